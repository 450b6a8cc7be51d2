//! `thinimage add-wish` command.

use clap::Args;
use thinimage_core::{ThinError, Wish, WishSpec};
use thinimage_runtime::ConversionDb;

use super::Context;

#[derive(Args)]
pub struct AddWishArgs {
    /// Source image, e.g. https://registry.hub.docker.com/library/redis:4
    pub input: String,

    /// Thin image to produce
    pub output: String,

    /// Store repository receiving the layers
    pub repo: String,

    /// User whose credentials access the registries
    #[arg(short, long)]
    pub user: Option<String>,
}

pub async fn execute(args: AddWishArgs, ctx: &Context) -> Result<(), Box<dyn std::error::Error>> {
    let spec = WishSpec::parse(&args.input, &args.output, &args.repo)?;
    let db = ctx.open_db()?;

    match record_wish(db.as_ref(), args.user.as_deref(), &spec)? {
        Some(wish) => println!("Added wish {}", wish.id),
        None => println!("Wish already recorded: {} -> {}", spec.input, spec.output),
    }
    Ok(())
}

/// Record both images and the wish. `None` if the wish was already there.
pub(crate) fn record_wish(
    db: &dyn ConversionDb,
    user: Option<&str>,
    spec: &WishSpec,
) -> thinimage_core::Result<Option<Wish>> {
    let input = db.add_image(user, &spec.input, false)?;
    let output = db.add_image(user, &spec.output, true)?;
    match db.add_wish(input.id, output.id, &spec.repo) {
        Ok(wish) => {
            tracing::info!(
                wish = wish.id,
                input = %spec.input,
                output = %spec.output,
                "Wish added"
            );
            Ok(Some(wish))
        }
        Err(ThinError::WishAlreadyExists { .. }) => Ok(None),
        Err(e) => Err(e),
    }
}
