//! `thinimage images` command.

use clap::Args;

use super::Context;
use crate::output::Listing;

#[derive(Args)]
pub struct ImagesArgs {
    /// Only show image references (one per line)
    #[arg(short, long)]
    pub quiet: bool,
}

pub async fn execute(args: ImagesArgs, ctx: &Context) -> Result<(), Box<dyn std::error::Error>> {
    let db = ctx.open_db()?;
    let images = db.list_images()?;

    if args.quiet {
        for image in &images {
            println!("{}", image.reference);
        }
        return Ok(());
    }

    let mut listing = Listing::new(&["ID", "REFERENCE", "USER", "THIN"]);
    for image in images {
        listing.add_row(vec![
            image.id.to_string(),
            image.reference.to_string(),
            image.user.unwrap_or_default(),
            if image.is_thin { "yes" } else { "no" }.to_string(),
        ]);
    }
    listing.print(ctx.machine);
    Ok(())
}
