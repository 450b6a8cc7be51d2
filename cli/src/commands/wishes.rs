//! `thinimage wishes` command.

use clap::Args;

use super::Context;
use crate::output::Listing;

#[derive(Args)]
pub struct WishesArgs {
    /// Only show wishes targeting this repository
    #[arg(long)]
    pub repo: Option<String>,
}

pub async fn execute(args: WishesArgs, ctx: &Context) -> Result<(), Box<dyn std::error::Error>> {
    let db = ctx.open_db()?;
    let mut listing = Listing::new(&["ID", "INPUT", "OUTPUT", "REPO", "CONVERTED"]);
    for wish in db.list_wishes()? {
        if args.repo.as_deref().is_some_and(|r| r != wish.repo) {
            continue;
        }
        listing.add_row(vec![
            wish.id.to_string(),
            wish.input_name,
            wish.output_name,
            wish.repo,
            if wish.converted { "yes" } else { "no" }.to_string(),
        ]);
    }
    listing.print(ctx.machine);
    Ok(())
}
