//! `thinimage users` command.

use clap::Args;

use super::Context;
use crate::output::Listing;

#[derive(Args)]
pub struct UsersArgs;

pub async fn execute(_args: UsersArgs, ctx: &Context) -> Result<(), Box<dyn std::error::Error>> {
    let db = ctx.open_db()?;
    let mut listing = Listing::new(&["USER", "REGISTRY"]);
    for (user, registry) in db.list_users()? {
        listing.add_row(vec![user, registry]);
    }
    listing.print(ctx.machine);
    Ok(())
}
