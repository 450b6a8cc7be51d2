//! `thinimage needed-layers` command.

use clap::Args;

use super::Context;

#[derive(Args)]
pub struct NeededLayersArgs;

pub async fn execute(

    _args: NeededLayersArgs,

    ctx: &Context,

) -> Result<(), Box<dyn std::error::Error>> {
    let db = ctx.open_db()?;
    for path in db.needed_layers(&ctx.config.store.layers_subdir)?.iter() {
        println!("{path}");
    }
    Ok(())
}
