//! `thinimage remove-wish` command.

use clap::Args;

use super::Context;

#[derive(Args)]
pub struct RemoveWishArgs {
    /// Wish id, as listed by `thinimage wishes`
    pub id: u64,
}

pub async fn execute(

    args: RemoveWishArgs,

    ctx: &Context,

) -> Result<(), Box<dyn std::error::Error>> {
    let db = ctx.open_db()?;
    if db.delete_wish(args.id)? == 0 {
        return Err(format!("No such wish: {}", args.id).into());
    }
    println!("Removed wish {}", args.id);
    Ok(())
}
