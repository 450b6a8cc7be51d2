//! `thinimage driver` commands.

use clap::{Args, Subcommand};
use thinimage_runtime::UnionMountDriver;

use super::Context;
use crate::output::Listing;

#[derive(Subcommand)]
pub enum DriverCommand {
    /// Print the lower directories a layer would be mounted with
    Resolve(ResolveArgs),
    /// Print driver status
    Status,
    /// Unmount layers and release store repositories held by the driver
    Cleanup,
}

#[derive(Args)]
pub struct ResolveArgs {
    /// Layer id
    pub id: String,

    /// Print root first instead of in overlay stacking order
    #[arg(long)]
    pub root_first: bool,
}

pub async fn execute(

    command: DriverCommand,

    ctx: &Context,

) -> Result<(), Box<dyn std::error::Error>> {
    let driver = UnionMountDriver::from_config(&ctx.config)?;
    match command {
        DriverCommand::Resolve(args) => resolve(&driver, &args),
        DriverCommand::Status => {
            let mut listing = Listing::new(&["KEY", "VALUE"]);
            for [key, value] in driver.status()?.pairs() {
                listing.add_row(vec![key, value]);
            }
            listing.print(ctx.machine);
            Ok(())
        }
        DriverCommand::Cleanup => {
            driver.cleanup()?;
            println!("Driver cleaned up");
            Ok(())
        }
    }
}

fn resolve(

    driver: &UnionMountDriver,

    args: &ResolveArgs,

) -> Result<(), Box<dyn std::error::Error>> {
    let resolved = driver.resolver().resolve(&args.id)?;
    let paths = if args.root_first {
        resolved.paths.clone()
    } else {
        resolved.top_down()
    };
    for path in &paths {
        println!("{}", path.display());
    }
    if let Some(thin) = &resolved.thin {
        eprintln!(
            "thin ancestor: {} ({} layers)",
            thin.origin.as_deref().unwrap_or("<unknown origin>"),
            thin.layers.len()
        );
    }
    driver.store().release_many(&resolved.repos);
    Ok(())
}
