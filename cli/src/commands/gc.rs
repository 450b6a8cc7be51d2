//! `thinimage gc` command.

use std::sync::Arc;

use clap::Args;
use thinimage_runtime::{CvmfsServer, GarbageCollector};

use super::Context;

#[derive(Args)]
pub struct GcArgs {
    /// List unreferenced layers without deleting them
    #[arg(long)]
    pub dry_run: bool,
}

pub async fn execute(args: GcArgs, ctx: &Context) -> Result<(), Box<dyn std::error::Error>> {
    let store = Arc::new(CvmfsServer::from_config(&ctx.config.store));
    let gc = GarbageCollector::new(ctx.open_db()?, store, ctx.config.store.layers_subdir.clone());

    let report = tokio::task::spawn_blocking(move || gc.collect(args.dry_run)).await??;

    for path in &report.removed {
        if args.dry_run {
            println!("would remove {path}");
        } else {
            println!("removed {path}");
        }
    }
    for (path, error) in &report.failed {
        eprintln!("failed {path}: {error}");
    }
    if !report.failed.is_empty() {
        return Err(format!("{} layers could not be removed", report.failed.len()).into());
    }
    Ok(())
}
