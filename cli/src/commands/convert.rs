//! `thinimage convert` and `thinimage loop` commands.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use clap::Args;
use thinimage_runtime::{ConvertOptions, ConvertSummary, Converter};

use super::{interrupt_on_ctrl_c, Context};

#[derive(Args)]
pub struct ConvertArgs {
    /// Convert again even if the current input digest was already converted
    #[arg(short = 'g', long)]
    pub convert_again: bool,

    /// Download and ingest layers already present in the store
    #[arg(short = 'f', long)]
    pub overwrite_layers: bool,
}

impl ConvertArgs {
    fn options(&self) -> ConvertOptions {
        ConvertOptions {
            convert_again: self.convert_again,
            force_download: self.overwrite_layers,
        }
    }
}

#[derive(Args)]
pub struct LoopArgs {
    #[command(flatten)]
    pub convert: ConvertArgs,

    /// Seconds to wait between rounds
    #[arg(long, default_value = "60")]
    pub interval: u64,
}

pub async fn execute(args: ConvertArgs, ctx: &Context) -> Result<(), Box<dyn std::error::Error>> {
    let interrupt = interrupt_on_ctrl_c();
    let converter =
        Converter::from_config(&ctx.config, ctx.open_db()?).with_interrupt(interrupt.clone());

    let jobs = converter.jobs()?;
    let summary = converter.convert_all(&jobs, args.options()).await;
    print_summary(&summary);

    if interrupt.load(Ordering::SeqCst) {
        return Err("Interrupted".into());
    }
    if summary.failed > 0 {
        return Err(format!("{} conversions failed", summary.failed).into());
    }
    Ok(())
}

/// Convert every wish, wait, and start over. Only an interrupt ends the loop.
pub async fn execute_loop(args: LoopArgs, ctx: &Context) -> Result<(), Box<dyn std::error::Error>> {
    let interrupt = interrupt_on_ctrl_c();
    let converter =
        Converter::from_config(&ctx.config, ctx.open_db()?).with_interrupt(interrupt.clone());
    let options = args.convert.options();
    let mut round = 0u64;

    while !interrupt.load(Ordering::SeqCst) {
        round += 1;
        tracing::info!(round, "Starting conversion round");
        match converter.jobs() {
            Ok(jobs) => {
                let summary = converter.convert_all(&jobs, options).await;
                print_summary(&summary);
            }
            Err(e) => tracing::error!(error = %e, "Cannot list wishes"),
        }
        wait(&interrupt, Duration::from_secs(args.interval)).await;
    }

    tracing::info!(rounds = round, "Conversion loop stopped");
    Ok(())
}

/// Sleep for `total`, returning early once `interrupt` is set.
async fn wait(interrupt: &Arc<AtomicBool>, total: Duration) {
    let tick = Duration::from_millis(500);
    let mut waited = Duration::ZERO;
    while waited < total && !interrupt.load(Ordering::SeqCst) {
        tokio::time::sleep(tick).await;
        waited += tick;
    }
}

fn print_summary(summary: &ConvertSummary) {
    println!(
        "Converted: {}, already converted: {}, failed: {}",
        summary.converted, summary.already_converted, summary.failed
    );
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_options_from_flags() {
        let args = ConvertArgs {
            convert_again: true,
            overwrite_layers: false,
        };
        let options = args.options();
        assert!(options.convert_again);
        assert!(!options.force_download);
    }

    #[tokio::test]
    async fn test_wait_returns_on_interrupt() {
        let interrupt = Arc::new(AtomicBool::new(true));
        let started = std::time::Instant::now();
        wait(&interrupt, Duration::from_secs(30)).await;
        assert!(started.elapsed() < Duration::from_secs(1));
    }
}
