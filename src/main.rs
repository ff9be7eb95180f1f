use atc_forwarder::app::{self, Options, RealScanner};
use atc_forwarder::shutdown::Shutdown;
use clap::Parser;
use std::panic::{self, PanicHookInfo};
use tracing::{error, info};
use tracing_subscriber::filter::LevelFilter;

/// Exit codes for the application
const EXIT_SUCCESS: i32 = 0;
const EXIT_ERROR: i32 = 1;
const EXIT_PANIC: i32 = 2;

fn init_logging(verbose: bool) {
    let level = if verbose {
        LevelFilter::DEBUG
    } else {
        LevelFilter::INFO
    };
    tracing_subscriber::fmt()
        .with_max_level(level)
        .with_writer(std::io::stderr)
        .init();
}

#[tokio::main(flavor = "current_thread")]
async fn main() {
    // Process managers (e.g. systemd) watch the exit status
    panic::set_hook(Box::new(move |info: &PanicHookInfo| {
        eprintln!("Panic! {}", info);
        std::process::exit(EXIT_PANIC);
    }));

    let options = Options::parse();
    init_logging(options.verbose);

    let (trigger, shutdown) = Shutdown::channel();
    tokio::spawn(async move {
        if tokio::signal::ctrl_c().await.is_ok() {
            trigger.trigger();
        }
    });

    match app::run(options, &RealScanner, shutdown).await {
        Ok(summary) => {
            info!(
                queued = summary.pipeline.queued,
                skipped = summary.pipeline.skipped,
                delivered = summary.delivery.delivered,
                dropped = summary.delivery.dropped + summary.pipeline.dropped,
                unsent = summary.delivery.interrupted + summary.delivery.abandoned,
                "finished"
            );
            std::process::exit(EXIT_SUCCESS)
        }
        Err(why) => {
            error!(error = %why, "fatal");
            std::process::exit(EXIT_ERROR);
        }
    }
}
