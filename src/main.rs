use clap::Parser;
use std::panic::{self, PanicHookInfo};
use tilt_listener::app::{self, Broadcaster, Options, RealScanner};
use tilt_listener::output::mqtt::MqttPublisher;
use tracing_subscriber::EnvFilter;

/// Exit codes for the application
const EXIT_SUCCESS: i32 = 0;
const EXIT_ERROR: i32 = 1;
const EXIT_PANIC: i32 = 2;

fn init_logging(verbose: bool) {
    let default_filter = if verbose { "debug" } else { "info" };
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(default_filter)),
        )
        .init();
}

/// Main application entry point.
///
/// This function:
/// 1. Loads the device identity registry and calibration tables
/// 2. Connects the MQTT publisher and the rename-request subscription
/// 3. Runs the broadcast loop until interrupted
///
/// # Errors
/// Returns `RunError` if the identity or calibration files cannot be loaded,
/// or if Bluetooth initialization fails.
async fn run(options: Options) -> Result<(), app::RunError> {
    let parser = app::build_parser(&options)?;
    let (publisher, mut renames) =
        MqttPublisher::connect(&options.mqtt_host, options.mqtt_port, &options.name);

    let mut broadcaster = Broadcaster::new(options, parser);
    broadcaster.run(&RealScanner, &publisher, &mut renames).await
}

#[tokio::main(flavor = "current_thread")]
async fn main() {
    // Set up panic hook to ensure clean exit codes for process managers
    // (e.g., systemd, docker) that monitor exit status
    panic::set_hook(Box::new(move |info: &PanicHookInfo| {
        eprintln!("Panic! {}", info);
        std::process::exit(EXIT_PANIC);
    }));

    let options = Options::parse();
    init_logging(options.verbose);

    match run(options).await {
        Ok(_) => std::process::exit(EXIT_SUCCESS),
        Err(why) => {
            eprintln!("error: {}", why);
            std::process::exit(EXIT_ERROR);
        }
    }
}
