#![deny(unsafe_code)]

use std::env;
use std::process::ExitCode;
use std::sync::Arc;
use std::sync::atomic::AtomicBool;

use signal_hook::consts::{SIGHUP, SIGINT, SIGTERM};

fn main() -> ExitCode {
    let config = match generator::GenConfig::parse(env::args_os()) {
        Ok(config) => config,
        Err(err) => err.exit(),
    };
    logging::init(config.verbose);

    let shutdown = Arc::new(AtomicBool::new(false));
    for signal in [SIGINT, SIGHUP, SIGTERM] {
        if let Err(err) = signal_hook::flag::register(signal, Arc::clone(&shutdown)) {
            eprintln!("firehose-gen: failed to install signal handler: {err}");
            return ExitCode::FAILURE;
        }
    }

    match generator::run(&config, &shutdown) {
        Ok(()) => ExitCode::SUCCESS,
        Err(err) => {
            tracing::error!(%err, "generator terminated with an error");
            ExitCode::FAILURE
        }
    }
}
