#![deny(unsafe_code)]

use std::env;
use std::process::ExitCode;
use std::sync::Arc;
use std::sync::atomic::AtomicBool;

use signal_hook::consts::{SIGHUP, SIGINT, SIGTERM};

fn main() -> ExitCode {
    let config = match sink::SinkConfig::parse(env::args_os()) {
        Ok(config) => config,
        Err(err) => err.exit(),
    };
    logging::init(config.verbose);

    let shutdown = Arc::new(AtomicBool::new(false));
    for signal in [SIGINT, SIGHUP, SIGTERM] {
        if let Err(err) = signal_hook::flag::register(signal, Arc::clone(&shutdown)) {
            eprintln!("firehose-sink: failed to install signal handler: {err}");
            return ExitCode::FAILURE;
        }
    }

    match sink::run(&config, &shutdown) {
        Ok(()) => ExitCode::SUCCESS,
        Err(err) => {
            tracing::error!(%err, "sink terminated with an error");
            ExitCode::FAILURE
        }
    }
}
