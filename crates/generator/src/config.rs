//! crates/generator/src/config.rs
//!
//! Generator configuration and its command line.

use std::ffi::OsString;
use std::time::Duration;

use clap::{Arg, ArgAction, Command, value_parser};

/// Runtime configuration of the generator process.
#[derive(Clone, Debug)]
pub struct GenConfig {
    /// Hostname or address of the sink.
    pub sink_host: String,
    /// TCP port of the sink.
    pub sink_port: u16,
    /// Size of each generated frame, in bytes.
    pub frame_size: usize,
    /// Frames per second.
    pub frame_rate: f64,
    /// Stream name used in generator logs and frame metadata.
    pub name: String,
    /// Log verbosity (`-v` count).
    pub verbose: u8,
}

impl Default for GenConfig {
    fn default() -> Self {
        Self {
            sink_host: String::new(),
            sink_port: 15740,
            frame_size: 4 * 1024 * 1024,
            frame_rate: 30.0,
            name: "data-stream".to_owned(),
            verbose: 0,
        }
    }
}

impl GenConfig {
    /// The `firehose-gen` command line.
    #[must_use]
    pub fn command() -> Command {
        Command::new("firehose-gen")
            .about("Generate rate-paced data frames and stream them to a sink")
            .arg(
                Arg::new("sink-host")
                    .short('A')
                    .long("sink-host")
                    .value_name("HOST")
                    .help("Sink hostname or IP address")
                    .required(true),
            )
            .arg(
                Arg::new("sink-port")
                    .short('P')
                    .long("sink-port")
                    .value_name("PORT")
                    .help("Sink TCP port")
                    .default_value("15740")
                    .value_parser(value_parser!(u16)),
            )
            .arg(
                Arg::new("frame-size")
                    .short('s')
                    .long("frame-size")
                    .value_name("BYTES")
                    .help("Size of the data frames to generate")
                    .default_value("4194304")
                    .value_parser(value_parser!(u64).range(1..)),
            )
            .arg(
                Arg::new("frame-rate")
                    .short('r')
                    .long("frame-rate")
                    .value_name("FPS")
                    .help("Frame rate in frames per second")
                    .default_value("30")
                    .value_parser(value_parser!(f64)),
            )
            .arg(
                Arg::new("name")
                    .short('n')
                    .long("name")
                    .value_name("NAME")
                    .help("Name of the data stream")
                    .default_value("data-stream"),
            )
            .arg(
                Arg::new("verbose")
                    .short('v')
                    .long("verbose")
                    .help("Increase log verbosity (repeatable)")
                    .action(ArgAction::Count),
            )
    }

    /// Parses a configuration from command-line arguments.
    pub fn parse<I, T>(args: I) -> Result<Self, clap::Error>
    where
        I: IntoIterator<Item = T>,
        T: Into<OsString> + Clone,
    {
        let matches = Self::command().try_get_matches_from(args)?;

        let frame_rate = *matches.get_one::<f64>("frame-rate").expect("defaulted");
        if !(frame_rate > 0.0 && frame_rate.is_finite()) {
            return Err(Self::command().error(
                clap::error::ErrorKind::ValueValidation,
                format!("frame rate must be positive, got {frame_rate}"),
            ));
        }

        Ok(Self {
            sink_host: matches.get_one::<String>("sink-host").expect("required").clone(),
            sink_port: *matches.get_one::<u16>("sink-port").expect("defaulted"),
            frame_size: *matches.get_one::<u64>("frame-size").expect("defaulted") as usize,
            frame_rate,
            name: matches.get_one::<String>("name").expect("defaulted").clone(),
            verbose: matches.get_count("verbose"),
        })
    }

    /// Pacing interval between frames.
    #[must_use]
    pub fn interval(&self) -> Duration {
        Duration::from_nanos((1_000_000_000.0 / self.frame_rate) as u64)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn sink_host_is_required() {
        assert!(GenConfig::parse(["firehose-gen"]).is_err());
    }

    #[test]
    fn defaults_match_the_documented_interface() {
        let config =
            GenConfig::parse(["firehose-gen", "--sink-host", "10.0.0.1"]).expect("parse");
        assert_eq!(config.sink_host, "10.0.0.1");
        assert_eq!(config.sink_port, 15740);
        assert_eq!(config.frame_size, 4 * 1024 * 1024);
        assert!((config.frame_rate - 30.0).abs() < f64::EPSILON);
        assert_eq!(config.name, "data-stream");
    }

    #[test]
    fn thirty_fps_paces_at_a_third_of_a_tenth_of_a_second() {
        let config =
            GenConfig::parse(["firehose-gen", "--sink-host", "h"]).expect("parse");
        assert_eq!(config.interval(), Duration::from_nanos(33_333_333));
    }

    #[test]
    fn non_positive_frame_rate_is_rejected() {
        assert!(
            GenConfig::parse(["firehose-gen", "--sink-host", "h", "--frame-rate", "0"]).is_err()
        );
        assert!(
            GenConfig::parse(["firehose-gen", "--sink-host", "h", "--frame-rate", "-5"]).is_err()
        );
    }
}
