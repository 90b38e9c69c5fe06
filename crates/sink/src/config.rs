//! crates/sink/src/config.rs
//!
//! Sink configuration and its command line.

use std::ffi::OsString;
use std::path::PathBuf;

use buffer::BufferOptions;
use clap::{Arg, ArgAction, Command, value_parser};

use crate::writer::WriteOptions;

/// Runtime configuration of the sink process.
#[derive(Clone, Debug)]
pub struct SinkConfig {
    /// Directory receiving one file per emitted buffer.
    pub output_dir: PathBuf,
    /// TCP port the acceptor listens on.
    pub port: u16,
    /// Size of each pool buffer, in MB.
    pub buff_size_mb: usize,
    /// Number of buffers in the pool.
    pub buff_count: usize,
    /// Number of file-writer threads.
    pub writer_threads: usize,
    /// Back pool buffers with HugeTLB pages.
    pub huge_pages: bool,
    /// Open output files with `O_DIRECT`.
    pub direct_io: bool,
    /// Back pool buffers with a memfd (enables the sendfile output path).
    pub memfd: bool,
    /// Use vmsplice+splice for non-memfd writes.
    pub splice: bool,
    /// Log verbosity (`-v` count).
    pub verbose: u8,
}

impl Default for SinkConfig {
    fn default() -> Self {
        Self {
            output_dir: PathBuf::from("/tmp"),
            port: 15740,
            buff_size_mb: 1024,
            buff_count: 2,
            writer_threads: 2,
            huge_pages: false,
            direct_io: false,
            memfd: false,
            splice: false,
            verbose: 0,
        }
    }
}

impl SinkConfig {
    /// The `firehose-sink` command line.
    #[must_use]
    pub fn command() -> Command {
        Command::new("firehose-sink")
            .about("Receive high-rate TCP data streams and persist them to disk")
            .arg(
                Arg::new("output-dir")
                    .short('D')
                    .long("output-dir")
                    .value_name("DIR")
                    .help("Output directory for received data streams")
                    .default_value("/tmp")
                    .value_parser(value_parser!(PathBuf)),
            )
            .arg(
                Arg::new("sink-port")
                    .short('P')
                    .long("sink-port")
                    .value_name("PORT")
                    .help("TCP port to listen on")
                    .default_value("15740")
                    .value_parser(value_parser!(u16)),
            )
            .arg(
                Arg::new("buff-size")
                    .short('B')
                    .long("buff-size")
                    .value_name("MB")
                    .help("Size of each I/O buffer in MB")
                    .default_value("1024")
                    .value_parser(value_parser!(u64).range(1..)),
            )
            .arg(
                Arg::new("buff-count")
                    .short('C')
                    .long("buff-count")
                    .value_name("N")
                    .help("Number of I/O buffers to pre-allocate")
                    .default_value("2")
                    .value_parser(value_parser!(u64).range(1..)),
            )
            .arg(
                Arg::new("writer-threads")
                    .short('W')
                    .long("writer-threads")
                    .value_name("N")
                    .help("Number of file writer threads")
                    .default_value("2")
                    .value_parser(value_parser!(u64).range(1..)),
            )
            .arg(
                Arg::new("hugepages")
                    .long("hugepages")
                    .help("Back I/O buffers with HugeTLB pages")
                    .action(ArgAction::SetTrue),
            )
            .arg(
                Arg::new("directio")
                    .long("directio")
                    .help("Open output files with O_DIRECT")
                    .action(ArgAction::SetTrue),
            )
            .arg(
                Arg::new("memfd")
                    .long("memfd")
                    .help("Back I/O buffers with a memfd and write them with sendfile")
                    .action(ArgAction::SetTrue),
            )
            .arg(
                Arg::new("splice")
                    .long("splice")
                    .help("Use vmsplice+splice to avoid copies when possible")
                    .action(ArgAction::SetTrue),
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
        Ok(Self {
            output_dir: matches
                .get_one::<PathBuf>("output-dir")
                .expect("defaulted")
                .clone(),
            port: *matches.get_one::<u16>("sink-port").expect("defaulted"),
            buff_size_mb: *matches.get_one::<u64>("buff-size").expect("defaulted") as usize,
            buff_count: *matches.get_one::<u64>("buff-count").expect("defaulted") as usize,
            writer_threads: *matches.get_one::<u64>("writer-threads").expect("defaulted") as usize,
            huge_pages: matches.get_flag("hugepages"),
            direct_io: matches.get_flag("directio"),
            memfd: matches.get_flag("memfd"),
            splice: matches.get_flag("splice"),
            verbose: matches.get_count("verbose"),
        })
    }

    /// Pool buffer capacity in bytes.
    #[must_use]
    pub fn buff_size_bytes(&self) -> usize {
        self.buff_size_mb * 1024 * 1024
    }

    /// Allocation options for pool buffers.
    #[must_use]
    pub fn buffer_options(&self) -> BufferOptions {
        BufferOptions {
            huge_pages: self.huge_pages,
            memfd: self.memfd,
        }
    }

    /// Write-path options for the file writers.
    #[must_use]
    pub fn write_options(&self) -> WriteOptions {
        WriteOptions {
            direct_io: self.direct_io,
            splice: self.splice,
        }
    }
}
