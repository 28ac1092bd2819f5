//! Command line and runtime configuration.
//!
//! `Cli` is what the user types; [`ServerConfig`] and [`SupervisorConfig`]
//! are what the event loop and the supervisor actually consume. Both have
//! `Default` impls so tests and library users never need the CLI.

use crate::handler::HandlerKind;
use clap::Parser;
use std::time::Duration;
use tracing::Level;

/// Bytes read from a socket per call.
pub const DEFAULT_READ_CHUNK: usize = 4096;

/// Per-connection cap on received but unconsumed bytes (16 MB).
pub const DEFAULT_MAX_BUFFER: usize = 16 * 1024 * 1024;

/// Most workers a single supervisor forks.
pub const MAX_PROCESSES: u32 = 1024;

/// Settings for one multiplexer loop.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ServerConfig {
    /// Size of each socket read
    pub read_chunk: usize,
    /// Backpressure cap per connection
    pub max_buffer: usize,
    /// Longest a poll blocks with nothing ready
    pub poll_timeout: Duration,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            read_chunk: DEFAULT_READ_CHUNK,
            max_buffer: DEFAULT_MAX_BUFFER,
            poll_timeout: Duration::from_secs(1),
        }
    }
}

/// Settings for the forking supervisor.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SupervisorConfig {
    /// Number of worker processes, 1..=1024
    pub processes: u32,
    /// How often workers report in
    pub heartbeat_interval: Duration,
    /// Silence after which a worker is considered dead
    pub worker_timeout: Duration,
}

impl Default for SupervisorConfig {
    fn default() -> Self {
        Self {
            processes: 1,
            heartbeat_interval: Duration::from_secs(5),
            worker_timeout: Duration::from_secs(10),
        }
    }
}

impl SupervisorConfig {
    /// Same as `Default`, with the process count clamped to 1..=1024.
    pub fn with_processes(processes: u32) -> Self {
        Self {
            processes: processes.clamp(1, MAX_PROCESSES),
            ..Self::default()
        }
    }
}

/// Log verbosity accepted on the command line.
#[derive(Debug, Clone, Copy, PartialEq, Eq, clap::ValueEnum)]
pub enum LogLevel {
    Error,
    Warn,
    Info,
    Debug,
    Trace,
}

impl From<LogLevel> for Level {
    fn from(level: LogLevel) -> Self {
        match level {
            LogLevel::Error => Level::ERROR,
            LogLevel::Warn => Level::WARN,
            LogLevel::Info => Level::INFO,
            LogLevel::Debug => Level::DEBUG,
            LogLevel::Trace => Level::TRACE,
        }
    }
}

/// Command line of the `sockmux` binary.
#[derive(Debug, Parser)]
#[command(name = "sockmux")]
#[command(version, about = "Multiplexed, pre-forking socket server", long_about = None)]
pub struct Cli {
    /// Address to bind to
    #[arg(short = 'a', long, default_value = "0.0.0.0")]
    pub address: String,

    /// Port to listen on
    #[arg(short, long, default_value_t = 8080)]
    pub port: u16,

    /// Worker processes to fork (1 runs in-process)
    #[arg(short = 'n', long, default_value_t = 1, value_parser = clap::value_parser!(u32).range(1..=MAX_PROCESSES as i64))]
    pub processes: u32,

    /// Protocol served on every connection
    #[arg(short = 'H', long, value_enum, default_value_t = HandlerKind::Http)]
    pub handler: HandlerKind,

    /// Log verbosity
    #[arg(short = 'L', long, value_enum, default_value_t = LogLevel::Info)]
    pub log_level: LogLevel,

    /// Listen backlog
    #[arg(long, default_value_t = 100)]
    pub backlog: i32,

    /// Poll timeout in milliseconds
    #[arg(long, default_value_t = 1000, value_parser = clap::value_parser!(u64).range(100..=5000))]
    pub poll_timeout_ms: u64,

    /// Seconds between worker heartbeats
    #[arg(long, default_value_t = 5, value_parser = clap::value_parser!(u64).range(1..))]
    pub heartbeat_secs: u64,

    /// Seconds without a heartbeat before a worker counts as dead
    #[arg(long, default_value_t = 10, value_parser = clap::value_parser!(u64).range(1..))]
    pub worker_timeout_secs: u64,

    /// Per-connection buffer cap in bytes
    #[arg(long, default_value_t = DEFAULT_MAX_BUFFER)]
    pub max_buffer: usize,
}

impl Cli {
    /// Returns the bind address as a string
    pub fn bind_address(&self) -> String {
        format!("{}:{}", self.address, self.port)
    }

    pub fn server_config(&self) -> ServerConfig {
        ServerConfig {
            read_chunk: DEFAULT_READ_CHUNK,
            max_buffer: self.max_buffer,
            poll_timeout: Duration::from_millis(self.poll_timeout_ms),
        }
    }

    pub fn supervisor_config(&self) -> SupervisorConfig {
        SupervisorConfig {
            processes: self.processes.clamp(1, MAX_PROCESSES),
            heartbeat_interval: Duration::from_secs(self.heartbeat_secs),
            worker_timeout: Duration::from_secs(self.worker_timeout_secs),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_defaults() {
        let cli = Cli::parse_from(["sockmux"]);
        assert_eq!(cli.bind_address(), "0.0.0.0:8080");
        assert_eq!(cli.processes, 1);
        assert_eq!(cli.handler, HandlerKind::Http);
        assert_eq!(cli.log_level, LogLevel::Info);
        assert_eq!(cli.backlog, 100);
        assert_eq!(cli.server_config(), ServerConfig::default());
        assert_eq!(cli.supervisor_config(), SupervisorConfig::default());
    }

    #[test]
    fn test_short_flags() {
        let cli = Cli::parse_from([
            "sockmux", "-a", "127.0.0.1", "-p", "9000", "-n", "4", "-H", "websocket", "-L",
            "debug",
        ]);
        assert_eq!(cli.bind_address(), "127.0.0.1:9000");
        assert_eq!(cli.supervisor_config().processes, 4);
        assert_eq!(cli.handler, HandlerKind::Websocket);
        assert_eq!(Level::from(cli.log_level), Level::DEBUG);
    }

    #[test]
    fn test_rejects_out_of_range() {
        assert!(Cli::try_parse_from(["sockmux", "-n", "0"]).is_err());
        assert!(Cli::try_parse_from(["sockmux", "-n", "1025"]).is_err());
        assert!(Cli::try_parse_from(["sockmux", "--poll-timeout-ms", "50"]).is_err());
        assert!(Cli::try_parse_from(["sockmux", "-H", "gopher"]).is_err());
    }

    #[test]
    fn test_long_flags() {
        let cli = Cli::parse_from([
            "sockmux",
            "--poll-timeout-ms",
            "250",
            "--heartbeat-secs",
            "2",
            "--worker-timeout-secs",
            "6",
            "--max-buffer",
            "1024",
        ]);
        let server = cli.server_config();
        assert_eq!(server.poll_timeout, Duration::from_millis(250));
        assert_eq!(server.max_buffer, 1024);
        let supervisor = cli.supervisor_config();
        assert_eq!(supervisor.heartbeat_interval, Duration::from_secs(2));
        assert_eq!(supervisor.worker_timeout, Duration::from_secs(6));
    }

    #[test]
    fn test_process_clamp() {
        assert_eq!(SupervisorConfig::with_processes(0).processes, 1);
        assert_eq!(SupervisorConfig::with_processes(5000).processes, 1024);
    }
}
