//! CLI argument parsing using clap

use clap::{Parser, Subcommand};

/// servicehost - host runtime for Windows services
///
/// Runs the bundled sample units under an in-process service manager
#[derive(Parser, Debug)]
#[command(name = "servicehost")]
#[command(author, version, about, long_about = None)]
pub struct Args {
    /// Subcommand to execute
    #[command(subcommand)]
    pub command: Option<Command>,

    /// Verbose output (can be repeated for more verbosity)
    #[arg(short, long, action = clap::ArgAction::Count, global = true)]
    pub verbose: u8,

    /// Quiet mode - only show errors
    #[arg(short, long, global = true)]
    pub quiet: bool,

    /// Log output to file
    #[arg(long, global = true)]
    pub log: Option<String>,

    /// Host configuration file (default: search standard locations)
    #[arg(long, global = true)]
    pub config: Option<String>,
}

/// Available commands
#[derive(Subcommand, Debug)]
pub enum Command {
    /// Host sample units in this console until Ctrl+C
    Console {
        /// Units to host (comma-separated): heartbeat, echo
        #[arg(short, long, value_delimiter = ',', default_value = "heartbeat")]
        units: Vec<String>,

        /// Heartbeat interval in milliseconds
        #[arg(long, default_value = "1000")]
        interval: u64,
    },

    /// Print a sample configuration file
    SampleConfig,
}

impl Args {
    /// Get the log level based on verbose/quiet flags
    pub fn log_level(&self) -> tracing::Level {
        if self.quiet {
            tracing::Level::ERROR
        } else {
            match self.verbose {
                0 => tracing::Level::INFO,
                1 => tracing::Level::DEBUG,
                _ => tracing::Level::TRACE,
            }
        }
    }
}

impl Default for Command {
    fn default() -> Self {
        Command::Console {
            units: vec!["heartbeat".to_string()],
            interval: 1000,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_console_units_are_split() {
        let args = Args::parse_from(["servicehost", "-v", "console", "--units", "heartbeat,echo"]);
        assert_eq!(args.log_level(), tracing::Level::DEBUG);
        match args.command {
            Some(Command::Console { units, interval }) => {
                assert_eq!(units, vec!["heartbeat", "echo"]);
                assert_eq!(interval, 1000);
            }
            other => panic!("unexpected command: {:?}", other),
        }
    }
}
