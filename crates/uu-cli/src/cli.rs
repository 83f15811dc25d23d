use clap::{Parser, Subcommand};

/// CLI surface definition.
#[derive(Parser, Debug)]
#[command(
    name = "uu",
    about = "Encrypted preferences and named timers",
    version,
    propagate_version = true
)]
pub struct Cli {
    /// Optional subcommand; defaults to a health check when absent.
    #[command(subcommand)]
    pub command: Option<Command>,
}

#[derive(Subcommand, Debug, Clone, PartialEq, Eq)]
pub enum Command {
    /// Print version and exit.
    Version,
    /// Run an encrypt/decrypt round trip against the configured store.
    Health,
    /// Manage CLI configuration.
    #[command(subcommand)]
    Config(ConfigCommand),
    /// Read and write encrypted preferences.
    #[command(subcommand)]
    Prefs(PrefsCommand),
    /// Run a repeating named timer until it has fired a number of times.
    Timer {
        /// Timer id; starting an id that is already running replaces it.
        #[arg(long, default_value = "demo")]
        id: String,
        /// Delay between fires, in milliseconds.
        #[arg(long, default_value_t = 500)]
        interval_ms: u64,
        /// Cancel after this many fires.
        #[arg(long, default_value_t = 3, value_parser = clap::value_parser!(u32).range(1..))]
        fires: u32,
    },
}

#[derive(Subcommand, Debug, Clone, PartialEq, Eq)]
pub enum ConfigCommand {
    /// Create a default config file if one does not exist.
    Init,
}

#[derive(Subcommand, Debug, Clone, PartialEq, Eq)]
pub enum PrefsCommand {
    /// Print a value, or the default when absent or unreadable.
    Get {
        key: String,
        #[arg(long, default_value = "")]
        default: String,
    },
    /// Store a value.
    Set { key: String, value: String },
    /// Delete one key.
    Remove { key: String },
    /// Delete every key in the store.
    Clear,
}
