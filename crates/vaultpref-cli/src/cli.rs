use clap::{Parser, Subcommand};

/// Command-line access to an encrypted preference store.
#[derive(Parser, Debug)]
#[command(
    name = "vaultpref",
    about = "Encrypted key-value preferences backed by the OS keychain",
    version,
    propagate_version = true
)]
pub struct Cli {
    /// Store to operate on; overrides `name` from the config file.
    #[arg(long, global = true)]
    pub store: Option<String>,

    #[command(subcommand)]
    pub command: Command,
}

#[derive(Subcommand, Debug, Clone, PartialEq, Eq)]
pub enum Command {
    /// Print the value stored under KEY.
    Get {
        key: String,
        /// Printed instead of failing when KEY is unset.
        #[arg(long)]
        default: Option<String>,
    },
    /// Store VALUE under KEY.
    Put {
        key: String,
        value: String,
        /// Queue the write on the worker pool and wait for it.
        #[arg(long = "async")]
        queued: bool,
    },
    /// Delete KEY. Deleting a missing key is not an error.
    Remove { key: String },
    /// Print whether KEY is set.
    Contains { key: String },
    /// Delete every entry of the store.
    Clear,
    /// Run a write/read/delete round trip against the configured store.
    Health,
    /// Print version and exit.
    Version,
    /// Manage CLI configuration.
    #[command(subcommand)]
    Config(ConfigCommand),
}

#[derive(Subcommand, Debug, Clone, PartialEq, Eq)]
pub enum ConfigCommand {
    /// Create a default config file if one does not exist.
    Init,
    /// Print where the config file is read from.
    Path,
}
