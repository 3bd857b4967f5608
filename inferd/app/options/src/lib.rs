// Copyright 2022-2024 Protocol Labs
// SPDX-License-Identifier: Apache-2.0, MIT

use std::path::PathBuf;

use clap::{Args, Parser, Subcommand};
use tracing_subscriber::EnvFilter;

mod log;

pub use log::LogLevel;
use log::parse_log_level;

pub fn parse() -> Options {
    Options::parse()
}

#[derive(Parser, Debug)]
#[command(version)]
pub struct Options {
    /// Set a custom directory for data and configuration files.
    #[arg(short = 'd', long, default_value = "~/.inferd", env = "INFERD_HOME_DIR")]
    pub home_dir: PathBuf,

    /// Set a custom directory for configuration files.
    #[arg(long, env = "INFERD_CONFIG_DIR")]
    config_dir: Option<PathBuf>,

    /// Set a custom directory for log files.
    #[arg(long, env = "INFERD_LOG_DIR")]
    pub log_dir: Option<PathBuf>,

    /// Set a custom prefix for log files.
    #[arg(long, env = "INFERD_LOG_FILE_PREFIX")]
    pub log_file_prefix: Option<String>,

    /// Optionally override the default configuration.
    #[arg(short, long, default_value = "dev")]
    pub mode: String,

    /// Set the logging level of the console.
    #[arg(
        short = 'l',
        long,
        default_value = "info",
        value_enum,
        env = "INFERD_LOG_LEVEL",
        help = "Standard log levels, or a comma separated list of filters, e.g. 'debug,tendermint_rpc=warn'",
        value_parser = parse_log_level,
    )]
    log_level: LogLevel,

    /// Set the logging level of the log file. If missing, it defaults to the same level as the console.
    #[arg(
        long,
        value_enum,
        env = "INFERD_LOG_FILE_LEVEL",
        value_parser = parse_log_level,
    )]
    log_file_level: Option<LogLevel>,

    #[command(subcommand)]
    pub command: Commands,
}

impl Options {
    /// Tracing filter for the console.
    pub fn log_console_filter(&self) -> anyhow::Result<EnvFilter> {
        self.log_level.to_filter()
    }

    /// Tracing filter for the log file.
    pub fn log_file_filter(&self) -> anyhow::Result<EnvFilter> {
        if let Some(ref level) = self.log_file_level {
            level.to_filter()
        } else {
            self.log_console_filter()
        }
    }

    /// Path to the configuration directories.
    ///
    /// If not specified then returns the default under the home directory.
    pub fn config_dir(&self) -> PathBuf {
        self.config_dir
            .as_ref()
            .cloned()
            .unwrap_or(self.home_dir.join("config"))
    }
}

#[derive(Subcommand, Debug)]
pub enum Commands {
    /// Parse the configuration file and print it to the console.
    Config(ConfigArgs),
    /// Run the sidecar: the API listener, the stream consumers and the
    /// background sweeps.
    Run(RunArgs),
    /// Subcommands related to the node's signing key.
    Key(KeyArgs),
}

#[derive(Args, Debug)]
pub struct ConfigArgs {}

#[derive(Args, Debug)]
pub struct RunArgs {}

#[derive(Subcommand, Debug)]
pub enum KeyCommands {
    /// Generate a new Secp256k1 key and write it to a file in hex format.
    Gen(KeyGenArgs),
    /// Print the public key and bech32 address of a secret key file.
    Show(KeyShowArgs),
}

#[derive(Args, Debug)]
pub struct KeyArgs {
    #[command(subcommand)]
    pub command: KeyCommands,
}

#[derive(Args, Debug)]
pub struct KeyGenArgs {
    /// Path of the key file to write; its parent directory must exist.
    #[arg(long, short)]
    pub out: PathBuf,
}

#[derive(Args, Debug)]
pub struct KeyShowArgs {
    /// Path to the file that stores the secret key (hex format).
    #[arg(long, short)]
    pub secret_key: PathBuf,
    /// Bech32 prefix for the derived address.
    #[arg(long, default_value = "infer")]
    pub prefix: String,
}
