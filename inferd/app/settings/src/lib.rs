// Copyright 2022-2024 Protocol Labs
// SPDX-License-Identifier: Apache-2.0, MIT

use anyhow::Context;
use config::{Config, ConfigError, Environment, File};
use serde::Deserialize;
use serde_with::{serde_as, DurationSeconds};
use std::fmt::{Display, Formatter};
use std::net::{SocketAddr, ToSocketAddrs};
use std::path::{Path, PathBuf};
use std::time::Duration;
use tendermint_rpc::Url;

pub mod utils;

#[derive(Debug, Deserialize, Clone)]
pub struct SocketAddress {
    pub host: String,
    pub port: u32,
}

impl Display for SocketAddress {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}:{}", self.host, self.port)
    }
}

impl std::net::ToSocketAddrs for SocketAddress {
    type Iter = <String as std::net::ToSocketAddrs>::Iter;

    fn to_socket_addrs(&self) -> std::io::Result<Self::Iter> {
        self.to_string().to_socket_addrs()
    }
}

impl TryInto<std::net::SocketAddr> for SocketAddress {
    type Error = std::io::Error;

    fn try_into(self) -> Result<SocketAddr, Self::Error> {
        self.to_socket_addrs()?
            .next()
            .ok_or_else(|| std::io::Error::from(std::io::ErrorKind::AddrNotAvailable))
    }
}

#[derive(Debug, Deserialize, Clone)]
pub struct ApiSettings {
    pub listen: SocketAddress,
    /// URL other participants reach this node's inference API under; used
    /// to detect when the node picks itself as executor.
    pub public_url: String,
}

/// Settings of the durable transaction manager.
#[serde_as]
#[derive(Debug, Deserialize, Clone)]
pub struct BroadcastSettings {
    /// Inclusion window stamped on every unordered transaction.
    #[serde_as(as = "DurationSeconds<u64>")]
    pub tx_timeout: Duration,
    /// How long a sync submission waits for the transaction to land.
    #[serde_as(as = "DurationSeconds<u64>")]
    pub sync_wait: Duration,
    /// Redelivery delay after a transient send failure.
    #[serde_as(as = "DurationSeconds<u64>")]
    pub send_retry_delay: Duration,
    /// Redelivery delay while waiting for an on-chain sighting.
    #[serde_as(as = "DurationSeconds<u64>")]
    pub observe_retry_delay: Duration,
    /// Broadcast-and-observe cycles before a transaction is dropped.
    pub max_attempts: u32,
    /// How long the chain may go without new blocks before it counts as
    /// halted.
    #[serde_as(as = "DurationSeconds<u64>")]
    pub max_block_timeout: Duration,
}

/// One local ML worker and the models it serves.
#[derive(Debug, Deserialize, Clone)]
pub struct WorkerSettings {
    pub url: String,
    pub models: Vec<String>,
    /// Concurrent jobs the worker accepts.
    pub concurrency: usize,
}

#[derive(Debug, Deserialize, Clone)]
pub struct Settings {
    /// Home directory configured on the CLI, to which all paths in settings
    /// can be set relative.
    home_dir: PathBuf,

    /// Secp256k1 private key (hex) used for agent and transaction signing.
    signing_key: PathBuf,

    /// Where to reach CometBFT for queries or broadcasting transactions.
    tendermint_rpc_url: Url,

    /// Chain identifier the transactions are signed for.
    pub chain_id: String,
    /// Bech32 prefix of account addresses.
    pub address_prefix: String,
    /// Denomination balances and escrows are counted in.
    pub fee_denom: String,

    pub api: ApiSettings,
    pub broadcast: BroadcastSettings,
    pub workers: Vec<WorkerSettings>,
}

impl Settings {
    home_relative!(signing_key);

    /// Load the default configuration from a directory,
    /// then potential overrides specific to the run mode,
    /// then overrides from the local environment,
    /// finally parse it into the [Settings] type.
    pub fn new(config_dir: &Path, home_dir: &Path, run_mode: &str) -> Result<Self, ConfigError> {
        Self::config(config_dir, home_dir, run_mode).and_then(Self::parse)
    }

    /// Load the configuration into a generic data structure.
    fn config(config_dir: &Path, home_dir: &Path, run_mode: &str) -> Result<Config, ConfigError> {
        Config::builder()
            .add_source(File::from(config_dir.join("default")))
            // Optional mode specific overrides, checked into git.
            .add_source(File::from(config_dir.join(run_mode)).required(false))
            // Optional local overrides, not checked into git.
            .add_source(File::from(config_dir.join("local")).required(false))
            // Add in settings from the environment (with a prefix of INFERD)
            // e.g. `INFERD_API__PUBLIC_URL=https://node.example inferd run`.
            .add_source(
                Environment::with_prefix("inferd")
                    .prefix_separator("_")
                    .separator("__")
                    .ignore_empty(true),
            )
            // Set the home directory based on what was passed to the CLI,
            // so everything in the config can be relative to it.
            // The `home_dir` key is not added to `default.toml` so there is
            // no confusion about where it will be coming from.
            .set_override("home_dir", home_dir.to_string_lossy().as_ref())?
            .build()
    }

    /// Try to parse the config into [Settings].
    fn parse(config: Config) -> Result<Self, ConfigError> {
        config.try_deserialize()
    }

    /// The configured home directory.
    pub fn home_dir(&self) -> &Path {
        &self.home_dir
    }

    /// Tendermint RPC URL from the environment or the config file.
    pub fn tendermint_rpc_url(&self) -> anyhow::Result<Url> {
        // Prefer the "standard" env var used in the CLI.
        match std::env::var("TENDERMINT_RPC_URL").ok() {
            Some(url) => url.parse::<Url>().context("invalid Tendermint URL"),
            None => Ok(self.tendermint_rpc_url.clone()),
        }
    }

    pub fn listen_addr(&self) -> anyhow::Result<SocketAddr> {
        self.api
            .listen
            .clone()
            .try_into()
            .context("invalid API listen address")
    }
}
