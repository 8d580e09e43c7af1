// src/config.rs

use crate::params::Param;
use crate::transaction::TxId;
use anyhow::Result;
use serde::Deserialize;
use std::collections::BTreeMap;

/// The main configuration struct for the DAO node.
#[derive(Clone, Deserialize, Debug)]
pub struct Config {
    pub node: NodeConfig,
    pub dao: DaoConfig,
}

/// Process-level settings that do not affect consensus.
#[derive(Clone, Deserialize, Debug)]
pub struct NodeConfig {
    pub db_path: String,
    pub blocks_dir: String,
    #[serde(default = "default_poll_interval")]
    pub poll_interval_secs: u64,
}

/// Consensus inputs handed to every core constructor.
#[derive(Clone, Deserialize, Debug)]
pub struct DaoConfig {
    pub genesis_tx_id: TxId,
    pub genesis_block_height: u32,
    pub genesis_total_supply: u64,
    /// Turns invariant violations into panics.
    #[serde(default)]
    pub dev_mode: bool,
    #[serde(default = "default_true")]
    pub dao_activated: bool,
    /// Overrides of the built-in parameter defaults.
    #[serde(default)]
    pub params: BTreeMap<Param, u64>,
}

fn default_poll_interval() -> u64 {
    30
}

fn default_true() -> bool {
    true
}

/// Loads the configuration from a file.
pub fn load(filename: &str) -> Result<Config> {
    let settings = config::Config::builder()
        .add_source(config::File::with_name(filename))
        .build()?;
    let config: Config = settings.try_deserialize()?;
    for (param, value) in &config.dao.params {
        param.validate_value(*value)?;
    }
    Ok(config)
}
