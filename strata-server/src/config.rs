// strata - tiered metrics rollup service
// Copyright Bitdrift, Inc. All rights reserved.
//
// Use of this source code is governed by a source available license that can be found in the
// LICENSE file or at:
// https://polyformproject.org/wp-content/uploads/2020/06/PolyForm-Shield-1.0.0.txt

#[cfg(test)]
#[path = "./config_test.rs"]
mod config_test;

use anyhow::bail;
use serde::Deserialize;
use strata_rollup::config::RollupConfig;

const fn default_local_workers() -> usize {
  4
}

//
// Config
//

// Bootstrap configuration of one strata node.
#[derive(Clone, Debug, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct Config {
  // Identity used for the leadership lock and for naming local workers.
  pub node_id: String,
  #[serde(default = "default_local_workers")]
  pub local_workers: usize,
  // Root of every stat name. Defaults to "strata".
  pub meta_prefix: Option<String>,
  pub rollup: RollupConfig,
}

pub fn load_from_file(path: &str) -> anyhow::Result<Config> {
  let file_contents = std::fs::read_to_string(path)?;
  parse(&file_contents)
}

pub fn parse(contents: &str) -> anyhow::Result<Config> {
  let config: Config = serde_yaml::from_str(contents)?;
  if config.node_id.is_empty() {
    bail!("node_id must not be empty");
  }
  if config.local_workers == 0 {
    bail!("local_workers must be non-zero");
  }
  Ok(config)
}
