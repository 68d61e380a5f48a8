// strata - tiered metrics rollup service
// Copyright Bitdrift, Inc. All rights reserved.
//
// Use of this source code is governed by a source available license that can be found in the
// LICENSE file or at:
// https://polyformproject.org/wp-content/uploads/2020/06/PolyForm-Shield-1.0.0.txt

use super::*;
use pretty_assertions::assert_eq;
use std::io::Write;
use strata_rollup::config::Settings;
use tempfile::NamedTempFile;

// Do basic sanity testing of everything in the config directory.
#[test]
fn verify_examples() {
  let mut num_examples = 0;
  for example in std::fs::read_dir(env!("CARGO_MANIFEST_DIR").to_string() + "/../config").unwrap() {
    let example = example.unwrap();
    if !example.file_type().unwrap().is_file() || !example.path().extension().unwrap().eq("yaml") {
      continue;
    }
    num_examples += 1;

    let config = load_from_file(example.path().to_str().unwrap()).unwrap();
    Settings::new(config.rollup).unwrap();
  }

  assert_eq!(1, num_examples);
}

#[test]
fn load_minimal_config() {
  let mut file = NamedTempFile::new().unwrap();
  file
    .write_all(
      br#"
node_id: node-b
rollup:
  durations:
    - duration: 10s
    - duration: 5m
      cron: "0 */5 * * * *"
"#,
    )
    .unwrap();

  let config = load_from_file(file.path().to_str().unwrap()).unwrap();
  assert_eq!("node-b", config.node_id);
  assert_eq!(4, config.local_workers);
  assert_eq!(None, config.meta_prefix);
  let settings = Settings::new(config.rollup).unwrap();
  assert_eq!(1, settings.ticks.len());
}

#[test]
fn bad_configs() {
  for (yaml, message) in [
    (
      "local_workers: 2\nrollup:\n  durations: []\n",
      "missing field `node_id`",
    ),
    (
      "node_id: ''\nrollup:\n  durations: []\n",
      "node_id must not be empty",
    ),
    (
      "node_id: a\nlocal_workers: 0\nrollup:\n  durations: []\n",
      "local_workers must be non-zero",
    ),
    (
      "node_id: a\nworkers: 2\nrollup:\n  durations: []\n",
      "unknown field",
    ),
  ] {
    let error = parse(yaml).unwrap_err().to_string();
    assert!(
      error.contains(message),
      "expected '{message}' in '{error}'"
    );
  }
  assert!(load_from_file("/nonexistent/strata.yaml").is_err());
}
