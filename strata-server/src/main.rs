// strata - tiered metrics rollup service
// Copyright Bitdrift, Inc. All rights reserved.
//
// Use of this source code is governed by a source available license that can be found in the
// LICENSE file or at:
// https://polyformproject.org/wp-content/uploads/2020/06/PolyForm-Shield-1.0.0.txt

use anyhow::Context;
use clap::Parser;
use log::info;
use std::num::NonZeroUsize;
use strata_common::global_initialize;
use strata_server::{NullHooks, run_server};
use tikv_jemallocator::Jemalloc;
use tokio::select;
use tokio::signal::unix::{SignalKind, signal};

#[global_allocator]
static GLOBAL: Jemalloc = Jemalloc;

#[allow(clippy::needless_raw_string_hashes)]
pub mod built_info {
  include!(concat!(env!("OUT_DIR"), "/built.rs"));
}

#[derive(Parser, Debug, Clone)]
struct Options {
  #[arg(short = 'c', long = "config")]
  pub config: String,

  #[arg(long = "config-check-and-exit")]
  pub config_check: bool,

  #[arg(long = "version")]
  pub version: bool,
}

fn main() -> anyhow::Result<()> {
  global_initialize();
  let opts = Options::parse();

  if opts.version {
    println!("strata: {}", built_info::GIT_COMMIT_HASH.unwrap_or("unknown"));
    return Ok(());
  }
  info!(
    "strata loading: {}",
    built_info::GIT_COMMIT_HASH.unwrap_or("unknown")
  );

  let config = strata_server::config::load_from_file(&opts.config)
    .with_context(|| format!("can't load config file from {}", opts.config))?;
  info!("loaded config file {}", opts.config);

  let num_threads = std::thread::available_parallelism().unwrap_or_else(|_| {
    log::warn!("could not determine number of CPUs. Defaulting to 1");
    NonZeroUsize::MIN
  });
  log::info!("running server with {num_threads} threads");
  let runtime = tokio::runtime::Builder::new_multi_thread()
    .worker_threads(num_threads.into())
    .enable_all()
    .build()?;

  runtime.block_on(async {
    run_server(
      config,
      opts.config_check,
      || async {
        // Trap ctrl+c and sigterm messages and perform a clean shutdown
        let (Ok(mut sigint), Ok(mut sigterm)) = (
          signal(SignalKind::interrupt()),
          signal(SignalKind::terminate()),
        ) else {
          log::error!("failed to install signal handlers, shutting down");
          return;
        };
        select! {
          _ = sigint.recv() => info!("received sigint"),
          _ = sigterm.recv() => info!("received sigterm"),
        }
      },
      NullHooks {},
    )
    .await
  })
}
