// strata - tiered metrics rollup service
// Copyright Bitdrift, Inc. All rights reserved.
//
// Use of this source code is governed by a source available license that can be found in the
// LICENSE file or at:
// https://polyformproject.org/wp-content/uploads/2020/06/PolyForm-Shield-1.0.0.txt


use bd_log::SwapLogger;
use bd_panic::PanicType;

#[cfg(test)]
#[ctor::ctor]
fn test_global_init() {
  global_initialize();
}

pub fn global_initialize() {
  // The panic handler must be installed before the logger. A log line carrying thread ids that is
  // emitted from a ctor before this point will otherwise panic.
  bd_panic::default(PanicType::ForceAbort);

  SwapLogger::initialize();

  // Release builds always log panics since we don't control the environment the service runs in.
  #[cfg(not(debug_assertions))]
  unsafe {
    std::env::set_var("LOG_PANIC", "true");
  }

  if std::env::var("ENABLE_TOKIO_CONSOLE").is_ok() {
    log::info!("enabling tokio console");
    console_subscriber::init();
  }
}

// Sample counts are converted to floats for averages and quantile ranks.
pub trait LossyIntoToFloat {
  fn lossy_to_f64(self) -> f64;
}

impl LossyIntoToFloat for u64 {
  #[allow(clippy::cast_precision_loss)]
  fn lossy_to_f64(self) -> f64 {
    self as f64
  }
}
