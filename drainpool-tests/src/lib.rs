// SPDX-License-Identifier: MIT

pub mod buffer;
pub mod fetchers;
pub mod handlers;
pub mod run_drainpool;

/// Routes `log` output through the test harness. Safe to call repeatedly.
pub fn init_test_logging() {
    let _ = env_logger::Builder::from_env(env_logger::Env::default().default_filter_or("debug"))
        .is_test(true)
        .try_init();
}
