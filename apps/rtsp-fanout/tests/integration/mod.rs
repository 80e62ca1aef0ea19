pub mod common;
pub mod failure_injection;
pub mod scenarios;

use rtsp_fanout::Config;

pub fn init_test_environment() {
    let _ = tracing_subscriber::fmt()
        .with_env_filter("debug")
        .with_test_writer()
        .try_init();
}

/// Defaults with timings short enough for tests.
pub fn create_test_config() -> Config {
    let mut config = Config::default();
    config.restart.backoff_ms = 50;
    config.restart.window_ms = 200;
    config.push_rtsp.eos_timeout_ms = 300;
    config.graph.state_timeout_ms = 200;
    config
}
