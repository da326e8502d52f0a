//! Launch an external MPV player, hold a JSON IPC channel to it and log
//! everything it reports.

mod config;
pub mod mpv;

pub use config::{ConfigError, SupervisorConfig};
pub use mpv::{PlayerCommand, Supervisor, SupervisorError};

/// Install the `env_logger` backend for the `log` facade.
///
/// Defaults to `info`; `RUST_LOG` overrides it.
pub fn init_logging() {
  env_logger::Builder::from_env(env_logger::Env::default().default_filter_or("info"))
    .format_timestamp_millis()
    .init();
}
