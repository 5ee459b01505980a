// SPDX-License-Identifier: CEPL-1.0
#![deny(unsafe_op_in_unsafe_fn)]

pub mod config;

pub use config::{
    load_config, ConfigError, EngineConfig, LogConfig, PresentModePref, RenderConfig,
};

use tracing_subscriber::{fmt, EnvFilter};

/// `RUST_LOG` when set, otherwise the `[log]` levels.
pub fn log_filter(log: &LogConfig) -> EnvFilter {
    EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(log.directives()))
}

/// Installs the compact fmt subscriber. Only the first call takes effect.
pub fn init_tracing(log: &LogConfig) {
    let installed = fmt()
        .with_env_filter(log_filter(log))
        .with_target(log.show_targets)
        .compact()
        .try_init()
        .is_ok();
    if installed {
        tracing::debug!("tracing filter: {}", log.directives());
    }
}
