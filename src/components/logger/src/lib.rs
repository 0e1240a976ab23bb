// Licensed to the Apache Software Foundation (ASF) under one
// or more contributor license agreements.  See the NOTICE file
// distributed with this work for additional information
// regarding copyright ownership.  The ASF licenses this file
// to you under the Apache License, Version 2.0 (the
// "License"); you may not use this file except in compliance
// with the License.  You may obtain a copy of the License at
//
//   http://www.apache.org/licenses/LICENSE-2.0
//
// Unless required by applicable law or agreed to in writing,
// software distributed under the License is distributed on an
// "AS IS" BASIS, WITHOUT WARRANTIES OR CONDITIONS OF ANY
// KIND, either express or implied.  See the License for the
// specific language governing permissions and limitations
// under the License.

//! A process-global [slog] logger behind the usual leveled macros.
//!
//! The logger is installed once by the server setup via [init_log]; before
//! that (and in unit tests) the macros are no-ops.

use std::sync::RwLock;

use lazy_static::lazy_static;
use serde::{Deserialize, Serialize};
use slog::{o, Drain, Logger};

pub use slog;

lazy_static! {
    static ref GLOBAL_LOGGER: RwLock<Option<Logger>> = RwLock::new(None);
}

#[derive(Clone, Debug, Deserialize, Serialize)]
#[serde(default)]
pub struct LogConfig {
    /// One of trace/debug/info/warn/error.
    pub level: String,
    /// Route records through an async channel drain.
    pub enable_async: bool,
    /// Capacity of the async drain channel.
    pub async_channel_len: usize,
}

impl Default for LogConfig {
    fn default() -> Self {
        Self {
            level: "info".to_string(),
            enable_async: true,
            async_channel_len: 102400,
        }
    }
}

fn parse_level(level: &str) -> Result<slog::Level, String> {
    match level.to_lowercase().as_str() {
        "trace" => Ok(slog::Level::Trace),
        "debug" => Ok(slog::Level::Debug),
        "info" => Ok(slog::Level::Info),
        "warn" => Ok(slog::Level::Warning),
        "error" => Ok(slog::Level::Error),
        _ => Err(format!("unknown log level: {level}")),
    }
}

/// Build the terminal logger described by `config` and install it as the
/// process-global one. Returns the logger so callers may keep a handle.
pub fn init_log(config: &LogConfig) -> Result<Logger, String> {
    let level = parse_level(&config.level)?;
    let decorator = slog_term::TermDecorator::new().build();
    let format = slog_term::FullFormat::new(decorator).build();

    let logger = if config.enable_async {
        let drain = slog_async::Async::new(format.fuse())
            .chan_size(config.async_channel_len)
            .overflow_strategy(slog_async::OverflowStrategy::Block)
            .build()
            .fuse();
        let drain = slog::LevelFilter::new(drain, level).fuse();
        Logger::root(drain, o!())
    } else {
        let drain = std::sync::Mutex::new(format).fuse();
        let drain = slog::LevelFilter::new(drain, level).fuse();
        Logger::root(drain, o!())
    };

    set_global(logger.clone());
    Ok(logger)
}

pub fn set_global(logger: Logger) {
    *GLOBAL_LOGGER.write().unwrap() = Some(logger);
}

/// Current global logger, if one was installed.
pub fn try_global() -> Option<Logger> {
    GLOBAL_LOGGER.read().unwrap().clone()
}

#[macro_export]
macro_rules! trace {
    ($($args:tt)+) => {
        if let Some(logger) = $crate::try_global() {
            $crate::slog::trace!(logger, $($args)+)
        }
    };
}

#[macro_export]
macro_rules! debug {
    ($($args:tt)+) => {
        if let Some(logger) = $crate::try_global() {
            $crate::slog::debug!(logger, $($args)+)
        }
    };
}

#[macro_export]
macro_rules! info {
    ($($args:tt)+) => {
        if let Some(logger) = $crate::try_global() {
            $crate::slog::info!(logger, $($args)+)
        }
    };
}

#[macro_export]
macro_rules! warn {
    ($($args:tt)+) => {
        if let Some(logger) = $crate::try_global() {
            $crate::slog::warn!(logger, $($args)+)
        }
    };
}

#[macro_export]
macro_rules! error {
    ($($args:tt)+) => {
        if let Some(logger) = $crate::try_global() {
            $crate::slog::error!(logger, $($args)+)
        }
    };
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_level() {
        assert_eq!(parse_level("info").unwrap(), slog::Level::Info);
        assert_eq!(parse_level("WARN").unwrap(), slog::Level::Warning);
        assert!(parse_level("verbose").is_err());
    }

    #[test]
    fn test_macros_without_global() {
        // No logger installed in unit tests, the macros must not panic.
        info!("ignored {}", 1);
        warn!("ignored");
    }
}
