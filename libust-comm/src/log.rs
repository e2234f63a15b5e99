// Copyright 2021-Present Datadog, Inc. https://www.datadoghq.com/
// SPDX-License-Identifier: Apache-2.0

//! Diagnostics of the runtime itself, written to stderr.
//!
//! Logging is off unless `UST_DEBUG` is set, so that tracing a process does
//! not change its output.

use crate::config::LogConfig;
use anyhow::Context;
use std::sync::{LazyLock, Mutex};
use tracing_subscriber::layer::SubscriberExt;
use tracing_subscriber::reload::Handle;
use tracing_subscriber::{fmt, reload, EnvFilter, Registry};

struct Logger {
    filter_handle: Handle<EnvFilter, Registry>,
}

static LOGGER: LazyLock<Mutex<Option<Logger>>> = LazyLock::new(|| Mutex::new(None));

fn env_filter(level: &str) -> anyhow::Result<EnvFilter> {
    EnvFilter::try_new(level).with_context(|| format!("invalid log level {level:?}"))
}

impl Logger {
    fn setup_global(level: &str) -> anyhow::Result<Self> {
        let (filter_layer, filter_handle) = reload::Layer::new(env_filter(level)?);
        let subscriber = tracing_subscriber::registry().with(filter_layer).with(
            fmt::layer()
                .with_writer(std::io::stderr)
                .with_thread_names(true)
                .with_target(true)
                .with_ansi(false),
        );
        tracing::subscriber::set_global_default(subscriber)
            .context("failed to set global default subscriber")?;
        Ok(Logger { filter_handle })
    }

    fn set_level(&self, level: &str) -> anyhow::Result<()> {
        let filter = env_filter(level)?;
        self.filter_handle
            .modify(|current| *current = filter)
            .context("failed to update log level")
    }
}

/// Installs the stderr logger if `config` enables it. Calling it again only
/// updates the level.
pub fn init(config: &LogConfig) -> anyhow::Result<()> {
    if !config.enabled {
        return Ok(());
    }
    let mut logger = LOGGER
        .lock()
        .map_err(|e| anyhow::anyhow!("failed to acquire logger lock: {e}"))?;
    match logger.as_ref() {
        Some(logger) => logger.set_level(&config.level),
        None => {
            *logger = Some(Logger::setup_global(&config.level)?);
            Ok(())
        }
    }
}

pub fn set_log_level(level: &str) -> anyhow::Result<()> {
    let logger = LOGGER
        .lock()
        .map_err(|e| anyhow::anyhow!("failed to acquire logger lock: {e}"))?;
    match logger.as_ref() {
        Some(logger) => logger.set_level(level),
        None => anyhow::bail!("logger not initialized"),
    }
}
