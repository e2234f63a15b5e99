// Copyright 2021-Present Datadog, Inc. https://www.datadoghq.com/
// SPDX-License-Identifier: Apache-2.0

use crate::setup::ScopePaths;
use libust_shm::DEFAULT_FALLBACK_INTERVAL;
use std::collections::HashMap;
use std::ffi::OsString;
use std::fmt;
use std::time::Duration;

const ENV_REGISTER_TIMEOUT: &str = "UST_REGISTER_TIMEOUT";
const DEFAULT_REGISTER_TIMEOUT: Duration = Duration::from_millis(3000);

const ENV_DEBUG: &str = "UST_DEBUG";
const ENV_LOG_LEVEL: &str = "UST_LOG_LEVEL";
const DEFAULT_LOG_LEVEL: &str = "debug";

pub mod parse_env {
    use std::env;

    /// Integer prefix of the variable, C `strtol` style: leading whitespace
    /// and an optional sign, then digits up to the first other character.
    /// No digits reads as 0 and out of range values saturate.
    pub fn leading_int(name: &str) -> Option<i64> {
        let value = env::var(name).ok()?;
        let value = value.trim_start();
        let (negative, digits) = match value.as_bytes().first() {
            Some(b'-') => (true, &value[1..]),
            Some(b'+') => (false, &value[1..]),
            _ => (false, value),
        };
        let magnitude = digits
            .bytes()
            .take_while(u8::is_ascii_digit)
            .fold(0i64, |acc, d| {
                acc.saturating_mul(10).saturating_add(i64::from(d - b'0'))
            });
        Some(if negative { magnitude.saturating_neg() } else { magnitude })
    }

    /// Presence flag: set to anything, even empty, means enabled.
    pub fn flag(name: &str) -> bool {
        env::var_os(name).is_some()
    }

    pub fn str_not_empty(name: &str) -> Option<String> {
        env::var(name).ok().filter(|s| !s.is_empty())
    }
}

/// How long process startup waits for both coordinators to acknowledge the
/// registration.
#[derive(Debug, Copy, Clone, PartialEq, Eq)]
pub enum RegisterTimeout {
    NoWait,
    Forever,
    Timeout(Duration),
}

impl RegisterTimeout {
    /// `0` means do not wait, any negative value waits forever.
    pub fn from_millis(ms: i64) -> Self {
        match ms {
            0 => RegisterTimeout::NoWait,
            ms if ms < 0 => RegisterTimeout::Forever,
            ms => RegisterTimeout::Timeout(Duration::from_millis(ms.unsigned_abs())),
        }
    }
}

impl Default for RegisterTimeout {
    fn default() -> Self {
        RegisterTimeout::Timeout(DEFAULT_REGISTER_TIMEOUT)
    }
}

impl fmt::Display for RegisterTimeout {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            RegisterTimeout::NoWait => write!(f, "0"),
            RegisterTimeout::Forever => write!(f, "-1"),
            RegisterTimeout::Timeout(timeout) => write!(f, "{}", timeout.as_millis()),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LogConfig {
    pub enabled: bool,
    pub level: String,
}

impl Default for LogConfig {
    fn default() -> Self {
        LogConfig {
            enabled: false,
            level: DEFAULT_LOG_LEVEL.to_owned(),
        }
    }
}

#[derive(Debug, Clone)]
pub struct Config {
    pub register_timeout: RegisterTimeout,
    /// `None` disables the scope: its registration counts as settled and no
    /// agent is started for it.
    pub system: Option<ScopePaths>,
    pub user: Option<ScopePaths>,
    /// Sleep between connection attempts when the wait page is unusable.
    pub wait_fallback_interval: Duration,
    pub log: LogConfig,
}

impl Default for Config {
    fn default() -> Self {
        Config {
            register_timeout: RegisterTimeout::default(),
            system: Some(ScopePaths::system()),
            user: None,
            wait_fallback_interval: DEFAULT_FALLBACK_INTERVAL,
            log: LogConfig::default(),
        }
    }
}

impl Config {
    pub fn get() -> Self {
        FromEnv::config()
    }

    /// Environment to hand to a child process so it behaves like this one.
    pub fn to_env(&self) -> HashMap<&'static str, OsString> {
        let mut env = HashMap::from([(
            ENV_REGISTER_TIMEOUT,
            self.register_timeout.to_string().into(),
        )]);
        if self.log.enabled {
            env.insert(ENV_DEBUG, "1".into());
            env.insert(ENV_LOG_LEVEL, self.log.level.clone().into());
        }
        env
    }
}

pub struct FromEnv {}

impl FromEnv {
    pub fn register_timeout() -> RegisterTimeout {
        parse_env::leading_int(ENV_REGISTER_TIMEOUT)
            .map(RegisterTimeout::from_millis)
            .unwrap_or_default()
    }

    pub fn log() -> LogConfig {
        LogConfig {
            enabled: parse_env::flag(ENV_DEBUG),
            level: parse_env::str_not_empty(ENV_LOG_LEVEL)
                .unwrap_or_else(|| DEFAULT_LOG_LEVEL.to_owned()),
        }
    }

    pub fn config() -> Config {
        Config {
            register_timeout: Self::register_timeout(),
            system: Some(ScopePaths::system()),
            user: ScopePaths::user(),
            wait_fallback_interval: DEFAULT_FALLBACK_INTERVAL,
            log: Self::log(),
        }
    }
}
