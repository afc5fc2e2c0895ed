// Copyright 2024-Present the Janus authors.
// SPDX-License-Identifier: Apache-2.0

//! YAML configuration front-end.
//!
//! Files are loaded in order onto one logical [`Config`]: `ports` entries
//! accumulate across files and `max-requests` takes the last value set.
//! Field defaults match the runtime defaults of
//! [`PortConfig`](janus_gateway::PortConfig); validation runs after
//! deserialization so error messages can name the offending port entry.

use std::fs;
use std::io::{self, Read};
use std::time::Duration;

use serde::Deserialize;
use url::Url;

use janus_gateway::{Backoff, ListenAddr, PortConfig};

#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    #[error("unable to read {path}: {source}")]
    Io {
        path: String,
        #[source]
        source: io::Error,
    },

    #[error("unable to parse {path}: {source}")]
    Parse {
        path: String,
        #[source]
        source: serde_yaml::Error,
    },

    #[error("port {index}: {reason}")]
    Port { index: usize, reason: String },
}

/// The logical configuration every front-end produces.
#[derive(Debug, Default)]
pub struct Config {
    pub ports: Vec<PortConfig>,
    /// Process-wide ceiling on concurrent HTTP requests; non-positive
    /// disables the ceiling.
    pub max_requests: i64,
}

impl Config {
    /// Loads and merges the given config files. `-` (or an empty list)
    /// reads one document from standard input.
    pub fn load(paths: &[String]) -> Result<Config, ConfigError> {
        let stdin_only = ["-".to_string()];
        let paths: &[String] = if paths.is_empty() { &stdin_only } else { paths };

        let mut config = Config::default();
        for path in paths {
            let text = read_source(path)?;
            config.merge_yaml(&text, path)?;
        }
        Ok(config)
    }

    fn merge_yaml(&mut self, text: &str, path: &str) -> Result<(), ConfigError> {
        let raw: RawConfig = serde_yaml::from_str(text).map_err(|source| ConfigError::Parse {
            path: path.to_string(),
            source,
        })?;

        if let Some(max_requests) = raw.max_requests {
            self.max_requests = max_requests;
        }
        let offset = self.ports.len();
        for (i, port) in raw.ports.into_iter().enumerate() {
            let port = port
                .into_port_config()
                .map_err(|reason| ConfigError::Port {
                    index: offset + i + 1,
                    reason,
                })?;
            self.ports.push(port);
        }
        Ok(())
    }
}

fn read_source(path: &str) -> Result<String, ConfigError> {
    let wrap = |source| ConfigError::Io {
        path: path.to_string(),
        source,
    };
    if path == "-" {
        let mut text = String::new();
        io::stdin().read_to_string(&mut text).map_err(wrap)?;
        Ok(text)
    } else {
        fs::read_to_string(path).map_err(wrap)
    }
}

#[derive(Debug, Deserialize)]
#[serde(deny_unknown_fields)]
struct RawConfig {
    #[serde(default)]
    ports: Vec<RawPort>,

    #[serde(rename = "max-requests", default)]
    max_requests: Option<i64>,
}

#[derive(Debug, Deserialize)]
#[serde(deny_unknown_fields)]
struct RawPort {
    #[serde(default)]
    listen: Vec<String>,

    #[serde(default)]
    dest: Option<String>,

    #[serde(rename = "flush-every", default, deserialize_with = "duration::option")]
    flush_every: Option<Duration>,

    #[serde(rename = "flush-size", default)]
    flush_size: Option<usize>,

    /// Shorthand that sets both timeouts; the specific keys win.
    #[serde(default, deserialize_with = "duration::option")]
    timeout: Option<Duration>,

    #[serde(rename = "read-timeout", default, deserialize_with = "duration::option")]
    read_timeout: Option<Duration>,

    #[serde(rename = "write-timeout", default, deserialize_with = "duration::option")]
    write_timeout: Option<Duration>,

    #[serde(rename = "max-retries", default)]
    max_retries: Option<u32>,

    #[serde(default)]
    backoff: Option<RawBackoff>,
}

impl RawPort {
    fn into_port_config(self) -> Result<PortConfig, String> {
        if self.listen.is_empty() {
            return Err("port requires at least one listen address".to_string());
        }
        let dest = self.dest.ok_or("port requires a dest URL")?;
        let forward =
            Url::parse(&dest).map_err(|err| format!("invalid dest URL {dest:?}: {err}"))?;

        let mut listen = Vec::with_capacity(self.listen.len());
        for (i, raw) in self.listen.iter().enumerate() {
            let addr = raw
                .parse::<ListenAddr>()
                .map_err(|err| format!("listen address {}: {err}", i + 1))?;
            listen.push(addr);
        }

        let mut port = PortConfig::new(listen, forward);
        if let Some(both) = self.timeout {
            port.read_timeout = both;
            port.write_timeout = both;
        }
        if let Some(value) = self.flush_every {
            port.flush_interval = value;
        }
        if let Some(value) = self.flush_size {
            port.flush_size = value;
        }
        if let Some(value) = self.read_timeout {
            port.read_timeout = value;
        }
        if let Some(value) = self.write_timeout {
            port.write_timeout = value;
        }
        if let Some(value) = self.max_retries {
            port.max_retries = value;
        }
        if let Some(raw) = self.backoff {
            port.backoff = raw.into_backoff()?;
        }
        Ok(port)
    }
}

#[derive(Debug, Deserialize)]
#[serde(deny_unknown_fields)]
struct RawBackoff {
    #[serde(default, deserialize_with = "duration::option")]
    interval: Option<Duration>,

    #[serde(default)]
    factor: Option<f64>,

    #[serde(rename = "grow-by", default, deserialize_with = "duration::option")]
    grow_by: Option<Duration>,

    #[serde(default, deserialize_with = "duration::option")]
    min: Option<Duration>,

    #[serde(default, deserialize_with = "duration::option")]
    max: Option<Duration>,

    #[serde(rename = "exp-max", default)]
    exp_max: Option<u32>,

    #[serde(rename = "exp-m", default)]
    exp_m: Option<f64>,

    #[serde(rename = "exp-y", default)]
    exp_y: Option<f64>,
}

impl RawBackoff {
    fn into_backoff(self) -> Result<Backoff, String> {
        let mut backoff = Backoff::default();
        if let Some(value) = self.interval {
            backoff.interval = value;
        }
        if let Some(value) = self.factor {
            backoff.factor = value;
        }
        if let Some(value) = self.grow_by {
            backoff.grow = value;
        }
        if let Some(value) = self.min {
            backoff.min = value;
        }
        if let Some(value) = self.max {
            backoff.max = value;
        }
        if let Some(value) = self.exp_max {
            backoff.max_exp = value;
        }
        if let Some(value) = self.exp_m {
            backoff.exp_m = value;
        }
        if let Some(value) = self.exp_y {
            backoff.exp_scale = value;
        }
        backoff.validate()?;
        Ok(backoff)
    }
}

mod duration {
    use serde::{Deserialize, Deserializer};
    use std::time::Duration;

    pub fn option<'de, D>(deserializer: D) -> Result<Option<Duration>, D::Error>
    where
        D: Deserializer<'de>,
    {
        let value: Option<String> = Option::deserialize(deserializer)?;
        match value {
            Some(text) => humantime::parse_duration(&text)
                .map(Some)
                .map_err(serde::de::Error::custom),
            None => Ok(None),
        }
    }
}
