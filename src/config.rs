/*
 * Copyright (C) 2025 Fastly, Inc.
 *
 * Licensed under the Apache License, Version 2.0 (the "License");
 * you may not use this file except in compliance with the License.
 * You may obtain a copy of the License at
 *
 *     http://www.apache.org/licenses/LICENSE-2.0
 *
 * Unless required by applicable law or agreed to in writing, software
 * distributed under the License is distributed on an "AS IS" BASIS,
 * WITHOUT WARRANTIES OR CONDITIONS OF ANY KIND, either express or implied.
 * See the License for the specific language governing permissions and
 * limitations under the License.
 */

use crate::request::MethodPolicy;
use config::{Config, Environment, File, FileFormat};
use log::{debug, error};
use serde::Deserialize;
use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::time::Duration;

pub const CONFIG_FILE_NAME: &str = "m2handler.toml";
pub const ENV_PREFIX: &str = "M2HANDLER";

pub const VALID_SPEC_SCHEMES: &[&str] = &["epgm", "tcp", "ipc", "pgm"];
pub const VALID_PROTOCOLS: &[&str] = &["json", "tnetstring"];

#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    #[error(transparent)]
    Load(#[from] config::ConfigError),

    #[error("invalid handler {ident:?}: {}", .errors.join("; "))]
    Invalid { ident: String, errors: Vec<String> },

    #[error("no configuration file found. Tried: {0}")]
    NotFound(String),
}

/// Where a handler's sockets live, as registered with the server.
#[derive(Clone, Debug, Deserialize, PartialEq)]
pub struct HandlerRecord {
    pub send_ident: String,
    pub send_spec: String,
    pub recv_spec: String,

    #[serde(default)]
    pub recv_ident: String,

    #[serde(default)]
    pub protocol: Option<String>,

    #[serde(default)]
    pub raw_payload: bool,
}

fn is_ident(s: &str) -> bool {
    let is_word = |c: char| c.is_alphanumeric() || c == '_';

    let mut chars = s.chars();

    match chars.next() {
        Some(c) if is_word(c) => {}
        _ => return false,
    }

    let rest = chars.as_str();

    !rest.is_empty() && rest.chars().all(|c| is_word(c) || c == '-')
}

fn check_spec(spec: &str) -> Option<String> {
    match url::Url::parse(spec) {
        Ok(u) if VALID_SPEC_SCHEMES.contains(&u.scheme()) => None,
        Ok(u) => Some(format!("invalid 0mq transport {}", u.scheme())),
        Err(_) => Some("not a URI; should be something like \"tcp://127.0.0.1:9998\"".to_string()),
    }
}

impl HandlerRecord {
    pub fn new(send_ident: &str, send_spec: &str, recv_spec: &str) -> Self {
        Self {
            send_ident: send_ident.to_string(),
            send_spec: send_spec.to_string(),
            recv_spec: recv_spec.to_string(),
            recv_ident: String::new(),
            protocol: None,
            raw_payload: false,
        }
    }

    pub fn validate(&self) -> Result<(), ConfigError> {
        let mut errors = Vec::new();

        if !is_ident(&self.send_ident) {
            errors.push(format!(
                "send_ident [{:?}]: invalid sender identity (should be UUID-like)",
                self.send_ident
            ));
        }

        if !self.recv_ident.is_empty() && !is_ident(&self.recv_ident) {
            errors.push(format!(
                "recv_ident [{:?}]: invalid receiver identity (should be empty string or UUID-like)",
                self.recv_ident
            ));
        }

        for (name, spec) in [("send_spec", &self.send_spec), ("recv_spec", &self.recv_spec)] {
            if let Some(e) = check_spec(spec) {
                errors.push(format!("{} [{:?}]: {}", name, spec, e));
            }
        }

        if let Some(p) = &self.protocol {
            if !VALID_PROTOCOLS.contains(&p.as_str()) {
                errors.push(format!("protocol [{:?}]: invalid", p));
            }
        }

        if errors.is_empty() {
            return Ok(());
        }

        for e in errors.iter() {
            error!("{}", e);
        }

        Err(ConfigError::Invalid {
            ident: self.send_ident.clone(),
            errors,
        })
    }
}

/// Source of handler records.
pub trait ConfigProvider {
    fn handler_by_send_ident(&self, ident: &str) -> Result<Option<HandlerRecord>, ConfigError>;
}

#[derive(Clone, Debug, Deserialize, PartialEq)]
pub struct RuntimeSettings {
    pub method_policy: MethodPolicy,
    pub poll_interval_ms: u64,
    pub trap_signals: bool,
    pub heartbeat_interval_secs: u64,
    pub heartbeat_idle_secs: u64,
}

impl Default for RuntimeSettings {
    fn default() -> Self {
        Self {
            method_policy: MethodPolicy::Strict,
            poll_interval_ms: 500,
            trap_signals: true,
            heartbeat_interval_secs: 5,
            heartbeat_idle_secs: 15,
        }
    }
}

impl RuntimeSettings {
    pub fn poll_interval(&self) -> Duration {
        Duration::from_millis(self.poll_interval_ms)
    }

    pub fn heartbeat_interval(&self) -> Duration {
        Duration::from_secs(self.heartbeat_interval_secs)
    }

    pub fn heartbeat_idle(&self) -> Duration {
        Duration::from_secs(self.heartbeat_idle_secs)
    }
}

impl From<RuntimeSettings> for config::ValueKind {
    fn from(runtime: RuntimeSettings) -> Self {
        let policy = match runtime.method_policy {
            MethodPolicy::Strict => "strict",
            MethodPolicy::DefaultToGet => "default-to-get",
        };

        let mut properties = HashMap::new();
        properties.insert("method_policy".to_string(), config::Value::from(policy));
        properties.insert(
            "poll_interval_ms".to_string(),
            config::Value::from(runtime.poll_interval_ms as i64),
        );
        properties.insert(
            "trap_signals".to_string(),
            config::Value::from(runtime.trap_signals),
        );
        properties.insert(
            "heartbeat_interval_secs".to_string(),
            config::Value::from(runtime.heartbeat_interval_secs as i64),
        );
        properties.insert(
            "heartbeat_idle_secs".to_string(),
            config::Value::from(runtime.heartbeat_idle_secs as i64),
        );

        Self::Table(properties)
    }
}

#[derive(Clone, Debug, Default, Deserialize, PartialEq)]
pub struct Settings {
    pub runtime: RuntimeSettings,

    #[serde(default)]
    pub handlers: Vec<HandlerRecord>,
}

impl Settings {
    /// Loads settings from an optional TOML file, then applies
    /// `M2HANDLER_*` environment overrides, e.g.
    /// `M2HANDLER_RUNTIME__POLL_INTERVAL_MS=100`. Every handler record is
    /// validated.
    pub fn load(config_file: Option<&Path>) -> Result<Settings, ConfigError> {
        let mut builder =
            Config::builder().set_default("runtime", RuntimeSettings::default())?;

        if let Some(path) = config_file {
            debug!("loading settings from {}", path.display());

            builder = builder.add_source(File::from(path).format(FileFormat::Toml));
        }

        let config = builder
            .add_source(
                Environment::with_prefix(ENV_PREFIX)
                    .prefix_separator("_")
                    .separator("__")
                    .try_parsing(true),
            )
            .build()?;

        let settings: Settings = config.try_deserialize()?;

        for h in settings.handlers.iter() {
            h.validate()?;
        }

        Ok(settings)
    }
}

impl ConfigProvider for Settings {
    fn handler_by_send_ident(&self, ident: &str) -> Result<Option<HandlerRecord>, ConfigError> {
        Ok(self.handlers.iter().find(|h| h.send_ident == ident).cloned())
    }
}

/// Settings read from a configuration file.
#[derive(Debug)]
pub struct FileConfig {
    path: PathBuf,
    settings: Settings,
}

impl FileConfig {
    pub fn load(path: &Path) -> Result<Self, ConfigError> {
        Ok(Self {
            path: path.to_path_buf(),
            settings: Settings::load(Some(path))?,
        })
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    pub fn settings(&self) -> &Settings {
        &self.settings
    }
}

impl ConfigProvider for FileConfig {
    fn handler_by_send_ident(&self, ident: &str) -> Result<Option<HandlerRecord>, ConfigError> {
        self.settings.handler_by_send_ident(ident)
    }
}

/// Picks the configuration file: the one given, else the first of
/// `./config/m2handler.toml` and `./m2handler.toml` that exists.
pub fn find_config_file(work_dir: &Path, arg_config: Option<PathBuf>) -> Result<PathBuf, ConfigError> {
    let config_files: Vec<PathBuf> = match arg_config {
        Some(x) => vec![x],
        None => vec![
            work_dir.join("config").join(CONFIG_FILE_NAME),
            work_dir.join(CONFIG_FILE_NAME),
        ],
    };

    match config_files.iter().find(|cf| cf.is_file()) {
        Some(cf) => Ok(cf.clone()),
        None => Err(ConfigError::NotFound(
            config_files
                .iter()
                .map(|path_buf| path_buf.display().to_string())
                .collect::<Vec<String>>()
                .join(" "),
        )),
    }
}
