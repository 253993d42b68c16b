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

use crate::config::{find_config_file, ConfigError};
use clap::Parser;
use std::env;
use std::path::PathBuf;

/// Command line shared by handler programs.
#[derive(Parser, Debug)]
#[command(version, about = "Runs a Mongrel2 handler.")]
pub struct CliArgs {
    /// Set path to the configuration file
    #[arg(short, long = "config", value_name = "file")]
    pub config_file: Option<String>,

    /// Set path to the log file
    #[arg(short = 'l', long = "logfile", value_name = "file")]
    pub log_file: Option<String>,

    /// Set log level (0=error, 1=warn, 2=info, 3=debug, 4=trace)
    #[arg(short = 'L', long = "loglevel", value_name = "x", default_value_t = 2, value_parser = clap::value_parser!(u32).range(0..=4))]
    pub log_level: u32,

    /// Handler to run, as registered by its send_ident
    #[arg(value_name = "app-id")]
    pub app_id: Option<String>,
}

impl CliArgs {
    /// Resolves the configuration file, searching the working directory if
    /// none was given.
    pub fn config_path(&self) -> Result<PathBuf, ConfigError> {
        let work_dir = env::current_dir().unwrap_or_default();

        find_config_file(&work_dir, self.config_file.as_ref().map(PathBuf::from))
    }

    /// The app id given on the command line, else `default`.
    pub fn app_id_or<'a>(&'a self, default: &'a str) -> &'a str {
        self.app_id.as_deref().unwrap_or(default)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::NamedTempFile;

    #[test]
    fn parse_args() {
        let file = NamedTempFile::new().unwrap();
        let config_test_file = file.path().to_str().unwrap().to_string();

        let args = CliArgs::try_parse_from([
            "m2handler-hello",
            "--config",
            config_test_file.as_str(),
            "-l",
            "hello.log",
            "-L",
            "3",
            "hello-app",
        ])
        .unwrap();

        assert_eq!(args.config_file, Some(config_test_file.clone()));
        assert_eq!(args.log_file, Some("hello.log".to_string()));
        assert_eq!(args.log_level, 3);
        assert_eq!(args.app_id_or("other"), "hello-app");
        assert_eq!(args.config_path().unwrap(), PathBuf::from(&config_test_file));
    }

    #[test]
    fn defaults() {
        let args = CliArgs::try_parse_from(["m2handler-hello"]).unwrap();

        assert_eq!(args.config_file, None);
        assert_eq!(args.log_level, 2);
        assert_eq!(args.app_id_or("helloworld-handler"), "helloworld-handler");

        assert!(CliArgs::try_parse_from(["m2handler-hello", "-L", "5"]).is_err());
    }

    #[test]
    fn missing_config() {
        let args = CliArgs::try_parse_from(["m2handler-hello", "-c", "no/such/file"]).unwrap();

        assert_eq!(
            args.config_path().unwrap_err().to_string(),
            "no configuration file found. Tried: no/such/file"
        );
    }
}
