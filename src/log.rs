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

use log::{Level, LevelFilter, Log, Metadata, Record};
use std::fmt;
use std::fs::File;
use std::io::{self, Write};
use std::sync::{Mutex, OnceLock};
use time::macros::format_description;
use time::{OffsetDateTime, UtcOffset};

pub struct SimpleLogger {
    local_offset: Option<UtcOffset>,
    output_file: Option<Mutex<File>>,
}

fn level_name(level: Level) -> &'static str {
    match level {
        Level::Error => "ERR",
        Level::Warn => "WARN",
        Level::Info => "INFO",
        Level::Debug => "DEBUG",
        Level::Trace => "TRACE",
    }
}

/// Maps a command line log level (0=error .. 4=trace) to a filter.
pub fn level_filter(level: u32) -> LevelFilter {
    match level {
        0 => LevelFilter::Error,
        1 => LevelFilter::Warn,
        2 => LevelFilter::Info,
        3 => LevelFilter::Debug,
        _ => LevelFilter::Trace,
    }
}

fn timestamp(now: OffsetDateTime) -> String {
    let format = format_description!(
        "[year]-[month]-[day] [hour]:[minute]:[second].[subsecond digits:3]"
    );

    now.format(&format).unwrap_or_default()
}

fn format_line(level: Level, ts: &str, target: &str, args: &fmt::Arguments) -> String {
    format!("[{}] {} [{}] {}", level_name(level), ts, target, args)
}

impl Log for SimpleLogger {
    fn enabled(&self, metadata: &Metadata) -> bool {
        metadata.level() <= log::max_level()
    }

    fn log(&self, record: &Record) {
        if !self.enabled(record.metadata()) {
            return;
        }

        let now = OffsetDateTime::now_utc().to_offset(self.local_offset.unwrap_or(UtcOffset::UTC));

        let line = format_line(
            record.level(),
            &timestamp(now),
            record.target(),
            record.args(),
        );

        // nowhere to report a failed log write
        let _ = match &self.output_file {
            Some(f) => writeln!(f.lock().unwrap_or_else(|e| e.into_inner()), "{}", line),
            None => writeln!(io::stdout(), "{}", line),
        };
    }

    fn flush(&self) {
        let _ = match &self.output_file {
            Some(f) => f.lock().unwrap_or_else(|e| e.into_inner()).flush(),
            None => io::stdout().flush(),
        };
    }
}

// SAFETY: this method is unsound on platforms where another thread may
// modify environment vars
unsafe fn get_offset() -> Option<UtcOffset> {
    time::util::local_offset::set_soundness(time::util::local_offset::Soundness::Unsound);

    let offset = UtcOffset::current_local_offset().ok();

    time::util::local_offset::set_soundness(time::util::local_offset::Soundness::Sound);

    offset
}

static LOGGER: OnceLock<SimpleLogger> = OnceLock::new();

pub fn ensure_init_simple_logger(output_file: Option<File>) {
    LOGGER.get_or_init(|| {
        // SAFETY: called once, early, before any threads that could touch
        // the environment are started
        let local_offset = unsafe { get_offset() };

        SimpleLogger {
            local_offset,
            output_file: output_file.map(Mutex::new),
        }
    });
}

pub fn get_simple_logger() -> &'static SimpleLogger {
    ensure_init_simple_logger(None);

    // logger is guaranteed to have been initialized
    LOGGER.get().expect("logger should be initialized")
}

/// Installs the process logger, writing to `log_file` if given, else
/// stdout.
pub fn init(log_file: Option<&str>, level: u32) -> Result<(), io::Error> {
    let output_file = match log_file {
        Some(path) => Some(File::options().create(true).append(true).open(path)?),
        None => None,
    };

    ensure_init_simple_logger(output_file);

    log::set_logger(get_simple_logger())
        .map_err(|e| io::Error::new(io::ErrorKind::Other, e.to_string()))?;
    log::set_max_level(level_filter(level));

    if get_simple_logger().local_offset.is_none() {
        log::warn!("Failed to determine local time offset. Log timestamps will be in UTC.");
    }

    Ok(())
}
