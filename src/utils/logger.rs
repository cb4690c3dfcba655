/*
 * Copyright (c) 2024 Yunshan Networks
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

use std::fs;
use std::io;
use std::path::Path;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Weak};

use flexi_logger::{
    colored_opt_format, writers::LogWriter, Age, Cleanup, Criterion, DeferredNow, Duplicate,
    FileSpec, FlexiLoggerError, Level, Logger, LoggerHandle, Naming, Record,
};

use super::stats;

#[derive(Default)]
struct Counter {
    error: AtomicU64,
    warning: AtomicU64,
}

// A writer calculating log count by level without actually writing log
pub struct LogLevelWriter(Arc<Counter>);

impl LogLevelWriter {
    pub fn new() -> (Self, LogLevelCounter) {
        let c = Arc::new(Counter::default());
        (Self(c.clone()), LogLevelCounter(Arc::downgrade(&c)))
    }
}

impl LogWriter for LogLevelWriter {
    fn write(&self, _: &mut DeferredNow, record: &Record<'_>) -> io::Result<()> {
        match record.level() {
            Level::Error => &self.0.error,
            Level::Warn => &self.0.warning,
            _ => return Ok(()),
        }
        .fetch_add(1, Ordering::Relaxed);
        Ok(())
    }

    fn flush(&self) -> io::Result<()> {
        Ok(())
    }
}

pub struct LogLevelCounter(Weak<Counter>);

impl stats::OwnedCountable for LogLevelCounter {
    fn get_counters(&self) -> Vec<stats::Counter> {
        match self.0.upgrade() {
            Some(counters) => vec![
                (
                    "error",
                    stats::CounterType::Counted,
                    stats::CounterValue::Unsigned(counters.error.swap(0, Ordering::Relaxed)),
                ),
                (
                    "warning",
                    stats::CounterType::Counted,
                    stats::CounterValue::Unsigned(counters.warning.swap(0, Ordering::Relaxed)),
                ),
            ],
            None => vec![],
        }
    }

    fn closed(&self) -> bool {
        self.0.strong_count() == 0
    }
}

/// Starts the process logger.
///
/// Logs go to a daily rotated file when its directory is writable, and are
/// duplicated to stderr. `RUST_LOG` overrides `level`.
pub fn start_logger(
    log_file: &str,
    level: &str,
    retention: usize,
) -> Result<(LoggerHandle, LogLevelCounter), FlexiLoggerError> {
    let (log_level_writer, log_level_counter) = LogLevelWriter::new();
    let logger = Logger::try_with_env_or_str(level)?.format(colored_opt_format);
    // check log folder permission
    let write_to_file = match Path::new(log_file).parent() {
        Some(base_path) if base_path.exists() => base_path
            .metadata()
            .ok()
            .map(|meta| !meta.permissions().readonly())
            .unwrap_or(false),
        Some(base_path) => fs::create_dir_all(base_path).is_ok(),
        None => false,
    };
    let logger = if write_to_file {
        logger
            .log_to_file_and_writer(FileSpec::try_from(log_file)?, Box::new(log_level_writer))
            .rotate(
                Criterion::Age(Age::Day),
                Naming::Timestamps,
                Cleanup::KeepLogFiles(retention),
            )
            .create_symlink(log_file)
            .append()
    } else {
        eprintln!(
            "Log file path '{}' access denied, logs will not be written to file",
            log_file
        );
        logger.log_to_writer(Box::new(log_level_writer))
    };
    let handle = logger.duplicate_to_stderr(Duplicate::All).start()?;
    Ok((handle, log_level_counter))
}
