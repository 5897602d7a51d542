// Copyright (c) 2020-2022 The devcoord authors
//
// SPDX-License-Identifier: Apache-2.0
//

//! Structured logging shared by the device coordinator components.
//!
//! Records are emitted through an asynchronous drain so that logging never
//! blocks the coordinator's dispatch loop. The level can be changed while the
//! process is running through the [`LevelHandle`] returned alongside a logger.

use std::collections::HashMap;
use std::io::Write;
use std::process;
use std::sync::Arc;

use arc_swap::ArcSwap;
use lazy_static::lazy_static;
use slog::{o, Drain, Level};

const DEFAULT_SUBSYSTEM: &str = "root";
const ASYNC_THREAD_NAME: &str = "slog-async-logger";
const ASYNC_CHANNEL_SIZE: usize = 1024;

const LOG_LEVELS: &[(&str, Level)] = &[
    ("trace", Level::Trace),
    ("debug", Level::Debug),
    ("info", Level::Info),
    ("warn", Level::Warning),
    ("error", Level::Error),
    ("critical", Level::Critical),
];

lazy_static! {
    static ref LEVEL_BY_NAME: HashMap<&'static str, Level> = LOG_LEVELS.iter().cloned().collect();
}

/// Define a crate-local macro returning the scoped logger tagged with a
/// `subsystem` key.
///
/// ```ignore
/// logging::logger_with_subsystem!(sl, "devcoord");
/// info!(sl!(), "coordinator started");
/// ```
#[macro_export]
macro_rules! logger_with_subsystem {
    ($name: ident, $subsystem: expr) => {
        macro_rules! $name {
            () => {
                slog_scope::logger().new(slog::o!("subsystem" => $subsystem))
            };
        }
    };
}

/// Shared, runtime-adjustable log level.
#[derive(Clone, Debug)]
pub struct LevelHandle(Arc<ArcSwap<Level>>);

impl LevelHandle {
    fn new(level: Level) -> Self {
        LevelHandle(Arc::new(ArcSwap::from_pointee(level)))
    }

    /// Current filtering level.
    pub fn level(&self) -> Level {
        **self.0.load()
    }

    /// Change the filtering level of every drain sharing this handle.
    pub fn set_level(&self, level: Level) {
        self.0.store(Arc::new(level));
    }
}

/// Drain filtering records below a level that may change at runtime.
pub struct RuntimeLevelFilter<D> {
    drain: D,
    level: LevelHandle,
}

impl<D> RuntimeLevelFilter<D> {
    pub fn new(drain: D, level: LevelHandle) -> Self {
        RuntimeLevelFilter { drain, level }
    }
}

impl<D> Drain for RuntimeLevelFilter<D>
where
    D: Drain,
{
    type Ok = Option<D::Ok>;
    type Err = Option<D::Err>;

    fn log(
        &self,
        record: &slog::Record,
        values: &slog::OwnedKVList,
    ) -> std::result::Result<Self::Ok, Self::Err> {
        if record.level().is_at_least(self.level.level()) {
            self.drain.log(record, values).map(Some).map_err(Some)
        } else {
            Ok(None)
        }
    }
}

/// Creates a logger which prints output as JSON to `writer`.
pub fn create_logger<W>(
    name: &str,
    source: &str,
    level: Level,
    writer: W,
) -> (slog::Logger, slog_async::AsyncGuard)
where
    W: Write + Send + Sync + 'static,
{
    let (logger, guard, _) = create_logger_with_level(name, source, level, writer);
    (logger, guard)
}

/// Like [`create_logger`], also returning the handle that adjusts the level.
pub fn create_logger_with_level<W>(
    name: &str,
    source: &str,
    level: Level,
    writer: W,
) -> (slog::Logger, slog_async::AsyncGuard, LevelHandle)
where
    W: Write + Send + Sync + 'static,
{
    let json_drain = slog_json::Json::new(writer)
        .add_default_keys()
        .build()
        .fuse();

    let handle = LevelHandle::new(level);
    let filter_drain = RuntimeLevelFilter::new(json_drain, handle.clone()).fuse();

    let (async_drain, guard) = slog_async::Async::new(filter_drain)
        .thread_name(ASYNC_THREAD_NAME.into())
        .chan_size(ASYNC_CHANNEL_SIZE)
        .build_with_guard();

    let logger = slog::Logger::root(
        async_drain.fuse(),
        o!(
            "version" => env!("CARGO_PKG_VERSION"),
            "subsystem" => DEFAULT_SUBSYSTEM,
            "pid" => process::id().to_string(),
            "name" => name.to_string(),
            "source" => source.to_string()
        ),
    );

    (logger, guard, handle)
}

/// Creates a logger which prints human readable text to the terminal.
pub fn create_term_logger(level: Level) -> (slog::Logger, slog_async::AsyncGuard) {
    let decorator = slog_term::TermDecorator::new().build();
    let term_drain = slog_term::FullFormat::new(decorator).build().fuse();
    let filter_drain = RuntimeLevelFilter::new(term_drain, LevelHandle::new(level)).fuse();

    let (async_drain, guard) = slog_async::Async::new(filter_drain)
        .thread_name(ASYNC_THREAD_NAME.into())
        .chan_size(ASYNC_CHANNEL_SIZE)
        .build_with_guard();

    let logger = slog::Logger::root(async_drain.fuse(), o!("subsystem" => DEFAULT_SUBSYSTEM));

    (logger, guard)
}

/// Names of all supported levels, most verbose first.
pub fn get_log_levels() -> Vec<&'static str> {
    LOG_LEVELS.iter().map(|(name, _)| *name).collect()
}

pub fn level_name_to_slog_level(level_name: &str) -> Result<Level, String> {
    LEVEL_BY_NAME
        .get(level_name)
        .copied()
        .ok_or_else(|| format!("invalid log level: {:?}", level_name))
}

pub fn slog_level_to_level_name(level: Level) -> Result<&'static str, &'static str> {
    LOG_LEVELS
        .iter()
        .find(|(_, l)| *l == level)
        .map(|(name, _)| *name)
        .ok_or("invalid slog level")
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::Value;
    use slog::{crit, debug, info};
    use std::fs::File;
    use std::io::{BufRead, BufReader};
    use tempfile::NamedTempFile;

    fn read_records(path: &std::path::Path) -> Vec<Value> {
        let reader = BufReader::new(File::open(path).unwrap());
        reader
            .lines()
            .map(|l| serde_json::from_str(&l.unwrap()).unwrap())
            .collect()
    }

    #[test]
    fn test_level_names() {
        for name in get_log_levels() {
            let level = level_name_to_slog_level(name).unwrap();
            assert_eq!(slog_level_to_level_name(level).unwrap(), name);
        }
        assert!(level_name_to_slog_level("verbose").is_err());
        assert!(level_name_to_slog_level("").is_err());
    }

    #[test]
    fn test_create_logger_writes_json() {
        let file = NamedTempFile::new().unwrap();
        let writer = file.reopen().unwrap();

        let (logger, guard) = create_logger("devcoord", "unit-test", Level::Info, writer);
        info!(logger, "coordinator started"; "devices" => 4);
        debug!(logger, "filtered out");
        drop(logger);
        drop(guard);

        let records = read_records(file.path());
        assert_eq!(records.len(), 1);
        let record = &records[0];
        assert_eq!(record["msg"], "coordinator started");
        assert_eq!(record["level"], "INFO");
        assert_eq!(record["name"], "devcoord");
        assert_eq!(record["source"], "unit-test");
        assert_eq!(record["subsystem"], DEFAULT_SUBSYSTEM);
        assert_eq!(record["devices"], 4);
        assert_eq!(record["pid"], process::id().to_string());
    }

    #[test]
    fn test_runtime_level_change() {
        let file = NamedTempFile::new().unwrap();
        let writer = file.reopen().unwrap();

        let (logger, guard, handle) =
            create_logger_with_level("devcoord", "unit-test", Level::Info, writer);
        debug!(logger, "dropped");
        handle.set_level(Level::Debug);
        assert_eq!(handle.level(), Level::Debug);
        debug!(logger, "kept");
        handle.set_level(Level::Critical);
        info!(logger, "dropped again");
        crit!(logger, "fatal");
        drop(logger);
        drop(guard);

        let msgs: Vec<String> = read_records(file.path())
            .iter()
            .map(|r| r["msg"].as_str().unwrap().to_string())
            .collect();
        assert_eq!(msgs, vec!["kept".to_string(), "fatal".to_string()]);
    }
}
