//! Shared test utilities for shell-logger integration tests.

// Each test file compiles separately, so not all helpers are used in each binary
#![allow(dead_code)]

use shell_logger::{CommandRecord, LogEntry, LoggerConfig, ShellLogger};
use std::path::{Path, PathBuf};
use tempfile::TempDir;

/// Test context owning the log directory of one logger.
pub struct TestContext {
    pub temp_dir: TempDir,
    pub logger: ShellLogger,
}

impl TestContext {
    pub fn new() -> Self {
        Self::with_config(LoggerConfig::default())
    }

    pub fn with_config(config: LoggerConfig) -> Self {
        let temp_dir = TempDir::new().expect("Failed to create temp dir");
        let config = LoggerConfig {
            log_dir: temp_dir.path().join("logs"),
            ..config
        };
        let logger = ShellLogger::new("test", &config).expect("Failed to create logger");
        Self { temp_dir, logger }
    }

    pub fn temp_path(&self) -> &Path {
        self.temp_dir.path()
    }

    /// The most recent command in the log book.
    pub fn last_command(&self) -> &CommandRecord {
        self.logger
            .log_book()
            .iter()
            .rev()
            .find_map(|entry| match entry {
                LogEntry::Command(record) => Some(record.as_ref()),
                _ => None,
            })
            .expect("No command was logged")
    }

    /// Files in the stream directory, sorted by name.
    pub fn stream_files(&self) -> Vec<PathBuf> {
        let mut files: Vec<PathBuf> = std::fs::read_dir(self.logger.stream_dir())
            .expect("Failed to read stream dir")
            .map(|entry| entry.expect("Failed to read entry").path())
            .collect();
        files.sort();
        files
    }
}

pub fn has_executable(name: &str) -> bool {
    which::which(name).is_ok()
}
