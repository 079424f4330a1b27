//! Site catchall parsing into a typed configuration record (spec.md §6,
//! Design Note §9 "Ad-hoc catchall parsing").
//!
//! The catchall is a comma-separated `key=value` string handed back by
//! the site-information oracle. It is parsed once at startup; unknown
//! keys are a `tracing::warn!`, never an error, and numeric/boolean
//! values are coerced on read with a clear error on failure (spec.md §9,
//! second Open Question).

use std::collections::HashMap;
use thiserror::Error;

#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum ConfigError {
    #[error("catchall key {key:?} has value {value:?}, expected an integer")]
    NotAnInteger { key: String, value: String },
    #[error("catchall key {key:?} has value {value:?}, expected a boolean")]
    NotABoolean { key: String, value: String },
}

/// Raw `key=value` catchall string, parsed into a lookup map.
#[derive(Debug, Clone, Default)]
pub struct Catchall {
    values: HashMap<String, String>,
}

impl Catchall {
    /// Parse a comma-separated `key=value,key2=value2` string. Entries
    /// without an `=` are skipped with a warning (malformed, not fatal).
    pub fn parse(raw: &str) -> Self {
        let mut values = HashMap::new();
        for entry in raw.split(',') {
            let entry = entry.trim();
            if entry.is_empty() {
                continue;
            }
            match entry.split_once('=') {
                Some((k, v)) => {
                    values.insert(k.trim().to_string(), v.trim().to_string());
                }
                None => {
                    tracing::warn!(entry, "malformed catchall entry, skipping");
                }
            }
        }
        Self { values }
    }

    pub fn get_str(&self, key: &str) -> Option<&str> {
        self.values.get(key).map(|s| s.as_str())
    }

    pub fn get_int(&self, key: &str) -> Result<Option<i64>, ConfigError> {
        match self.values.get(key) {
            None => Ok(None),
            Some(v) => v
                .parse::<i64>()
                .map(Some)
                .map_err(|_| ConfigError::NotAnInteger { key: key.to_string(), value: v.clone() }),
        }
    }

    pub fn get_bool(&self, key: &str) -> Result<Option<bool>, ConfigError> {
        match self.values.get(key) {
            None => Ok(None),
            Some(v) => match v.to_ascii_lowercase().as_str() {
                "true" => Ok(Some(true)),
                "false" => Ok(Some(false)),
                _ => Err(ConfigError::NotABoolean { key: key.to_string(), value: v.clone() }),
            },
        }
    }

    /// Recognized keys from spec.md §6, used to flag unrecognized ones
    /// with a warning rather than rejecting the whole catchall.
    pub fn warn_unrecognized(&self) {
        for key in self.values.keys() {
            if !RECOGNIZED_KEYS.contains(&key.as_str()) {
                tracing::warn!(key, "unrecognized catchall key, ignoring");
            }
        }
    }
}

const RECOGNIZED_KEYS: &[&str] = &[
    "yoda_to_os",
    "yoda_to_zip",
    "es_to_zip",
    "copyOutputToGlobal",
    "queue",
    "mppwidth",
    "mppnppn",
    "walltime_m",
    "ATHENA_PROC_NUMBER",
    "max_nodes",
    "min_walltime_m",
    "max_walltime_m",
    "nodes",
    "min_nodes",
    "cpu_per_node",
    "partition",
    "repo",
    "max_events",
    "initialtime_m",
    "time_per_event_m",
    "mode",
    "backfill_queue",
    "stageout_threads",
    "copy_input_files",
    "plugin",
    "localWorkingDir",
    "parallel_jobs",
    "events_limit_per_job",
];

/// Stage-out operating mode (spec.md §4.5). Mutually exclusive; derived
/// from the three boolean catchall flags (`yoda_to_os`, `yoda_to_zip`,
/// `es_to_zip`) with per-event as the fallback.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StageoutMode {
    PerEvent,
    Zip,
}

/// Typed, validated site configuration — the Scheduler's resource
/// acquisition step (spec.md §4.2 step 1) reads exactly these fields.
#[derive(Debug, Clone, PartialEq)]
pub struct SiteConfig {
    pub queue: String,
    pub mppwidth: i64,
    pub mppnppn: i64,
    pub walltime_m: i64,
    pub athena_proc_number: i64,
    pub max_nodes: i64,
    pub min_walltime_m: i64,
    pub max_walltime_m: i64,
    pub nodes: i64,
    pub min_nodes: i64,
    pub cpu_per_node: i64,
    pub partition: String,
    pub repo: String,
    pub max_events: i64,
    pub initialtime_m: i64,
    pub time_per_event_m: i64,
    pub mode: String,
    pub backfill_queue: Option<String>,
    pub stageout_threads: i64,
    pub copy_input_files: bool,
    pub plugin: String,
    pub local_working_dir: Option<String>,
    pub parallel_jobs: i64,
    pub events_limit_per_job: i64,
    pub stageout_mode: StageoutMode,
    pub copy_output_to_global: bool,
}

impl SiteConfig {
    pub fn from_catchall(catchall: &Catchall) -> Result<Self, ConfigError> {
        catchall.warn_unrecognized();
        let yoda_to_zip = catchall.get_bool("yoda_to_zip")?.unwrap_or(false);
        let es_to_zip = catchall.get_bool("es_to_zip")?.unwrap_or(false);
        let stageout_mode =
            if yoda_to_zip || es_to_zip { StageoutMode::Zip } else { StageoutMode::PerEvent };

        Ok(Self {
            queue: catchall.get_str("queue").unwrap_or_default().to_string(),
            mppwidth: catchall.get_int("mppwidth")?.unwrap_or(0),
            mppnppn: catchall.get_int("mppnppn")?.unwrap_or(0),
            walltime_m: catchall.get_int("walltime_m")?.unwrap_or(0),
            athena_proc_number: catchall.get_int("ATHENA_PROC_NUMBER")?.unwrap_or(0),
            max_nodes: catchall.get_int("max_nodes")?.unwrap_or(1),
            min_walltime_m: catchall.get_int("min_walltime_m")?.unwrap_or(0),
            max_walltime_m: catchall.get_int("max_walltime_m")?.unwrap_or(0),
            nodes: catchall.get_int("nodes")?.unwrap_or(1),
            min_nodes: catchall.get_int("min_nodes")?.unwrap_or(1),
            cpu_per_node: catchall.get_int("cpu_per_node")?.unwrap_or(1),
            partition: catchall.get_str("partition").unwrap_or_default().to_string(),
            repo: catchall.get_str("repo").unwrap_or_default().to_string(),
            max_events: catchall.get_int("max_events")?.unwrap_or(i64::MAX),
            initialtime_m: catchall.get_int("initialtime_m")?.unwrap_or(0),
            time_per_event_m: catchall.get_int("time_per_event_m")?.unwrap_or(0),
            mode: catchall.get_str("mode").unwrap_or("normal").to_string(),
            backfill_queue: catchall.get_str("backfill_queue").map(str::to_string),
            stageout_threads: catchall.get_int("stageout_threads")?.unwrap_or(4),
            copy_input_files: catchall.get_bool("copy_input_files")?.unwrap_or(true),
            plugin: catchall.get_str("plugin").unwrap_or("pbs").to_string(),
            local_working_dir: catchall.get_str("localWorkingDir").map(str::to_string),
            parallel_jobs: catchall.get_int("parallel_jobs")?.unwrap_or(1),
            events_limit_per_job: catchall.get_int("events_limit_per_job")?.unwrap_or(1000),
            stageout_mode,
            copy_output_to_global: catchall.get_bool("copyOutputToGlobal")?.unwrap_or(false),
        })
    }
}
