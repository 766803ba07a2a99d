use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::fs;
use std::io::ErrorKind;
use std::path::PathBuf;

use crate::classify::like;
use crate::AnalysisError;

/// One record of the pipeline's event log.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct LogEvent {
    pub id: u64,
    #[serde(rename = "workerid")]
    pub worker_id: String,
    /// Emit time in nanoseconds.
    #[serde(rename = "timestamp")]
    pub emitted_ns: i64,
    #[serde(rename = "timereceived")]
    pub received: DateTime<Utc>,
    pub comment: String,
}

/// Read-only access to the per-run log databases.
pub trait LogDatabases {
    /// Database names matching a `%`-pattern, sorted.
    fn matching(&self, pattern: &str) -> Result<Vec<String>, AnalysisError>;

    /// All events of one database, ascending by id.
    fn events(&self, database: &str) -> Result<Vec<LogEvent>, AnalysisError>;
}

/// Picks the single database for `run_id`; zero and several matches are
/// distinct errors.
pub fn resolve_database(
    source: &dyn LogDatabases,
    run_id: &str,
) -> Result<String, AnalysisError> {
    let pattern = format!("%{}%", run_id);
    let mut names = source.matching(&pattern)?;
    match names.len() {
        0 => Err(AnalysisError::NoMatch(run_id.to_string())),
        1 => Ok(names.remove(0)),
        _ => Err(AnalysisError::Ambiguous {
            run_id: run_id.to_string(),
            candidates: names,
        }),
    }
}

/// Databases stored as `<dir>/<name>.jsonl`, one event object per line.
#[derive(Debug, Clone)]
pub struct JsonlLogStore {
    dir: PathBuf,
}

impl JsonlLogStore {
    pub fn new(dir: impl Into<PathBuf>) -> Self {
        Self { dir: dir.into() }
    }

    fn path_for(&self, database: &str) -> PathBuf {
        self.dir.join(format!("{}.jsonl", database))
    }
}

impl LogDatabases for JsonlLogStore {
    fn matching(&self, pattern: &str) -> Result<Vec<String>, AnalysisError> {
        let entries = match fs::read_dir(&self.dir) {
            Ok(entries) => entries,
            Err(e) if e.kind() == ErrorKind::NotFound => return Ok(Vec::new()),
            Err(e) => return Err(e.into()),
        };
        let mut names = Vec::new();
        for entry in entries {
            let path = entry?.path();
            if path.extension().and_then(|e| e.to_str()) != Some("jsonl") {
                continue;
            }
            let Some(stem) = path.file_stem().and_then(|s| s.to_str()) else {
                continue;
            };
            if like(stem, pattern) {
                names.push(stem.to_string());
            }
        }
        names.sort();
        Ok(names)
    }

    fn events(&self, database: &str) -> Result<Vec<LogEvent>, AnalysisError> {
        let data = fs::read_to_string(self.path_for(database))?;
        // A line still being written by the logger has no newline yet.
        let complete = match data.rfind('\n') {
            Some(end) => &data[..=end],
            None => "",
        };
        let mut events = Vec::new();
        for (idx, line) in complete.lines().enumerate() {
            if line.trim().is_empty() {
                continue;
            }
            let event: LogEvent =
                serde_json::from_str(line).map_err(|source| AnalysisError::Parse {
                    database: database.to_string(),
                    line: idx + 1,
                    source,
                })?;
            events.push(event);
        }
        events.sort_by_key(|e| e.id);
        Ok(events)
    }
}

/// Events held in memory, keyed by database name.
#[derive(Debug, Clone, Default)]
pub struct MemoryLogStore {
    databases: std::collections::BTreeMap<String, Vec<LogEvent>>,
}

impl MemoryLogStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn insert(&mut self, database: &str, mut events: Vec<LogEvent>) {
        events.sort_by_key(|e| e.id);
        self.databases.insert(database.to_string(), events);
    }
}

impl LogDatabases for MemoryLogStore {
    fn matching(&self, pattern: &str) -> Result<Vec<String>, AnalysisError> {
        Ok(self
            .databases
            .keys()
            .filter(|name| like(name, pattern))
            .cloned()
            .collect())
    }

    fn events(&self, database: &str) -> Result<Vec<LogEvent>, AnalysisError> {
        self.databases
            .get(database)
            .cloned()
            .ok_or_else(|| AnalysisError::NoMatch(database.to_string()))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;

    fn temp_root(tag: &str) -> PathBuf {
        let root = std::env::temp_dir().join(format!(
            "drp_events_{}_{}_{}",
            tag,
            std::process::id(),
            Utc::now().timestamp_micros()
        ));
        fs::create_dir_all(&root).expect("temp dir");
        root
    }

    fn line(id: u64, worker: &str, comment: &str) -> String {
        let event = LogEvent {
            id,
            worker_id: worker.to_string(),
            emitted_ns: id as i64 * 1_000_000_000,
            received: Utc
                .with_ymd_and_hms(2026, 10, 13, 9, 0, 0)
                .single()
                .expect("time"),
            comment: comment.to_string(),
        };
        serde_json::to_string(&event).expect("encode")
    }

    #[test]
    fn jsonl_store_reads_sorted_and_skips_partial_tail() {
        let root = temp_root("read");
        let store = JsonlLogStore::new(&root);
        let body = format!(
            "{}\n{}\n{{\"id\":3,\"workerid\":",
            line(2, "w2", "second"),
            line(1, "w1", "first")
        );
        fs::write(root.join("ktl_PT1_2_u_run123.jsonl"), body).expect("write");
        let events = store.events("ktl_PT1_2_u_run123").expect("events");
        assert_eq!(events.iter().map(|e| e.id).collect::<Vec<_>>(), vec![1, 2]);
        let _ = fs::remove_dir_all(root);
    }

    #[test]
    fn resolve_database_distinguishes_none_one_and_many() {
        let root = temp_root("resolve");
        let store = JsonlLogStore::new(&root);
        assert!(matches!(
            resolve_database(&store, "run123"),
            Err(AnalysisError::NoMatch(_))
        ));

        fs::write(root.join("ktl_PT1_2_u_run123.jsonl"), "").expect("write");
        fs::write(root.join("notes.txt"), "").expect("write");
        assert_eq!(
            resolve_database(&store, "run123").expect("single"),
            "ktl_PT1_2_u_run123"
        );

        fs::write(root.join("ktl_PT1_2_u_run1234.jsonl"), "").expect("write");
        match resolve_database(&store, "run123") {
            Err(AnalysisError::Ambiguous { candidates, .. }) => assert_eq!(
                candidates,
                vec!["ktl_PT1_2_u_run123".to_string(), "ktl_PT1_2_u_run1234".to_string()]
            ),
            other => panic!("expected ambiguous match, got {:?}", other),
        }
        let _ = fs::remove_dir_all(root);
    }

    #[test]
    fn missing_events_dir_means_no_database_yet() {
        let store = JsonlLogStore::new("/nonexistent/drp/events");
        assert!(matches!(
            resolve_database(&store, "run123"),
            Err(AnalysisError::NoMatch(_))
        ));
    }

    #[test]
    fn malformed_complete_line_is_a_parse_error() {
        let root = temp_root("parse");
        let store = JsonlLogStore::new(&root);
        fs::write(root.join("db_run9.jsonl"), "not json\n").expect("write");
        assert!(matches!(
            store.events("db_run9"),
            Err(AnalysisError::Parse { line: 1, .. })
        ));
        let _ = fs::remove_dir_all(root);
    }
}
