use regex::Regex;
use serde::Serialize;
use std::collections::BTreeMap;
use std::fmt;
use std::sync::OnceLock;

use crate::classify::is_failure;
use crate::events::{resolve_database, LogDatabases, LogEvent};
use crate::summary::{last_message_per_worker, WorkerStatus};
use crate::AnalysisError;

fn job_start() -> &'static Regex {
    static JOB_START: OnceLock<Regex> = OnceLock::new();
    JOB_START.get_or_init(|| {
        Regex::new(
            r"Processing job: type=calexp sensor=(?P<sensor>\d,\d) visit=(?P<visit>\d+) raft=(?P<raft>\d,\d)",
        )
        .expect("job start pattern is valid")
    })
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct FailureDetail {
    pub event_id: u64,
    pub worker_id: String,
    /// Work unit the worker was on, when one had started.
    pub job: Option<String>,
    pub context: Option<String>,
    pub message: String,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct ErrorReport {
    pub database: String,
    pub empty: bool,
    pub worker_status: Vec<WorkerStatus>,
    pub failures: Vec<FailureDetail>,
}

pub fn error_report(source: &dyn LogDatabases, run_id: &str) -> Result<ErrorReport, AnalysisError> {
    let database = resolve_database(source, run_id)?;
    let events = source.events(&database)?;
    Ok(build_error_report(&database, &events))
}

/// `events` must be ascending by id.
pub fn build_error_report(database: &str, events: &[LogEvent]) -> ErrorReport {
    let mut jobs: BTreeMap<&str, String> = BTreeMap::new();
    let mut failures = Vec::new();
    for event in events {
        if let Some(caps) = job_start().captures(&event.comment) {
            jobs.insert(
                event.worker_id.as_str(),
                format!("Visit {} Raft {} Sensor {}", &caps["visit"], &caps["raft"], &caps["sensor"]),
            );
            continue;
        }
        if event.comment.starts_with("Processing job:") || !is_failure(&event.comment) {
            continue;
        }
        let (context, message) = closing_lines(&event.comment);
        failures.push(FailureDetail {
            event_id: event.id,
            worker_id: event.worker_id.clone(),
            job: jobs.get(event.worker_id.as_str()).cloned(),
            context,
            message,
        });
    }
    ErrorReport {
        database: database.to_string(),
        empty: events.is_empty(),
        worker_status: last_message_per_worker(events),
        failures,
    }
}

/// Last non-blank line of a (possibly multi-line traceback) message and
/// the line just before it.
fn closing_lines(comment: &str) -> (Option<String>, String) {
    let lines: Vec<&str> = comment.lines().collect();
    let Some(last) = lines.iter().rposition(|l| !l.trim().is_empty()) else {
        return (None, String::new());
    };
    let context = last
        .checked_sub(1)
        .map(|i| lines[i].trim().to_string())
        .filter(|l| !l.is_empty());
    (context, lines[last].trim().to_string())
}

impl fmt::Display for ErrorReport {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        if self.empty {
            return writeln!(f, "*** No log entries written");
        }
        for status in &self.worker_status {
            writeln!(f, "Pipeline {} last status: {}", status.worker_id, status.message)?;
        }
        for failure in &self.failures {
            match &failure.job {
                Some(job) => writeln!(f, "*** Error in {} on {}:", job, failure.worker_id)?,
                None => writeln!(f, "*** Error in unknown job on {}:", failure.worker_id)?,
            }
            if let Some(context) = &failure.context {
                writeln!(f, "{}", context)?;
            }
            writeln!(f, "{}", failure.message)?;
        }
        Ok(())
    }
}
