use chrono::{DateTime, Utc};
use serde::Serialize;
use std::collections::{BTreeMap, BTreeSet};
use std::fmt;

use crate::classify::{classify, is_failure, EventClass};
use crate::events::{resolve_database, LogDatabases, LogEvent};
use crate::AnalysisError;

/// Worker ids are counted over this many leading events only.
pub const WORKER_SAMPLE: usize = 10_000;

/// Nanosecond span rendered as `H:MM:SS.sss`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub struct Elapsed {
    pub nanos: i64,
}

impl fmt::Display for Elapsed {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        const HOUR: i64 = 3600 * 1_000_000_000;
        const MINUTE: i64 = 60 * 1_000_000_000;
        let sign = if self.nanos < 0 { "-" } else { "" };
        let mut rest = self.nanos.abs();
        let hours = rest / HOUR;
        rest -= hours * HOUR;
        let minutes = rest / MINUTE;
        rest -= minutes * MINUTE;
        let seconds = rest as f64 / 1.0e9;
        write!(f, "{}{}:{:02}:{:06.3}", sign, hours, minutes, seconds)
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct WorkerStatus {
    pub worker_id: String,
    pub message: String,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum Anomaly {
    NoShutdowns,
    ShutdownMismatch { workers: usize, shutdowns: usize },
}

impl fmt::Display for Anomaly {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Anomaly::NoShutdowns => write!(f, "*** No pipelines were shut down properly"),
            Anomaly::ShutdownMismatch { .. } => write!(f, "*** Shutdowns do not match pipelines"),
        }
    }
}

/// Derived view of a non-empty event stream.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct RunOutcome {
    pub first_received: DateTime<Utc>,
    pub last_received: DateTime<Utc>,
    pub elapsed: Elapsed,
    pub worker_count: usize,
    pub counts: BTreeMap<EventClass, usize>,
    pub failures: usize,
    pub anomaly: Option<Anomaly>,
    /// Last message per worker; filled only when shutdowns and workers
    /// disagree.
    pub last_messages: Vec<WorkerStatus>,
}

impl RunOutcome {
    pub fn count(&self, class: EventClass) -> usize {
        self.counts.get(&class).copied().unwrap_or(0)
    }

    pub fn shutdowns(&self) -> usize {
        self.count(EventClass::Shutdown)
    }
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct RunSummary {
    pub database: String,
    pub in_progress: bool,
    /// `None` when the database has no entries yet.
    pub outcome: Option<RunOutcome>,
}

impl RunSummary {
    pub fn is_empty(&self) -> bool {
        self.outcome.is_none()
    }
}

/// Looks up the run's database and summarizes it.
pub fn analyze(
    source: &dyn LogDatabases,
    run_id: &str,
    in_progress: bool,
) -> Result<RunSummary, AnalysisError> {
    let database = resolve_database(source, run_id)?;
    let events = source.events(&database)?;
    tracing::debug!(database = %database, events = events.len(), "analyzing event log");
    Ok(summarize(&database, &events, in_progress))
}

/// `events` must be ascending by id.
pub fn summarize(database: &str, events: &[LogEvent], in_progress: bool) -> RunSummary {
    let outcome = match (events.first(), events.last()) {
        (Some(first), Some(last)) => Some(outcome_of(first, last, events, in_progress)),
        _ => None,
    };
    RunSummary {
        database: database.to_string(),
        in_progress,
        outcome,
    }
}

fn outcome_of(first: &LogEvent, last: &LogEvent, events: &[LogEvent], in_progress: bool) -> RunOutcome {
    let worker_count = events
        .iter()
        .take(WORKER_SAMPLE)
        .map(|e| e.worker_id.as_str())
        .collect::<BTreeSet<_>>()
        .len();

    let mut counts: BTreeMap<EventClass, usize> = BTreeMap::new();
    let mut failures = 0;
    for event in events {
        let class = classify(&event.comment);
        if class != EventClass::None {
            *counts.entry(class).or_default() += 1;
        }
        if is_failure(&event.comment) {
            failures += 1;
        }
    }

    let shutdowns = counts.get(&EventClass::Shutdown).copied().unwrap_or(0);
    let mut anomaly = None;
    let mut last_messages = Vec::new();
    if shutdowns != worker_count {
        if !in_progress {
            anomaly = Some(if shutdowns == 0 {
                Anomaly::NoShutdowns
            } else {
                Anomaly::ShutdownMismatch {
                    workers: worker_count,
                    shutdowns,
                }
            });
        }
        last_messages = last_message_per_worker(events);
    }

    RunOutcome {
        first_received: first.received,
        last_received: last.received,
        elapsed: Elapsed {
            nanos: last.emitted_ns - first.emitted_ns,
        },
        worker_count,
        counts,
        failures,
        anomaly,
        last_messages,
    }
}

/// Comment of each worker's highest-id event, ordered by worker id.
pub fn last_message_per_worker(events: &[LogEvent]) -> Vec<WorkerStatus> {
    let mut last: BTreeMap<&str, &LogEvent> = BTreeMap::new();
    for event in events {
        let slot = last.entry(event.worker_id.as_str()).or_insert(event);
        if event.id >= slot.id {
            *slot = event;
        }
    }
    last.into_iter()
        .map(|(worker, event)| WorkerStatus {
            worker_id: worker.to_string(),
            message: event.comment.clone(),
        })
        .collect()
}

impl fmt::Display for RunSummary {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let Some(outcome) = &self.outcome else {
            return if self.in_progress {
                writeln!(f, "No log entries yet")
            } else {
                writeln!(f, "*** No log entries written")
            };
        };
        writeln!(f, "First log entry: {}", outcome.first_received)?;
        writeln!(f, "Last log entry: {}", outcome.last_received)?;
        writeln!(f, "Elapsed time: {}", outcome.elapsed)?;
        writeln!(f, "{} pipelines used", outcome.worker_count)?;
        for (class, n) in &outcome.counts {
            writeln!(f, "{} {}", n, class.describe())?;
        }
        if let Some(anomaly) = &outcome.anomaly {
            writeln!(f)?;
            writeln!(f, "{}", anomaly)?;
        }
        for status in &outcome.last_messages {
            if self.in_progress {
                writeln!(f, "Pipeline {} last status: {}", status.worker_id, status.message)?;
            } else {
                writeln!(f, "Pipeline {} ended with: {}", status.worker_id, status.message)?;
            }
        }
        writeln!(f, "{} failures seen", outcome.failures)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::events::MemoryLogStore;
    use chrono::TimeZone;

    fn event(id: u64, worker: &str, emitted_ns: i64, comment: &str) -> LogEvent {
        LogEvent {
            id,
            worker_id: worker.to_string(),
            emitted_ns,
            received: Utc
                .with_ymd_and_hms(2026, 10, 13, 9, 0, 0)
                .single()
                .expect("time")
                + chrono::Duration::nanoseconds(emitted_ns),
            comment: comment.to_string(),
        }
    }

    fn shutdown(id: u64, worker: &str) -> LogEvent {
        event(
            id,
            worker,
            id as i64 * 1_000,
            "Processing job: type=calexp sensor=0,0 visit=0 raft=0,0",
        )
    }

    fn completed_run(workers: usize) -> Vec<LogEvent> {
        let mut events = Vec::new();
        let mut id = 0;
        for w in 0..workers {
            id += 1;
            events.push(event(
                id,
                &format!("w{}", w),
                id as i64 * 1_000,
                "Processing job: type=calexp sensor=1,1 visit=85 raft=2,2",
            ));
            id += 1;
            events.push(event(
                id,
                &format!("w{}", w),
                id as i64 * 1_000,
                "Ending write to FitsStorage /out/calexp/v85.fits",
            ));
        }
        for w in 0..workers {
            id += 1;
            events.push(shutdown(id, &format!("w{}", w)));
        }
        events
    }

    #[test]
    fn elapsed_is_difference_of_extreme_ids() {
        let events = vec![
            event(1, "w0", 1_000_000_000, "start"),
            event(2, "w0", 2_000_000_000, "middle"),
            event(3, "w0", 1_000_000_000 + 3_723_500_000_000, "end"),
        ];
        let summary = summarize("db", &events, false);
        let outcome = summary.outcome.expect("outcome");
        assert_eq!(outcome.elapsed.nanos, 3_723_500_000_000);
        assert_eq!(outcome.elapsed.to_string(), "1:02:03.500");
    }

    #[test]
    fn empty_stream_is_not_an_error() {
        let summary = summarize("db", &[], true);
        assert!(summary.is_empty());
        assert_eq!(summary.to_string(), "No log entries yet\n");
        assert_eq!(summarize("db", &[], false).to_string(), "*** No log entries written\n");
    }

    #[test]
    fn failure_count_moves_by_exactly_one() {
        let mut events = completed_run(2);
        let base = summarize("db", &events, false).outcome.expect("outcome");
        assert_eq!(base.failures, 0);

        events.push(event(100, "w0", 100_000, "error reading calexp"));
        let bumped = summarize("db", &events, false).outcome.expect("outcome");
        assert_eq!(bumped.failures, 1);

        events.push(event(
            101,
            "w1",
            101_000,
            "Processing job: type=calexp sensor=1,2 visit=99 raft=0,1 ... failureStage ...",
        ));
        let excluded = summarize("db", &events, false).outcome.expect("outcome");
        assert_eq!(excluded.failures, 1);
    }

    #[test]
    fn matching_shutdowns_raise_no_anomaly() {
        let events = completed_run(3);
        let summary = summarize("db", &events, false);
        let outcome = summary.outcome.as_ref().expect("outcome");
        assert_eq!(outcome.worker_count, 3);
        assert_eq!(outcome.shutdowns(), 3);
        assert_eq!(outcome.count(EventClass::WorkUnitAttempted), 3);
        assert_eq!(outcome.count(EventClass::FinalProductWritten), 3);
        assert_eq!(outcome.anomaly, None);
        assert!(outcome.last_messages.is_empty());
        let text = summary.to_string();
        assert!(text.contains("3 pipelines used\n"));
        assert!(text.contains("3 pipeline shutdowns seen\n"));
        assert!(!text.contains("src writes"), "zero counts are omitted");
        assert!(text.ends_with("0 failures seen\n"));
    }

    #[test]
    fn missing_shutdown_flags_anomaly_with_last_message() {
        let mut events = completed_run(3);
        events.retain(|e| !(e.worker_id == "w1" && classify(&e.comment) == EventClass::Shutdown));
        let summary = summarize("db", &events, false);
        let outcome = summary.outcome.as_ref().expect("outcome");
        assert_eq!(
            outcome.anomaly,
            Some(Anomaly::ShutdownMismatch {
                workers: 3,
                shutdowns: 2
            })
        );
        let w1 = outcome
            .last_messages
            .iter()
            .find(|s| s.worker_id == "w1")
            .expect("w1 listed");
        assert_eq!(w1.message, "Ending write to FitsStorage /out/calexp/v85.fits");
        let text = summary.to_string();
        assert!(text.contains("*** Shutdowns do not match pipelines\n"));
        assert!(text.contains(
            "Pipeline w1 ended with: Ending write to FitsStorage /out/calexp/v85.fits\n"
        ));
    }

    #[test]
    fn in_progress_lists_status_without_anomaly() {
        let mut events = completed_run(2);
        events.retain(|e| classify(&e.comment) != EventClass::Shutdown);
        let summary = summarize("db", &events, true);
        let outcome = summary.outcome.as_ref().expect("outcome");
        assert_eq!(outcome.anomaly, None);
        assert_eq!(outcome.last_messages.len(), 2);
        let text = summary.to_string();
        assert!(!text.contains("***"));
        assert!(text.contains("Pipeline w0 last status: "));

        let final_text = summarize("db", &events, false).to_string();
        assert!(final_text.contains("*** No pipelines were shut down properly\n"));
    }

    #[test]
    fn worker_count_only_samples_leading_events() {
        let mut events: Vec<LogEvent> = (1..=WORKER_SAMPLE as u64)
            .map(|id| event(id, "w0", id as i64, "tick"))
            .collect();
        events.push(event(WORKER_SAMPLE as u64 + 1, "late", 0, "tick"));
        let outcome = summarize("db", &events, true).outcome.expect("outcome");
        assert_eq!(outcome.worker_count, 1);
    }

    #[test]
    fn analyze_refuses_ambiguous_run_ids() {
        let mut store = MemoryLogStore::new();
        store.insert("ktl_PT1_2_u_run123", completed_run(1));
        store.insert("ktl_PT1_2_u_run123_retry", completed_run(1));
        assert!(matches!(
            analyze(&store, "run123", false),
            Err(AnalysisError::Ambiguous { .. })
        ));
        assert!(matches!(
            analyze(&store, "run999", false),
            Err(AnalysisError::NoMatch(_))
        ));
        let summary = analyze(&store, "run123_retry", false).expect("unique");
        assert_eq!(summary.database, "ktl_PT1_2_u_run123_retry");
    }
}
