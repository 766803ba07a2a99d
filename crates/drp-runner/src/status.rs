use anyhow::{Context, Result};
use drp_analysis::{analyze, AnalysisError, LogDatabases, RunSummary};
use drp_core::{
    journal_line, tail_bytes, DrpConfig, DrpError, Environment, LockStore, RunHeader, RunLayout,
    TAIL_BYTES,
};
use nix::errno::Errno;
use nix::sys::signal::{killpg, Signal};
use nix::unistd::Pid;
use serde::Serialize;
use std::collections::BTreeMap;
use std::fmt;
use std::fs;
use std::path::{Path, PathBuf};
use tracing::{info, warn};

use crate::exec::{expand_template, StageCommand, StageRunner};

/// What is known about a run while (or after) it executes.
#[derive(Debug, Clone, Serialize)]
pub struct Progress {
    pub summary: Option<RunSummary>,
    /// Raw pipeline log excerpt, used when the log database has nothing yet.
    pub log_tail: Option<String>,
}

impl fmt::Display for Progress {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match &self.summary {
            Some(summary) => write!(f, "{}", summary)?,
            None => writeln!(f, "\tDatabase not yet created")?,
        }
        if let Some(tail) = &self.log_tail {
            writeln!(f, "(last 500 bytes)... {}", tail)?;
        }
        Ok(())
    }
}

/// Summary of `run_id`'s log database, falling back to the tail of the raw
/// pipeline log when the database is missing or empty.
pub fn progress(logs: &dyn LogDatabases, run_id: &str, output_dir: &Path, in_progress: bool) -> Result<Progress> {
    let summary = match analyze(logs, run_id, in_progress) {
        Ok(summary) => Some(summary),
        Err(AnalysisError::NoMatch(_)) => None,
        Err(err) => return Err(err).context("cannot analyze run log"),
    };
    let needs_tail = summary.as_ref().map_or(true, RunSummary::is_empty);
    let log_tail = if in_progress && needs_tail {
        tail_bytes(&RunLayout::new(output_dir).pipeline_log(), TAIL_BYTES).ok()
    } else {
        None
    };
    Ok(Progress { summary, log_tail })
}

#[derive(Debug, Clone, Serialize)]
pub struct GroupStatus {
    pub group: String,
    pub hosts: String,
    pub record: String,
    pub progress: Option<Progress>,
}

impl fmt::Display for GroupStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        writeln!(f, "*** Machine set {} {}", self.group, self.hosts)?;
        write!(f, "{}", self.record)?;
        if let Some(progress) = &self.progress {
            write!(f, "{}", progress)?;
        }
        Ok(())
    }
}

/// Every held machine group with its lock record and live progress.
pub fn status(config: &DrpConfig, locks: &LockStore, logs: &dyn LogDatabases) -> Result<Vec<GroupStatus>> {
    let mut out = Vec::new();
    for group in locks.held()? {
        // Released between listing and reading.
        let Some(record) = locks.read(&group)? else {
            continue;
        };
        let hosts = config
            .machine_group(&group)
            .map(|g| g.describe())
            .unwrap_or_else(|| "[unknown]".to_string());
        let header = RunHeader::parse(&record);
        let progress = match (&header.run_id, &header.output) {
            (Some(run_id), Some(output)) => Some(progress(logs, run_id, output, true)?),
            _ => None,
        };
        out.push(GroupStatus {
            group,
            hosts,
            record,
            progress,
        });
    }
    Ok(out)
}

#[derive(Debug, Clone, Serialize)]
pub struct RunStatusReport {
    pub run_id: String,
    /// True while the run still holds its machine group.
    pub active: bool,
    pub record: String,
    pub progress: Progress,
}

impl fmt::Display for RunStatusReport {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.record)?;
        write!(f, "{}", self.progress)
    }
}

/// Report on one run: its run log and final analysis once released, or its
/// lock record and live progress while it still runs.
/// `output_base` is the directory the run was started under.
pub fn report(output_base: &Path, locks: &LockStore, logs: &dyn LogDatabases, run_id: &str) -> Result<RunStatusReport> {
    let output_dir = output_base.join(run_id);
    let run_log = RunLayout::new(&output_dir).run_log();
    if run_log.exists() {
        let record = fs::read_to_string(&run_log)
            .with_context(|| format!("cannot read {}", run_log.display()))?;
        return Ok(RunStatusReport {
            run_id: run_id.to_string(),
            active: false,
            record,
            progress: progress(logs, run_id, &output_dir, false)?,
        });
    }
    let Some(group) = locks.find_run(run_id)? else {
        return Err(DrpError::Unreadable(run_log).into());
    };
    let record = locks.read(&group)?.ok_or_else(|| DrpError::NoActiveRun(run_id.to_string()))?;
    let output = RunHeader::parse(&record).output.unwrap_or(output_dir);
    Ok(RunStatusReport {
        run_id: run_id.to_string(),
        active: true,
        record,
        progress: progress(logs, run_id, &output, true)?,
    })
}

#[derive(Debug, Clone, Serialize)]
pub struct KillOutcome {
    pub run_id: String,
    pub group: String,
    pub signalled: Option<i32>,
    pub shutdown_requested: bool,
}

/// Stops a running pipeline: SIGTERM to its process group, then the
/// configured shutdown command. The run itself releases its claim.
pub fn kill(
    config: &DrpConfig,
    locks: &LockStore,
    env: &dyn Environment,
    stages: &dyn StageRunner,
    run_id: &str,
) -> Result<KillOutcome> {
    let group = locks
        .find_run(run_id)?
        .ok_or_else(|| DrpError::NoActiveRun(run_id.to_string()))?;
    locks.append(&group, &journal_line(&env.now(), "pipeline killed"))?;

    let record = locks.read(&group)?.unwrap_or_default();
    let output = RunHeader::parse(&record)
        .output
        .unwrap_or_else(|| config.output_base.join(run_id));
    let layout = RunLayout::new(&output);

    let signalled = match read_pgid(&layout.pipeline_pgid())? {
        Some(pgid) => match killpg(Pid::from_raw(pgid), Signal::SIGTERM) {
            Ok(()) => {
                info!(run_id = %run_id, pgid, "pipeline signalled");
                Some(pgid)
            }
            Err(Errno::ESRCH) => {
                warn!(run_id = %run_id, pgid, "pipeline process group already gone");
                None
            }
            Err(errno) => return Err(std::io::Error::from(errno)).context("cannot signal pipeline"),
        },
        None => None,
    };

    let mut shutdown_requested = false;
    if let Some(template) = &config.shutdown_command {
        let mut vars = BTreeMap::new();
        vars.insert("run_id", run_id.to_string());
        vars.insert("output", output.display().to_string());
        let stage = StageCommand {
            name: "shutdown".to_string(),
            command: expand_template(template, &vars),
            cwd: if layout.run_dir.is_dir() { layout.run_dir.clone() } else { PathBuf::from(".") },
            log: layout.run_dir.join("shutdown.log"),
            pgid_file: None,
        };
        shutdown_requested = stages.run(&stage)?;
        if !shutdown_requested {
            warn!(run_id = %run_id, "shutdown command failed");
        }
    }
    Ok(KillOutcome {
        run_id: run_id.to_string(),
        group,
        signalled,
        shutdown_requested,
    })
}

fn read_pgid(path: &Path) -> Result<Option<i32>> {
    match fs::read_to_string(path) {
        Ok(text) => {
            let pgid = text
                .trim()
                .parse::<i32>()
                .with_context(|| format!("malformed process group in {}", path.display()))?;
            Ok(Some(pgid))
        }
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(None),
        Err(e) => Err(e.into()),
    }
}

/// Input datasets under `input_base` that carry the configured collection.
pub fn list_inputs(config: &DrpConfig) -> Result<Vec<String>> {
    let mut inputs = Vec::new();
    let entries = fs::read_dir(&config.input_base)
        .with_context(|| format!("cannot list {}", config.input_base.display()))?;
    for entry in entries {
        let entry = entry?;
        if !entry.path().join(&config.collection).is_dir() {
            continue;
        }
        inputs.push(entry.file_name().to_string_lossy().to_string());
    }
    inputs.sort();
    Ok(inputs)
}

/// Newest input whose name starts with the configured prefix.
pub fn default_input(config: &DrpConfig) -> Result<Option<String>> {
    Ok(list_inputs(config)?
        .into_iter()
        .rev()
        .find(|name| name.starts_with(&config.default_input_prefix)))
}
