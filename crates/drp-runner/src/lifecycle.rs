use anyhow::{Context, Result};
use drp_analysis::{analyze, AnalysisError, LogDatabases, RunSummary};
use drp_core::{
    check_writable, journal_line, tail_bytes, DrpConfig, DrpError, Environment, LockStore,
    MachineGroup, RunOptions, RunRecord, StageSpec, TAIL_BYTES,
};
use serde::Serialize;
use std::fmt;
use std::path::{Path, PathBuf};
use tracing::{error, info, warn};

use crate::checks::prepare_run;
use crate::exec::{expand_template, template_vars, StageCommand, StageRunner};
use crate::links::link_run;
use crate::notify::Notifier;
use crate::provision::{mismatched_snapshots, Provisioner};
use crate::selector::select_group;

const SUBJECT_TAG: &str = "[drpRun]";

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum RunState {
    Created,
    Locked,
    Provisioned,
    Executing,
    PostProcessing,
    Reporting,
    Linked,
    Released,
    Failed,
}

impl fmt::Display for RunState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            RunState::Created => "created",
            RunState::Locked => "locked",
            RunState::Provisioned => "provisioned",
            RunState::Executing => "executing",
            RunState::PostProcessing => "post_processing",
            RunState::Reporting => "reporting",
            RunState::Linked => "linked",
            RunState::Released => "released",
            RunState::Failed => "failed",
        };
        f.write_str(s)
    }
}

/// Everything a run talks to outside its own record.
#[derive(Clone, Copy)]
pub struct Collaborators<'a> {
    pub env: &'a dyn Environment,
    pub provisioner: &'a dyn Provisioner,
    pub stages: &'a dyn StageRunner,
    pub notifier: &'a dyn Notifier,
    pub logs: &'a dyn LogDatabases,
}

#[derive(Debug, Clone, Serialize)]
pub struct RunReport {
    pub run_id: String,
    pub group: String,
    pub output_dir: PathBuf,
    pub run_log: PathBuf,
    pub state: RunState,
    pub history: Vec<RunState>,
    pub summary: Option<RunSummary>,
    pub linked: Option<PathBuf>,
}

/// Held claim on a machine group. Released exactly once: explicitly through
/// `release`, or on drop if the run unwinds before reaching it.
struct GroupClaim<'a> {
    locks: &'a LockStore,
    group: String,
    artifact: PathBuf,
    done: bool,
}

impl<'a> GroupClaim<'a> {
    fn new(locks: &'a LockStore, group: &str, artifact: PathBuf) -> Self {
        Self {
            locks,
            group: group.to_string(),
            artifact,
            done: false,
        }
    }

    fn release(&mut self) -> drp_core::Result<()> {
        self.done = true;
        self.locks.release(&self.group, &self.artifact)
    }
}

impl Drop for GroupClaim<'_> {
    fn drop(&mut self) {
        if !self.done {
            self.done = true;
            if let Err(err) = self.locks.release(&self.group, &self.artifact) {
                error!(group = %self.group, error = %err, "machine group left claimed");
            }
        }
    }
}

/// One production run, driven from `Created` to `Released` or `Failed`.
pub struct ProductionRun<'a> {
    config: &'a DrpConfig,
    record: RunRecord,
    locks: &'a LockStore,
    collab: Collaborators<'a>,
    state: RunState,
    history: Vec<RunState>,
}

impl<'a> ProductionRun<'a> {
    pub fn new(config: &'a DrpConfig, record: RunRecord, locks: &'a LockStore, collab: Collaborators<'a>) -> Self {
        Self {
            config,
            record,
            locks,
            collab,
            state: RunState::Created,
            history: vec![RunState::Created],
        }
    }

    pub fn state(&self) -> RunState {
        self.state
    }

    pub fn history(&self) -> &[RunState] {
        &self.history
    }

    pub fn record(&self) -> &RunRecord {
        &self.record
    }

    /// Claims a group, runs every stage and releases the claim. The claim
    /// is released on every path past acquisition; a stage failure is
    /// returned after the release.
    pub fn execute(&mut self) -> Result<RunReport> {
        let locks = self.locks;
        let record = &self.record;
        let group = match select_group(self.config, locks, &record.arch, |name| record.header(name)) {
            Ok(group) => group,
            Err(err) => {
                self.transition(RunState::Failed);
                return Err(err.into());
            }
        };
        self.transition(RunState::Locked);

        let run_log = self.record.layout().run_log();
        let mut claim = GroupClaim::new(locks, &group.name, run_log.clone());
        let outcome = self.drive(&group);

        let closing = match &outcome {
            Ok(_) => "Run complete",
            Err(_) => "Run failed",
        };
        if let Err(err) = self.journal(&group.name, closing) {
            warn!(error = %err, "cannot journal run end");
        }
        if outcome.is_err() {
            self.transition(RunState::Failed);
        }
        let released = claim.release();

        match (outcome, released) {
            (Ok((summary, linked)), Ok(())) => {
                self.transition(RunState::Released);
                let body = summary
                    .as_ref()
                    .map(|s| s.to_string())
                    .unwrap_or_else(|| "Database not yet created".to_string());
                self.notify(&format!("{} Complete: run {}", SUBJECT_TAG, self.record.run_id), &body);
                Ok(RunReport {
                    run_id: self.record.run_id.clone(),
                    group: group.name.clone(),
                    output_dir: self.record.output_dir.clone(),
                    run_log,
                    state: self.state,
                    history: self.history.clone(),
                    summary,
                    linked,
                })
            }
            (Ok(_), Err(rel)) => {
                self.transition(RunState::Failed);
                self.notify_failure(&rel.to_string());
                Err(rel.into())
            }
            (Err(err), Ok(())) => {
                self.notify_failure(&format!("{:#}", err));
                Err(err)
            }
            (Err(err), Err(rel)) => {
                self.notify_failure(&format!("{:#}", err));
                Err(err.context(format!("releasing the machine group also failed: {}", rel)))
            }
        }
    }

    fn drive(&mut self, group: &MachineGroup) -> Result<(Option<RunSummary>, Option<PathBuf>)> {
        let record = self.record.clone();
        let layout = record.layout();
        let vars = template_vars(self.config, &record);
        self.journal(&group.name, &format!("Machine group {} acquired", group.name))?;
        self.notify(
            &format!("{} Start on {}: run {}", SUBJECT_TAG, group.name, record.run_id),
            &record.header(&group.name),
        );

        self.collab
            .provisioner
            .provision(self.config, &record, group)
            .map_err(|e| stage_failure("provision", e))?;
        self.journal(&group.name, "Run directory created")?;
        self.transition(RunState::Provisioned);

        let pipeline = StageCommand {
            name: "pipeline".to_string(),
            command: expand_template(&self.config.pipeline_command, &vars),
            cwd: layout.run_dir.clone(),
            log: layout.pipeline_log(),
            pgid_file: Some(layout.pipeline_pgid()),
        };
        self.transition(RunState::Executing);
        self.journal(&group.name, "Pipeline started")?;
        self.run_stage(&pipeline)?;
        self.journal(&group.name, "Pipeline complete")?;
        let body = match self.summary(false)? {
            Some(summary) => summary.to_string(),
            None => "Database not yet created".to_string(),
        };
        self.notify(&format!("{} End of execution: run {}", SUBJECT_TAG, record.run_id), &body);

        let mismatched = mismatched_snapshots(&record).map_err(|e| stage_failure("setup_check", e))?;
        if !mismatched.is_empty() {
            let listing = mismatched
                .iter()
                .map(|p| p.display().to_string())
                .collect::<Vec<_>>()
                .join("\n");
            return Err(DrpError::stage("setup_check", Some(listing)).into());
        }

        self.transition(RunState::PostProcessing);
        self.run_steps(&group.name, &self.config.post_steps, &vars, &layout.run_dir)?;
        if record.do_qa {
            check_writable(&self.config.qa_dir).map_err(|e| stage_failure("qa", e.into()))?;
            self.notify(
                &format!("{} QA start: run {}", SUBJECT_TAG, record.run_id),
                &format!("QA output will be at {}", record.qa_url),
            );
            self.run_steps(&group.name, &self.config.qa_steps, &vars, &layout.run_dir)?;
        }

        self.transition(RunState::Reporting);
        let summary = self.summary(false)?;
        if let Some(summary) = &summary {
            info!(run_id = %record.run_id, "\n{}", summary);
        }

        let mut linked = None;
        if !record.test_only {
            link_run(self.config, &record.output_base, &record.run_type, &record.output_dir, &record.db_name)
                .map_err(|e| stage_failure("link", e))?;
            linked = Some(record.output_base.join(format!("latest_{}", record.run_type)));
            self.journal(&group.name, "Latest link updated")?;
            self.transition(RunState::Linked);
        }
        Ok((summary, linked))
    }

    fn run_steps(
        &self,
        group: &str,
        steps: &[StageSpec],
        vars: &std::collections::BTreeMap<&'static str, String>,
        run_dir: &Path,
    ) -> Result<()> {
        for spec in steps {
            let stage = StageCommand::from_spec(spec, vars, run_dir);
            self.journal(group, &format!("{} started", stage.name))?;
            self.run_stage(&stage)?;
        }
        Ok(())
    }

    fn run_stage(&self, stage: &StageCommand) -> Result<()> {
        match self.collab.stages.run(stage) {
            Ok(true) => Ok(()),
            Ok(false) => {
                let tail = tail_bytes(&stage.log, TAIL_BYTES).ok();
                Err(DrpError::stage(&stage.name, tail).into())
            }
            Err(err) => Err(stage_failure(&stage.name, err)),
        }
    }

    /// Final analysis of the run's log database; a database that does not
    /// exist yet is not an error.
    fn summary(&self, in_progress: bool) -> Result<Option<RunSummary>> {
        match analyze(self.collab.logs, &self.record.run_id, in_progress) {
            Ok(summary) => Ok(Some(summary)),
            Err(AnalysisError::NoMatch(_)) => Ok(None),
            Err(err) => Err(err).context("cannot analyze run log"),
        }
    }

    fn journal(&self, group: &str, message: &str) -> Result<()> {
        let line = journal_line(&self.collab.env.now(), message);
        self.locks
            .append(group, &line)
            .with_context(|| format!("cannot journal to machine group {}", group))
    }

    fn notify(&self, subject: &str, body: &str) {
        if let Err(err) = self.collab.notifier.notify(&self.record.notify_to, subject, body) {
            warn!(error = %format!("{:#}", err), subject = %subject, "notification not delivered");
        }
    }

    fn notify_failure(&self, detail: &str) {
        self.notify(
            &format!("{} Failed: run {}", SUBJECT_TAG, self.record.run_id),
            detail,
        );
    }

    fn transition(&mut self, next: RunState) {
        info!(run_id = %self.record.run_id, from = %self.state, to = %next, "run state");
        self.state = next;
        self.history.push(next);
    }
}

/// Tags an error with the stage it happened in, unless it already names one.
fn stage_failure(stage: &str, err: anyhow::Error) -> anyhow::Error {
    if err.downcast_ref::<DrpError>().and_then(DrpError::failed_stage).is_some() {
        return err;
    }
    err.context(DrpError::stage(stage, None))
}

/// Checks, derives and executes one run end to end.
pub fn run_production(config: &DrpConfig, options: &RunOptions, collab: Collaborators<'_>) -> Result<RunReport> {
    let record = prepare_run(config, options, collab.env)?;
    let locks = LockStore::open(config.lock_dir())?;
    let mut run = ProductionRun::new(config, record, &locks, collab);
    run.execute()
}
