use anyhow::{Context, Result};
use drp_core::{DrpConfig, RunRecord, StageSpec};
use nix::sys::signal::{killpg, Signal};
use nix::unistd::Pid;
use std::collections::BTreeMap;
use std::fs;
use std::path::{Path, PathBuf};
use std::process::{Command, Stdio};
use tracing::{debug, info, warn};

/// One external process with its combined output captured to `log`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StageCommand {
    pub name: String,
    pub command: String,
    pub cwd: PathBuf,
    pub log: PathBuf,
    /// Receives the child's process-group id while it runs.
    pub pgid_file: Option<PathBuf>,
}

impl StageCommand {
    pub fn from_spec(spec: &StageSpec, vars: &BTreeMap<&'static str, String>, run_dir: &Path) -> Self {
        Self {
            name: spec.name.clone(),
            command: expand_template(&spec.command, vars),
            cwd: run_dir.to_path_buf(),
            log: run_dir.join(spec.log_name()),
            pgid_file: None,
        }
    }
}

/// Runs external collaborators to completion.
pub trait StageRunner {
    /// `Ok(false)` means the process ran and exited unsuccessfully.
    fn run(&self, stage: &StageCommand) -> Result<bool>;
}

/// Runs each stage through `sh -c` in its own process group.
#[derive(Debug, Clone, Copy, Default)]
pub struct ShellStageRunner;

impl StageRunner for ShellStageRunner {
    fn run(&self, stage: &StageCommand) -> Result<bool> {
        if let Some(parent) = stage.log.parent() {
            fs::create_dir_all(parent)?;
        }
        let log = fs::File::create(&stage.log)
            .with_context(|| format!("cannot create log {}", stage.log.display()))?;
        let mut cmd = Command::new("sh");
        cmd.arg("-c")
            .arg(&stage.command)
            .current_dir(&stage.cwd)
            .stdin(Stdio::null())
            .stdout(Stdio::from(log.try_clone()?))
            .stderr(Stdio::from(log));
        #[cfg(unix)]
        {
            use std::os::unix::process::CommandExt;
            cmd.process_group(0);
        }

        info!(stage = %stage.name, log = %stage.log.display(), "starting stage");
        debug!(stage = %stage.name, command = %stage.command, "stage command");
        let mut child = cmd
            .spawn()
            .with_context(|| format!("cannot start stage {}", stage.name))?;
        let recorded = match &stage.pgid_file {
            Some(pgid_file) => fs::write(pgid_file, format!("{}\n", child.id()))
                .with_context(|| format!("cannot record process group in {}", pgid_file.display())),
            None => Ok(()),
        };
        if let Err(err) = &recorded {
            // Nothing could signal the group later; stop it before reporting.
            warn!(stage = %stage.name, error = %format!("{:#}", err), "terminating unrecorded stage");
            let _ = killpg(Pid::from_raw(child.id() as i32), Signal::SIGTERM);
        }
        let status = child.wait();
        if let Some(pgid_file) = &stage.pgid_file {
            let _ = fs::remove_file(pgid_file);
        }
        recorded?;
        let status = status?;
        if !status.success() {
            warn!(stage = %stage.name, status = %status, "stage exited unsuccessfully");
        }
        Ok(status.success())
    }
}

/// Placeholder values available to configured command templates.
pub fn template_vars(config: &DrpConfig, record: &RunRecord) -> BTreeMap<&'static str, String> {
    let mut vars = BTreeMap::new();
    vars.insert("run_id", record.run_id.clone());
    vars.insert("run_type", record.run_type.clone());
    vars.insert("db_name", record.db_name.clone());
    vars.insert("user", record.user.clone());
    vars.insert("db_host", config.db_host.clone());
    vars.insert("output", record.output_dir.display().to_string());
    vars.insert("input", record.input_dir.display().to_string());
    vars.insert("pipeline", record.pipeline.clone());
    vars.insert("qa_dir", config.qa_dir.display().to_string());
    vars
}

/// Replaces `{name}` placeholders; unknown names are left as written.
pub fn expand_template(template: &str, vars: &BTreeMap<&'static str, String>) -> String {
    let mut out = template.to_string();
    for (name, value) in vars {
        out = out.replace(&format!("{{{}}}", name), value);
    }
    out
}
