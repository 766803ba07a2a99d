use anyhow::{Context, Result};
use drp_core::{
    atomic_write_bytes, canonical_json_digest, ensure_dir, tail_bytes, DrpConfig, DrpError,
    MachineGroup, RunRecord, TAIL_BYTES,
};
use serde::Serialize;
use serde_json::json;
use std::path::{Path, PathBuf};
use walkdir::WalkDir;

use crate::exec::{expand_template, template_vars, ShellStageRunner, StageCommand, StageRunner};

/// Lays out a run's working tree and the artifacts the pipeline reads.
pub trait Provisioner {
    fn provision(&self, config: &DrpConfig, record: &RunRecord, group: &MachineGroup) -> Result<()>;
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct NodePlan {
    pub host: String,
    pub processes: u32,
}

/// Process placement for one run on its machine group.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct PlatformPlan {
    pub run_id: String,
    pub group: String,
    /// Host running the job office; it gets one process on top of its
    /// pipeline slots.
    pub job_office: String,
    pub pipelines: u32,
    pub nodes: Vec<NodePlan>,
}

impl PlatformPlan {
    pub fn new(run_id: &str, group: &MachineGroup) -> Self {
        let nodes = group
            .hosts
            .iter()
            .enumerate()
            .map(|(i, slot)| NodePlan {
                host: slot.host.clone(),
                processes: if i == 0 { slot.capacity + 1 } else { slot.capacity },
            })
            .collect();
        Self {
            run_id: run_id.to_string(),
            group: group.name.clone(),
            job_office: group.hosts.first().map(|h| h.host.clone()).unwrap_or_default(),
            pipelines: group.total_capacity(),
            nodes,
        }
    }
}

/// Raw exposures under `<input>/raw`, sorted, one per work unit.
pub fn raw_work_units(input_dir: &Path) -> Result<Vec<String>> {
    let raw = input_dir.join("raw");
    let mut units = Vec::new();
    for entry in WalkDir::new(&raw).follow_links(true) {
        let entry = entry.with_context(|| format!("cannot scan {}", raw.display()))?;
        if !entry.file_type().is_file() {
            continue;
        }
        let rel = entry.path().strip_prefix(&raw).unwrap_or(entry.path());
        units.push(rel.to_string_lossy().to_string());
    }
    units.sort();
    Ok(units)
}

/// Input list: the first `ccd_count` units, then one shutdown sentinel per
/// pipeline.
pub fn work_unit_list(units: &[String], ccd_count: u32, pipelines: u32) -> String {
    let mut out = String::from(">intids visit\n");
    for unit in units.iter().take(ccd_count as usize) {
        out.push_str(&format!("raw {}\n", unit));
    }
    for _ in 0..pipelines {
        out.push_str("raw visit=0 raft=0 sensor=0\n");
    }
    out
}

#[derive(Debug, Clone, Default)]
pub struct StandardProvisioner<R: StageRunner = ShellStageRunner> {
    runner: R,
}

impl<R: StageRunner> StandardProvisioner<R> {
    pub fn new(runner: R) -> Self {
        Self { runner }
    }
}

impl<R: StageRunner> Provisioner for StandardProvisioner<R> {
    fn provision(&self, config: &DrpConfig, record: &RunRecord, group: &MachineGroup) -> Result<()> {
        let layout = record.layout();
        ensure_dir(&layout.run_dir)?;
        ensure_dir(&layout.config_dir)?;

        let plan = PlatformPlan::new(&record.run_id, group);
        atomic_write_bytes(
            &layout.run_dir.join("platform.yaml"),
            serde_yaml::to_string(&plan)?.as_bytes(),
        )?;

        let units = raw_work_units(&record.input_dir)?;
        atomic_write_bytes(
            &layout.run_dir.join("ccdlist"),
            work_unit_list(&units, record.ccd_count, plan.pipelines).as_bytes(),
        )?;

        let mut env_sh = String::new();
        let mut snapshot = String::new();
        for (package, version) in &record.setups {
            env_sh.push_str(&format!("setup -j {} {}\n", package, version));
            snapshot.push_str(&format!("{} {}\n", package, version));
        }
        atomic_write_bytes(&layout.run_dir.join("env.sh"), env_sh.as_bytes())?;
        atomic_write_bytes(&layout.env_snapshot(), snapshot.as_bytes())?;

        let resolved = json!({
            "run": record,
            "group": group,
            "platform": plan,
            "config": config,
        });
        atomic_write_bytes(
            &layout.config_dir.join("resolved.json"),
            &serde_json::to_vec_pretty(&resolved)?,
        )?;
        atomic_write_bytes(
            &layout.config_dir.join("resolved.digest"),
            canonical_json_digest(&resolved).as_bytes(),
        )?;

        if let Some(template) = &config.provision_command {
            let stage = StageCommand {
                name: "provision".to_string(),
                command: expand_template(template, &template_vars(config, record)),
                cwd: layout.run_dir.clone(),
                log: layout.run_dir.join("provision.log"),
                pgid_file: None,
            };
            if !self.runner.run(&stage)? {
                let tail = tail_bytes(&stage.log, TAIL_BYTES).ok();
                return Err(DrpError::stage("provision", tail).into());
            }
        }
        Ok(())
    }
}

/// Environment snapshots the pipeline wrote under `work/` that differ from
/// the one recorded at provisioning.
pub fn mismatched_snapshots(record: &RunRecord) -> Result<Vec<PathBuf>> {
    let layout = record.layout();
    let expected = std::fs::read(layout.env_snapshot())
        .with_context(|| format!("cannot read {}", layout.env_snapshot().display()))?;
    let mut mismatched = Vec::new();
    if !layout.work_dir.exists() {
        return Ok(mismatched);
    }
    for entry in WalkDir::new(&layout.work_dir).min_depth(2).max_depth(2) {
        let entry = entry?;
        if entry.file_name() != "env-snapshot.txt" || !entry.file_type().is_file() {
            continue;
        }
        if std::fs::read(entry.path())? != expected {
            mismatched.push(entry.path().to_path_buf());
        }
    }
    mismatched.sort();
    Ok(mismatched)
}
