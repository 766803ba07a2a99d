use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::fmt;
use std::fs;
use std::path::{Path, PathBuf};

use crate::error::{DrpError, Result};

/// One host in a machine group and the number of worker processes it runs.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(try_from = "String", into = "String")]
pub struct HostSlot {
    pub host: String,
    pub capacity: u32,
}

impl TryFrom<String> for HostSlot {
    type Error = String;

    fn try_from(raw: String) -> std::result::Result<Self, Self::Error> {
        let (host, capacity) = raw
            .split_once(':')
            .ok_or_else(|| format!("invalid host slot '{}': expected host:capacity", raw))?;
        let host = host.trim();
        if host.is_empty() {
            return Err(format!("invalid host slot '{}': empty host", raw));
        }
        let capacity: u32 = capacity
            .trim()
            .parse()
            .map_err(|_| format!("invalid host slot '{}': capacity is not a number", raw))?;
        if capacity == 0 {
            return Err(format!("invalid host slot '{}': capacity must be positive", raw));
        }
        Ok(HostSlot {
            host: host.to_string(),
            capacity,
        })
    }
}

impl From<HostSlot> for String {
    fn from(slot: HostSlot) -> Self {
        slot.to_string()
    }
}

impl fmt::Display for HostSlot {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}:{}", self.host, self.capacity)
    }
}

/// A named, claimable set of hosts.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct MachineGroup {
    pub name: String,
    pub hosts: Vec<HostSlot>,
}

impl MachineGroup {
    pub fn total_capacity(&self) -> u32 {
        self.hosts.iter().map(|h| h.capacity).sum()
    }

    pub fn describe(&self) -> String {
        let hosts: Vec<String> = self.hosts.iter().map(|h| h.to_string()).collect();
        format!("[{}]", hosts.join(", "))
    }
}

/// Architecture tag: the group name up to the first `-`.
pub fn architecture_of(group_name: &str) -> &str {
    group_name.split('-').next().unwrap_or(group_name)
}

/// An external job run after the pipeline, in configured order.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct StageSpec {
    pub name: String,
    pub command: String,
    #[serde(default)]
    pub log: Option<String>,
}

impl StageSpec {
    fn new(name: &str, command: &str, log: &str) -> Self {
        Self {
            name: name.to_string(),
            command: command.to_string(),
            log: Some(log.to_string()),
        }
    }

    pub fn log_name(&self) -> String {
        self.log
            .clone()
            .unwrap_or_else(|| format!("{}.log", self.name))
    }
}

/// Site configuration, loaded once and shared read-only by every component.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct DrpConfig {
    pub collection: String,
    pub input_base: PathBuf,
    pub output_base: PathBuf,
    pub lock_dir: Option<PathBuf>,
    pub events_dir: PathBuf,
    pub pipeline_policy: String,
    pub run_id_pattern: String,
    pub space_per_ccd: u64,
    pub min_ccds: u32,
    pub default_input_prefix: String,
    pub notify_to: String,
    pub sendmail: String,
    pub db_host: String,
    pub qa_base_url: String,
    pub qa_dir: PathBuf,
    pub qa_packages: Vec<String>,
    pub required_packages: Vec<String>,
    pub required_inputs: Vec<String>,
    pub machine_groups: BTreeMap<String, Vec<HostSlot>>,
    pub provision_command: Option<String>,
    pub pipeline_command: String,
    pub post_steps: Vec<StageSpec>,
    pub qa_steps: Vec<StageSpec>,
    pub shutdown_command: Option<String>,
}

impl Default for DrpConfig {
    fn default() -> Self {
        let output_base = PathBuf::from("/lsst3/weekly/datarel-runs");
        let mut machine_groups = BTreeMap::new();
        let mut group = |name: &str, hosts: &[(&str, u32)]| {
            machine_groups.insert(
                name.to_string(),
                hosts
                    .iter()
                    .map(|(h, c)| HostSlot {
                        host: h.to_string(),
                        capacity: *c,
                    })
                    .collect(),
            );
        };
        group("rh5-1", &[("lsst5", 3), ("lsst11", 2)]);
        group("rh5-2", &[("lsst6", 2), ("lsst8", 2), ("lsst11", 1)]);
        group("rh6-1", &[("lsst9", 3), ("lsst14", 2)]);
        group("rh6-2", &[("lsst14", 1), ("lsst15", 3)]);

        Self {
            collection: "PT1.2".to_string(),
            input_base: PathBuf::from("/lsst3/weekly/data"),
            output_base,
            lock_dir: None,
            events_dir: PathBuf::from("/lsst3/weekly/logdb"),
            pipeline_policy: "PT1Pipe/main-ImSim.paf".to_string(),
            run_id_pattern: "{run_type}_{datetime}".to_string(),
            space_per_ccd: 160_000_000,
            min_ccds: 2,
            default_input_prefix: "obs_imSim".to_string(),
            notify_to: "lsst-devel-runs@lsstcorp.org".to_string(),
            sendmail: "sendmail".to_string(),
            db_host: "lsst10.ncsa.uiuc.edu".to_string(),
            qa_base_url: "http://lsst1.ncsa.illinois.edu/pipeQA/dev/".to_string(),
            qa_dir: PathBuf::from("/lsst/public_html/pipeQA/html/dev"),
            qa_packages: vec!["testing_pipeQA".to_string(), "testing_displayQA".to_string()],
            required_packages: vec![
                "ctrl_orca".to_string(),
                "datarel".to_string(),
                "astrometry_net_data".to_string(),
            ],
            required_inputs: vec![
                "bias".to_string(),
                "dark".to_string(),
                "flat".to_string(),
                "raw".to_string(),
                "refObject.csv".to_string(),
            ],
            machine_groups,
            provision_command: None,
            pipeline_command:
                "$CTRL_ORCA_DIR/bin/orca.py -e env.sh -r . -V 30 -L 2 {pipeline} {run_id}"
                    .to_string(),
            post_steps: vec![
                StageSpec::new(
                    "source_assoc",
                    "$DATAREL_DIR/bin/sst/SourceAssoc_ImSim.py -i {output}/update -o {output}/SourceAssoc -R {output}/update/registry.sqlite3",
                    "SourceAssoc_ImSim.log",
                ),
                StageSpec::new(
                    "prepare_db",
                    "$DATAREL_DIR/bin/ingest/prepareDb.py -u {user} -H {db_host} {db_name}",
                    "prepareDb.log",
                ),
                StageSpec::new(
                    "ingest_processed",
                    "$DATAREL_DIR/bin/ingest/ingestProcessed_ImSim.py -u {user} -d {db_name} {output}/update {output}/update/registry.sqlite3",
                    "ingestProcessed_ImSim.log",
                ),
                StageSpec::new(
                    "ingest_source_assoc",
                    "$DATAREL_DIR/bin/ingest/ingestSourceAssoc.py -m -u {user} -H {db_host} -R {output}/input/refObject.csv -e {output}/Science_Ccd_Exposure_Metadata.csv -j 1 {db_name} {output}/SourceAssoc {output}/csv-SourceAssoc",
                    "ingestSourceAssoc.log",
                ),
                StageSpec::new(
                    "ingest_sdqa",
                    "$DATAREL_DIR/bin/ingest/ingestSdqa_ImSim.py -u {user} -H {db_host} -d {db_name} {output}/update {output}/update/registry.sqlite3",
                    "ingestSdqa_ImSim.log",
                ),
                StageSpec::new(
                    "finish_db",
                    "$DATAREL_DIR/bin/ingest/finishDb.py -u {user} -H {db_host} -t {db_name}",
                    "finishDb.log",
                ),
            ],
            qa_steps: vec![
                StageSpec::new(
                    "new_qa",
                    "WWW_ROOT={qa_dir} $TESTING_DISPLAYQA_DIR/bin/newQa.py {db_name}",
                    "newQa.log",
                ),
                StageSpec::new(
                    "pipe_qa",
                    "WWW_ROOT={qa_dir} $TESTING_PIPEQA_DIR/bin/pipeQa.py --delaySummary --forkFigure --keep --breakBy ccd {db_name}",
                    "pipeQa.log",
                ),
            ],
            shutdown_command: Some("$CTRL_ORCA_DIR/bin/shutprod.py 1 {run_id}".to_string()),
        }
    }
}

impl DrpConfig {
    pub fn load(path: &Path) -> Result<Self> {
        let raw = fs::read_to_string(path)
            .map_err(|e| DrpError::Config(format!("cannot read {}: {}", path.display(), e)))?;
        let config: DrpConfig = serde_yaml::from_str(&raw)?;
        config.validate()?;
        Ok(config)
    }

    pub fn validate(&self) -> Result<()> {
        if self.machine_groups.is_empty() {
            return Err(DrpError::Config("no machine groups configured".to_string()));
        }
        for (name, hosts) in &self.machine_groups {
            if hosts.is_empty() {
                return Err(DrpError::Config(format!(
                    "machine group {} has no hosts",
                    name
                )));
            }
        }
        if self.pipeline_command.trim().is_empty() {
            return Err(DrpError::Config("pipeline_command is empty".to_string()));
        }
        let mut seen = std::collections::BTreeSet::new();
        for step in self.post_steps.iter().chain(self.qa_steps.iter()) {
            if !seen.insert(step.name.as_str()) {
                return Err(DrpError::Config(format!(
                    "duplicate stage name {}",
                    step.name
                )));
            }
        }
        Ok(())
    }

    pub fn lock_dir(&self) -> PathBuf {
        self.lock_dir
            .clone()
            .unwrap_or_else(|| self.output_base.join("locks"))
    }

    /// Collection name with dots made identifier-safe (`PT1.2` -> `PT1_2`).
    pub fn collection_name(&self) -> String {
        self.collection.replace('.', "_")
    }

    pub fn machine_group(&self, name: &str) -> Option<MachineGroup> {
        self.machine_groups.get(name).map(|hosts| MachineGroup {
            name: name.to_string(),
            hosts: hosts.clone(),
        })
    }

    /// All groups in lexicographic name order.
    pub fn machine_groups(&self) -> Vec<MachineGroup> {
        self.machine_groups
            .iter()
            .map(|(name, hosts)| MachineGroup {
                name: name.clone(),
                hosts: hosts.clone(),
            })
            .collect()
    }

    pub fn architectures(&self) -> Vec<String> {
        let archs: std::collections::BTreeSet<String> = self
            .machine_groups
            .keys()
            .map(|name| architecture_of(name).to_string())
            .collect();
        archs.into_iter().collect()
    }

    /// Architecture of the first group listing `host` (short name).
    pub fn arch_for_host(&self, host: &str) -> Option<String> {
        let short = host.split('.').next().unwrap_or(host);
        self.machine_groups
            .iter()
            .find(|(_, hosts)| hosts.iter().any(|h| h.host == short))
            .map(|(name, _)| architecture_of(name).to_string())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn host_slot_parses_host_and_capacity() {
        let slot = HostSlot::try_from("lsst5:3".to_string()).expect("valid slot");
        assert_eq!(slot.host, "lsst5");
        assert_eq!(slot.capacity, 3);
        assert_eq!(slot.to_string(), "lsst5:3");
        assert!(HostSlot::try_from("lsst5".to_string()).is_err());
        assert!(HostSlot::try_from("lsst5:x".to_string()).is_err());
        assert!(HostSlot::try_from("lsst5:0".to_string()).is_err());
    }

    #[test]
    fn yaml_config_fills_defaults_and_sorts_groups() {
        let raw = r#"
output_base: /tmp/drp-out
machine_groups:
  rh6-2: ["lsst14:1", "lsst15:3"]
  rh5-1: ["lsst5:3", "lsst11:2"]
"#;
        let config: DrpConfig = serde_yaml::from_str(raw).expect("parse");
        config.validate().expect("valid");
        assert_eq!(config.collection, "PT1.2");
        assert_eq!(config.lock_dir(), PathBuf::from("/tmp/drp-out/locks"));
        let names: Vec<String> = config.machine_groups().into_iter().map(|g| g.name).collect();
        assert_eq!(names, vec!["rh5-1", "rh6-2"]);
        assert_eq!(config.architectures(), vec!["rh5", "rh6"]);
    }

    #[test]
    fn arch_for_host_uses_short_hostname() {
        let config = DrpConfig::default();
        assert_eq!(
            config.arch_for_host("lsst15.ncsa.uiuc.edu").as_deref(),
            Some("rh6")
        );
        assert_eq!(config.arch_for_host("lsst5").as_deref(), Some("rh5"));
        assert_eq!(config.arch_for_host("elsewhere"), None);
    }

    #[test]
    fn group_capacity_and_architecture() {
        let config = DrpConfig::default();
        let group = config.machine_group("rh5-2").expect("group");
        assert_eq!(architecture_of(&group.name), "rh5");
        assert_eq!(group.total_capacity(), 5);
        assert_eq!(group.describe(), "[lsst6:2, lsst8:2, lsst11:1]");
    }

    #[test]
    fn validate_rejects_duplicate_stage_names() {
        let mut config = DrpConfig::default();
        config.qa_steps.push(config.post_steps[0].clone());
        assert!(matches!(config.validate(), Err(DrpError::Config(_))));
    }
}
