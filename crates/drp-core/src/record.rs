use serde::Serialize;
use std::collections::BTreeMap;
use std::path::{Path, PathBuf};
use tracing::warn;

use crate::config::DrpConfig;
use crate::env::Environment;
use crate::error::{DrpError, Result};

/// Lines in a lock record / run log that other commands key on.
pub const RUN_PREFIX: &str = "Run:";
pub const OUTPUT_PREFIX: &str = "Output:";
pub const RUN_TYPE_PREFIX: &str = "RunType:";
pub const DATABASE_PREFIX: &str = "Database:";
pub const GROUP_PREFIX: &str = "Group:";

/// Per-invocation choices, before derivation.
#[derive(Debug, Clone)]
pub struct RunOptions {
    pub run_type: String,
    pub pipeline: String,
    pub input: String,
    pub output: PathBuf,
    pub ccd_count: Option<u32>,
    pub arch: Option<String>,
    pub overrides: Vec<(String, String)>,
    pub do_qa: bool,
    pub test_only: bool,
    pub notify_to: String,
}

impl RunOptions {
    /// Site defaults for `user`; input is left empty for the caller to pick.
    pub fn defaults(config: &DrpConfig, user: &str) -> Self {
        Self {
            run_type: user.to_string(),
            pipeline: config.pipeline_policy.clone(),
            input: String::new(),
            output: config.output_base.clone(),
            ccd_count: None,
            arch: None,
            overrides: Vec::new(),
            do_qa: true,
            test_only: false,
            notify_to: config.notify_to.clone(),
        }
    }
}

/// Identity, parameters and derived paths of one production run.
#[derive(Debug, Clone, Serialize)]
pub struct RunRecord {
    pub run_id: String,
    pub run_type: String,
    pub user: String,
    pub hostname: String,
    pub collection: String,
    pub pipeline: String,
    pub input: String,
    pub input_dir: PathBuf,
    pub output_base: PathBuf,
    pub output_dir: PathBuf,
    pub db_name: String,
    pub arch: String,
    pub ccd_count: u32,
    pub overrides: Vec<(String, String)>,
    pub do_qa: bool,
    pub test_only: bool,
    pub notify_to: String,
    pub qa_url: String,
    pub setups: BTreeMap<String, String>,
}

impl RunRecord {
    pub fn derive(
        config: &DrpConfig,
        options: &RunOptions,
        env: &dyn Environment,
        arch: &str,
        ccd_count: u32,
    ) -> Result<Self> {
        validate_run_type(&options.run_type)?;
        let user = env.user();
        let coll = config.collection_name();
        let datetime = env.now().format("%Y_%m%d_%H%M%S").to_string();
        let run_id = expand_run_id(&config.run_id_pattern, &user, &coll, &options.run_type, &datetime)?;
        let db_name = format!("{}_{}_u_{}", user, coll, run_id);

        let setups = env.setups();
        let mut do_qa = options.do_qa;
        for package in &config.qa_packages {
            if do_qa && !setups.contains_key(package) {
                warn!(package = %package, "package not set up, QA will be skipped");
                do_qa = false;
            }
        }

        Ok(Self {
            input_dir: config.input_base.join(&options.input).join(&config.collection),
            output_dir: options.output.join(&run_id),
            qa_url: format!("{}{}/", config.qa_base_url, db_name),
            run_id,
            run_type: options.run_type.clone(),
            user,
            hostname: env.hostname(),
            collection: config.collection.clone(),
            pipeline: options.pipeline.clone(),
            input: options.input.clone(),
            output_base: options.output.clone(),
            db_name,
            arch: arch.to_string(),
            ccd_count,
            overrides: options.overrides.clone(),
            do_qa,
            test_only: options.test_only,
            notify_to: options.notify_to.clone(),
            setups,
        })
    }

    /// Human-readable head of the lock record and run log.
    pub fn header(&self, group: &str) -> String {
        let overrides = if self.overrides.is_empty() {
            "None".to_string()
        } else {
            self.overrides
                .iter()
                .map(|(k, v)| format!("{}={}", k, v))
                .collect::<Vec<_>>()
                .join(", ")
        };
        format!(
            "{RUN_PREFIX} {}\n{RUN_TYPE_PREFIX} {}\nUser: {}\nPipeline: {}\nInput: {}\nCCD count: {}\n{OUTPUT_PREFIX} {}\n{DATABASE_PREFIX} {}\nOverrides: {}\n{GROUP_PREFIX} {}\n",
            self.run_id,
            self.run_type,
            self.user,
            self.pipeline,
            self.input,
            self.ccd_count,
            self.output_dir.display(),
            self.db_name,
            overrides,
            group,
        )
    }

    pub fn layout(&self) -> RunLayout {
        RunLayout::new(&self.output_dir)
    }
}

/// Directory tree of one run's output.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RunLayout {
    pub output_dir: PathBuf,
    pub run_dir: PathBuf,
    pub config_dir: PathBuf,
    pub work_dir: PathBuf,
}

impl RunLayout {
    pub fn new(output_dir: &Path) -> Self {
        Self {
            output_dir: output_dir.to_path_buf(),
            run_dir: output_dir.join("run"),
            config_dir: output_dir.join("config"),
            work_dir: output_dir.join("work"),
        }
    }

    /// Where the lock record ends up after release.
    pub fn run_log(&self) -> PathBuf {
        self.run_dir.join("run.log")
    }

    pub fn pipeline_log(&self) -> PathBuf {
        self.run_dir.join("pipeline.log")
    }

    pub fn pipeline_pgid(&self) -> PathBuf {
        self.run_dir.join("pipeline.pgid")
    }

    pub fn env_snapshot(&self) -> PathBuf {
        self.config_dir.join("env-snapshot.txt")
    }
}

/// Fields recovered from a lock record or run log by line prefix.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct RunHeader {
    pub run_id: Option<String>,
    pub run_type: Option<String>,
    pub output: Option<PathBuf>,
    pub database: Option<String>,
    pub group: Option<String>,
}

impl RunHeader {
    pub fn parse(text: &str) -> Self {
        let mut header = RunHeader::default();
        for line in text.lines() {
            let value = |prefix: &str| line.strip_prefix(prefix).map(|v| v.trim().to_string());
            if let Some(v) = value(RUN_PREFIX) {
                header.run_id = Some(v);
            } else if let Some(v) = value(RUN_TYPE_PREFIX) {
                header.run_type = Some(v);
            } else if let Some(v) = value(OUTPUT_PREFIX) {
                header.output = Some(PathBuf::from(v));
            } else if let Some(v) = value(DATABASE_PREFIX) {
                header.database = Some(v);
            } else if let Some(v) = value(GROUP_PREFIX) {
                header.group = Some(v);
            }
        }
        header
    }
}

pub fn validate_run_type(run_type: &str) -> Result<()> {
    if run_type.is_empty()
        || !run_type
            .chars()
            .all(|c| c.is_ascii_alphanumeric() || c == '_')
    {
        return Err(DrpError::InvalidRunType(run_type.to_string()));
    }
    Ok(())
}

fn expand_run_id(
    pattern: &str,
    user: &str,
    coll: &str,
    run_type: &str,
    datetime: &str,
) -> Result<String> {
    let run_id = pattern
        .replace("{user}", user)
        .replace("{coll}", coll)
        .replace("{run_type}", run_type)
        .replace("{datetime}", datetime);
    if run_id.is_empty()
        || !run_id
            .chars()
            .all(|c| c.is_ascii_alphanumeric() || "_-.".contains(c))
        || run_id.starts_with('.')
    {
        return Err(DrpError::Config(format!(
            "run id '{}' from pattern '{}' is not filesystem-safe",
            run_id, pattern
        )));
    }
    Ok(run_id)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::env::FixedEnvironment;
    use chrono::{Local, TimeZone};

    fn env() -> FixedEnvironment {
        let mut setups = BTreeMap::new();
        setups.insert("testing_pipeQA".to_string(), "1.0".to_string());
        setups.insert("testing_displayQA".to_string(), "1.0".to_string());
        FixedEnvironment {
            user: "ktl".to_string(),
            hostname: "lsst5.ncsa.uiuc.edu".to_string(),
            now: Local
                .with_ymd_and_hms(2026, 10, 13, 9, 5, 7)
                .single()
                .expect("valid time"),
            setups,
        }
    }

    fn options(config: &DrpConfig) -> RunOptions {
        let mut opts = RunOptions::defaults(config, "ktl");
        opts.run_type = "weekly".to_string();
        opts.input = "obs_imSim-2026".to_string();
        opts.output = PathBuf::from("/data/runs");
        opts
    }

    #[test]
    fn derive_builds_identifiers_from_user_collection_and_clock() {
        let config = DrpConfig::default();
        let record = RunRecord::derive(&config, &options(&config), &env(), "rh5", 12).expect("derive");
        assert_eq!(record.run_id, "weekly_2026_1013_090507");
        assert_eq!(record.db_name, "ktl_PT1_2_u_weekly_2026_1013_090507");
        assert_eq!(record.output_dir, PathBuf::from("/data/runs/weekly_2026_1013_090507"));
        assert_eq!(
            record.input_dir,
            PathBuf::from("/lsst3/weekly/data/obs_imSim-2026/PT1.2")
        );
        assert!(record.do_qa);
        assert!(record.qa_url.ends_with("ktl_PT1_2_u_weekly_2026_1013_090507/"));
    }

    #[test]
    fn derive_rejects_multi_word_run_type() {
        let config = DrpConfig::default();
        let mut opts = options(&config);
        opts.run_type = "two words".to_string();
        let err = RunRecord::derive(&config, &opts, &env(), "rh5", 12).expect_err("must fail");
        assert!(matches!(err, DrpError::InvalidRunType(_)));
    }

    #[test]
    fn derive_skips_qa_without_qa_packages() {
        let config = DrpConfig::default();
        let mut bare = env();
        bare.setups.clear();
        let record = RunRecord::derive(&config, &options(&config), &bare, "rh5", 12).expect("derive");
        assert!(!record.do_qa);
    }

    #[test]
    fn header_round_trips_through_prefix_parser() {
        let config = DrpConfig::default();
        let mut opts = options(&config);
        opts.overrides = vec![("nodes".to_string(), "4".to_string())];
        let record = RunRecord::derive(&config, &opts, &env(), "rh5", 12).expect("derive");
        let header = record.header("rh5-1");
        assert!(header.starts_with("Run: weekly_2026_1013_090507\n"));
        assert!(header.contains("Overrides: nodes=4\n"));
        let journal = format!("{}Tue Oct 13 09:05:08 2026 Run directory created\n", header);
        let parsed = RunHeader::parse(&journal);
        assert_eq!(parsed.run_id.as_deref(), Some("weekly_2026_1013_090507"));
        assert_eq!(parsed.run_type.as_deref(), Some("weekly"));
        assert_eq!(parsed.output, Some(record.output_dir.clone()));
        assert_eq!(parsed.database.as_deref(), Some(record.db_name.as_str()));
        assert_eq!(parsed.group.as_deref(), Some("rh5-1"));
    }

    #[test]
    fn run_id_pattern_must_stay_filesystem_safe() {
        assert!(expand_run_id("{run_type}/{datetime}", "u", "c", "t", "d").is_err());
        assert_eq!(
            expand_run_id("{user}_{coll}_{run_type}", "u", "c", "t", "d").expect("safe"),
            "u_c_t"
        );
    }
}
