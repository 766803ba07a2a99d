use anyhow::Result;
use drp_core::record::validate_run_type;
use drp_core::{
    available_space, check_readable, check_writable, DrpConfig, DrpError, Environment, RunOptions,
    RunRecord,
};
use std::fs;
use std::path::Path;
use tracing::info;

use crate::provision::raw_work_units;
use crate::selector::resolve_arch;

/// Validates the invocation and the site, then freezes the run record and
/// creates its output directory. Nothing is claimed yet, so any failure
/// here leaves nothing to undo.
pub fn prepare_run(config: &DrpConfig, options: &RunOptions, env: &dyn Environment) -> Result<RunRecord> {
    validate_run_type(&options.run_type)?;
    if options.input.is_empty() {
        return Err(DrpError::Config("no input dataset given".to_string()).into());
    }
    let arch = resolve_arch(config, options.arch.as_deref(), env)?;

    let setups = env.setups();
    for package in &config.required_packages {
        if !setups.contains_key(package) {
            return Err(DrpError::Config(format!("{} is not set up", package)).into());
        }
    }

    let input_dir = config.input_base.join(&options.input).join(&config.collection);
    check_readable(&input_dir)?;
    for required in &config.required_inputs {
        check_readable(&input_dir.join(required))?;
    }

    let ccd_count = match options.ccd_count {
        Some(n) => n,
        None => raw_work_units(&input_dir)?.len() as u32,
    };
    if ccd_count < config.min_ccds {
        return Err(DrpError::Config(format!(
            "must process at least {} CCDs (got {})",
            config.min_ccds, ccd_count
        ))
        .into());
    }

    let record = RunRecord::derive(config, options, env, &arch, ccd_count)?;
    if record.output_dir.symlink_metadata().is_ok() {
        return Err(DrpError::Config(format!(
            "output directory {} already exists",
            record.output_dir.display()
        ))
        .into());
    }
    fs::create_dir_all(&record.output_dir)?;
    if let Err(err) = check_output_space(config, &record.output_dir, ccd_count) {
        let _ = fs::remove_dir(&record.output_dir);
        return Err(err.into());
    }
    info!(run_id = %record.run_id, arch = %arch, ccds = ccd_count, "run prepared");
    Ok(record)
}

fn check_output_space(config: &DrpConfig, output_dir: &Path, ccd_count: u32) -> drp_core::Result<()> {
    check_writable(output_dir)?;
    let available = available_space(output_dir)?;
    let needed = config.space_per_ccd.saturating_mul(ccd_count as u64);
    if available < needed {
        return Err(DrpError::InsufficientSpace { available, needed });
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::{Local, TimeZone, Utc};
    use drp_core::{ensure_dir, FixedEnvironment};
    use std::collections::BTreeMap;
    use std::path::PathBuf;

    struct Site {
        root: PathBuf,
        config: DrpConfig,
    }

    fn site(tag: &str) -> Site {
        let root = std::env::temp_dir().join(format!(
            "drp_checks_{}_{}_{}",
            tag,
            std::process::id(),
            Utc::now().timestamp_micros()
        ));
        let mut config = DrpConfig::default();
        config.input_base = root.join("data");
        config.output_base = root.join("runs");
        config.space_per_ccd = 1;
        let input = config.input_base.join("obs_imSim-1").join(&config.collection);
        for dir in ["bias", "dark", "flat", "raw/v1"] {
            ensure_dir(&input.join(dir)).expect("input dir");
        }
        fs::write(input.join("refObject.csv"), "id\n").expect("ref");
        for n in 0..3 {
            fs::write(input.join("raw/v1").join(format!("s{}.fits", n)), "").expect("raw");
        }
        ensure_dir(&config.output_base).expect("output base");
        Site { root, config }
    }

    fn env() -> FixedEnvironment {
        let mut setups = BTreeMap::new();
        for pkg in ["ctrl_orca", "datarel", "astrometry_net_data"] {
            setups.insert(pkg.to_string(), "1.0".to_string());
        }
        FixedEnvironment {
            user: "ktl".to_string(),
            hostname: "lsst9".to_string(),
            now: Local.with_ymd_and_hms(2026, 10, 13, 9, 5, 7).single().expect("time"),
            setups,
        }
    }

    fn options(config: &DrpConfig) -> RunOptions {
        let mut opts = RunOptions::defaults(config, "ktl");
        opts.input = "obs_imSim-1".to_string();
        opts.run_type = "weekly".to_string();
        opts
    }

    #[test]
    fn prepare_counts_raw_units_and_creates_output() {
        let site = site("ok");
        let record = prepare_run(&site.config, &options(&site.config), &env()).expect("prepare");
        assert_eq!(record.ccd_count, 3);
        assert_eq!(record.arch, "rh6");
        assert!(record.output_dir.is_dir());

        let again = prepare_run(&site.config, &options(&site.config), &env()).expect_err("exists");
        assert!(again.to_string().contains("already exists"));
        let _ = fs::remove_dir_all(site.root);
    }

    #[test]
    fn prepare_rejects_missing_packages_and_inputs() {
        let site = site("missing");
        let mut bare = env();
        bare.setups.remove("datarel");
        let err = prepare_run(&site.config, &options(&site.config), &bare).expect_err("package");
        assert!(err.to_string().contains("datarel is not set up"));

        fs::remove_dir_all(
            site.config.input_base.join("obs_imSim-1").join(&site.config.collection).join("flat"),
        )
        .expect("remove flat");
        let err = prepare_run(&site.config, &options(&site.config), &env()).expect_err("input");
        assert!(matches!(err.downcast_ref::<DrpError>(), Some(DrpError::Unreadable(_))));
        let _ = fs::remove_dir_all(site.root);
    }

    #[test]
    fn prepare_enforces_minimum_units_and_space() {
        let mut site = site("limits");
        let mut opts = options(&site.config);
        opts.ccd_count = Some(1);
        let err = prepare_run(&site.config, &opts, &env()).expect_err("too few");
        assert!(err.to_string().contains("at least 2 CCDs"));

        site.config.space_per_ccd = u64::MAX / 2;
        let err = prepare_run(&site.config, &options(&site.config), &env()).expect_err("space");
        assert!(matches!(
            err.downcast_ref::<DrpError>(),
            Some(DrpError::InsufficientSpace { .. })
        ));
        assert!(
            fs::read_dir(&site.config.output_base).expect("list").next().is_none(),
            "output directory is removed when checks fail"
        );
        let _ = fs::remove_dir_all(site.root);
    }
}
