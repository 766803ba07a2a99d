use anyhow::{anyhow, Context, Result};
use drp_core::{check_readable, check_writable, DrpConfig, RunHeader, RunLayout};
use std::fs;
use std::path::{Path, PathBuf};
use tracing::info;

/// Points `<base>/latest_<run_type>` at `target`.
///
/// The previous target survives as `latest_<run_type>.bak`; renaming onto
/// the backup name discards any older backup in the same step. The new link
/// is built under a private name and renamed into place, so readers see
/// either the old or the new link, or briefly none between the two renames.
pub fn link_latest(base: &Path, run_type: &str, target: &Path) -> Result<PathBuf> {
    check_writable(base)?;
    let latest = base.join(format!("latest_{}", run_type));
    let backup = base.join(format!("latest_{}.bak", run_type));
    if latest.symlink_metadata().is_ok() {
        fs::rename(&latest, &backup)
            .with_context(|| format!("cannot back up {}", latest.display()))?;
    }
    let staging = base.join(format!(".latest_{}.{}", run_type, std::process::id()));
    let _ = fs::remove_file(&staging);
    symlink(target, &staging)?;
    fs::rename(&staging, &latest)
        .with_context(|| format!("cannot publish {}", latest.display()))?;
    info!(link = %latest.display(), target = %target.display(), "latest link updated");
    Ok(latest)
}

#[cfg(unix)]
fn symlink(target: &Path, link: &Path) -> Result<()> {
    std::os::unix::fs::symlink(target, link)
        .with_context(|| format!("cannot create link {}", link.display()))
}

#[cfg(not(unix))]
fn symlink(_target: &Path, link: &Path) -> Result<()> {
    Err(anyhow!("symbolic links are unsupported here: {}", link.display()))
}

/// Repoints the output link and, when the run published QA pages, the QA
/// link.
pub fn link_run(config: &DrpConfig, output_base: &Path, run_type: &str, output_dir: &Path, db_name: &str) -> Result<()> {
    link_latest(output_base, run_type, output_dir)?;
    let qa_target = config.qa_dir.join(db_name);
    if qa_target.exists() {
        link_latest(&config.qa_dir, run_type, &qa_target)?;
    }
    Ok(())
}

/// Marks an earlier run as the latest of its type, reading type and
/// database from its run log.
pub fn relink_run(config: &DrpConfig, output_base: &Path, run_id: &str) -> Result<PathBuf> {
    let output_dir = output_base.join(run_id);
    check_readable(&output_dir)?;
    let run_log = RunLayout::new(&output_dir).run_log();
    let text = fs::read_to_string(&run_log)
        .with_context(|| format!("cannot read {}", run_log.display()))?;
    let header = RunHeader::parse(&text);
    let run_type = header
        .run_type
        .ok_or_else(|| anyhow!("{} has no RunType line", run_log.display()))?;
    let db_name = header
        .database
        .ok_or_else(|| anyhow!("{} has no Database line", run_log.display()))?;
    link_run(config, output_base, &run_type, &output_dir, &db_name)?;
    Ok(output_base.join(format!("latest_{}", run_type)))
}

#[cfg(all(test, unix))]
mod tests {
    use super::*;
    use chrono::Utc;

    fn temp_root(tag: &str) -> PathBuf {
        let root = std::env::temp_dir().join(format!(
            "drp_links_{}_{}_{}",
            tag,
            std::process::id(),
            Utc::now().timestamp_micros()
        ));
        fs::create_dir_all(&root).expect("temp dir");
        root
    }

    #[test]
    fn relinking_keeps_exactly_one_backup_level() {
        let root = temp_root("backup");
        let runs: Vec<PathBuf> = ["r1", "r2", "r3"].iter().map(|r| root.join(r)).collect();
        for run in &runs {
            fs::create_dir_all(run).expect("run dir");
        }

        let latest = link_latest(&root, "weekly", &runs[0]).expect("first");
        assert_eq!(fs::read_link(&latest).expect("link"), runs[0]);
        assert!(root.join("latest_weekly.bak").symlink_metadata().is_err());

        link_latest(&root, "weekly", &runs[1]).expect("second");
        assert_eq!(fs::read_link(&latest).expect("link"), runs[1]);
        assert_eq!(fs::read_link(root.join("latest_weekly.bak")).expect("bak"), runs[0]);

        link_latest(&root, "weekly", &runs[2]).expect("third");
        assert_eq!(fs::read_link(&latest).expect("link"), runs[2]);
        assert_eq!(fs::read_link(root.join("latest_weekly.bak")).expect("bak"), runs[1]);

        let mut names: Vec<String> = fs::read_dir(&root)
            .expect("list")
            .map(|e| e.expect("entry").file_name().to_string_lossy().to_string())
            .filter(|n| n.starts_with("latest_") || n.starts_with(".latest_"))
            .collect();
        names.sort();
        assert_eq!(names, vec!["latest_weekly", "latest_weekly.bak"]);
        let _ = fs::remove_dir_all(root);
    }

    #[test]
    fn relink_run_reads_type_and_database_from_run_log() {
        let root = temp_root("relink");
        let mut config = DrpConfig::default();
        config.qa_dir = root.join("qa");
        fs::create_dir_all(config.qa_dir.join("ktl_PT1_2_u_nightly_1")).expect("qa dir");
        let run_dir = root.join("nightly_1").join("run");
        fs::create_dir_all(&run_dir).expect("run dir");
        fs::write(
            run_dir.join("run.log"),
            "Run: nightly_1\nRunType: nightly\nDatabase: ktl_PT1_2_u_nightly_1\nTue Oct 13 09:05:08 2026 Run released\n",
        )
        .expect("run log");

        let latest = relink_run(&config, &root, "nightly_1").expect("relink");
        assert_eq!(latest, root.join("latest_nightly"));
        assert_eq!(fs::read_link(&latest).expect("link"), root.join("nightly_1"));
        assert_eq!(
            fs::read_link(config.qa_dir.join("latest_nightly")).expect("qa link"),
            config.qa_dir.join("ktl_PT1_2_u_nightly_1")
        );
        let _ = fs::remove_dir_all(root);
    }
}
