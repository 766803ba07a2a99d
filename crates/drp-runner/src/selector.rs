use drp_core::{DrpConfig, DrpError, Environment, LockStore, MachineGroup, Result};
use tracing::{debug, info};

/// Architecture to run on: the requested one, else the one the current
/// host belongs to.
pub fn resolve_arch(config: &DrpConfig, requested: Option<&str>, env: &dyn Environment) -> Result<String> {
    let archs = config.architectures();
    if let Some(arch) = requested {
        if !archs.iter().any(|a| a == arch) {
            return Err(DrpError::Config(format!(
                "unknown architecture {} [{}]",
                arch,
                archs.join(", ")
            )));
        }
        return Ok(arch.to_string());
    }
    config.arch_for_host(&env.hostname()).ok_or_else(|| {
        DrpError::Config(format!(
            "architecture is required [{}]",
            archs.join(", ")
        ))
    })
}

/// Groups whose name starts with `arch`, in lexicographic order.
pub fn candidate_groups(config: &DrpConfig, arch: &str) -> Vec<MachineGroup> {
    config
        .machine_groups()
        .into_iter()
        .filter(|g| g.name.starts_with(arch))
        .collect()
}

/// Claims the first free candidate group. `payload` renders the lock
/// record for a given group name.
pub fn select_group<F>(config: &DrpConfig, locks: &LockStore, arch: &str, payload: F) -> Result<MachineGroup>
where
    F: Fn(&str) -> String,
{
    for group in candidate_groups(config, arch) {
        if locks.try_acquire(&group.name, &payload(&group.name))? {
            info!(group = %group.name, arch = %arch, "acquired machine group");
            return Ok(group);
        }
        debug!(group = %group.name, "machine group busy");
    }
    Err(DrpError::NoGroupAvailable {
        arch: arch.to_string(),
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::{Local, Utc};
    use drp_core::FixedEnvironment;
    use std::collections::BTreeMap;
    use std::path::PathBuf;

    fn temp_locks(tag: &str) -> (PathBuf, LockStore) {
        let root = std::env::temp_dir().join(format!(
            "drp_selector_{}_{}_{}",
            tag,
            std::process::id(),
            Utc::now().timestamp_micros()
        ));
        let store = LockStore::open(root.join("locks")).expect("store");
        (root, store)
    }

    fn env_on(host: &str) -> FixedEnvironment {
        FixedEnvironment {
            user: "ktl".to_string(),
            hostname: host.to_string(),
            now: Local::now(),
            setups: BTreeMap::new(),
        }
    }

    #[test]
    fn groups_are_tried_in_sorted_order_until_one_is_free() {
        let (root, locks) = temp_locks("order");
        let config = DrpConfig::default();

        let first = select_group(&config, &locks, "rh5", |g| format!("Run: a\nGroup: {}\n", g)).expect("first");
        assert_eq!(first.name, "rh5-1");
        let second = select_group(&config, &locks, "rh5", |g| format!("Run: b\nGroup: {}\n", g)).expect("second");
        assert_eq!(second.name, "rh5-2");

        let err = select_group(&config, &locks, "rh5", |_| "Run: c\n".to_string()).expect_err("exhausted");
        assert!(matches!(err, DrpError::NoGroupAvailable { ref arch } if arch == "rh5"));
        assert!(!locks.is_held("rh6-1"), "other architectures are untouched");
        assert_eq!(
            locks.read("rh5-2").expect("read").as_deref(),
            Some("Run: b\nGroup: rh5-2\n")
        );
        let _ = std::fs::remove_dir_all(root);
    }

    #[test]
    fn freed_group_is_picked_before_later_ones() {
        let (root, locks) = temp_locks("freed");
        let config = DrpConfig::default();
        assert!(locks.try_acquire("rh6-2", "Run: x\n").expect("claim"));
        let picked = select_group(&config, &locks, "rh6", |_| "Run: y\n".to_string()).expect("pick");
        assert_eq!(picked.name, "rh6-1");
        let _ = std::fs::remove_dir_all(root);
    }

    #[test]
    fn arch_comes_from_request_or_host() {
        let config = DrpConfig::default();
        assert_eq!(
            resolve_arch(&config, Some("rh6"), &env_on("lsst5.ncsa.uiuc.edu")).expect("requested"),
            "rh6"
        );
        assert_eq!(
            resolve_arch(&config, None, &env_on("lsst5.ncsa.uiuc.edu")).expect("host"),
            "rh5"
        );
        assert!(resolve_arch(&config, None, &env_on("laptop")).is_err());
        assert!(resolve_arch(&config, Some("sparc"), &env_on("laptop")).is_err());
    }
}
