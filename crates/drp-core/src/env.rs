use chrono::{DateTime, Local};
use std::collections::BTreeMap;

/// Process identity and clock, injected wherever a run reads its
/// surroundings so tests can pin user, host and time.
pub trait Environment {
    fn user(&self) -> String;
    fn hostname(&self) -> String;
    fn now(&self) -> DateTime<Local>;
    /// Set-up packages and their versions (`ctrl_orca -> 4.0.1`).
    fn setups(&self) -> BTreeMap<String, String>;
}

/// Reads the live process environment.
///
/// Package setups follow the `SETUP_<PRODUCT>` convention: the value starts
/// with the product name and version, e.g. `ctrl_orca 4.0.1 -f Linux64`.
#[derive(Debug, Clone, Copy, Default)]
pub struct SystemEnvironment;

impl Environment for SystemEnvironment {
    fn user(&self) -> String {
        std::env::var("USER")
            .or_else(|_| std::env::var("LOGNAME"))
            .unwrap_or_else(|_| "unknown".to_string())
    }

    fn hostname(&self) -> String {
        nix::unistd::gethostname()
            .ok()
            .and_then(|h| h.into_string().ok())
            .unwrap_or_else(|| "localhost".to_string())
    }

    fn now(&self) -> DateTime<Local> {
        Local::now()
    }

    fn setups(&self) -> BTreeMap<String, String> {
        parse_setups(std::env::vars())
    }
}

pub fn parse_setups<I>(vars: I) -> BTreeMap<String, String>
where
    I: IntoIterator<Item = (String, String)>,
{
    let mut out = BTreeMap::new();
    for (key, value) in vars {
        if !key.starts_with("SETUP_") {
            continue;
        }
        let mut parts = value.split_whitespace();
        let (Some(product), Some(version)) = (parts.next(), parts.next()) else {
            continue;
        };
        if product == "eups" {
            continue;
        }
        out.insert(product.to_string(), version.to_string());
    }
    out
}

/// Fixed identity and clock.
#[derive(Debug, Clone)]
pub struct FixedEnvironment {
    pub user: String,
    pub hostname: String,
    pub now: DateTime<Local>,
    pub setups: BTreeMap<String, String>,
}

impl Environment for FixedEnvironment {
    fn user(&self) -> String {
        self.user.clone()
    }

    fn hostname(&self) -> String {
        self.hostname.clone()
    }

    fn now(&self) -> DateTime<Local> {
        self.now
    }

    fn setups(&self) -> BTreeMap<String, String> {
        self.setups.clone()
    }
}
