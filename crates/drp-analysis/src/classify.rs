use serde::Serialize;

/// SQL `LIKE` with `%` as the only wildcard; case-sensitive.
pub fn like(text: &str, pattern: &str) -> bool {
    let parts: Vec<&str> = pattern.split('%').collect();
    if parts.len() == 1 {
        return text == pattern;
    }
    let Some(mut rest) = text.strip_prefix(parts[0]) else {
        return false;
    };
    let last = parts[parts.len() - 1];
    for part in &parts[1..parts.len() - 1] {
        if part.is_empty() {
            continue;
        }
        match rest.find(part) {
            Some(at) => rest = &rest[at + part.len()..],
            None => return false,
        }
    }
    rest.ends_with(last)
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum EventClass {
    /// The sentinel `visit=0` job handed to each worker at the end.
    Shutdown,
    WorkUnitAttempted,
    PartialProductWritten,
    FinalProductWritten,
    None,
}

impl EventClass {
    pub fn describe(self) -> &'static str {
        match self {
            EventClass::Shutdown => "pipeline shutdowns seen",
            EventClass::WorkUnitAttempted => "CCDs attempted",
            EventClass::PartialProductWritten => "src writes",
            EventClass::FinalProductWritten => "calexp writes",
            EventClass::None => "other events",
        }
    }
}

const SHUTDOWN: &str = "Processing job:% visit=0 %";
const JOB_START: &str = "Processing job:%";
const PARTIAL_WRITE: &str = "Ending write to BoostStorage%/src%";
const FINAL_WRITE: &str = "Ending write to FitsStorage%/calexp%";

/// First matching class wins, in the order listed.
pub fn classify(comment: &str) -> EventClass {
    if like(comment, SHUTDOWN) {
        EventClass::Shutdown
    } else if like(comment, JOB_START) {
        EventClass::WorkUnitAttempted
    } else if like(comment, PARTIAL_WRITE) {
        EventClass::PartialProductWritten
    } else if like(comment, FINAL_WRITE) {
        EventClass::FinalProductWritten
    } else {
        EventClass::None
    }
}

pub const FAILURE_PATTERNS: &[&str] = &["%rror%", "%xception%", "%arning%", "%Fail%", "%fail%"];

/// Known messages that mention failure words without reporting one.
pub const BENIGN_PATTERNS: &[&str] = &[
    "%failureStage%",
    "%failure stage%",
    "failSerialName%",
    "failParallelName%",
    "Distortion fitter failed to improve%",
    "%magnitude error column%",
    "%errorFlagged%",
    "Skipping process due to error",
];

pub fn is_benign(comment: &str) -> bool {
    BENIGN_PATTERNS.iter().any(|p| like(comment, p))
}

pub fn is_failure(comment: &str) -> bool {
    FAILURE_PATTERNS.iter().any(|p| like(comment, p)) && !is_benign(comment)
}
