pub mod checks;
pub mod exec;
pub mod lifecycle;
pub mod links;
pub mod notify;
pub mod provision;
pub mod selector;
pub mod status;

pub use checks::prepare_run;
pub use exec::{ShellStageRunner, StageCommand, StageRunner};
pub use lifecycle::{run_production, Collaborators, ProductionRun, RunReport, RunState};
pub use links::{link_latest, relink_run};
pub use notify::{Notifier, SendmailNotifier};
pub use provision::{Provisioner, StandardProvisioner};
pub use selector::{candidate_groups, resolve_arch, select_group};
pub use status::{default_input, kill, list_inputs, report, status, GroupStatus, KillOutcome, Progress, RunStatusReport};
