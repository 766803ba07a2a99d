use anyhow::{anyhow, Context, Result};
use clap::{Parser, Subcommand};
use drp_analysis::{error_report, AnalysisError, JsonlLogStore};
use drp_core::{DrpConfig, DrpError, Environment, LockStore, RunOptions, SystemEnvironment};
use drp_runner::{
    default_input, kill, list_inputs, relink_run, report, run_production, status, Collaborators,
    SendmailNotifier, ShellStageRunner, StandardProvisioner,
};
use serde_json::{json, Value};
use std::path::PathBuf;
use tracing_subscriber::{fmt, prelude::*, EnvFilter};

#[derive(Parser)]
#[command(name = "drp", version = "0.3.0", about = "Data release production run coordinator")]
struct Cli {
    /// Site configuration (YAML); built-in defaults when omitted.
    #[arg(long, global = true)]
    config: Option<PathBuf>,
    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Claim a machine group and execute one production run.
    Run {
        #[arg(short = 't', long)]
        run_type: Option<String>,
        #[arg(short = 'p', long)]
        pipeline: Option<String>,
        #[arg(short = 'i', long)]
        input: Option<String>,
        #[arg(short = 'n', long = "ccd-count")]
        ccd_count: Option<u32>,
        #[arg(short = 'o', long)]
        output: Option<PathBuf>,
        #[arg(short = 'a', long)]
        arch: Option<String>,
        /// Pipeline override as key=value; repeatable.
        #[arg(short = 'D', long = "define")]
        define: Vec<String>,
        #[arg(short = 'x', long)]
        skip_qa: bool,
        #[arg(short = 'T', long)]
        test_only: bool,
        #[arg(short = 'm', long)]
        mail: Option<String>,
        #[arg(long)]
        json: bool,
    },
    /// Show every held machine group and its run's progress.
    Status {
        #[arg(long)]
        json: bool,
    },
    Report {
        run_id: String,
        /// Base directory the run was started under.
        #[arg(short = 'o', long)]
        output: Option<PathBuf>,
        #[arg(long)]
        json: bool,
    },
    ErrorReport {
        run_id: String,
        #[arg(long)]
        json: bool,
    },
    Kill {
        run_id: String,
        #[arg(long)]
        json: bool,
    },
    ListInputs {
        #[arg(long)]
        json: bool,
    },
    /// Point latest_<run type> at an earlier run.
    LinkLatest {
        run_id: String,
        #[arg(short = 'o', long)]
        output: Option<PathBuf>,
        #[arg(long)]
        json: bool,
    },
}

fn main() -> Result<()> {
    tracing_subscriber::registry()
        .with(fmt::layer().with_writer(std::io::stderr))
        .with(EnvFilter::from_default_env().add_directive("drp=info".parse()?))
        .init();

    let cli = Cli::parse();
    let json_mode = command_json_mode(&cli.command);
    tracing::debug!(config = ?cli.config, "loading configuration");
    let result = load_config(cli.config.as_ref()).and_then(|config| run_command(&config, cli.command));
    match result {
        Ok(Some(payload)) => {
            emit_json(&payload);
            Ok(())
        }
        Ok(None) => Ok(()),
        Err(err) => {
            if json_mode {
                let (code, details) = error_code(&err);
                emit_json(&json_error(code, format!("{:#}", err), details));
                std::process::exit(1);
            }
            Err(err)
        }
    }
}

fn load_config(path: Option<&PathBuf>) -> Result<DrpConfig> {
    match path {
        Some(path) => Ok(DrpConfig::load(path)?),
        None => Ok(DrpConfig::default()),
    }
}

fn run_command(config: &DrpConfig, command: Commands) -> Result<Option<Value>> {
    let env = SystemEnvironment;
    let logs = JsonlLogStore::new(&config.events_dir);
    match command {
        Commands::Run {
            run_type,
            pipeline,
            input,
            ccd_count,
            output,
            arch,
            define,
            skip_qa,
            test_only,
            mail,
            json,
        } => {
            let user = env.user();
            let mut options = RunOptions::defaults(config, &user);
            if let Some(run_type) = run_type {
                options.run_type = run_type;
            }
            if let Some(pipeline) = pipeline {
                options.pipeline = pipeline;
            }
            options.input = match input {
                Some(input) => input,
                None => default_input(config)?
                    .ok_or_else(|| DrpError::Config("no input dataset given or found".to_string()))?,
            };
            if let Some(output) = output {
                options.output = output;
            }
            if let Some(mail) = mail {
                options.notify_to = mail;
            }
            options.ccd_count = ccd_count;
            options.arch = arch;
            options.overrides = parse_overrides(&define)?;
            options.do_qa = !skip_qa;
            options.test_only = test_only;

            let provisioner = StandardProvisioner::new(ShellStageRunner);
            let notifier = SendmailNotifier::new(
                config.sendmail.clone(),
                format!("{}@{}", user, env.hostname()),
            );
            let collab = Collaborators {
                env: &env,
                provisioner: &provisioner,
                stages: &ShellStageRunner,
                notifier: &notifier,
                logs: &logs,
            };
            let result = run_production(config, &options, collab)?;
            if json {
                return Ok(Some(json!({
                    "ok": true,
                    "command": "run",
                    "run": serde_json::to_value(&result)?
                })));
            }
            println!("run_id: {}", result.run_id);
            println!("group: {}", result.group);
            println!("output: {}", result.output_dir.display());
            match &result.summary {
                Some(summary) => print!("{}", summary),
                None => println!("\tDatabase not yet created"),
            }
        }
        Commands::Status { json } => {
            let locks = LockStore::new(config.lock_dir());
            let groups = status(config, &locks, &logs)?;
            if json {
                return Ok(Some(json!({
                    "ok": true,
                    "command": "status",
                    "groups": serde_json::to_value(&groups)?
                })));
            }
            if groups.is_empty() {
                println!("No machine sets in use");
            }
            for group in &groups {
                print!("{}", group);
            }
        }
        Commands::Report { run_id, output, json } => {
            let locks = LockStore::new(config.lock_dir());
            let output_base = output.unwrap_or_else(|| config.output_base.clone());
            let result = report(&output_base, &locks, &logs, &run_id)?;
            if json {
                return Ok(Some(json!({
                    "ok": true,
                    "command": "report",
                    "report": serde_json::to_value(&result)?
                })));
            }
            print!("{}", result);
        }
        Commands::ErrorReport { run_id, json } => {
            let result = error_report(&logs, &run_id)?;
            if json {
                return Ok(Some(json!({
                    "ok": true,
                    "command": "error-report",
                    "report": serde_json::to_value(&result)?
                })));
            }
            print!("{}", result);
        }
        Commands::Kill { run_id, json } => {
            let locks = LockStore::new(config.lock_dir());
            let outcome = kill(config, &locks, &env, &ShellStageRunner, &run_id)?;
            if json {
                return Ok(Some(json!({
                    "ok": true,
                    "command": "kill",
                    "kill": serde_json::to_value(&outcome)?
                })));
            }
            println!("run {} on {} killed", outcome.run_id, outcome.group);
        }
        Commands::ListInputs { json } => {
            let inputs = list_inputs(config)?;
            if json {
                return Ok(Some(json!({
                    "ok": true,
                    "command": "list-inputs",
                    "inputs": inputs
                })));
            }
            for input in &inputs {
                println!("{}", input);
            }
        }
        Commands::LinkLatest { run_id, output, json } => {
            let output_base = output.unwrap_or_else(|| config.output_base.clone());
            let latest = relink_run(config, &output_base, &run_id)?;
            if json {
                return Ok(Some(json!({
                    "ok": true,
                    "command": "link-latest",
                    "latest": latest.display().to_string()
                })));
            }
            println!("{} -> {}", latest.display(), run_id);
        }
    }
    Ok(None)
}

fn parse_overrides(define: &[String]) -> Result<Vec<(String, String)>> {
    define
        .iter()
        .map(|item| {
            item.split_once('=')
                .map(|(k, v)| (k.trim().to_string(), v.trim().to_string()))
                .filter(|(k, _)| !k.is_empty())
                .ok_or_else(|| anyhow!("override '{}' must be key=value", item))
        })
        .collect::<Result<Vec<_>>>()
        .context("invalid --define")
}

fn emit_json(value: &Value) {
    match serde_json::to_string(value) {
        Ok(s) => println!("{}", s),
        Err(_) => println!(
            "{{\"ok\":false,\"error\":{{\"code\":\"serialization_error\",\"message\":\"failed to serialize JSON payload\",\"details\":{{}}}}}}"
        ),
    }
}

fn json_error(code: &str, message: String, details: Value) -> Value {
    json!({
        "ok": false,
        "error": {
            "code": code,
            "message": message,
            "details": details
        }
    })
}

fn error_code(err: &anyhow::Error) -> (&'static str, Value) {
    if let Some(err) = err.downcast_ref::<DrpError>() {
        return match err {
            DrpError::Config(_) | DrpError::Yaml(_) | DrpError::InvalidRunType(_) => ("config_error", json!({})),
            DrpError::Unreadable(path) | DrpError::Unwritable(path) => {
                ("path_error", json!({ "path": path.display().to_string() }))
            }
            DrpError::InsufficientSpace { available, needed } => (
                "insufficient_space",
                json!({ "available": available, "needed": needed }),
            ),
            DrpError::NoGroupAvailable { arch } => ("no_group_available", json!({ "arch": arch })),
            DrpError::Stage { stage, .. } => ("stage_failed", json!({ "stage": stage })),
            DrpError::Release { group, .. } => ("release_failed", json!({ "group": group })),
            DrpError::NoActiveRun(run_id) => ("no_active_run", json!({ "run_id": run_id })),
            DrpError::AmbiguousRun { run_id, groups } => {
                ("ambiguous_run", json!({ "run_id": run_id, "groups": groups }))
            }
            DrpError::Io(_) => ("io_error", json!({})),
        };
    }
    if let Some(err) = err.downcast_ref::<AnalysisError>() {
        return match err {
            AnalysisError::NoMatch(run_id) => ("no_log_database", json!({ "run_id": run_id })),
            AnalysisError::Ambiguous { run_id, candidates } => (
                "ambiguous_log_database",
                json!({ "run_id": run_id, "candidates": candidates }),
            ),
            AnalysisError::Parse { database, line, .. } => {
                ("log_parse_error", json!({ "database": database, "line": line }))
            }
            AnalysisError::Io(_) => ("io_error", json!({})),
        };
    }
    ("command_failed", json!({}))
}

fn command_json_mode(command: &Commands) -> bool {
    match command {
        Commands::Run { json, .. }
        | Commands::Status { json }
        | Commands::Report { json, .. }
        | Commands::ErrorReport { json, .. }
        | Commands::Kill { json, .. }
        | Commands::ListInputs { json }
        | Commands::LinkLatest { json, .. } => *json,
    }
}
