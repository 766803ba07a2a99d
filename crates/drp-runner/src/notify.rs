use anyhow::{anyhow, Context, Result};
use std::io::Write;
use std::process::{Command, Stdio};
use tracing::info;

/// Delivers run notifications. Delivery failures never change run state.
pub trait Notifier {
    fn notify(&self, to: &str, subject: &str, body: &str) -> Result<()>;
}

/// Pipes an RFC 822 message into `sendmail -t`.
#[derive(Debug, Clone)]
pub struct SendmailNotifier {
    pub program: String,
    pub from: String,
}

impl SendmailNotifier {
    pub fn new(program: impl Into<String>, from: impl Into<String>) -> Self {
        Self {
            program: program.into(),
            from: from.into(),
        }
    }
}

pub fn format_message(from: &str, to: &str, subject: &str, body: &str) -> String {
    format!(
        "Subject: {}\nFrom: {}\nTo: {}\nContent-Type: text/plain; charset=\"utf-8\"\n\n{}\n",
        subject, from, to, body
    )
}

impl Notifier for SendmailNotifier {
    fn notify(&self, to: &str, subject: &str, body: &str) -> Result<()> {
        info!(to = %to, "{}", subject);
        if to.is_empty() {
            return Ok(());
        }
        let mut child = Command::new(&self.program)
            .args(["-t", "-f", self.from.as_str()])
            .stdin(Stdio::piped())
            .stdout(Stdio::null())
            .spawn()
            .with_context(|| format!("cannot start {}", self.program))?;
        // stdin is closed at the end of the match so the child sees EOF.
        let written = match child.stdin.take() {
            Some(mut stdin) => stdin.write_all(format_message(&self.from, to, subject, body).as_bytes()),
            None => Ok(()),
        };
        let status = child.wait()?;
        written.with_context(|| format!("cannot write message to {}", self.program))?;
        if !status.success() {
            return Err(anyhow!("{} exited with {}", self.program, status));
        }
        Ok(())
    }
}
