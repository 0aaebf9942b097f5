//! Reload actions for consumer services.

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use std::fmt;
use std::path::PathBuf;
use std::process::Stdio;
use std::sync::Arc;
use std::time::Duration;

use crate::errors::{Result, RotationError};

/// Signals a `signal` action may send.
pub const SUPPORTED_SIGNALS: &[&str] = &["HUP", "USR1", "USR2", "TERM", "INT", "QUIT"];

fn default_signal() -> String {
    "HUP".to_string()
}

/// How a service is told to pick up new artifacts.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum ReloadActionSpec {
    /// Run a command; exit status 0 means the reload succeeded
    Command { command: Vec<String> },
    /// Send a signal to the PID stored in `pidfile`
    Signal {
        pidfile: PathBuf,
        #[serde(default = "default_signal")]
        signal: String,
    },
}

/// A named consumer service from the catalog.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ServiceSpec {
    #[serde(flatten)]
    pub action: ReloadActionSpec,

    /// Per-attempt timeout overriding the engine default
    #[serde(default, with = "humantime_serde", skip_serializing_if = "Option::is_none")]
    pub timeout: Option<Duration>,
}

impl ServiceSpec {
    /// Static checks run when the catalog is loaded.
    pub fn validate(&self) -> std::result::Result<(), String> {
        match &self.action {
            ReloadActionSpec::Command { command } => {
                if command.first().map_or(true, |program| program.trim().is_empty()) {
                    return Err("command must name a program".to_string());
                }
            }
            ReloadActionSpec::Signal { pidfile, signal } => {
                if pidfile.as_os_str().is_empty() {
                    return Err("pidfile cannot be empty".to_string());
                }
                if !SUPPORTED_SIGNALS.contains(&normalize_signal(signal)) {
                    return Err(format!(
                        "unsupported signal '{}' (expected one of {})",
                        signal,
                        SUPPORTED_SIGNALS.join(", ")
                    ));
                }
            }
        }
        if self.timeout.is_some_and(|t| t.is_zero()) {
            return Err("timeout must be greater than zero".to_string());
        }
        Ok(())
    }

    /// Build the runnable action for `service`.
    pub fn build(&self, service: &str) -> Arc<dyn ReloadAction> {
        match &self.action {
            ReloadActionSpec::Command { command } => {
                Arc::new(CommandAction { service: service.to_string(), argv: command.clone() })
            }
            ReloadActionSpec::Signal { pidfile, signal } => Arc::new(SignalAction {
                service: service.to_string(),
                pidfile: pidfile.clone(),
                signal: normalize_signal(signal).to_string(),
            }),
        }
    }
}

fn normalize_signal(signal: &str) -> &str {
    signal.strip_prefix("SIG").unwrap_or(signal)
}

/// Something that makes a service reload its configuration.
///
/// Each call is one attempt; retries and timeouts belong to the dispatcher.
#[async_trait]
pub trait ReloadAction: Send + Sync + fmt::Debug {
    async fn invoke(&self) -> Result<()>;

    /// Human-readable description for logs
    fn describe(&self) -> String;
}

/// Runs an argv without a shell.
#[derive(Debug, Clone)]
pub struct CommandAction {
    service: String,
    argv: Vec<String>,
}

impl CommandAction {
    pub fn new(service: impl Into<String>, argv: Vec<String>) -> Self {
        Self { service: service.into(), argv }
    }
}

#[async_trait]
impl ReloadAction for CommandAction {
    async fn invoke(&self) -> Result<()> {
        let (program, args) = self
            .argv
            .split_first()
            .ok_or_else(|| RotationError::config(format!("Service '{}' has an empty command", self.service)))?;

        let output = tokio::process::Command::new(program)
            .args(args)
            .stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true)
            .output()
            .await
            .map_err(|e| RotationError::io(e, format!("Failed to spawn reload command '{}'", program)))?;

        if output.status.success() {
            return Ok(());
        }

        let stderr = String::from_utf8_lossy(&output.stderr);
        let tail: String = stderr.trim().chars().rev().take(200).collect::<Vec<_>>().into_iter().rev().collect();
        Err(RotationError::reload_failed(
            &self.service,
            1,
            format!("'{}' exited with {}: {}", program, output.status, tail),
        ))
    }

    fn describe(&self) -> String {
        format!("command {:?}", self.argv)
    }
}

/// Sends a signal to the process whose PID is in a pidfile.
#[derive(Debug, Clone)]
pub struct SignalAction {
    service: String,
    pidfile: PathBuf,
    signal: String,
}

impl SignalAction {
    async fn read_pid(&self) -> Result<u32> {
        let raw = tokio::fs::read_to_string(&self.pidfile)
            .await
            .map_err(|e| RotationError::io(e, format!("Failed to read pidfile {}", self.pidfile.display())))?;
        match raw.trim().parse::<u32>() {
            Ok(pid) if pid > 1 => Ok(pid),
            _ => Err(RotationError::reload_failed(
                &self.service,
                1,
                format!("pidfile {} does not contain a valid PID", self.pidfile.display()),
            )),
        }
    }
}

#[async_trait]
impl ReloadAction for SignalAction {
    async fn invoke(&self) -> Result<()> {
        let pid = self.read_pid().await?;
        let status = tokio::process::Command::new("kill")
            .arg("-s")
            .arg(&self.signal)
            .arg(pid.to_string())
            .stdin(Stdio::null())
            .stdout(Stdio::null())
            .stderr(Stdio::null())
            .kill_on_drop(true)
            .status()
            .await
            .map_err(|e| RotationError::io(e, "Failed to run kill"))?;

        if status.success() {
            Ok(())
        } else {
            Err(RotationError::reload_failed(
                &self.service,
                1,
                format!("kill -s {} {} exited with {}", self.signal, pid, status),
            ))
        }
    }

    fn describe(&self) -> String {
        format!("signal SIG{} via {}", self.signal, self.pidfile.display())
    }
}
