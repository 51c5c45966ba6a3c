//! Shell Integration
//!
//! Hands a resolved instance over to `gcloud compute ssh`.

use std::process::{Command, Stdio};

/// SSH connection options
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SshOptions {
    /// Instance name
    pub instance: String,
    /// Zone
    pub zone: String,
    /// Project ID
    pub project: String,
    /// Use IAP tunneling
    pub use_iap: bool,
    /// Additional SSH arguments, passed after `--`
    pub extra_args: Vec<String>,
}

impl SshOptions {
    pub fn new(instance: &str, zone: &str, project: &str) -> Self {
        Self {
            instance: instance.to_string(),
            zone: zone.to_string(),
            project: project.to_string(),
            use_iap: false,
            extra_args: Vec::new(),
        }
    }

    pub fn with_iap(mut self, use_iap: bool) -> Self {
        self.use_iap = use_iap;
        self
    }

    pub fn with_extra_args(mut self, args: Vec<String>) -> Self {
        self.extra_args = args;
        self
    }

    /// Arguments for `gcloud`
    pub fn gcloud_args(&self) -> Vec<String> {
        let mut args = vec![
            "compute".to_string(),
            "ssh".to_string(),
            self.instance.clone(),
            "--zone".to_string(),
            self.zone.clone(),
            "--project".to_string(),
            self.project.clone(),
        ];

        if self.use_iap {
            args.push("--tunnel-through-iap".to_string());
        }

        if !self.extra_args.is_empty() {
            args.push("--".to_string());
            args.extend(self.extra_args.iter().cloned());
        }

        args
    }
}

/// Result of a shell operation
#[derive(Debug, PartialEq, Eq)]
pub enum ShellResult {
    /// Command completed successfully
    Success,
    /// Command failed with exit code
    Failed(i32),
    /// Error launching command
    Error(String),
}

impl ShellResult {
    pub fn is_success(&self) -> bool {
        matches!(self, Self::Success)
    }
}

/// Execute SSH to a GCE instance, blocking until the session ends
pub fn ssh_to_instance(opts: &SshOptions) -> ShellResult {
    let args = opts.gcloud_args();
    tracing::info!("Executing: gcloud {}", args.join(" "));
    execute_command("gcloud", &args)
}

/// Execute a command, inheriting stdio
fn execute_command(cmd: &str, args: &[String]) -> ShellResult {
    match Command::new(cmd)
        .args(args)
        .stdin(Stdio::inherit())
        .stdout(Stdio::inherit())
        .stderr(Stdio::inherit())
        .spawn()
    {
        Ok(mut child) => match child.wait() {
            Ok(status) => {
                if status.success() {
                    ShellResult::Success
                } else {
                    ShellResult::Failed(status.code().unwrap_or(-1))
                }
            },
            Err(e) => ShellResult::Error(format!("Failed to wait for process: {}", e)),
        },
        Err(e) => ShellResult::Error(format!("Failed to execute {}: {}", cmd, e)),
    }
}
