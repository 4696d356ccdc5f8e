// # Remote Command Driver
//
// This crate runs one command on a device over a short-lived SSH session,
// using the system OpenSSH client as a child process.
//
// ## Session
//
// - Key-based authentication only (`BatchMode=yes`, no password prompts)
// - Unknown host keys are accepted on first contact and pinned afterwards
// - The child is killed when the probe future is dropped, so a cancelled
//   probe never leaves a session behind
//
// ## Failure mapping
//
// OpenSSH reports its own failures with exit status 255 and a message on
// stderr. Those are classified into `AuthenticationFailed`,
// `ConnectionRefused` or `CommandTimeout`; any other non-zero status is the
// remote command's own and becomes `NonZeroExit`.

use async_trait::async_trait;
use netsup_core::config::DriverConfig;
use netsup_core::device::{Credentials, Protocol};
use netsup_core::error::ProbeError;
use netsup_core::traits::{
    CommandOutput, ProbeDriver, ProbeDriverFactory, ProbeOptions, ProbePayload,
};
use netsup_core::{DriverRegistry, Error, Result};
use std::net::IpAddr;
use std::process::Stdio;
use std::time::Duration;
use tokio::process::Command;
use tracing::debug;

/// Standard SSH port
pub const DEFAULT_SSH_PORT: u16 = 22;

/// Exit status OpenSSH uses for its own errors
const SSH_ERROR_STATUS: i32 = 255;

/// Longest stderr excerpt kept on a failure
const MAX_STDERR_LEN: usize = 512;

/// Longest stdout kept on the device record
const MAX_STDOUT_LEN: usize = 64 * 1024;

/// OpenSSH-based remote command driver
#[derive(Debug, Clone)]
pub struct SshDriver {
    port: u16,
    binary: String,
}

impl SshDriver {
    /// Create a driver
    ///
    /// # Parameters
    ///
    /// - `port`: Default session port (credentials may override it)
    /// - `binary`: Path to the `ssh` client, `ssh` from `PATH` if `None`
    pub fn new(port: u16, binary: Option<String>) -> Self {
        Self {
            port,
            binary: binary.unwrap_or_else(|| "ssh".to_string()),
        }
    }

    /// Arguments for one session
    fn session_args(
        &self,
        address: IpAddr,
        timeout: Duration,
        credentials: &Credentials,
        command: &str,
    ) -> Vec<String> {
        let connect_secs = timeout.as_secs().max(1);
        let mut args: Vec<String> = [
            "-o",
            "BatchMode=yes",
            "-o",
            "PasswordAuthentication=no",
            "-o",
            "KbdInteractiveAuthentication=no",
            "-o",
            "StrictHostKeyChecking=accept-new",
        ]
        .iter()
        .map(|s| s.to_string())
        .collect();

        args.push("-o".to_string());
        args.push(format!("ConnectTimeout={}", connect_secs));
        args.push("-p".to_string());
        args.push(credentials.port.unwrap_or(self.port).to_string());
        if let Some(key) = &credentials.private_key_path {
            args.push("-o".to_string());
            args.push("IdentitiesOnly=yes".to_string());
            args.push("-i".to_string());
            args.push(key.display().to_string());
        }
        args.push("-l".to_string());
        args.push(credentials.username.clone());
        args.push(address.to_string());
        args.push(command.to_string());
        args
    }
}

#[async_trait]
impl ProbeDriver for SshDriver {
    fn protocol(&self) -> Protocol {
        Protocol::Command
    }

    async fn probe(
        &self,
        address: IpAddr,
        timeout: Duration,
        options: &ProbeOptions,
    ) -> std::result::Result<ProbePayload, ProbeError> {
        let (Some(credentials), Some(command)) = (&options.credentials, &options.command) else {
            return Err(ProbeError::Driver(
                "command probe needs credentials and a command".to_string(),
            ));
        };

        let args = self.session_args(address, timeout, credentials, command);
        debug!("Running command on {} as {}", address, credentials.username);

        let output = Command::new(&self.binary)
            .args(&args)
            .stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true)
            .output()
            .await
            .map_err(|e| ProbeError::Driver(format!("cannot run {}: {}", self.binary, e)))?;

        let stdout = String::from_utf8_lossy(&output.stdout);
        let stderr = String::from_utf8_lossy(&output.stderr);

        match output.status.code() {
            Some(0) => Ok(ProbePayload::Command(CommandOutput {
                command: command.clone(),
                stdout: truncate(&stdout, MAX_STDOUT_LEN),
                stderr: truncate(&stderr, MAX_STDERR_LEN),
                exit_code: 0,
            })),
            Some(code) => Err(classify_exit(code, &stderr)),
            None => Err(ProbeError::Driver("ssh terminated by signal".to_string())),
        }
    }

    fn applies_to(&self, options: &ProbeOptions) -> bool {
        options.credentials.is_some() && options.command.is_some()
    }

    fn driver_name(&self) -> &'static str {
        "ssh"
    }
}

/// Map a non-zero exit status and stderr to a probe error
pub fn classify_exit(code: i32, stderr: &str) -> ProbeError {
    if code == SSH_ERROR_STATUS {
        let lower = stderr.to_ascii_lowercase();
        if lower.contains("permission denied")
            || lower.contains("authentication failed")
            || lower.contains("too many authentication failures")
        {
            return ProbeError::AuthenticationFailed;
        }
        if lower.contains("timed out") {
            return ProbeError::CommandTimeout;
        }
        if lower.contains("connection refused")
            || lower.contains("no route to host")
            || lower.contains("network is unreachable")
            || lower.contains("connection closed")
            || lower.contains("connection reset")
            || lower.contains("host key verification failed")
        {
            return ProbeError::ConnectionRefused(first_line(stderr));
        }
    }
    ProbeError::NonZeroExit {
        code,
        stderr: truncate(stderr, MAX_STDERR_LEN),
    }
}

fn first_line(text: &str) -> String {
    text.lines()
        .map(str::trim)
        .find(|line| !line.is_empty())
        .unwrap_or_default()
        .to_string()
}

/// Cut `text` to at most `max` bytes on a character boundary
fn truncate(text: &str, max: usize) -> String {
    if text.len() <= max {
        return text.to_string();
    }
    let mut end = max;
    while !text.is_char_boundary(end) {
        end -= 1;
    }
    text[..end].to_string()
}

/// Factory for creating SSH drivers
pub struct SshFactory;

impl ProbeDriverFactory for SshFactory {
    fn create(&self, config: &DriverConfig) -> Result<Box<dyn ProbeDriver>> {
        match config {
            DriverConfig::Ssh { port, binary } => {
                Ok(Box::new(SshDriver::new(*port, binary.clone())))
            }
            _ => Err(Error::config("Invalid config for SSH driver")),
        }
    }
}

/// Register the SSH driver with a registry
pub fn register(registry: &DriverRegistry) {
    registry.register_driver("ssh", Box::new(SshFactory));
}
