//! Validator backed by an external runtime process

use super::AuthValidator;
use async_trait::async_trait;
use mailpost_common::config::AuthConfig;
use mailpost_common::{Error, Result};
use std::net::IpAddr;
use std::path::{Path, PathBuf};
use std::process::Stdio;
use tokio::io::AsyncWriteExt;
use tokio::process::Command;
use tracing::debug;

/// Runs the configured validator scripts; exit status 0 means `pass`
pub struct ScriptValidator {
    runtime: String,
    dkim_args: Vec<String>,
    spf_args: Vec<String>,
}

impl ScriptValidator {
    /// Create a validator from config
    pub fn new(config: &AuthConfig) -> Self {
        Self {
            runtime: config.runtime.clone(),
            dkim_args: config.dkim_args.clone(),
            spf_args: config.spf_args.clone(),
        }
    }

    async fn run(&self, check: &str, args: &[String], input: Option<&[u8]>) -> Result<bool> {
        let mut command = Command::new(&self.runtime);
        command
            .args(args)
            .stdin(if input.is_some() {
                Stdio::piped()
            } else {
                Stdio::null()
            })
            .stdout(Stdio::null())
            .stderr(Stdio::piped())
            .kill_on_drop(true);

        let mut child = command.spawn().map_err(|e| {
            Error::Validator(format!("Failed to start {} validator: {}", check, e))
        })?;

        let stdin = child.stdin.take();
        let feed = async move {
            if let (Some(mut pipe), Some(data)) = (stdin, input) {
                match pipe.write_all(data).await {
                    Ok(()) => {}
                    // The validator may decide before reading everything
                    Err(e) if e.kind() == std::io::ErrorKind::BrokenPipe => {}
                    Err(e) => return Err(e),
                }
            }
            Ok::<(), std::io::Error>(())
        };

        let (fed, output) = tokio::join!(feed, child.wait_with_output());

        fed.map_err(|e| {
            Error::Validator(format!("Failed to write message to {} validator: {}", check, e))
        })?;
        let output = output
            .map_err(|e| Error::Validator(format!("{} validator did not finish: {}", check, e)))?;

        if !output.status.success() {
            debug!(
                check,
                status = ?output.status.code(),
                stderr = %String::from_utf8_lossy(&output.stderr).trim(),
                "Validator reported failure"
            );
        }

        Ok(output.status.success())
    }
}

#[async_trait]
impl AuthValidator for ScriptValidator {
    async fn validate_dkim(&self, raw: &[u8]) -> Result<bool> {
        self.run("DKIM", &self.dkim_args, Some(raw)).await
    }

    async fn validate_spf(
        &self,
        remote_ip: IpAddr,
        envelope_from: &str,
        remote_host: &str,
    ) -> Result<bool> {
        let mut args = self.spf_args.clone();
        args.push(remote_ip.to_string());
        args.push(envelope_from.to_string());
        args.push(remote_host.to_string());
        self.run("SPF", &args, None).await
    }
}

/// Resolve `program` the way a shell would: as a path when it contains a
/// separator, otherwise by searching `PATH`
pub fn locate_program(program: &str) -> Option<PathBuf> {
    if program.is_empty() {
        return None;
    }

    let candidate = Path::new(program);
    if candidate.components().count() > 1 {
        return is_executable(candidate).then(|| candidate.to_path_buf());
    }

    let paths = std::env::var_os("PATH")?;
    std::env::split_paths(&paths)
        .map(|dir| dir.join(program))
        .find(|path| is_executable(path))
}

#[cfg(unix)]
fn is_executable(path: &Path) -> bool {
    use std::os::unix::fs::PermissionsExt;

    std::fs::metadata(path)
        .map(|m| m.is_file() && m.permissions().mode() & 0o111 != 0)
        .unwrap_or(false)
}

#[cfg(not(unix))]
fn is_executable(path: &Path) -> bool {
    path.is_file()
}
