//! Remote storage access via the `rclone` binary.
//!
//! Uploads pipe clip bytes straight into `rclone rcat` stdin so nothing is
//! written to the local disk. Deletes treat a missing object as success so
//! purge passes are idempotent.

use crate::error::Error;
use anyhow::Result;
use async_trait::async_trait;
use bytes::Bytes;
use log::{debug, error, trace, warn};
use std::process::Stdio;
use tokio::io::AsyncWriteExt;
use tokio::process::{Child, ChildStdin, Command};

/// Interface to the remote store used by the upload stage and the purger.
#[async_trait]
pub trait Transfer: Send + Sync {
    /// Verify the tool and destination are usable. Called once at startup.
    async fn check(&self) -> Result<()>;

    /// Start streaming an object to `path`.
    async fn begin_upload(&self, path: &str) -> Result<Box<dyn UploadSink>>;

    /// Delete the object at `path`. A missing object is success.
    async fn delete(&self, path: &str) -> Result<()>;

    /// Remove empty directories left behind by deletes. Best effort.
    async fn tidy(&self) -> Result<()>;
}

/// An in-progress streaming upload.
#[async_trait]
pub trait UploadSink: Send {
    async fn write(&mut self, chunk: Bytes) -> Result<()>;

    /// Complete the upload. The object exists remotely only after this
    /// returns Ok.
    async fn finish(self: Box<Self>) -> Result<()>;

    /// Abandon the upload without committing the object.
    async fn abort(self: Box<Self>);
}

/// `rclone`-backed [`Transfer`] implementation.
pub struct RcloneTransfer {
    destination: String,
    upload_args: Vec<String>,
    purge_args: Vec<String>,
}

impl RcloneTransfer {
    pub fn new(destination: String, upload_args: Vec<String>, purge_args: Vec<String>) -> Self {
        RcloneTransfer {
            destination,
            upload_args,
            purge_args,
        }
    }

    async fn run(&self, args: &[&str]) -> Result<std::process::Output> {
        trace!("Running: rclone {}", args.join(" "));
        let output = Command::new("rclone")
            .args(args)
            .stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .output()
            .await
            .map_err(|e| Error::Transfer(format!("failed to run rclone: {e}")))?;

        trace!("rclone stdout: {}", String::from_utf8_lossy(&output.stdout));
        trace!("rclone stderr: {}", String::from_utf8_lossy(&output.stderr));
        Ok(output)
    }
}

#[async_trait]
impl Transfer for RcloneTransfer {
    async fn check(&self) -> Result<()> {
        let output = self.run(&["listremotes"]).await?;
        if !output.status.success() {
            return Err(Error::Transfer(format!(
                "`rclone listremotes` failed: {}",
                String::from_utf8_lossy(&output.stderr)
            ))
            .into());
        }

        let remotes = String::from_utf8_lossy(&output.stdout);
        if !remote_configured(&self.destination, &remotes) {
            let remote = self.destination.split(':').next().unwrap_or_default();
            return Err(Error::Transfer(format!(
                "rclone does not have a remote called `{remote}`"
            ))
            .into());
        }

        // Make sure the base directory exists.
        let output = self.run(&["mkdir", "-vv", &self.destination]).await?;
        if !output.status.success() {
            warn!(
                "`rclone mkdir {}` failed: {}",
                self.destination,
                String::from_utf8_lossy(&output.stderr)
            );
        }

        Ok(())
    }

    async fn begin_upload(&self, path: &str) -> Result<Box<dyn UploadSink>> {
        let mut command = Command::new("rclone");
        command.arg("rcat").arg("-vv");
        for arg in &self.upload_args {
            command.arg(arg);
        }
        command
            .arg(path)
            .stdin(Stdio::piped())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true);

        debug!("Starting upload to {path}");
        let mut child = command
            .spawn()
            .map_err(|e| Error::Transfer(format!("failed to spawn rclone rcat: {e}")))?;
        let stdin = child
            .stdin
            .take()
            .ok_or_else(|| Error::Transfer("rclone rcat has no stdin".to_string()))?;

        Ok(Box::new(RcloneSink {
            path: path.to_string(),
            child,
            stdin: Some(stdin),
        }))
    }

    async fn delete(&self, path: &str) -> Result<()> {
        let mut args = vec!["delete", "-vv"];
        for arg in &self.purge_args {
            args.push(arg);
        }
        args.push(path);

        let output = self.run(&args).await?;
        if output.status.success() {
            return Ok(());
        }

        let stderr = String::from_utf8_lossy(&output.stderr);
        if is_not_found(&stderr) {
            debug!("Delete of {path}: already gone");
            return Ok(());
        }
        Err(Error::Transfer(format!("failed to delete `{path}`: {stderr}")).into())
    }

    async fn tidy(&self) -> Result<()> {
        let output = self
            .run(&[
                "rmdirs",
                "-vv",
                "--ignore-errors",
                "--leave-root",
                &self.destination,
            ])
            .await?;
        if !output.status.success() {
            warn!(
                "Failed to tidy empty directories: {}",
                String::from_utf8_lossy(&output.stderr)
            );
        }
        Ok(())
    }
}

struct RcloneSink {
    path: String,
    child: Child,
    stdin: Option<ChildStdin>,
}

#[async_trait]
impl UploadSink for RcloneSink {
    async fn write(&mut self, chunk: Bytes) -> Result<()> {
        let stdin = self
            .stdin
            .as_mut()
            .ok_or_else(|| Error::Transfer("upload already closed".to_string()))?;
        stdin
            .write_all(&chunk)
            .await
            .map_err(|e| Error::Transfer(format!("rclone rcat write failed: {e}")))?;
        Ok(())
    }

    async fn finish(mut self: Box<Self>) -> Result<()> {
        // Closing stdin is what makes rclone commit the object.
        drop(self.stdin.take());

        let output = self
            .child
            .wait_with_output()
            .await
            .map_err(|e| Error::Transfer(format!("rclone rcat wait failed: {e}")))?;
        if !output.status.success() {
            return Err(Error::Transfer(format!(
                "rclone rcat `{}` exited with {}: {}",
                self.path,
                output.status,
                String::from_utf8_lossy(&output.stderr)
            ))
            .into());
        }
        Ok(())
    }

    async fn abort(mut self: Box<Self>) {
        drop(self.stdin.take());
        if let Err(e) = self.child.start_kill() {
            error!("Failed to kill rclone rcat for {}: {e}", self.path);
        }
        let _ = self.child.wait().await;
    }
}

fn remote_configured(destination: &str, listremotes_output: &str) -> bool {
    listremotes_output
        .lines()
        .map(str::trim)
        .filter(|line| !line.is_empty())
        .any(|remote| destination.starts_with(remote))
}

fn is_not_found(stderr: &str) -> bool {
    let stderr = stderr.to_ascii_lowercase();
    stderr.contains("not found") || stderr.contains("doesn't exist")
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn recognizes_configured_remote() {
        let listing = "gdrive:\nb2:\n";
        assert!(remote_configured("gdrive:/backups/unifi", listing));
        assert!(remote_configured("b2:unifi", listing));
        assert!(!remote_configured("s3:unifi", listing));
    }

    #[test]
    fn recognizes_not_found_errors() {
        assert!(is_not_found("ERROR : file.mp4: Object not found"));
        assert!(is_not_found("directory not found"));
        assert!(is_not_found("error: path doesn't exist"));
        assert!(!is_not_found("permission denied"));
    }
}
