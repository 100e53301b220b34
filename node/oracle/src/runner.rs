use std::path::{Path, PathBuf};
use std::process::Stdio;
use thiserror::Error;
use tokio::io::AsyncWriteExt;
use tokio::process::Command;
use veritor_common::types::ExecutionRecord;

#[derive(Debug, Error)]
pub enum ExecutionError {
    #[error("failed to start isolated process: {0}")]
    Spawn(std::io::Error),
    #[error("output capture failed: {0}")]
    Capture(std::io::Error),
    #[error("process exposed no output stream")]
    NoOutput,
}

/// Runs one verification request as an isolated container against the
/// Ready archive image, capturing its stdout to a request-scoped log.
pub struct ExecutionRunner {
    runtime: String,
    image: String,
    logs_dir: PathBuf,
}

impl ExecutionRunner {
    pub fn new(runtime: &str, image: &str, logs_dir: &Path) -> Self {
        Self {
            runtime: runtime.to_string(),
            image: image.to_string(),
            logs_dir: logs_dir.to_path_buf(),
        }
    }

    pub fn log_path(&self, request_number: u64) -> PathBuf {
        self.logs_dir.join(format!("{}.log", request_number))
    }

    /// Resolves when the container's output stream ends. Exit codes are
    /// not interpreted; the verification program's contract is that the
    /// last line of output is the result.
    pub async fn run(
        &self,
        request_number: u64,
        data_storage_hash: &str,
        transcoding_options: &str,
    ) -> Result<ExecutionRecord, ExecutionError> {
        let log_path = self.log_path(request_number);

        let mut child = Command::new(&self.runtime)
            .arg("run")
            .arg("--rm")
            .arg("-e")
            .arg(format!("ARG0={}", data_storage_hash))
            .arg("-e")
            .arg(format!("ARG1={}", transcoding_options))
            .arg(&self.image)
            .stdin(Stdio::null())
            .stdout(Stdio::piped())
            .spawn()
            .map_err(ExecutionError::Spawn)?;

        let mut stdout = child.stdout.take().ok_or(ExecutionError::NoOutput)?;
        let mut log = tokio::fs::File::create(&log_path)
            .await
            .map_err(ExecutionError::Capture)?;

        tokio::io::copy(&mut stdout, &mut log)
            .await
            .map_err(ExecutionError::Capture)?;
        log.flush().await.map_err(ExecutionError::Capture)?;

        let _ = child.wait().await;

        Ok(ExecutionRecord {
            request_number,
            log_path,
        })
    }
}

#[cfg(test)]
#[cfg(unix)]
mod tests {
    use super::*;

    fn stub_runtime(dir: &Path, body: &str) -> String {
        use std::os::unix::fs::PermissionsExt;

        let path = dir.join("fake-runtime");
        std::fs::write(&path, format!("#!/bin/sh\n{}\n", body)).unwrap();
        std::fs::set_permissions(&path, std::fs::Permissions::from_mode(0o755)).unwrap();
        path.to_string_lossy().into_owned()
    }

    #[tokio::test]
    async fn captures_output_stream_to_request_log() {
        let dir = tempfile::tempdir().unwrap();
        let runtime = stub_runtime(dir.path(), "echo \"$@\"\necho verifying\necho done");

        let runner = ExecutionRunner::new(&runtime, "verification", dir.path());
        let record = runner.run(7, "QmXYZ", "P720p60fps16x9").await.unwrap();

        assert_eq!(record.request_number, 7);
        assert_eq!(record.log_path, dir.path().join("7.log"));

        let log = std::fs::read_to_string(&record.log_path).unwrap();
        assert!(log.contains("ARG0=QmXYZ"));
        assert!(log.contains("ARG1=P720p60fps16x9"));
        assert!(log.trim_end().ends_with("done"));
    }

    #[tokio::test]
    async fn missing_runtime_is_a_spawn_error() {
        let dir = tempfile::tempdir().unwrap();
        let runner = ExecutionRunner::new("/nonexistent/runtime", "verification", dir.path());

        let err = runner.run(0, "QmXYZ", "").await.unwrap_err();
        assert!(matches!(err, ExecutionError::Spawn(_)));
    }
}
