//! Startup blob generation.
//!
//! The blob is produced by the runtime's own build step from a small JSON
//! build-config document. [`BlobGenerator`] abstracts that step so the
//! pipeline can be driven by a different runtime or by a test double.

use crate::{Error, Result};
use serde::{Deserialize, Serialize};
use std::fs;
use std::io::Read;
use std::path::{Path, PathBuf};
use std::process::{Child, Command, ExitStatus, Stdio};
use std::sync::mpsc;
use std::thread;
use std::time::{Duration, Instant};

/// Default bound on the external build step.
pub const DEFAULT_TIMEOUT: Duration = Duration::from_secs(120);

/// Bytes of stdout/stderr kept per stream for diagnostics.
pub const OUTPUT_CAP: usize = 64 * 1024;

/// How long to wait for the output pipes to close once the child is gone.
const DRAIN_GRACE: Duration = Duration::from_secs(1);

/// Build-config document consumed by the runtime.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct BlobConfig {
    /// Script to embed.
    pub main: PathBuf,
    /// Where the blob must be written.
    pub output: PathBuf,
    #[serde(rename = "disableExperimentalSEAWarning")]
    pub disable_experimental_sea_warning: bool,
    pub use_snapshot: bool,
    pub use_code_cache: bool,
}

impl BlobConfig {
    /// Serialize the document to `path`.
    pub fn write(&self, path: &Path) -> Result<()> {
        fs::write(path, serde_json::to_string(self)?)?;
        Ok(())
    }
}

/// Produces the blob described by a [`BlobConfig`].
///
/// Implementations must leave the blob at `config.output` or return
/// [`Error::BlobGeneration`].
pub trait BlobGenerator {
    fn generate(&self, config_path: &Path, config: &BlobConfig) -> Result<()>;
}

/// Runs `<runtime> --experimental-sea-config <config>`.
#[derive(Debug, Clone)]
pub struct NodeBlobGenerator {
    runtime: PathBuf,
    timeout: Duration,
}

impl NodeBlobGenerator {
    pub fn new(runtime: impl Into<PathBuf>, timeout: Duration) -> Self {
        Self {
            runtime: runtime.into(),
            timeout,
        }
    }

    pub fn runtime(&self) -> &Path {
        &self.runtime
    }

    pub fn timeout(&self) -> Duration {
        self.timeout
    }
}

impl BlobGenerator for NodeBlobGenerator {
    fn generate(&self, config_path: &Path, config: &BlobConfig) -> Result<()> {
        let mut cmd = Command::new(&self.runtime);
        cmd.arg("--experimental-sea-config")
            .arg(config_path)
            .stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped());
        if let Some(dir) = config_path.parent() {
            cmd.current_dir(dir);
        }
        // Wrapper scripts may fork the real runtime; the group lets a timeout reach it.
        #[cfg(unix)]
        {
            use std::os::unix::process::CommandExt as _;
            cmd.process_group(0);
        }

        let mut child = cmd.spawn().map_err(|e| Error::BlobGeneration {
            message: format!("failed to start {}: {}", self.runtime.display(), e),
            stdout: String::new(),
            stderr: String::new(),
        })?;

        let stdout = child.stdout.take().map(drain);
        let stderr = child.stderr.take().map(drain);

        let waited = wait_with_timeout(&mut child, self.timeout);
        let grace = Instant::now() + DRAIN_GRACE;
        let stdout = stdout.map(|rx| collect(&rx, grace)).unwrap_or_default();
        let stderr = stderr.map(|rx| collect(&rx, grace)).unwrap_or_default();

        let failure = |message: String| Error::BlobGeneration {
            message,
            stdout: stdout.clone(),
            stderr: stderr.clone(),
        };

        let (status, timed_out) = waited?;
        if timed_out {
            return Err(failure(format!(
                "{} did not finish within {:?}",
                self.runtime.display(),
                self.timeout
            )));
        }
        if !status.success() {
            return Err(failure(format!(
                "{} --experimental-sea-config exited with {}",
                self.runtime.display(),
                status
            )));
        }
        if !config.output.is_file() {
            return Err(failure(format!(
                "no blob was written to {}",
                config.output.display()
            )));
        }

        Ok(())
    }
}

/// Read `reader` to EOF on a helper thread, keeping at most [`OUTPUT_CAP`] bytes.
fn drain(reader: impl Read + Send + 'static) -> mpsc::Receiver<String> {
    let (tx, rx) = mpsc::channel();
    thread::spawn(move || {
        let (buf, truncated) = read_to_end_capped(reader, OUTPUT_CAP).unwrap_or_default();
        let mut text = String::from_utf8_lossy(&buf).into_owned();
        if truncated {
            text.push_str("\n[output truncated]");
        }
        let _ = tx.send(text);
    });
    rx
}

/// Output drained so far, or nothing if the pipe is still held open at `deadline`.
fn collect(rx: &mpsc::Receiver<String>, deadline: Instant) -> String {
    rx.recv_timeout(deadline.saturating_duration_since(Instant::now()))
        .unwrap_or_default()
}

fn read_to_end_capped(mut reader: impl Read, cap: usize) -> std::io::Result<(Vec<u8>, bool)> {
    let mut buf = Vec::new();
    let mut tmp = [0u8; 8192];
    let mut truncated = false;

    loop {
        let n = reader.read(&mut tmp)?;
        if n == 0 {
            break;
        }
        if truncated {
            continue;
        }

        let remaining = cap.saturating_sub(buf.len());
        if n <= remaining {
            buf.extend_from_slice(&tmp[..n]);
        } else {
            buf.extend_from_slice(&tmp[..remaining]);
            truncated = true;
        }
    }

    Ok((buf, truncated))
}

/// Kill the child and everything in its process group.
fn kill_tree(child: &mut Child) {
    #[cfg(unix)]
    {
        if let Ok(pid) = i32::try_from(child.id()) {
            unsafe {
                let _ = libc::kill(-pid, libc::SIGKILL);
            }
        }
    }
    let _ = child.kill();
}

/// Poll the child until it exits or `timeout` elapses; kill it on timeout.
fn wait_with_timeout(child: &mut Child, timeout: Duration) -> Result<(ExitStatus, bool)> {
    let deadline = Instant::now().checked_add(timeout);

    loop {
        if let Some(status) = child.try_wait()? {
            return Ok((status, false));
        }
        if deadline.is_some_and(|d| Instant::now() >= d) {
            kill_tree(child);
            let status = child.wait()?;
            return Ok((status, true));
        }
        thread::sleep(Duration::from_millis(10));
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    fn config(dir: &Path) -> BlobConfig {
        BlobConfig {
            main: dir.join("input.js"),
            output: dir.join("sea.blob"),
            disable_experimental_sea_warning: true,
            use_snapshot: false,
            use_code_cache: true,
        }
    }

    #[test]
    fn test_config_field_names() {
        let dir = TempDir::new().unwrap();
        let value = serde_json::to_value(config(dir.path())).unwrap();
        let obj = value.as_object().unwrap();
        let mut keys: Vec<&str> = obj.keys().map(String::as_str).collect();
        keys.sort_unstable();
        assert_eq!(
            keys,
            [
                "disableExperimentalSEAWarning",
                "main",
                "output",
                "useCodeCache",
                "useSnapshot"
            ]
        );
        assert_eq!(obj["disableExperimentalSEAWarning"], true);
        assert_eq!(obj["useCodeCache"], true);
    }

    #[test]
    fn test_config_write() {
        let dir = TempDir::new().unwrap();
        let cfg = config(dir.path());
        let path = dir.path().join("config.json");
        cfg.write(&path).unwrap();
        let back: BlobConfig = serde_json::from_slice(&fs::read(&path).unwrap()).unwrap();
        assert_eq!(back, cfg);
    }

    #[test]
    fn test_missing_runtime() {
        let dir = TempDir::new().unwrap();
        let generator = NodeBlobGenerator::new(dir.path().join("no-such-runtime"), DEFAULT_TIMEOUT);
        let err = generator
            .generate(&dir.path().join("config.json"), &config(dir.path()))
            .unwrap_err();
        assert!(matches!(err, Error::BlobGeneration { .. }));
    }

    #[cfg(unix)]
    fn script(dir: &Path, body: &str) -> PathBuf {
        use std::os::unix::fs::PermissionsExt;

        let path = dir.join("fake-runtime");
        fs::write(&path, format!("#!/bin/sh\n{body}\n")).unwrap();
        fs::set_permissions(&path, fs::Permissions::from_mode(0o755)).unwrap();
        path
    }

    #[cfg(unix)]
    #[test]
    fn test_runtime_writes_blob() {
        let dir = TempDir::new().unwrap();
        let runtime = script(dir.path(), r#"printf blob > "$(dirname "$2")/sea.blob""#);
        let generator = NodeBlobGenerator::new(runtime, DEFAULT_TIMEOUT);
        let cfg = config(dir.path());
        generator.generate(&dir.path().join("config.json"), &cfg).unwrap();
        assert_eq!(fs::read(&cfg.output).unwrap(), b"blob");
    }

    #[cfg(unix)]
    #[test]
    fn test_failure_captures_output() {
        let dir = TempDir::new().unwrap();
        let runtime = script(dir.path(), "echo out; echo 'bad config' >&2; exit 3");
        let generator = NodeBlobGenerator::new(runtime, DEFAULT_TIMEOUT);
        match generator.generate(&dir.path().join("config.json"), &config(dir.path())) {
            Err(Error::BlobGeneration { stdout, stderr, .. }) => {
                assert_eq!(stdout.trim(), "out");
                assert_eq!(stderr.trim(), "bad config");
            }
            other => panic!("expected BlobGeneration, got {other:?}"),
        }
    }

    #[cfg(unix)]
    #[test]
    fn test_success_without_blob_is_an_error() {
        let dir = TempDir::new().unwrap();
        let runtime = script(dir.path(), "exit 0");
        let generator = NodeBlobGenerator::new(runtime, DEFAULT_TIMEOUT);
        assert!(matches!(
            generator.generate(&dir.path().join("config.json"), &config(dir.path())),
            Err(Error::BlobGeneration { .. })
        ));
    }

    #[cfg(unix)]
    #[test]
    fn test_timeout_kills_child() {
        let dir = TempDir::new().unwrap();
        let runtime = script(dir.path(), "exec sleep 30");
        let generator = NodeBlobGenerator::new(runtime, Duration::from_millis(200));

        let start = Instant::now();
        let err = generator
            .generate(&dir.path().join("config.json"), &config(dir.path()))
            .unwrap_err();
        assert!(start.elapsed() < Duration::from_secs(10));
        match err {
            Error::BlobGeneration { message, .. } => assert!(message.contains("did not finish")),
            other => panic!("expected BlobGeneration, got {other:?}"),
        }
    }

    #[cfg(unix)]
    #[test]
    fn test_timeout_kills_forked_runtime() {
        let dir = TempDir::new().unwrap();
        // No exec: the sleep is a grandchild that inherits the output pipes.
        let runtime = script(dir.path(), "echo starting; sleep 6; echo done");
        let generator = NodeBlobGenerator::new(runtime, Duration::from_millis(200));

        let start = Instant::now();
        let err = generator
            .generate(&dir.path().join("config.json"), &config(dir.path()))
            .unwrap_err();
        assert!(
            start.elapsed() < Duration::from_secs(3),
            "generate blocked for {:?}",
            start.elapsed()
        );
        match err {
            Error::BlobGeneration { message, .. } => assert!(message.contains("did not finish")),
            other => panic!("expected BlobGeneration, got {other:?}"),
        }
    }

    #[cfg(unix)]
    #[test]
    fn test_captured_output_is_capped() {
        let dir = TempDir::new().unwrap();
        let runtime = script(
            dir.path(),
            "head -c 200000 /dev/zero | tr '\\0' x; exit 1",
        );
        let generator = NodeBlobGenerator::new(runtime, DEFAULT_TIMEOUT);
        match generator.generate(&dir.path().join("config.json"), &config(dir.path())) {
            Err(Error::BlobGeneration { stdout, .. }) => {
                assert!(stdout.len() < OUTPUT_CAP + 64);
                assert!(stdout.starts_with("xxxx"));
                assert!(stdout.ends_with("[output truncated]"));
            }
            other => panic!("expected BlobGeneration, got {other:?}"),
        }
    }

    #[test]
    fn test_read_to_end_capped() {
        let (buf, truncated) = read_to_end_capped(&b"abcdef"[..], 4).unwrap();
        assert_eq!(buf, b"abcd");
        assert!(truncated);

        let (buf, truncated) = read_to_end_capped(&b"ab"[..], 4).unwrap();
        assert_eq!(buf, b"ab");
        assert!(!truncated);
    }
}
