use std::path::Path;
use std::time::{Duration, Instant};

use tokio::io::{AsyncBufReadExt, BufReader};
use tokio::process::{Child, Command};
use tokio::task::JoinHandle;
use tokio::time::timeout as tokio_timeout;

use crate::error::ProcessError;

/// Status machine for [`EngineProcess`]:
/// `initialized -> running -> {stopped, crashed, failed}`. `crashed` iff the
/// process exited on its own; `stopped` iff we asked it to.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ProcessStatus {
    Initialized,
    Running,
    Stopped,
    Crashed,
    Failed,
}

/// Owns the lifetime of one engine subprocess: spawn, monitor, stop, and
/// drain its stdout/stderr.
pub struct EngineProcess {
    binary: String,
    args: Vec<String>,
    work_dir: Option<String>,
    child: Option<Child>,
    status: ProcessStatus,
    start_time: Option<Instant>,
    stdout_task: Option<JoinHandle<()>>,
    stderr_task: Option<JoinHandle<()>>,
}

impl EngineProcess {
    pub fn new(binary: impl Into<String>, args: Vec<String>, work_dir: Option<String>) -> Self {
        Self {
            binary: binary.into(),
            args,
            work_dir,
            child: None,
            status: ProcessStatus::Initialized,
            start_time: None,
            stdout_task: None,
            stderr_task: None,
        }
    }

    pub async fn start(&mut self) -> Result<(), ProcessError> {
        if self.child.is_some() {
            return Err(ProcessError::AlreadyRunning);
        }
        if !Path::new(&self.binary).exists() {
            return Err(ProcessError::NotFound(self.binary.clone()));
        }

        let mut cmd = Command::new(&self.binary);
        cmd.args(&self.args)
            .stdout(std::process::Stdio::piped())
            .stderr(std::process::Stdio::piped());
        if let Some(dir) = &self.work_dir {
            cmd.current_dir(dir);
        }

        let mut child = cmd.spawn()?;
        let pid = child.id();
        let stdout = child.stdout.take();
        let stderr = child.stderr.take();

        self.stdout_task = stdout.map(|s| {
            tokio::spawn(async move {
                let mut lines = BufReader::new(s).lines();
                while let Ok(Some(line)) = lines.next_line().await {
                    if !line.is_empty() {
                        tracing::info!(%pid, "[stdout] {}", line);
                    }
                }
            })
        });
        self.stderr_task = stderr.map(|s| {
            tokio::spawn(async move {
                let mut lines = BufReader::new(s).lines();
                while let Ok(Some(line)) = lines.next_line().await {
                    if !line.is_empty() {
                        tracing::warn!(%pid, "[stderr] {}", line);
                    }
                }
            })
        });

        self.child = Some(child);
        self.status = ProcessStatus::Running;
        self.start_time = Some(Instant::now());
        tracing::info!(binary = %self.binary, ?pid, "engine process started");
        Ok(())
    }

    /// Idempotent: a no-op on a non-running handle. Sends terminate, waits
    /// up to `timeout`, escalates to kill, and always cancels the
    /// stdout/stderr readers so subprocess cleanup never deadlocks on
    /// unread pipes.
    pub async fn stop(&mut self, timeout: Duration) {
        let Some(mut child) = self.child.take() else {
            return;
        };

        if let Some(status) = child.try_wait().ok().flatten() {
            tracing::debug!(?status, "process already exited before stop() was called");
        } else {
            #[cfg(unix)]
            {
                if let Some(pid) = child.id() {
                    unsafe { libc::kill(pid as i32, libc::SIGTERM) };
                }
            }
            #[cfg(not(unix))]
            {
                let _ = child.start_kill();
            }

            match tokio_timeout(timeout, child.wait()).await {
                Ok(_) => tracing::info!("engine process terminated gracefully"),
                Err(_) => {
                    tracing::warn!("engine process did not exit in time, killing");
                    let _ = child.start_kill();
                    let _ = child.wait().await;
                }
            }
        }

        if let Some(task) = self.stdout_task.take() {
            task.abort();
        }
        if let Some(task) = self.stderr_task.take() {
            task.abort();
        }

        self.status = ProcessStatus::Stopped;
        self.start_time = None;
    }

    pub fn is_running(&mut self) -> bool {
        let Some(child) = self.child.as_mut() else {
            return false;
        };
        match child.try_wait() {
            Ok(None) => true,
            Ok(Some(_)) => {
                if self.status == ProcessStatus::Running {
                    self.status = ProcessStatus::Crashed;
                }
                false
            }
            Err(_) => false,
        }
    }

    pub fn pid(&self) -> Option<u32> {
        self.child.as_ref().and_then(|c| c.id())
    }

    pub fn status(&self) -> ProcessStatus {
        self.status
    }

    pub fn uptime(&self) -> Option<Duration> {
        self.start_time.map(|t| t.elapsed())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn start_fails_on_missing_binary() {
        let mut p = EngineProcess::new("/no/such/binary-xyz", vec![], None);
        let err = p.start().await.unwrap_err();
        assert!(matches!(err, ProcessError::NotFound(_)));
    }

    #[tokio::test]
    async fn stop_on_never_started_is_noop() {
        let mut p = EngineProcess::new("/bin/true", vec![], None);
        p.stop(Duration::from_millis(50)).await;
        assert_eq!(p.status(), ProcessStatus::Initialized);
    }

    #[tokio::test]
    async fn start_twice_fails_already_running() {
        let mut p = EngineProcess::new("/bin/sleep", vec!["1".to_string()], None);
        if Path::new("/bin/sleep").exists() {
            p.start().await.unwrap();
            let err = p.start().await.unwrap_err();
            assert!(matches!(err, ProcessError::AlreadyRunning));
            p.stop(Duration::from_millis(200)).await;
        }
    }

    #[tokio::test]
    async fn lifecycle_runs_and_stops() {
        if !Path::new("/bin/sleep").exists() {
            return;
        }
        let mut p = EngineProcess::new("/bin/sleep", vec!["5".to_string()], None);
        p.start().await.unwrap();
        assert!(p.is_running());
        assert!(p.pid().is_some());
        p.stop(Duration::from_millis(200)).await;
        assert_eq!(p.status(), ProcessStatus::Stopped);
    }
}
