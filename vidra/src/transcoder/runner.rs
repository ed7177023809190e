//! Driving the external codec-copy tool.

use std::process::Stdio;
use std::time::Duration;

use dashmap::DashMap;
use process_utils::{kill_tree, spawn_process_waiter};
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use super::parser::{ProgressParser, ToolProgress};
use super::reader::RecordReader;
use crate::{Error, Result};

/// Windows `CREATE_NO_WINDOW`: tool invocations must not flash a console.
#[cfg(windows)]
const NO_WINDOW_FLAG: u32 = 0x0800_0000;

fn tool_command(binary: &str) -> tokio::process::Command {
    let mut cmd = tokio::process::Command::new(binary);
    #[cfg(windows)]
    {
        use std::os::windows::process::CommandExt;
        cmd.as_std_mut().creation_flags(NO_WINDOW_FLAG);
    }
    cmd
}

fn probe_command(binary: &str) -> std::process::Command {
    let mut cmd = std::process::Command::new(binary);
    #[cfg(windows)]
    {
        use std::os::windows::process::CommandExt;
        cmd.creation_flags(NO_WINDOW_FLAG);
    }
    cmd
}

struct RunningProcess {
    pid: Option<u32>,
    token: CancellationToken,
}

/// Runs the external tool and tracks every live invocation.
///
/// Invocations are keyed `taskId` or `taskId:subTaskId` so a task-level
/// cancel can reach all of its processes.
pub struct TranscoderRunner {
    binary: String,
    timeout: Duration,
    processes: DashMap<String, RunningProcess>,
}

impl TranscoderRunner {
    pub fn new(binary: impl Into<String>, timeout: Duration) -> Self {
        Self {
            binary: binary.into(),
            timeout,
            processes: DashMap::new(),
        }
    }

    /// First line of `<binary> -version`, or `None` when the tool is absent.
    pub fn detect_version(&self) -> Option<String> {
        probe_command(&self.binary)
            .arg("-version")
            .output()
            .ok()
            .and_then(|output| {
                String::from_utf8(output.stdout)
                    .ok()
                    .and_then(|s| s.lines().next().map(str::to_string))
            })
    }

    /// Run one invocation to completion, streaming parsed progress samples.
    ///
    /// Fails on spawn error, nonzero exit, wall-clock timeout, or
    /// cancellation; cancellation and timeout kill the whole process tree.
    pub async fn run<F>(
        &self,
        key: &str,
        args: Vec<String>,
        token: CancellationToken,
        on_progress: F,
    ) -> Result<()>
    where
        F: FnMut(ToolProgress),
    {
        debug!(key, binary = %self.binary, ?args, "Spawning transcoder");
        let mut child = tool_command(&self.binary)
            .args(&args)
            .env("LC_ALL", "C")
            .stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .spawn()
            .map_err(|e| Error::transcoder(format!("failed to spawn {}: {e}", self.binary)))?;

        let pid = child.id();
        let stdout = child.stdout.take();
        let stderr = child.stderr.take();

        self.processes.insert(
            key.to_string(),
            RunningProcess {
                pid,
                token: token.clone(),
            },
        );

        let result = self
            .drive(child, stdout, stderr, pid, &token, on_progress)
            .await;
        self.processes.remove(key);
        result
    }

    async fn drive<F>(
        &self,
        child: tokio::process::Child,
        stdout: Option<tokio::process::ChildStdout>,
        stderr: Option<tokio::process::ChildStderr>,
        pid: Option<u32>,
        token: &CancellationToken,
        mut on_progress: F,
    ) -> Result<()>
    where
        F: FnMut(ToolProgress),
    {
        // Merge stdout and stderr into one record stream; the tool writes
        // progress to stderr but helper noise can land on either.
        let (line_tx, mut line_rx) = mpsc::channel::<String>(64);
        if let Some(stdout) = stdout {
            let tx = line_tx.clone();
            tokio::spawn(async move {
                let mut reader = RecordReader::new(stdout);
                while let Ok(Some(record)) = reader.next_record().await {
                    if tx.send(record).await.is_err() {
                        break;
                    }
                }
            });
        }
        if let Some(stderr) = stderr {
            let tx = line_tx.clone();
            tokio::spawn(async move {
                let mut reader = RecordReader::new(stderr);
                while let Ok(Some(record)) = reader.next_record().await {
                    if tx.send(record).await.is_err() {
                        break;
                    }
                }
            });
        }
        drop(line_tx);

        let exit_rx = spawn_process_waiter(child, token.clone());

        let deadline = tokio::time::sleep(self.timeout);
        tokio::pin!(deadline);

        let mut parser = ProgressParser::new();
        let mut last_record: Option<String> = None;

        loop {
            tokio::select! {
                _ = &mut deadline => {
                    warn!(pid, "Transcoder exceeded its wall-clock budget, killing tree");
                    if let Some(pid) = pid {
                        kill_tree(pid);
                    }
                    return Err(Error::Timeout(format!(
                        "{} did not finish within {:?}",
                        self.binary, self.timeout
                    )));
                }
                record = line_rx.recv() => {
                    match record {
                        Some(record) => {
                            if let Some(sample) = parser.observe(&record) {
                                on_progress(sample);
                            }
                            last_record = Some(record);
                        }
                        None => break,
                    }
                }
            }
        }

        let exit_code = tokio::select! {
            _ = &mut deadline => {
                if let Some(pid) = pid {
                    kill_tree(pid);
                }
                return Err(Error::Timeout(format!(
                    "{} did not finish within {:?}",
                    self.binary, self.timeout
                )));
            }
            code = exit_rx => code.ok().flatten(),
        };

        if token.is_cancelled() {
            return Err(Error::Cancelled);
        }

        match exit_code {
            Some(0) => Ok(()),
            Some(code) => {
                let detail = last_record.unwrap_or_default();
                Err(Error::transcoder(format!(
                    "{} exited with code {code}: {detail}",
                    self.binary
                )))
            }
            None => Err(Error::Cancelled),
        }
    }

    /// Kill every live process belonging to a task, descendants included.
    ///
    /// Returns the number of invocations reached.
    pub fn kill_task(&self, task_id: &str) -> usize {
        let prefix = format!("{task_id}:");
        let mut reached = 0;
        for entry in self.processes.iter() {
            if entry.key() == task_id || entry.key().starts_with(&prefix) {
                let process = entry.value();
                process.token.cancel();
                if let Some(pid) = process.pid {
                    kill_tree(pid);
                }
                reached += 1;
            }
        }
        if reached > 0 {
            info!(task_id, processes = reached, "Killed transcoder processes");
        }
        reached
    }

    /// Number of currently tracked invocations, across all tasks.
    pub fn active_count(&self) -> usize {
        self.processes.len()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn runner(binary: &str) -> TranscoderRunner {
        TranscoderRunner::new(binary, Duration::from_secs(5))
    }

    #[test]
    fn version_detection_fails_for_missing_binary() {
        assert!(runner("definitely-not-a-real-binary").detect_version().is_none());
    }

    #[tokio::test]
    async fn spawn_failure_is_a_transcoder_error() {
        let runner = runner("definitely-not-a-real-binary");
        let result = runner
            .run("t1", vec![], CancellationToken::new(), |_| {})
            .await;
        assert!(matches!(result, Err(Error::Transcoder(_))));
        assert_eq!(runner.active_count(), 0);
    }

    #[cfg(unix)]
    #[tokio::test]
    async fn zero_exit_is_success() {
        let runner = runner("true");
        let result = runner
            .run("t1", vec![], CancellationToken::new(), |_| {})
            .await;
        assert!(result.is_ok());
    }

    #[cfg(unix)]
    #[tokio::test]
    async fn nonzero_exit_is_an_error() {
        let runner = runner("false");
        let result = runner
            .run("t1", vec![], CancellationToken::new(), |_| {})
            .await;
        assert!(matches!(result, Err(Error::Transcoder(_))));
    }

    #[cfg(unix)]
    #[tokio::test]
    async fn cancellation_kills_the_invocation() {
        let runner = std::sync::Arc::new(TranscoderRunner::new("sleep", Duration::from_secs(60)));
        let token = CancellationToken::new();

        let run = {
            let runner = std::sync::Arc::clone(&runner);
            let token = token.clone();
            tokio::spawn(async move {
                runner
                    .run("t1:video", vec!["30".to_string()], token, |_| {})
                    .await
            })
        };

        tokio::time::sleep(Duration::from_millis(200)).await;
        assert_eq!(runner.kill_task("t1"), 1);

        let result = tokio::time::timeout(Duration::from_secs(5), run)
            .await
            .expect("kill must end the run")
            .expect("no panic");
        assert!(matches!(result, Err(Error::Cancelled)));
        assert_eq!(runner.active_count(), 0);
    }
}
