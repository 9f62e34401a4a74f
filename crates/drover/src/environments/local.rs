use std::collections::HashMap;
use std::io::Read;
use std::process::{Command, Stdio};
use std::thread;
use std::time::{Duration, Instant};

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use serde_json::{json, Map, Value};
use tracing::{debug, warn};
use wait_timeout::ChildExt;

use super::environment::{Environment, EnvironmentError, ExecutionOutput};

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct LocalEnvironmentConfig {
    /// Working directory for commands; empty inherits the process cwd.
    pub cwd: String,
    /// Extra environment variables layered over the inherited ones.
    pub env: HashMap<String, String>,
    /// Per-action deadline in seconds.
    pub timeout: u64,
    /// Characters kept from the start of long output.
    pub head_chars: usize,
    /// Characters kept from the end of long output.
    pub tail_chars: usize,
}

impl Default for LocalEnvironmentConfig {
    fn default() -> Self {
        LocalEnvironmentConfig {
            cwd: String::new(),
            env: HashMap::new(),
            timeout: 30,
            head_chars: 5000,
            tail_chars: 5000,
        }
    }
}

/// Executes bash commands directly on the local machine.
pub struct LocalEnvironment {
    config: LocalEnvironmentConfig,
}

impl LocalEnvironment {
    pub fn new(config: LocalEnvironmentConfig) -> Self {
        Self { config }
    }
}

impl Default for LocalEnvironment {
    fn default() -> Self {
        Self::new(LocalEnvironmentConfig::default())
    }
}

#[async_trait]
impl Environment for LocalEnvironment {
    async fn execute(&self, command: &str) -> Result<ExecutionOutput, EnvironmentError> {
        let config = self.config.clone();
        let command = command.to_string();
        // The blocking wait/kill dance lives on the blocking pool; the
        // step loop awaits it to completion, so execution stays strictly
        // sequential per hierarchy.
        tokio::task::spawn_blocking(move || run_local(&command, &config))
            .await
            .map_err(|e| EnvironmentError::Launch(e.to_string()))?
    }

    fn template_vars(&self) -> Map<String, Value> {
        let mut vars = Map::new();
        let cwd = if self.config.cwd.is_empty() {
            std::env::current_dir()
                .map(|p| p.display().to_string())
                .unwrap_or_default()
        } else {
            self.config.cwd.clone()
        };
        vars.insert("cwd".to_string(), json!(cwd));
        vars.insert("timeout".to_string(), json!(self.config.timeout));
        vars
    }
}

fn run_local(
    command: &str,
    config: &LocalEnvironmentConfig,
) -> Result<ExecutionOutput, EnvironmentError> {
    let started = Instant::now();

    let mut cmd = Command::new("bash");
    cmd.arg("-c").arg(command);
    if !config.cwd.is_empty() {
        cmd.current_dir(&config.cwd);
    }
    cmd.envs(&config.env);
    cmd.stdin(Stdio::null())
        .stdout(Stdio::piped())
        .stderr(Stdio::piped());

    debug!(command, "executing action");
    let mut child = cmd
        .spawn()
        .map_err(|e| EnvironmentError::Launch(e.to_string()))?;

    // Drain both pipes from threads so a chatty command cannot deadlock
    // against a full pipe buffer while we wait on it.
    let stdout = child
        .stdout
        .take()
        .ok_or_else(|| EnvironmentError::Launch("stdout was not piped".to_string()))?;
    let stderr = child
        .stderr
        .take()
        .ok_or_else(|| EnvironmentError::Launch("stderr was not piped".to_string()))?;
    let stdout_handle = thread::spawn(move || read_stream(stdout));
    let stderr_handle = thread::spawn(move || read_stream(stderr));

    let deadline = Duration::from_secs(config.timeout);
    let (status, timed_out) = match child
        .wait_timeout(deadline)
        .map_err(|e| EnvironmentError::Launch(e.to_string()))?
    {
        Some(status) => (Some(status), false),
        None => {
            warn!(timeout_secs = config.timeout, "command timed out, killing");
            let _ = child.kill();
            let _ = child.wait();
            (None, true)
        }
    };

    let mut combined = stdout_handle.join().unwrap_or_default();
    combined.push_str(&stderr_handle.join().unwrap_or_default());
    let (output, elided_chars) = truncate_output(&combined, config.head_chars, config.tail_chars);

    if timed_out {
        return Err(EnvironmentError::Timeout {
            timeout_secs: config.timeout,
            partial_output: output,
        });
    }

    let returncode = status.and_then(|s| s.code()).unwrap_or(-1);
    debug!(returncode, elided_chars, "action finished");
    Ok(ExecutionOutput {
        output,
        returncode,
        duration_ms: started.elapsed().as_millis() as u64,
        elided_chars,
    })
}

fn read_stream<R: Read>(mut reader: R) -> String {
    let mut buf = Vec::new();
    let _ = reader.read_to_end(&mut buf);
    String::from_utf8_lossy(&buf).into_owned()
}

/// Keep the head and tail of long output, splicing in an elision marker
/// with the removed character count so the model can ask for a narrower
/// follow-up instead of silently losing the middle.
fn truncate_output(output: &str, head_chars: usize, tail_chars: usize) -> (String, usize) {
    let total = output.chars().count();
    if total <= head_chars + tail_chars {
        return (output.to_string(), 0);
    }
    let elided = total - head_chars - tail_chars;
    let head: String = output.chars().take(head_chars).collect();
    let tail: String = output
        .chars()
        .skip(total - tail_chars)
        .collect();
    (
        format!("{head}\n<{elided} characters elided>\n{tail}"),
        elided,
    )
}
