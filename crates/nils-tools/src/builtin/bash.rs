// Copyright (c) 2024-2026 Martin Schröder <info@swedishembedded.com>
//
// SPDX-License-Identifier: Apache-2.0
use std::collections::HashMap;
use std::process::Stdio;
use std::sync::Arc;

use async_trait::async_trait;
use serde_json::{json, Map, Value};
use tokio::io::AsyncReadExt;
use tokio::process::Command;
use tokio::sync::Mutex;
use tokio_util::sync::CancellationToken;
use tracing::debug;

use nils_security::build_tool_env;

use crate::tool::{Tool, ToolCategory, ToolContext};

/// Observer for live output chunks. Kept as a capability even though the
/// WebSocket layer does not currently forward the chunks.
pub type ChunkCallback = Arc<dyn Fn(&str) + Send + Sync>;

pub struct BashTool {
    ctx: Arc<ToolContext>,
    on_chunk: Option<ChunkCallback>,
    /// Tail-truncation threshold in bytes
    output_limit: usize,
}

impl BashTool {
    pub fn new(ctx: Arc<ToolContext>) -> Self {
        Self {
            ctx,
            on_chunk: None,
            output_limit: 200_000,
        }
    }

    pub fn with_output_limit(mut self, limit: usize) -> Self {
        self.output_limit = limit.max(1024);
        self
    }

    pub fn with_chunk_callback(mut self, cb: ChunkCallback) -> Self {
        self.on_chunk = Some(cb);
        self
    }
}

#[async_trait]
impl Tool for BashTool {
    fn name(&self) -> &str {
        "bash"
    }

    fn description(&self) -> &str {
        "Run a shell command and return combined stdout + stderr. Destructive \
         commands are refused. Output larger than the cap is written to a \
         temp file and only the tail is returned. Prefer read/grep/find for \
         file inspection instead of cat/grep/find commands."
    }

    fn category(&self) -> ToolCategory {
        ToolCategory::Admin
    }

    fn parameters_schema(&self) -> Value {
        json!({
            "type": "object",
            "properties": {
                "command": {"type": "string", "description": "Shell command to execute"}
            },
            "required": ["command"],
            "additionalProperties": false
        })
    }

    async fn execute(
        &self,
        args: &Map<String, Value>,
        cancel: &CancellationToken,
    ) -> anyhow::Result<String> {
        let command = args["command"].as_str().unwrap_or_default();

        let decision = self.ctx.commands.check(command);
        if decision.blocked {
            anyhow::bail!("command blocked: {}", decision.reason);
        }

        debug!(cmd = %command, "bash tool");
        let env = build_tool_env(&self.ctx.allowed_env, &HashMap::new());

        let mut cmd = Command::new("bash");
        cmd.arg("-c")
            .arg(command)
            .env_clear()
            .envs(&env)
            .stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true);
        // Detach the child from any controlling terminal so it cannot write
        // escape sequences past our pipes.
        #[cfg(unix)]
        unsafe {
            cmd.pre_exec(|| {
                libc::setsid();
                Ok(())
            });
        }

        let mut child = cmd.spawn()?;
        let stdout = child.stdout.take();
        let stderr = child.stderr.take();

        // Both pipes drain concurrently into one buffer; interleaving
        // follows arrival order, same as a terminal.
        let buffer: Arc<Mutex<Vec<u8>>> = Arc::new(Mutex::new(Vec::new()));
        let mut readers = Vec::new();
        for pipe in [stdout.map(PipeReader::Out), stderr.map(PipeReader::Err)]
            .into_iter()
            .flatten()
        {
            let buffer = Arc::clone(&buffer);
            let on_chunk = self.on_chunk.clone();
            readers.push(tokio::spawn(async move {
                pipe.drain(buffer, on_chunk).await;
            }));
        }

        let status = tokio::select! {
            _ = cancel.cancelled() => {
                let _ = child.start_kill();
                anyhow::bail!("command cancelled");
            }
            status = child.wait() => status?,
        };
        for reader in readers {
            let _ = reader.await;
        }

        let combined = String::from_utf8_lossy(&buffer.lock().await).into_owned();
        let rendered = self.render_output(&combined)?;

        if status.success() {
            Ok(rendered)
        } else {
            let code = status.code().unwrap_or(-1);
            anyhow::bail!("command exited with status {code}:\n{rendered}")
        }
    }
}

impl BashTool {
    /// Tail-truncate oversized output: the full text goes to a unique temp
    /// file, the returned string keeps only the tail plus a pointer.
    fn render_output(&self, combined: &str) -> anyhow::Result<String> {
        if combined.len() <= self.output_limit {
            return Ok(combined.to_string());
        }

        let file = tempfile::Builder::new()
            .prefix("nils-bash-")
            .suffix(".out")
            .tempfile()?;
        std::fs::write(file.path(), combined)?;
        let path = file.into_temp_path().keep()?;

        let keep = self.output_limit / 2;
        let mut start = combined.len() - keep;
        while start < combined.len() && !combined.is_char_boundary(start) {
            start += 1;
        }
        Ok(format!(
            "[output truncated: showing tail]\nFull output: {}\n\n{}",
            path.display(),
            &combined[start..]
        ))
    }
}

enum PipeReader {
    Out(tokio::process::ChildStdout),
    Err(tokio::process::ChildStderr),
}

impl PipeReader {
    async fn drain(self, buffer: Arc<Mutex<Vec<u8>>>, on_chunk: Option<ChunkCallback>) {
        match self {
            PipeReader::Out(mut pipe) => Self::pump(&mut pipe, buffer, on_chunk).await,
            PipeReader::Err(mut pipe) => Self::pump(&mut pipe, buffer, on_chunk).await,
        }
    }

    async fn pump<R: AsyncReadExt + Unpin>(
        pipe: &mut R,
        buffer: Arc<Mutex<Vec<u8>>>,
        on_chunk: Option<ChunkCallback>,
    ) {
        let mut chunk = [0u8; 8192];
        loop {
            match pipe.read(&mut chunk).await {
                Ok(0) | Err(_) => break,
                Ok(n) => {
                    if let Some(cb) = &on_chunk {
                        cb(&String::from_utf8_lossy(&chunk[..n]));
                    }
                    buffer.lock().await.extend_from_slice(&chunk[..n]);
                }
            }
        }
    }
}

// ─── Unit tests ──────────────────────────────────────────────────────────────

#[cfg(test)]
mod tests {
    use serde_json::json;

    use crate::builtin::test_ctx;

    use super::*;

    fn args(cmd: &str) -> Map<String, Value> {
        json!({"command": cmd}).as_object().unwrap().clone()
    }

    #[tokio::test]
    async fn captures_stdout_and_stderr() {
        let tmp = tempfile::tempdir().unwrap();
        let t = BashTool::new(test_ctx(tmp.path()));
        let out = t
            .execute(&args("echo out && echo err >&2"), &CancellationToken::new())
            .await
            .unwrap();
        assert!(out.contains("out"));
        assert!(out.contains("err"));
    }

    #[tokio::test]
    async fn blocked_command_is_refused() {
        let tmp = tempfile::tempdir().unwrap();
        let t = BashTool::new(test_ctx(tmp.path()));
        let err = t
            .execute(&args("sudo reboot"), &CancellationToken::new())
            .await
            .unwrap_err();
        assert!(err.to_string().contains("command blocked"));
    }

    #[tokio::test]
    async fn nonzero_exit_surfaces_output_in_error() {
        let tmp = tempfile::tempdir().unwrap();
        let t = BashTool::new(test_ctx(tmp.path()));
        let err = t
            .execute(&args("echo broken >&2; exit 3"), &CancellationToken::new())
            .await
            .unwrap_err();
        let msg = err.to_string();
        assert!(msg.contains("status 3"));
        assert!(msg.contains("broken"));
    }

    #[tokio::test]
    async fn env_is_filtered_to_allowlist() {
        std::env::set_var("NILS_BASH_SECRET", "leak");
        let tmp = tempfile::tempdir().unwrap();
        let t = BashTool::new(test_ctx(tmp.path()));
        let out = t
            .execute(
                &args("echo secret=${NILS_BASH_SECRET:-unset} home=${HOME:-unset}"),
                &CancellationToken::new(),
            )
            .await
            .unwrap();
        assert!(out.contains("secret=unset"), "{out}");
        assert!(!out.contains("home=unset"), "{out}");
    }

    #[tokio::test]
    async fn oversized_output_keeps_tail_and_temp_file() {
        let tmp = tempfile::tempdir().unwrap();
        let t = BashTool::new(test_ctx(tmp.path())).with_output_limit(2048);
        let out = t
            .execute(
                &args("for i in $(seq 1 500); do echo line-$i; done"),
                &CancellationToken::new(),
            )
            .await
            .unwrap();
        assert!(out.starts_with("[output truncated: showing tail]"));
        assert!(out.contains("line-500"), "tail must include the end");
        assert!(!out.contains("line-1\n"), "head must be dropped");

        let path = out
            .lines()
            .find_map(|l| l.strip_prefix("Full output: "))
            .unwrap();
        let full = std::fs::read_to_string(path).unwrap();
        assert!(full.contains("line-1\n"));
        let _ = std::fs::remove_file(path);
    }

    #[tokio::test]
    async fn cancellation_kills_the_child() {
        let tmp = tempfile::tempdir().unwrap();
        let t = BashTool::new(test_ctx(tmp.path()));
        let cancel = CancellationToken::new();
        let cancel2 = cancel.clone();
        tokio::spawn(async move {
            tokio::time::sleep(std::time::Duration::from_millis(50)).await;
            cancel2.cancel();
        });
        let started = std::time::Instant::now();
        let err = t.execute(&args("sleep 30"), &cancel).await.unwrap_err();
        assert!(err.to_string().contains("cancelled"));
        assert!(started.elapsed() < std::time::Duration::from_secs(5));
    }

    #[tokio::test]
    async fn chunk_callback_sees_streamed_output() {
        let tmp = tempfile::tempdir().unwrap();
        let seen = Arc::new(std::sync::Mutex::new(String::new()));
        let sink = Arc::clone(&seen);
        let t = BashTool::new(test_ctx(tmp.path())).with_chunk_callback(Arc::new(move |chunk| {
            sink.lock().unwrap().push_str(chunk);
        }));
        t.execute(&args("echo streamed"), &CancellationToken::new())
            .await
            .unwrap();
        assert!(seen.lock().unwrap().contains("streamed"));
    }
}
