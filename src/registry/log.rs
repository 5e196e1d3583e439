//! Append-only, newline-delimited JSON tool-call log, written by a single
//! task that drains an unbounded channel so logging is never on the hot
//! path of a `tools/call` dispatch.

use crate::types::ToolCallRecord;
use std::path::PathBuf;
use tokio::io::AsyncWriteExt;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;

/// A cheap, cloneable handle callers use to enqueue a record for logging.
#[derive(Clone)]
pub struct ToolCallLogger {
    sender: mpsc::UnboundedSender<ToolCallRecord>,
}

impl ToolCallLogger {
    /// Enqueue a record. Never blocks; if the writer task has shut down the
    /// record is silently dropped (the channel receiver end is gone), which
    /// is acceptable for a best-effort diagnostic log.
    pub fn log(&self, record: ToolCallRecord) {
        let _ = self.sender.send(record);
    }
}

/// Spawn the single writer task and return a logger handle plus its
/// `JoinHandle` (useful for tests and graceful shutdown).
pub fn spawn_tool_call_logger(path: PathBuf) -> (ToolCallLogger, JoinHandle<()>) {
    let (sender, mut receiver) = mpsc::unbounded_channel::<ToolCallRecord>();

    let handle = tokio::spawn(async move {
        if let Some(parent) = path.parent() {
            if let Err(err) = tokio::fs::create_dir_all(parent).await {
                tracing::warn!(error = %err, "failed to create tool-call log directory");
            }
        }

        let file = tokio::fs::OpenOptions::new().create(true).append(true).open(&path).await;
        let mut file = match file {
            Ok(file) => file,
            Err(err) => {
                tracing::error!(error = %err, path = %path.display(), "failed to open tool-call log; entries will be dropped");
                while receiver.recv().await.is_some() {}
                return;
            }
        };

        while let Some(record) = receiver.recv().await {
            match serde_json::to_string(&record) {
                Ok(mut line) => {
                    line.push('\n');
                    if let Err(err) = file.write_all(line.as_bytes()).await {
                        tracing::warn!(error = %err, "failed to append tool-call log entry");
                    }
                }
                Err(err) => tracing::warn!(error = %err, "failed to serialize tool-call record"),
            }
        }
    });

    (ToolCallLogger { sender }, handle)
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::Utc;

    #[tokio::test]
    async fn writes_one_ndjson_line_per_record() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("calls.ndjson");
        let (logger, handle) = spawn_tool_call_logger(path.clone());

        for i in 0..3 {
            logger.log(ToolCallRecord {
                timestamp: Utc::now(),
                tool_name: format!("calc__add_{i}"),
                original_name: "add".into(),
                service_name: "calc".into(),
                arguments: serde_json::json!({ "i": i }),
                success: true,
                duration_ms: 1,
                error: None,
                result_summary: None,
            });
        }

        drop(logger);
        let _ = handle.await;

        let content = tokio::fs::read_to_string(&path).await.unwrap();
        let lines: Vec<&str> = content.lines().collect();
        assert_eq!(lines.len(), 3);
        for line in lines {
            let parsed: serde_json::Value = serde_json::from_str(line).unwrap();
            assert!(parsed["toolName"].is_string());
        }
    }
}
