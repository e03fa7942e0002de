//! Stdio transport: one JSON tool request per line on stdin, one JSON
//! envelope per line on stdout. Used when the server runs embedded under
//! an agent host instead of behind HTTP.

use std::sync::Arc;

use anyhow::Result;
use serde_json::{json, Value};
use tokio::io::{AsyncBufReadExt, AsyncWriteExt, BufReader};
use tracing::info;

use protocol::dispatcher::dispatch_value;
use protocol::ToolDispatcher;

/// Serve tool calls over stdin/stdout until EOF.
pub async fn run_stdio(dispatcher: Arc<ToolDispatcher>) -> Result<()> {
    info!("Serving tool calls over stdio");
    let stdin = BufReader::new(tokio::io::stdin());
    let mut lines = stdin.lines();
    let mut stdout = tokio::io::stdout();

    while let Some(line) = lines.next_line().await? {
        let line = line.trim();
        if line.is_empty() {
            continue;
        }
        let response = match serde_json::from_str::<Value>(line) {
            Ok(raw) => dispatch_value(&dispatcher, raw).await,
            Err(e) => json!({
                "success": false,
                "error": {
                    "kind": "business_logic",
                    "message": format!("Request line is not valid JSON: {e}"),
                    "recoverable": false,
                },
            }),
        };
        let serialized = serde_json::to_string(&response)?;
        stdout.write_all(serialized.as_bytes()).await?;
        stdout.write_all(b"\n").await?;
        stdout.flush().await?;
    }

    info!("Stdin closed; stdio transport exiting");
    Ok(())
}
