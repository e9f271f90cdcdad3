//! Plugin host boundary.
//!
//! A JSON-line protocol over stdin/stdout: the host writes one
//! `QueryRequest` per line; the engine streams back `{"row": ...}` and
//! `{"scopeError": ...}` lines followed by a `{"queryComplete": ...}`
//! terminator. Logging goes to a file, never stdout, which belongs to the
//! protocol.

use anyhow::{Context, Result};
use serde::Serialize;
use serde_json::json;
use tokio::io::{AsyncBufReadExt, AsyncWriteExt, BufReader, Stdout};

use crate::engine::{Engine, QueryOutput, QueryRequest};

/// Serve queries from the host until stdin closes.
pub async fn serve(engine: Engine) -> Result<()> {
    let stdin = BufReader::new(tokio::io::stdin());
    let mut lines = stdin.lines();
    let mut stdout = tokio::io::stdout();

    while let Some(line) = lines.next_line().await.context("Failed to read from host")? {
        let line = line.trim();
        if line.is_empty() {
            continue;
        }

        let request: QueryRequest = match serde_json::from_str(line) {
            Ok(request) => request,
            Err(err) => {
                write_line(
                    &mut stdout,
                    &json!({"queryError": {"message": format!("invalid query request: {err}")}}),
                )
                .await?;
                continue;
            },
        };

        let table = request.table.clone();
        let mut execution = match engine.execute(request).await {
            Ok(execution) => execution,
            Err(err) => {
                tracing::warn!("query against {} rejected: {}", table, err);
                write_line(
                    &mut stdout,
                    &json!({"queryError": {"message": err.to_string()}}),
                )
                .await?;
                continue;
            },
        };

        let query_id = execution.query_id;
        let mut rows: u64 = 0;
        let mut scope_errors: u64 = 0;

        while let Some(output) = execution.next().await {
            match &output {
                QueryOutput::Row(_) => rows += 1,
                QueryOutput::ScopeError(_) => scope_errors += 1,
            }
            if write_line(&mut stdout, &output).await.is_err() {
                // Host went away mid-stream; stop fetching on its behalf.
                execution.cancel();
                anyhow::bail!("host connection lost");
            }
        }

        write_line(
            &mut stdout,
            &json!({"queryComplete": {
                "queryId": query_id.to_string(),
                "rows": rows,
                "scopeErrors": scope_errors,
            }}),
        )
        .await?;
        tracing::info!(
            "query {}: streamed {} rows, {} scope errors",
            query_id,
            rows,
            scope_errors
        );
    }

    Ok(())
}

async fn write_line<T: Serialize>(stdout: &mut Stdout, value: &T) -> Result<()> {
    let line = serde_json::to_string(value)?;
    stdout.write_all(line.as_bytes()).await?;
    stdout.write_all(b"\n").await?;
    stdout.flush().await?;
    Ok(())
}
