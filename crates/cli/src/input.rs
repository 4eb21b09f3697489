use anyhow::{Context as AnyhowContext, Result};
use sentinel_engine::InboundMessage;
use std::path::Path;
use tokio::io::{AsyncBufReadExt, AsyncRead, BufReader, Lines};

pub type MessageLines = Lines<BufReader<Box<dyn AsyncRead + Unpin + Send>>>;

/// Line reader over `path`, or stdin when absent.
pub async fn open(path: Option<&Path>) -> Result<MessageLines> {
    let reader: Box<dyn AsyncRead + Unpin + Send> = match path {
        Some(path) => Box::new(
            tokio::fs::File::open(path)
                .await
                .with_context(|| format!("Failed to open {}", path.display()))?,
        ),
        None => Box::new(tokio::io::stdin()),
    };
    Ok(BufReader::new(reader).lines())
}

/// Blank lines are skipped; malformed ones are logged and skipped.
pub fn parse_line(line_no: usize, line: &str) -> Option<InboundMessage> {
    let line = line.trim();
    if line.is_empty() {
        return None;
    }
    match serde_json::from_str(line) {
        Ok(message) => Some(message),
        Err(err) => {
            log::warn!("Skipping line {line_no}: {err}");
            None
        }
    }
}
