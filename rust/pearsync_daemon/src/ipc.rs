//! Daemon wire protocol: newline-delimited UTF-8 JSON over a Unix
//! socket. Each request gets exactly one response line; no pipelining.

use std::path::{Path, PathBuf};
use std::time::Duration;

use serde::{Deserialize, Serialize};
use tokio::io::{AsyncBufReadExt, AsyncWriteExt, BufReader};
use tokio::net::UnixStream;

/// Client-side request deadline.
pub const REQUEST_TIMEOUT: Duration = Duration::from_secs(5);

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "command", rename_all = "lowercase")]
pub enum Request {
    Status,
    Watch { workspace: PathBuf },
    Unwatch { workspace: PathBuf },
    List,
    Shutdown,
}

/// One watched workspace, as reported by `status`/`list`.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct WorkspaceReport {
    pub path: PathBuf,
    pub workspace_key: String,
    pub writable: bool,
    pub version: u64,
    pub files: u64,
    pub writers: u64,
    pub peers: u64,
}

/// One response line. Exactly one of `success`/`error` is set.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct Response {
    #[serde(skip_serializing_if = "Option::is_none")]
    pub success: Option<bool>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub note: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub workspaces: Option<Vec<WorkspaceReport>>,
}

impl Response {
    pub fn ok() -> Self {
        Self {
            success: Some(true),
            ..Self::default()
        }
    }

    pub fn ok_with_note(note: &str) -> Self {
        Self {
            success: Some(true),
            note: Some(note.to_string()),
            ..Self::default()
        }
    }

    pub fn ok_with_workspaces(workspaces: Vec<WorkspaceReport>) -> Self {
        Self {
            success: Some(true),
            workspaces: Some(workspaces),
            ..Self::default()
        }
    }

    pub fn err(message: impl Into<String>) -> Self {
        Self {
            error: Some(message.into()),
            ..Self::default()
        }
    }

    pub fn is_ok(&self) -> bool {
        self.success == Some(true)
    }
}

/// Send one request to a running daemon and await its response line.
pub async fn request(socket_path: &Path, request: &Request) -> std::io::Result<Response> {
    let work = async {
        let stream = UnixStream::connect(socket_path).await?;
        let (read_half, mut write_half) = stream.into_split();

        let mut line = serde_json::to_string(request)?;
        line.push('\n');
        write_half.write_all(line.as_bytes()).await?;
        write_half.flush().await?;

        let mut reader = BufReader::new(read_half);
        let mut response_line = String::new();
        reader.read_line(&mut response_line).await?;
        if response_line.is_empty() {
            return Err(std::io::Error::new(
                std::io::ErrorKind::UnexpectedEof,
                "daemon closed the connection without responding",
            ));
        }
        Ok(serde_json::from_str(&response_line)?)
    };

    tokio::time::timeout(REQUEST_TIMEOUT, work)
        .await
        .map_err(|_| {
            std::io::Error::new(std::io::ErrorKind::TimedOut, "daemon request timed out")
        })?
}

// ===========================================================================
// Tests
// ===========================================================================

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn request_wire_format_matches_protocol() {
        let json = serde_json::to_string(&Request::Watch {
            workspace: PathBuf::from("/home/me/docs"),
        })
        .unwrap();
        assert_eq!(json, r#"{"command":"watch","workspace":"/home/me/docs"}"#);

        let parsed: Request = serde_json::from_str(r#"{"command":"status"}"#).unwrap();
        assert!(matches!(parsed, Request::Status));
    }

    #[test]
    fn response_serialization_is_sparse() {
        let ok = serde_json::to_string(&Response::ok()).unwrap();
        assert_eq!(ok, r#"{"success":true}"#);

        let err = serde_json::to_string(&Response::err("nope")).unwrap();
        assert_eq!(err, r#"{"error":"nope"}"#);

        let noted = serde_json::to_string(&Response::ok_with_note("Already watching")).unwrap();
        assert_eq!(noted, r#"{"success":true,"note":"Already watching"}"#);
    }

    #[test]
    fn unknown_command_fails_to_parse() {
        assert!(serde_json::from_str::<Request>(r#"{"command":"explode"}"#).is_err());
        assert!(serde_json::from_str::<Request>("not json at all").is_err());
    }
}
