//! WebSocket wire protocol.
//!
//! Connect URLs carry a query string identifying the client's target and
//! the engine version it was compiled against. After the handshake, all
//! frames are JSON text: one client→server variant and `StatusChanged`
//! pushes in the other direction.

use percent_encoding::percent_decode_str;
use serde::{Deserialize, Serialize};

use crate::project::CompilationMode;
use crate::ws::server::WsData;

/// Version token compared against the client's `elmWatchVersion`.
pub const VERSION: &str = env!("CARGO_PKG_VERSION");

// ============================================================================
// Messages
// ============================================================================

/// Client → server frames.
#[derive(Debug, Deserialize, PartialEq, Eq)]
#[serde(tag = "tag")]
pub enum ClientMessage {
    ChangeCompilationMode {
        #[serde(rename = "compilationMode")]
        compilation_mode: CompilationMode,
    },
}

/// Server → client frames.
#[derive(Debug, Serialize)]
#[serde(tag = "tag")]
pub enum ServerMessage {
    StatusChanged { status: ClientStatus },
}

/// What the browser overlay shows.
#[derive(Debug, Clone, Serialize)]
#[serde(tag = "tag")]
pub enum ClientStatus {
    Busy,
    SuccessfullyCompiled,
    CompileError,
    ClientError { message: String },
}

impl ServerMessage {
    pub fn to_json(&self) -> String {
        serde_json::to_string(self)
            .unwrap_or_else(|_| r#"{"tag":"StatusChanged","status":{"tag":"Busy"}}"#.to_string())
    }
}

/// Why an inbound frame could not be handled.
#[derive(Debug, PartialEq, Eq)]
pub enum ClientMessageError {
    /// Binary frames are not part of the protocol.
    UnsupportedDataType,
    DecodeError(String),
}

/// Parse one inbound frame.
pub fn parse_client_message(data: &WsData) -> Result<ClientMessage, ClientMessageError> {
    match data {
        WsData::Binary(_) => Err(ClientMessageError::UnsupportedDataType),
        WsData::Text(text) => {
            serde_json::from_str(text).map_err(|e| ClientMessageError::DecodeError(e.to_string()))
        }
    }
}

// ============================================================================
// Connect URL
// ============================================================================

/// Decoded connect query.
#[derive(Debug, PartialEq, Eq)]
pub struct ConnectParams {
    pub elm_watch_version: String,
    /// Original output path of the target the client is attached to.
    pub output: String,
    /// Timestamp baked into the artifact the client currently runs.
    pub compiled_timestamp: u64,
}

/// Everything that can go wrong between handshake and a valid target.
#[derive(Debug, PartialEq, Eq)]
pub enum ConnectError {
    BadUrl { url: String },
    ParamsDecodeError { error: String, query: String },
    WrongVersion { client: String },
    OutputNotFound { output: String, enabled: Vec<String>, disabled: Vec<String> },
    OutputDisabled { output: String, enabled: Vec<String> },
}

impl ConnectError {
    /// Human text sent to the client as `ClientError`.
    pub fn message(&self) -> String {
        match self {
            Self::BadUrl { url } => {
                format!("The connect URL must look like /?<query>, but I got: {url}")
            }
            Self::ParamsDecodeError { error, query } => {
                format!("Failed to decode the connect query {query:?}: {error}")
            }
            Self::WrongVersion { client } => format!(
                "The compiled JavaScript was produced by elm-watch {client}, \
                 but the server is elm-watch {VERSION}. Reload the page!",
            ),
            Self::OutputNotFound { output, enabled, disabled } => format!(
                "The output {output:?} does not exist in elm-watch.json.\n\
                 Enabled targets: {enabled:?}\nDisabled targets: {disabled:?}",
            ),
            Self::OutputDisabled { output, enabled } => format!(
                "The output {output:?} exists in elm-watch.json but is not enabled \
                 for this run.\nEnabled targets: {enabled:?}",
            ),
        }
    }
}

/// Parse the connect URL. Target existence is checked by the caller,
/// which owns the project.
pub fn parse_connect_url(url: &str) -> Result<ConnectParams, ConnectError> {
    let Some(query) = url.strip_prefix("/?") else {
        return Err(ConnectError::BadUrl { url: url.to_string() });
    };

    let mut elm_watch_version = None;
    let mut output = None;
    let mut compiled_timestamp = None;

    for pair in query.split('&').filter(|p| !p.is_empty()) {
        let (key, value) = pair.split_once('=').unwrap_or((pair, ""));
        let value = percent_decode_str(value)
            .decode_utf8()
            .map_err(|e| ConnectError::ParamsDecodeError {
                error: e.to_string(),
                query: query.to_string(),
            })?
            .into_owned();
        match key {
            "elmWatchVersion" => elm_watch_version = Some(value),
            "output" => output = Some(value),
            "compiledTimestamp" => {
                let parsed = value.parse::<u64>().map_err(|e| ConnectError::ParamsDecodeError {
                    error: format!("compiledTimestamp: {e}"),
                    query: query.to_string(),
                })?;
                compiled_timestamp = Some(parsed);
            }
            _ => {}
        }
    }

    let missing = |field: &str| ConnectError::ParamsDecodeError {
        error: format!("missing {field}"),
        query: query.to_string(),
    };
    let params = ConnectParams {
        elm_watch_version: elm_watch_version.ok_or_else(|| missing("elmWatchVersion"))?,
        output: output.ok_or_else(|| missing("output"))?,
        compiled_timestamp: compiled_timestamp.ok_or_else(|| missing("compiledTimestamp"))?,
    };

    if params.elm_watch_version != VERSION {
        return Err(ConnectError::WrongVersion { client: params.elm_watch_version });
    }
    Ok(params)
}

// ============================================================================
// Tests
// ============================================================================

#[cfg(test)]
mod tests {
    use super::*;

    fn url(version: &str) -> String {
        format!("/?elmWatchVersion={version}&output=build%2Fmain.js&compiledTimestamp=123")
    }

    #[test]
    fn test_parse_valid_url() {
        let params = parse_connect_url(&url(VERSION)).unwrap();
        assert_eq!(params.output, "build/main.js");
        assert_eq!(params.compiled_timestamp, 123);
    }

    #[test]
    fn test_bad_url_prefix() {
        assert!(matches!(
            parse_connect_url("/websocket?output=x"),
            Err(ConnectError::BadUrl { .. })
        ));
    }

    #[test]
    fn test_missing_param() {
        let result = parse_connect_url("/?output=x&compiledTimestamp=0");
        assert!(matches!(result, Err(ConnectError::ParamsDecodeError { .. })));
    }

    #[test]
    fn test_bad_timestamp() {
        let result =
            parse_connect_url("/?elmWatchVersion=1&output=x&compiledTimestamp=later");
        assert!(matches!(result, Err(ConnectError::ParamsDecodeError { .. })));
    }

    #[test]
    fn test_wrong_version() {
        match parse_connect_url(&url("bogus")) {
            Err(ConnectError::WrongVersion { client }) => assert_eq!(client, "bogus"),
            other => panic!("expected WrongVersion, got {other:?}"),
        }
    }

    #[test]
    fn test_client_message_decode() {
        let msg = parse_client_message(&WsData::Text(
            r#"{"tag":"ChangeCompilationMode","compilationMode":"debug"}"#.to_string(),
        ))
        .unwrap();
        assert_eq!(
            msg,
            ClientMessage::ChangeCompilationMode {
                compilation_mode: CompilationMode::Debug
            }
        );
    }

    #[test]
    fn test_binary_frame_unsupported() {
        assert_eq!(
            parse_client_message(&WsData::Binary(vec![1, 2, 3])),
            Err(ClientMessageError::UnsupportedDataType)
        );
    }

    #[test]
    fn test_garbage_text_is_decode_error() {
        assert!(matches!(
            parse_client_message(&WsData::Text("{\"tag\":\"Nope\"}".to_string())),
            Err(ClientMessageError::DecodeError(_))
        ));
    }

    #[test]
    fn test_server_message_shape() {
        let json = ServerMessage::StatusChanged { status: ClientStatus::SuccessfullyCompiled }
            .to_json();
        assert!(json.contains(r#""tag":"StatusChanged""#));
        assert!(json.contains(r#""tag":"SuccessfullyCompiled""#));
    }
}
