//! JSON-RPC and SSE plumbing shared by the connectivity prober.
//!
//! Normalizes protocol differences between stdio and streamable-HTTP
//! servers so the prober can treat both as "send a request, get one
//! server message back".

use futures_util::StreamExt;
use memchr::memchr;
use rust_mcp_schema::schema_utils::{
    ClientMessage, FromMessage, MessageFromClient, RequestFromClient, ServerMessage,
};
use rust_mcp_schema::{
    ClientCapabilities, Implementation, InitializeRequestParams, InitializeResult,
    ListToolsResult, RequestId, RpcError, LATEST_PROTOCOL_VERSION,
};
use serde_json::Value;

/// JSON-RPC code used by servers to indicate unsupported list methods.
pub const METHOD_NOT_FOUND: i64 = -32601;

pub(crate) fn client_details() -> InitializeRequestParams {
    InitializeRequestParams {
        capabilities: ClientCapabilities::default(),
        client_info: Implementation {
            name: "palaver".to_string(),
            version: env!("CARGO_PKG_VERSION").to_string(),
            title: Some("Palaver MCP Client".to_string()),
            description: Some("Palaver capability-server probe".to_string()),
            icons: Vec::new(),
            website_url: Some("https://github.com/permacommons/palaver".to_string()),
        },
        meta: None,
        protocol_version: LATEST_PROTOCOL_VERSION.to_string(),
    }
}

pub(crate) fn encode_request(request: RequestFromClient, id: i64) -> Result<String, String> {
    let message = ClientMessage::from_message(
        MessageFromClient::RequestFromClient(request),
        Some(RequestId::Integer(id)),
    )
    .map_err(|err| err.to_string())?;
    serde_json::to_string(&message).map_err(|err| err.to_string())
}

pub(crate) fn parse_initialize_result(message: ServerMessage) -> Result<InitializeResult, String> {
    let value = parse_response_value(message)?;
    let result =
        serde_json::from_value::<InitializeResult>(value).map_err(|err| err.to_string())?;
    if result.protocol_version.trim().is_empty() {
        return Err("Unexpected initialize response.".to_string());
    }
    Ok(result)
}

pub(crate) fn parse_list_tools(message: ServerMessage) -> Result<ListToolsResult, String> {
    if is_method_not_found(&message) {
        return Ok(ListToolsResult {
            meta: None,
            next_cursor: None,
            tools: Vec::new(),
        });
    }
    let value = parse_response_value(message)?;
    serde_json::from_value::<ListToolsResult>(value).map_err(|err| err.to_string())
}

pub(crate) fn parse_response_value(message: ServerMessage) -> Result<Value, String> {
    match message {
        ServerMessage::Response(response) => {
            serde_json::to_value(&response.result).map_err(|err| err.to_string())
        }
        ServerMessage::Error(error) => Err(format_rpc_error(&error.error)),
        other => Err(format!("Unexpected MCP server message: {other:?}")),
    }
}

pub(crate) fn is_method_not_found(message: &ServerMessage) -> bool {
    matches!(
        message,
        ServerMessage::Error(error) if error.error.code == METHOD_NOT_FOUND
    )
}

pub(crate) fn format_rpc_error(error: &RpcError) -> String {
    format!("MCP error {}: {}", error.code, error.message)
}

pub(crate) fn is_event_stream_content_type(content_type: &str) -> bool {
    content_type
        .split(';')
        .next()
        .map(str::trim)
        .is_some_and(|value| value.eq_ignore_ascii_case("text/event-stream"))
}

pub(crate) fn sse_data_payload(line: &str) -> Option<&str> {
    line.strip_prefix("data:").map(str::trim)
}

/// Accumulates streamed bytes and yields complete, trimmed lines.
#[derive(Default)]
pub(crate) struct SseLineBuffer {
    buffer: Vec<u8>,
}

impl SseLineBuffer {
    pub(crate) fn push(&mut self, chunk: &[u8]) -> Vec<String> {
        self.buffer.extend_from_slice(chunk);
        self.drain_lines(false)
    }

    pub(crate) fn finish(&mut self) -> Vec<String> {
        self.drain_lines(true)
    }

    fn drain_lines(&mut self, flush: bool) -> Vec<String> {
        let mut lines = Vec::new();
        let mut search_index = 0;

        while let Some(relative_pos) = memchr(b'\n', &self.buffer[search_index..]) {
            let newline_index = search_index + relative_pos;
            let mut line_end = newline_index;
            if line_end > search_index && self.buffer[line_end - 1] == b'\r' {
                line_end -= 1;
            }

            if let Ok(text) = std::str::from_utf8(&self.buffer[search_index..line_end]) {
                let trimmed = text.trim();
                if !trimmed.is_empty() {
                    lines.push(trimmed.to_string());
                }
            }

            search_index = newline_index + 1;
        }

        if flush {
            if let Ok(text) = std::str::from_utf8(&self.buffer[search_index..]) {
                let trimmed = text.trim();
                if !trimmed.is_empty() {
                    lines.push(trimmed.to_string());
                }
            }
            self.buffer.clear();
        } else if search_index > 0 {
            self.buffer.drain(..search_index);
        }

        lines
    }
}

/// Reads an SSE body until the first response or error message.
pub(crate) async fn next_sse_server_message(
    response: reqwest::Response,
) -> Result<ServerMessage, String> {
    let mut stream = response.bytes_stream();
    let mut buffer = SseLineBuffer::default();

    while let Some(chunk) = stream.next().await {
        let chunk = chunk.map_err(|err| err.to_string())?;
        for line in buffer.push(&chunk) {
            if let Some(message) = decode_sse_line(&line)? {
                return Ok(message);
            }
        }
    }

    for line in buffer.finish() {
        if let Some(message) = decode_sse_line(&line)? {
            return Ok(message);
        }
    }

    Err("Empty event-stream response.".to_string())
}

fn decode_sse_line(line: &str) -> Result<Option<ServerMessage>, String> {
    let Some(payload) = sse_data_payload(line) else {
        return Ok(None);
    };
    if payload.is_empty() {
        return Ok(None);
    }

    let message =
        serde_json::from_str::<ServerMessage>(payload).map_err(|err| err.to_string())?;
    match message {
        ServerMessage::Response(_) | ServerMessage::Error(_) => Ok(Some(message)),
        _ => Ok(None),
    }
}
