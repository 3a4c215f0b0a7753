use std::collections::HashMap;
use std::time::Duration;

use async_trait::async_trait;
use rust_mcp_schema::schema_utils::{
    ClientMessage, FromMessage, MessageFromClient, NotificationFromClient, RequestFromClient,
    ServerMessage,
};
use tokio::io::{AsyncBufReadExt, AsyncWriteExt, BufReader};
use tokio::process::Command;
use tracing::debug;

use crate::mcp::descriptor::{AuthRequirement, ServerDescriptor, ServerTransport};
use crate::mcp::wire;

const HTTP_PROBE_TIMEOUT_SECONDS: u64 = 10;
// Stdio servers may cold-start (package download, interpreter boot), so
// they get a longer deadline than remote HTTP endpoints.
const STDIO_PROBE_TIMEOUT_SECONDS: u64 = 30;
const HTTP_CONNECT_TIMEOUT_SECONDS: u64 = 5;
const JSON_CONTENT_TYPE: &str = "application/json";
const JSON_AND_SSE_ACCEPT: &str = "application/json, text/event-stream";

/// How a completed probe should be recorded.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ProbeClassification {
    /// At least one operation was discovered.
    Connected,
    /// The server wants credentials we do not currently hold.
    NeedsAuth,
    /// Zero operations and no auth signal; terminal.
    Failed,
    /// The transport deadline elapsed; transient.
    TimedOut,
}

impl ProbeClassification {
    pub fn is_transient(self) -> bool {
        matches!(self, ProbeClassification::TimedOut)
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ProbeOutcome {
    pub operations: Vec<String>,
    pub classification: ProbeClassification,
}

impl ProbeOutcome {
    fn empty(classification: ProbeClassification) -> Self {
        Self {
            operations: Vec::new(),
            classification,
        }
    }
}

/// Attempts to enumerate one server's operations. Implementations must
/// never propagate transport errors: every failure resolves to an empty
/// outcome with a classification.
#[async_trait]
pub trait Prober: Send + Sync {
    async fn probe(&self, descriptor: &ServerDescriptor, credential: Option<&str>)
        -> ProbeOutcome;
}

pub struct ConnectivityProber {
    http: reqwest::Client,
}

impl ConnectivityProber {
    pub fn new() -> Result<Self, String> {
        let http = reqwest::Client::builder()
            .connect_timeout(Duration::from_secs(HTTP_CONNECT_TIMEOUT_SECONDS))
            .timeout(Duration::from_secs(HTTP_PROBE_TIMEOUT_SECONDS))
            .build()
            .map_err(|err| format!("Failed to build HTTP client: {err}"))?;
        Ok(Self { http })
    }

    async fn attempt(
        &self,
        descriptor: &ServerDescriptor,
        credential: Option<&str>,
    ) -> Result<Vec<String>, String> {
        match &descriptor.transport {
            ServerTransport::Http { url, headers } => {
                self.probe_http(url, headers, credential).await
            }
            ServerTransport::Stdio { command, args, env } => {
                probe_stdio(command, args, env).await
            }
        }
    }

    async fn probe_http(
        &self,
        url: &str,
        headers: &HashMap<String, String>,
        credential: Option<&str>,
    ) -> Result<Vec<String>, String> {
        let initialize = wire::encode_request(
            RequestFromClient::InitializeRequest(wire::client_details()),
            0,
        )?;
        let (message, session_id) = self
            .post_message(url, headers, credential, None, initialize)
            .await?;
        wire::parse_initialize_result(message)?;

        let initialized = ClientMessage::from_message(
            MessageFromClient::NotificationFromClient(
                NotificationFromClient::InitializedNotification(None),
            ),
            None,
        )
        .map_err(|err| err.to_string())?;
        let payload = serde_json::to_string(&initialized).map_err(|err| err.to_string())?;
        // Notification responses carry no body worth parsing; errors still fail the probe.
        self.post_raw(url, headers, credential, session_id.as_deref(), payload)
            .await?;

        let list_request =
            wire::encode_request(RequestFromClient::ListToolsRequest(None), 1)?;
        let (message, _) = self
            .post_message(url, headers, credential, session_id.as_deref(), list_request)
            .await?;
        let list = wire::parse_list_tools(message)?;
        Ok(list.tools.into_iter().map(|tool| tool.name).collect())
    }

    async fn post_message(
        &self,
        url: &str,
        headers: &HashMap<String, String>,
        credential: Option<&str>,
        session_id: Option<&str>,
        payload: String,
    ) -> Result<(ServerMessage, Option<String>), String> {
        let response = self
            .post_raw(url, headers, credential, session_id, payload)
            .await?;

        let session_id = response
            .headers()
            .get("mcp-session-id")
            .and_then(|value| value.to_str().ok())
            .map(|value| value.to_string());
        let content_type = response
            .headers()
            .get(reqwest::header::CONTENT_TYPE)
            .and_then(|value| value.to_str().ok())
            .unwrap_or("")
            .to_string();

        let message = if wire::is_event_stream_content_type(&content_type) {
            wire::next_sse_server_message(response).await?
        } else {
            let body = response.bytes().await.map_err(|err| err.to_string())?;
            serde_json::from_slice::<ServerMessage>(&body).map_err(|err| err.to_string())?
        };
        Ok((message, session_id))
    }

    async fn post_raw(
        &self,
        url: &str,
        headers: &HashMap<String, String>,
        credential: Option<&str>,
        session_id: Option<&str>,
        payload: String,
    ) -> Result<reqwest::Response, String> {
        let mut request = self
            .http
            .post(url)
            .header("Content-Type", JSON_CONTENT_TYPE)
            .header("Accept", JSON_AND_SSE_ACCEPT)
            .body(payload);
        for (name, value) in headers {
            request = request.header(name, value);
        }
        if let Some(credential) = credential {
            request = request.header("Authorization", format!("Bearer {credential}"));
        }
        if let Some(session_id) = session_id {
            request = request.header("mcp-session-id", session_id);
        }

        let response = request.send().await.map_err(|err| err.to_string())?;
        if !response.status().is_success() {
            return Err(format!("HTTP error: {}", response.status()));
        }
        Ok(response)
    }

    async fn classify_empty(
        &self,
        descriptor: &ServerDescriptor,
        credential: Option<&str>,
    ) -> ProbeClassification {
        if let ServerTransport::Http { url, .. } = &descriptor.transport {
            if discover_authorization_endpoint(&self.http, url).await {
                return ProbeClassification::NeedsAuth;
            }
        }
        if descriptor.auth != AuthRequirement::None && credential.is_none() {
            return ProbeClassification::NeedsAuth;
        }
        ProbeClassification::Failed
    }
}

#[async_trait]
impl Prober for ConnectivityProber {
    async fn probe(
        &self,
        descriptor: &ServerDescriptor,
        credential: Option<&str>,
    ) -> ProbeOutcome {
        let deadline = match descriptor.transport {
            ServerTransport::Http { .. } => Duration::from_secs(HTTP_PROBE_TIMEOUT_SECONDS),
            ServerTransport::Stdio { .. } => Duration::from_secs(STDIO_PROBE_TIMEOUT_SECONDS),
        };

        let attempt = tokio::time::timeout(deadline, self.attempt(descriptor, credential)).await;
        match attempt {
            Ok(Ok(operations)) if !operations.is_empty() => ProbeOutcome {
                operations,
                classification: ProbeClassification::Connected,
            },
            Ok(Ok(_)) => ProbeOutcome::empty(self.classify_empty(descriptor, credential).await),
            Ok(Err(err)) => {
                debug!(server = %descriptor.name, error = %err, "Probe attempt failed");
                ProbeOutcome::empty(self.classify_empty(descriptor, credential).await)
            }
            Err(_) => {
                debug!(server = %descriptor.name, "Probe timed out");
                ProbeOutcome::empty(ProbeClassification::TimedOut)
            }
        }
    }
}

async fn probe_stdio(
    command: &str,
    args: &[String],
    env: &HashMap<String, String>,
) -> Result<Vec<String>, String> {
    debug!(command = %command, args = ?args, "Starting capability server for probe");
    let mut cmd = Command::new(command);
    cmd.args(args)
        .stdin(std::process::Stdio::piped())
        .stdout(std::process::Stdio::piped())
        .stderr(std::process::Stdio::null())
        .kill_on_drop(true);
    if !env.is_empty() {
        cmd.envs(env);
    }

    let mut child = cmd.spawn().map_err(|err| err.to_string())?;
    let mut stdin = child
        .stdin
        .take()
        .ok_or_else(|| "Unable to retrieve stdin.".to_string())?;
    let stdout = child
        .stdout
        .take()
        .ok_or_else(|| "Unable to retrieve stdout.".to_string())?;
    let mut reader = BufReader::new(stdout).lines();

    let initialize = wire::encode_request(
        RequestFromClient::InitializeRequest(wire::client_details()),
        0,
    )?;
    write_line(&mut stdin, &initialize).await?;
    let message = read_server_message(&mut reader).await?;
    wire::parse_initialize_result(message)?;

    let initialized = ClientMessage::from_message(
        MessageFromClient::NotificationFromClient(
            NotificationFromClient::InitializedNotification(None),
        ),
        None,
    )
    .map_err(|err| err.to_string())?;
    let payload = serde_json::to_string(&initialized).map_err(|err| err.to_string())?;
    write_line(&mut stdin, &payload).await?;

    let list_request = wire::encode_request(RequestFromClient::ListToolsRequest(None), 1)?;
    write_line(&mut stdin, &list_request).await?;
    let message = read_server_message(&mut reader).await?;
    let list = wire::parse_list_tools(message)?;

    let _ = child.kill().await;
    Ok(list.tools.into_iter().map(|tool| tool.name).collect())
}

async fn write_line(
    stdin: &mut tokio::process::ChildStdin,
    payload: &str,
) -> Result<(), String> {
    stdin
        .write_all(payload.as_bytes())
        .await
        .map_err(|err| err.to_string())?;
    stdin.write_all(b"\n").await.map_err(|err| err.to_string())?;
    stdin.flush().await.map_err(|err| err.to_string())
}

async fn read_server_message(
    reader: &mut tokio::io::Lines<BufReader<tokio::process::ChildStdout>>,
) -> Result<ServerMessage, String> {
    while let Some(line) = reader.next_line().await.map_err(|err| err.to_string())? {
        let trimmed = line.trim();
        if trimmed.is_empty() {
            continue;
        }
        let Ok(message) = serde_json::from_str::<ServerMessage>(trimmed) else {
            continue;
        };
        if matches!(
            message,
            ServerMessage::Response(_) | ServerMessage::Error(_)
        ) {
            return Ok(message);
        }
    }
    Err("Capability server closed its stdout.".to_string())
}

#[derive(Debug, Clone, serde::Deserialize)]
struct OAuthMetadata {
    #[serde(default)]
    authorization_endpoint: Option<String>,
    #[serde(default)]
    authorization_servers: Option<Vec<String>>,
}

/// Checks the server origin's public OAuth discovery endpoints for an
/// authorization endpoint, following one level of delegation to listed
/// authorization servers.
async fn discover_authorization_endpoint(client: &reqwest::Client, base_url: &str) -> bool {
    if !base_url.starts_with("http://") && !base_url.starts_with("https://") {
        return false;
    }
    let Ok(url) = reqwest::Url::parse(base_url) else {
        return false;
    };
    let Some(host) = url.host_str() else {
        return false;
    };
    let authority = match url.port() {
        Some(port) => format!("{host}:{port}"),
        None => host.to_string(),
    };
    let origin = format!("{}://{authority}", url.scheme());
    let candidates = [
        format!("{origin}/.well-known/oauth-authorization-server"),
        format!("{origin}/.well-known/openid-configuration"),
        format!("{origin}/.well-known/oauth-protected-resource"),
    ];

    for candidate in candidates {
        let Some(metadata) = fetch_oauth_metadata(client, &candidate).await else {
            continue;
        };
        if metadata.authorization_endpoint.is_some() {
            return true;
        }
        if let Some(servers) = metadata.authorization_servers.as_ref() {
            for issuer in servers {
                let issuer = issuer.trim_end_matches('/');
                let delegated = format!("{issuer}/.well-known/oauth-authorization-server");
                if let Some(metadata) = fetch_oauth_metadata(client, &delegated).await {
                    if metadata.authorization_endpoint.is_some() {
                        return true;
                    }
                }
            }
        }
    }

    false
}

async fn fetch_oauth_metadata(client: &reqwest::Client, url: &str) -> Option<OAuthMetadata> {
    let response = client.get(url).send().await.ok()?;
    if !response.status().is_success() {
        return None;
    }
    response.json::<OAuthMetadata>().await.ok()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn only_timeouts_are_transient() {
        assert!(ProbeClassification::TimedOut.is_transient());
        assert!(!ProbeClassification::Failed.is_transient());
        assert!(!ProbeClassification::NeedsAuth.is_transient());
        assert!(!ProbeClassification::Connected.is_transient());
    }

    #[tokio::test]
    async fn missing_executable_resolves_to_failed_not_panic() {
        let prober = ConnectivityProber::new().expect("prober");
        let descriptor = ServerDescriptor::stdio(
            "ghost",
            "/nonexistent/palaver-test-binary",
            Vec::new(),
        );

        let outcome = prober.probe(&descriptor, None).await;
        assert!(outcome.operations.is_empty());
        assert_eq!(outcome.classification, ProbeClassification::Failed);
    }

    #[tokio::test]
    async fn declared_auth_without_credential_classifies_needs_auth() {
        let prober = ConnectivityProber::new().expect("prober");
        let mut descriptor = ServerDescriptor::stdio(
            "ghost",
            "/nonexistent/palaver-test-binary",
            Vec::new(),
        );
        descriptor.auth = AuthRequirement::Bearer;

        let outcome = prober.probe(&descriptor, None).await;
        assert_eq!(outcome.classification, ProbeClassification::NeedsAuth);

        let outcome = prober.probe(&descriptor, Some("token")).await;
        assert_eq!(outcome.classification, ProbeClassification::Failed);
    }
}
