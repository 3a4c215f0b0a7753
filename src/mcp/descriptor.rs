use std::collections::HashMap;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};

/// Where a capability-server descriptor was declared.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "kebab-case")]
pub enum ServerScope {
    Global,
    Project { path: String },
    Plugin { source: String },
    Builtin,
}

impl ServerScope {
    pub fn as_display(&self) -> String {
        match self {
            ServerScope::Global => "global".to_string(),
            ServerScope::Project { path } => format!("project:{path}"),
            ServerScope::Plugin { source } => format!("plugin:{source}"),
            ServerScope::Builtin => "builtin".to_string(),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "kebab-case")]
pub enum ServerTransport {
    Stdio {
        command: String,
        #[serde(default)]
        args: Vec<String>,
        #[serde(default, skip_serializing_if = "HashMap::is_empty")]
        env: HashMap<String, String>,
    },
    Http {
        url: String,
        #[serde(default, skip_serializing_if = "HashMap::is_empty")]
        headers: HashMap<String, String>,
    },
}

impl ServerTransport {
    pub fn is_http(&self) -> bool {
        matches!(self, ServerTransport::Http { .. })
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum AuthRequirement {
    None,
    Bearer,
    OAuth,
}

impl Default for AuthRequirement {
    fn default() -> Self {
        AuthRequirement::None
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ServerDescriptor {
    pub name: String,
    pub scope: ServerScope,
    pub transport: ServerTransport,
    #[serde(default)]
    pub auth: AuthRequirement,
    /// Derived working copies are skipped by warmup.
    #[serde(default)]
    pub ephemeral: bool,
}

impl ServerDescriptor {
    pub fn http(name: impl Into<String>, url: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            scope: ServerScope::Global,
            transport: ServerTransport::Http {
                url: url.into(),
                headers: HashMap::new(),
            },
            auth: AuthRequirement::None,
            ephemeral: false,
        }
    }

    pub fn stdio(name: impl Into<String>, command: impl Into<String>, args: Vec<String>) -> Self {
        Self {
            name: name.into(),
            scope: ServerScope::Global,
            transport: ServerTransport::Stdio {
                command: command.into(),
                args,
                env: HashMap::new(),
            },
            auth: AuthRequirement::None,
            ephemeral: false,
        }
    }

    /// Readiness cache key.
    pub fn key(&self) -> ServerKey {
        ServerKey {
            scope: self.scope.clone(),
            name: self.name.to_ascii_lowercase(),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct ServerKey {
    pub scope: ServerScope,
    pub name: String,
}

/// External collaborator supplying merged/filtered descriptors. The
/// orchestrator consumes this; it never implements configuration
/// merging itself.
#[async_trait]
pub trait DescriptorStore: Send + Sync {
    async fn descriptors(&self) -> Vec<ServerDescriptor>;
}

/// External credential refresh service: returns a currently valid bearer
/// credential for a server, or none.
#[async_trait]
pub trait CredentialSource: Send + Sync {
    async fn credential_for(&self, server_name: &str) -> Option<String>;
}

/// Static descriptor list, used by tests and simple embedders.
#[derive(Debug, Default, Clone)]
pub struct StaticDescriptorStore {
    descriptors: Vec<ServerDescriptor>,
}

impl StaticDescriptorStore {
    pub fn new(descriptors: Vec<ServerDescriptor>) -> Self {
        Self { descriptors }
    }
}

#[async_trait]
impl DescriptorStore for StaticDescriptorStore {
    async fn descriptors(&self) -> Vec<ServerDescriptor> {
        self.descriptors.clone()
    }
}

/// Credential source with no credentials, for servers that declare
/// `auth = none` across the board.
#[derive(Debug, Default, Clone, Copy)]
pub struct NoCredentials;

#[async_trait]
impl CredentialSource for NoCredentials {
    async fn credential_for(&self, _server_name: &str) -> Option<String> {
        None
    }
}
