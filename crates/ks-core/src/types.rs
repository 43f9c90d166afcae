//! Core domain types

use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use std::collections::BTreeMap;
use std::fmt;

use crate::error::GatewayError;

/// Maximum length of a DNS-1123 label (namespaces, services, containers,
/// label values)
const MAX_LABEL_LEN: usize = 63;

/// Hex digits of the hash appended to shortened names
const HASH_SUFFIX_LEN: usize = 8;

const SERVICE_SUFFIX: &str = "-service";

/// Port the SSH daemon listens on inside every provisioned container
pub const SSH_CONTAINER_PORT: u16 = 22;

/// Verified user identity, as handed out by an [`IdentityProvider`](crate::traits::IdentityProvider)
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct UserIdentity(String);

impl UserIdentity {
    /// Wrap a verified username
    pub fn new(username: impl Into<String>) -> Self {
        Self(username.into())
    }

    /// Get the raw username
    pub fn username(&self) -> &str {
        &self.0
    }

    /// Namespace name for this user.
    ///
    /// Lowercases the username, replaces every character that is not valid in
    /// a DNS-1123 label with `-`, trims leading/trailing dashes and truncates
    /// to 63 characters.
    pub fn namespace(&self) -> Result<String, GatewayError> {
        let mut name: String = self
            .0
            .to_lowercase()
            .chars()
            .map(|c| if c.is_ascii_alphanumeric() { c } else { '-' })
            .collect();
        name.truncate(MAX_LABEL_LEN);
        let name = name.trim_matches('-').to_string();

        if name.is_empty() {
            return Err(GatewayError::Invalid(format!(
                "username {:?} does not yield a valid namespace",
                self.0
            )));
        }
        Ok(name)
    }
}

impl fmt::Display for UserIdentity {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// A container image reference such as `flusinerd/ubuntussh:latest`
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct ImageRef(String);

impl ImageRef {
    /// Create a new image reference
    pub fn new(image: impl Into<String>) -> Self {
        Self(image.into())
    }

    /// The reference exactly as requested (used as the container image)
    pub fn as_str(&self) -> &str {
        &self.0
    }

    /// Friendly image name used for deterministic resource naming.
    ///
    /// Strips the digest and tag, then every character that is not a
    /// lowercase alphanumeric or `-`: `flusinerd/ubuntussh:latest` becomes
    /// `flusinerdubuntussh` and `docker.io/library/ubuntu` becomes
    /// `dockeriolibraryubuntu`.
    pub fn friendly_name(&self) -> String {
        let without_digest = self.0.split('@').next().unwrap_or_default();

        // A ':' is only a tag separator when it comes after the last '/',
        // otherwise it belongs to a registry host:port.
        let last_slash = without_digest.rfind('/');
        let without_tag = match without_digest.rfind(':') {
            Some(colon) if last_slash.map_or(true, |slash| colon > slash) => {
                &without_digest[..colon]
            }
            _ => without_digest,
        };

        let name: String = without_tag
            .to_lowercase()
            .chars()
            .filter(|c| c.is_ascii_alphanumeric() || *c == '-')
            .collect();
        name.trim_matches('-').to_string()
    }
}

impl fmt::Display for ImageRef {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl From<&str> for ImageRef {
    fn from(s: &str) -> Self {
        Self(s.to_string())
    }
}

/// Deterministic names for the resources backing one (user, image) pair
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ResourceNames {
    /// Namespace (sanitized username)
    pub namespace: String,
    /// Friendly image name
    pub app: String,
    /// Deployment name
    pub deployment: String,
    /// Service name
    pub service: String,
    /// Container name inside the pod template
    pub container: String,
}

impl ResourceNames {
    /// Derive all names for a user and image.
    ///
    /// Names that would exceed a DNS-1123 label are cut short and end in a
    /// hash of the full name, so the service, the container and the `app`
    /// label each stay within 63 characters.
    pub fn derive(user: &UserIdentity, image: &ImageRef) -> Result<Self, GatewayError> {
        let namespace = user.namespace()?;
        let friendly = image.friendly_name();
        if friendly.is_empty() {
            return Err(GatewayError::Invalid(format!(
                "image {:?} has no usable name",
                image.as_str()
            )));
        }

        let app = fit_label(&friendly, MAX_LABEL_LEN);
        let base = fit_label(
            &format!("{}-{}", namespace, friendly),
            MAX_LABEL_LEN - SERVICE_SUFFIX.len(),
        );

        Ok(Self {
            deployment: format!("{}-deployment", base),
            service: format!("{}{}", base, SERVICE_SUFFIX),
            container: base,
            namespace,
            app,
        })
    }

    /// Label set shared by the pod template and the service selector
    pub fn labels(&self) -> BTreeMap<String, String> {
        BTreeMap::from([
            ("app".to_string(), self.app.clone()),
            ("user".to_string(), self.namespace.clone()),
        ])
    }
}

/// Whether `name` is a DNS-1123 label: 1 to 63 lowercase alphanumerics or
/// `-`, starting and ending with an alphanumeric
pub fn is_dns_label(name: &str) -> bool {
    !name.is_empty()
        && name.len() <= MAX_LABEL_LEN
        && name
            .bytes()
            .all(|b| b.is_ascii_lowercase() || b.is_ascii_digit() || b == b'-')
        && !name.starts_with('-')
        && !name.ends_with('-')
}

/// Cut an ASCII name down to `max` characters, ending it in a hash of the
/// full name
fn fit_label(name: &str, max: usize) -> String {
    if name.len() <= max {
        return name.to_string();
    }
    let digest = hex::encode(Sha256::digest(name.as_bytes()));
    let mut short = name[..max - HASH_SUFFIX_LEN - 1]
        .trim_end_matches('-')
        .to_string();
    short.push('-');
    short.push_str(&digest[..HASH_SUFFIX_LEN]);
    short
}

/// A provisioned environment for one user and image
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Environment {
    /// Owning user
    pub owner: String,
    /// Requested image
    pub image: ImageRef,
    /// Namespace name
    pub namespace: String,
    /// Deployment name
    pub deployment: String,
    /// Service name
    pub service: String,
    /// Where the environment's SSH daemon can be reached
    pub endpoint: Endpoint,
}

/// Externally reachable endpoint of a provisioned environment
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Endpoint {
    /// Namespace of the service
    pub namespace: String,
    /// Service name
    pub service: String,
    /// Allocated node port
    pub node_port: u16,
    /// Host of a cluster node, when configured
    pub node_host: Option<String>,
}

impl Endpoint {
    /// Build an SSH target for this endpoint.
    ///
    /// Returns `None` when no node host is known.
    pub fn ssh_target(&self, username: impl Into<String>, auth: SshAuth) -> Option<SshTarget> {
        let host = self.node_host.clone()?;
        Some(SshTarget {
            host,
            port: self.node_port,
            username: username.into(),
            auth,
        })
    }
}

/// Where and how to open a remote shell
#[derive(Clone, Serialize, Deserialize)]
pub struct SshTarget {
    /// Host name or address
    pub host: String,
    /// SSH port
    #[serde(default = "default_ssh_port")]
    pub port: u16,
    /// Login user on the remote host
    pub username: String,
    /// Credentials
    pub auth: SshAuth,
}

fn default_ssh_port() -> u16 {
    SSH_CONTAINER_PORT
}

impl SshTarget {
    /// `host:port` string
    pub fn address(&self) -> String {
        format!("{}:{}", self.host, self.port)
    }
}

impl fmt::Debug for SshTarget {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("SshTarget")
            .field("host", &self.host)
            .field("port", &self.port)
            .field("username", &self.username)
            .finish_non_exhaustive()
    }
}

/// SSH credentials
#[derive(Clone, Serialize, Deserialize)]
#[serde(tag = "method", rename_all = "snake_case")]
pub enum SshAuth {
    /// Password authentication
    Password { password: String },
    /// Public key authentication with an OpenSSH/PEM encoded private key
    PrivateKey {
        key: String,
        passphrase: Option<String>,
    },
}

/// Identifier of a remote-shell connection
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct ConnectionId(pub u64);

impl fmt::Display for ConnectionId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "conn-{}", self.0)
    }
}

/// Identifier of a shell session
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct SessionId(pub u64);

impl fmt::Display for SessionId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "shell-{}", self.0)
    }
}

/// Transport-layer identifier of a client (one per WebSocket)
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct ClientId(String);

impl ClientId {
    /// Create a client ID
    pub fn new(id: impl Into<String>) -> Self {
        Self(id.into())
    }

    /// Get the raw ID string
    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for ClientId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl From<&str> for ClientId {
    fn from(s: &str) -> Self {
        Self(s.to_string())
    }
}

/// Serializable view of a connection record
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ConnectionInfo {
    pub id: ConnectionId,
    pub client_id: ClientId,
    /// `host:port` the connection was opened against
    pub address: String,
    pub is_open: bool,
}

/// Serializable view of a shell session record
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SessionInfo {
    pub id: SessionId,
    pub client_id: ClientId,
    /// Connection the shell was opened on
    pub connection_id: ConnectionId,
    pub is_open: bool,
}

/// Short description of a pod, for debugging
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PodSummary {
    pub name: String,
    pub phase: Option<String>,
}
