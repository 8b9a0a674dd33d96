/// API Response types

use hostlink_core::credentials::CredentialSummary;
use hostlink_core::{HandoffSummary, IssuerStats, SessionInfo, SessionStats};
use serde::{Deserialize, Serialize};
use std::collections::BTreeSet;
use std::net::SocketAddr;

/// Policy snapshot response
#[derive(Debug, Serialize)]
pub struct PolicyResponse {
    /// Snapshot version
    pub version: u64,
    /// Shared egress, if configured
    pub egress: Option<SocketAddr>,
    /// Per-identity rules
    pub identities: Vec<IdentityPolicy>,
}

/// Policy for one identity
#[derive(Debug, Serialize)]
pub struct IdentityPolicy {
    pub identity: String,
    /// Outbound rules, rendered as TOML-style inline tables
    pub outbound: Vec<serde_json::Value>,
    /// Inbound rules
    pub inbound_from: Vec<serde_json::Value>,
    pub resumable_classes: BTreeSet<String>,
    /// Unix uids bound to this identity on the control socket
    pub uids: Vec<u32>,
}

/// Routing table response
#[derive(Debug, Serialize)]
pub struct RoutesResponse {
    pub version: u64,
    pub routes: Vec<RouteInfo>,
    pub total: usize,
}

/// One routing entry
#[derive(Debug, Serialize)]
pub struct RouteInfo {
    /// Exact name or `*.suffix`
    pub server_name: String,
    /// Identity whose inbound policy applies
    pub owner: String,
    /// `local:<path>` or `remote:<location>`
    pub backend: String,
    pub proxy_header: bool,
}

/// SNI sessions response
#[derive(Debug, Serialize)]
pub struct SessionsResponse {
    pub sessions: Vec<SessionInfo>,
    pub stats: SessionStats,
    pub total: usize,
}

/// Session abort result
#[derive(Debug, Serialize)]
pub struct AbortResponse {
    pub session_id: u64,
    pub aborted: bool,
}

/// Pending handoffs response
#[derive(Debug, Serialize)]
pub struct HandoffsResponse {
    pub pending: Vec<HandoffSummary>,
    pub total: usize,
}

/// Credential cache response
#[derive(Debug, Serialize)]
pub struct CredentialsResponse {
    /// Key id of the active signer
    pub issuer_key_id: String,
    pub stats: IssuerStats,
    pub credentials: Vec<CredentialSummary>,
}

/// Reload result
#[derive(Debug, Serialize, Deserialize)]
pub struct ReloadResponse {
    pub policy_version: u64,
    pub identities: usize,
    pub routes_version: u64,
    pub routes: usize,
    pub services: usize,
}

/// Error response
#[derive(Debug, Serialize, Deserialize)]
pub struct ErrorResponse {
    /// Error message
    pub error: String,
    /// Error code
    pub code: u16,
}

impl ErrorResponse {
    pub fn new(error: impl Into<String>, code: u16) -> Self {
        Self {
            error: error.into(),
            code,
        }
    }
}
