/// Status API for the hostlink daemon
///
/// Loopback-only HTTP endpoints for operators:
/// - Policy, routing table and pending handoffs
/// - Recent SNI sessions
/// - Cached credentials
/// - Reloading the documents from disk

pub mod handlers;
pub mod responses;
pub mod server;

pub use server::ApiServer;
pub use responses::*;
