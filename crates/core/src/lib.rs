pub mod broker;
pub mod client;
pub mod credentials;
pub mod handoff;
pub mod policy;
pub mod runtime;
pub mod sni;
pub mod transfer;

// Re-export broker types
pub use broker::{
    ControlSession, DialBroker, DialConfig, DialOutcome, Donation, PeerDirectory, Request,
    Response, ServiceError, ServiceResolver, ServiceTable, StaticResolver, Transport,
};

pub use client::{BrokerClient, DialedSocket, DonatedConnection, DonationListener};

// Re-export credential types
pub use credentials::{
    CertificateIssuer, CertificateSigner, CredentialError, CredentialSummary, Ed25519Signer,
    IssuerConfig, IssuerStats, RuntimeCertificate,
};

pub use handoff::{
    ConnectionMeta, HandoffConfig, HandoffCoordinator, HandoffOutcome, HandoffSummary,
    HandoffToken,
};

pub use policy::{
    Decision, DenyReason, Pattern, PolicyEntry, PolicyError, PolicyRegistry, PolicySnapshot, Rule,
};

pub use runtime::{ReloadReport, Runtime, RuntimeError, RuntimeStats};

// Re-export SNI types
pub use sni::{
    Backend, BackendLocation, Multiplexor, MultiplexorConfig, RouteError, RouteTable, RoutingTable,
    SessionInfo, SessionState, SessionStats, SessionTracker,
};

pub use transfer::{FdChannel, TransferError};
