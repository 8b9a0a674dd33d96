/// Control channel messages
///
/// Every request gets exactly one response, in request order. Frames that
/// carry sockets say so in their header; the message body only describes
/// them.

use super::Transport;
use crate::credentials::RuntimeCertificate;
use crate::handoff::{ConnectionMeta, HandoffOutcome, HandoffToken};
use hostlink_common::{Destination, DialOptions, Failure};
use serde::{Deserialize, Serialize};

/// Application to broker
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub enum Request {
    /// Connect `destination` and send back the socket
    Dial {
        destination: Destination,
        options: DialOptions,
    },

    /// Offer the attached sockets for adoption by a new instance. One
    /// descriptor per entry, in order.
    OfferHandoff { connections: Vec<ConnectionMeta> },

    /// Block until the offer identified by `token` is committed or aborted
    AwaitHandoff { token: HandoffToken },

    /// Take over the sockets offered under `token`
    Adopt { token: HandoffToken },

    /// Confirms that every adopted socket was received
    AckAdoption { token: HandoffToken },

    Ping,
}

impl Request {
    pub fn name(&self) -> &'static str {
        match self {
            Request::Dial { .. } => "Dial",
            Request::OfferHandoff { .. } => "OfferHandoff",
            Request::AwaitHandoff { .. } => "AwaitHandoff",
            Request::Adopt { .. } => "Adopt",
            Request::AckAdoption { .. } => "AckAdoption",
            Request::Ping => "Ping",
        }
    }
}

/// Broker to application
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub enum Response {
    /// Exactly one connected socket is attached
    Dialed {
        peer: String,
        transport: Transport,
        credential: Option<RuntimeCertificate>,
    },

    HandoffOffered { token: HandoffToken },

    HandoffOutcome {
        token: HandoffToken,
        outcome: HandoffOutcome,
    },

    /// One socket per entry is attached, in order
    Adopted {
        token: HandoffToken,
        connections: Vec<ConnectionMeta>,
    },

    Acknowledged { token: HandoffToken },

    Pong { version: u32 },

    Failed(Failure),
}

/// Multiplexor to local backend: one inbound client connection, attached
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Donation {
    pub session_id: u64,
    pub server_name: String,
    pub peer_addr: std::net::SocketAddr,
    pub local_addr: std::net::SocketAddr,

    /// Bytes already read from the client, starting with the ClientHello
    pub preamble: Vec<u8>,
}
