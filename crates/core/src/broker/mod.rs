/// Dial broker
///
/// Applications never call `connect` for network destinations themselves.
/// They ask the broker over their control channel; the broker authorizes the
/// request against policy, resolves and connects the destination, and hands
/// the connected socket back with `SCM_RIGHTS`.

pub mod connect;
pub mod dial;
pub mod protocol;
pub mod resolver;
pub mod session;

pub use connect::{Connected, Transport};
pub use dial::{DialBroker, DialConfig, DialOutcome};
pub use protocol::{Donation, Request, Response};
pub use resolver::{PeerDirectory, ServiceError, ServiceResolver, ServiceTable, StaticResolver};
pub use session::ControlSession;
