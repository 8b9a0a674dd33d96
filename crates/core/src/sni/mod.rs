/// SNI multiplexor
///
/// Accepts inbound TCP connections on shared public endpoints, buffers the
/// TLS ClientHello without decrypting anything, routes on the server name,
/// and either donates the live socket to a local backend or relays bytes to
/// a remote one. Nothing that was read from the client is ever dropped: the
/// buffered preamble always reaches the backend first.

pub mod alert;
pub mod multiplexor;
pub mod preamble;
pub mod proxy_header;
pub mod relay;
pub mod routing;
pub mod session;

pub use multiplexor::{Multiplexor, MultiplexorConfig};
pub use preamble::{parse_server_name, MalformedReason, PreambleParse};
pub use routing::{Backend, BackendLocation, RouteError, RouteTable, RoutingTable};
pub use relay::{RelayControl, RelayEnd, RelayProgress};
pub use session::{SessionInfo, SessionState, SessionStats, SessionTracker};
