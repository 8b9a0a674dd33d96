/// hostlink daemon library
///
/// The control socket server that binds applications to identities, and the
/// loopback status API.

pub mod api;
pub mod control;

pub use api::ApiServer;
pub use control::ControlServer;
