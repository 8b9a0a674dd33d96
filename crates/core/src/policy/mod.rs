/// Policy & identity registry
///
/// Holds, per application identity, which destinations it may reach and
/// which sources may reach it. Readers always see one complete immutable
/// snapshot; reloads swap the whole snapshot at once.

pub mod pattern;
pub mod registry;

pub use pattern::{Pattern, Rule};
pub use registry::{Decision, DenyReason, PolicyEntry, PolicyError, PolicyRegistry, PolicySnapshot};
