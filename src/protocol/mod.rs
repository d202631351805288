//! Wire protocol of the risk stream backend
//!
//! Inbound units decode to a `{topic, payload}` pair. Liveness uses a plain
//! text `ping`/`pong` round trip.

pub mod messages;
pub mod topics;

pub use messages::*;
pub use topics::*;
