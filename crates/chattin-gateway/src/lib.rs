//! Real-time side of the server: the hub that owns the live-session
//! registry, the per-connection sessions, and the rules that connect them.

pub mod context;
pub mod error;
pub mod hub;
pub mod policy;
pub mod session;

pub use context::{GatewayContext, GatewaySettings};
pub use hub::{Hub, HubEvent, HubHandle};
pub use session::{SessionHandle, SessionId};
