//! Out-of-band hook surface: the event receiver and the pre-tool-use
//! approval bridge.

pub mod bridge;
pub mod receiver;

pub use bridge::{BridgeRequest, BridgeStatus, HookApprovalBridge};
pub use receiver::{HookEvent, HookReceiver};
