//! # Network Module
//!
//! Realtime transport between clients and the SmashChat relay.
//!
//! ## Connection Lifecycle
//!
//! ```text
//! ┌─────────────────────────────────────────────────────────────────────────┐
//! │                         REALTIME SESSION                                │
//! ├─────────────────────────────────────────────────────────────────────────┤
//! │                                                                         │
//! │  Client                                              Relay              │
//! │    │                                                   │                │
//! │    │── WS upgrade (Authorization: Bearer <token>) ────►│                │
//! │    │                                                   │ verify token   │
//! │    │◄──────────────── { "type": "authenticated" } ─────│                │
//! │    │                                                   │ auto-join      │
//! │    │◄──────────────── { "type": "joined" } ... ────────│ member rooms   │
//! │    │                                                   │                │
//! │    │── { "type": "send_message", ... } ───────────────►│ persist        │
//! │    │◄──────────────── { "type": "new_message" } ───────│ broadcast      │
//! │    │                                                   │                │
//! │                                                                         │
//! │  A bad token gets one error frame and a close. The connection never   │
//! │  becomes a room member.                                                │
//! │                                                                         │
//! └─────────────────────────────────────────────────────────────────────────┘
//! ```

pub mod protocol;
mod session;

pub use protocol::{ClientCommand, MessageRecord, MessageType, ServerEvent, SessionStatus};
pub use session::{RealtimeSession, SessionConfig, SessionEvent};
