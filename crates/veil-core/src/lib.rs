//! # veil-core
//!
//! Room presence, acknowledgement tracking and cross-instance fan-out for
//! the Veil room chat service.
//!
//! This crate provides the building blocks a server instance is made of:
//!
//! - **Store** - Shared key/value and pub/sub contract, plus an in-memory store
//! - **Presence** - Rooms, participants, identities and pending acknowledgements
//! - **Router** - Reference-counted fan-out over the shared room channels
//! - **Relay** - Contract for the external relay holding message payloads
//! - **Hub** / **Session** - Per-instance state and per-connection dispatch
//!
//! ## Architecture
//!
//! ```text
//! ┌─────────────┐     ┌─────────────┐     ┌─────────────┐
//! │   Session   │────▶│   Router    │────▶│ SharedStore │◀──── other instances
//! └─────────────┘     └─────────────┘     └─────────────┘
//!        │                                       ▲
//!        ├──────────▶┌─────────────┐             │
//!        │           │  Presence   │─────────────┘
//!        │           └─────────────┘
//!        ▼
//! ┌─────────────┐
//! │    Relay    │
//! └─────────────┘
//! ```

pub mod channel;
pub mod hub;
pub mod identity;
pub mod liveness;
pub mod memory;
pub mod message;
pub mod presence;
pub mod relay;
pub mod router;
pub mod session;
pub mod store;

pub use channel::{RoomChannel, RoomId};
pub use hub::{Hub, HubConfig, HubError, HubStats, InboundOutcome};
pub use liveness::{Heartbeat, Liveness};
pub use memory::MemoryStore;
pub use message::{ConnectionId, MessageId};
pub use presence::{AckOutcome, JoinOutcome, Presence, PresenceConfig, RoomError};
pub use relay::{InboundRelayed, Relay, RelayError, Relayed};
pub use router::{Router, RouterError, RouterStats};
pub use session::{Session, SessionError};
pub use store::{PendingRemoval, SharedStore, StoreError, Subscription};
