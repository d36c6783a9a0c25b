//! Nostr relay connections and relay pools.
//!
//! - [`RelayConnection`]: one relay, with lifecycle state, reconnect/backoff,
//!   an ordered outbox and a handler table
//! - [`RelayPool`]: uniquely-URLed connections sharing one handler table, with
//!   broadcast and subset fan-out

pub mod backoff;
pub mod error;
pub mod message;
pub mod pool;
pub mod relay;
pub mod transport;

pub use backoff::{ExponentialBackoff, ReconnectPolicy};
pub use error::{ClientError, Result};
pub use message::{ClientMessage, Filters, RelayMessage};
pub use pool::{PoolConfig, RelayPool, RelaySelector};
pub use relay::{
    ConnectionState, HandlerKind, HandlerTable, RelayConfig, RelayConnection, RelayHandler,
    RelayNotification,
};
pub use transport::{OutboundFrame, Transport, TransportHandle, TransportSignal, WebSocketTransport};
