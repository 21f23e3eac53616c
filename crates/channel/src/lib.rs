//! Publish/subscribe notification channels.
//!
//! A channel is one named, uuid-scoped endpoint carrying two event categories:
//! [`EventType::PeerToCore`] (a peer announcing that it just initialized) and
//! [`EventType::CoreToPeer`] (badge add/remove and scope-root add/remove).
//! Delivery is best-effort and at-most-once.
//!
//! * [`NotificationChannel`]: the transport contract the engine and its
//!   supervisor consume
//! * [`ChannelFactory`]: opens fresh channel instances (fresh subscriber identity)
//! * [`frame`]: bounded postcard frames for [`ChannelMessage`]
//! * [`local`]: in-process hub implementation

#![warn(missing_docs)]

mod channel;
pub mod error;
pub mod frame;
pub mod local;
mod message;

pub use channel::{ChannelFactory, NotificationChannel};
pub use error::{ChannelError, Result};
pub use local::{LocalChannel, LocalChannelConfig, LocalChannelFactory, LocalChannelHub};
pub use message::{ChannelMessage, EventSubType, EventType, SubscribeOutcome, SubscriberId};
