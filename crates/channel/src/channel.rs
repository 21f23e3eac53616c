use std::sync::Arc;
use std::time::Duration;

use crate::{ChannelMessage, EventType, Result, SubscribeOutcome, SubscriberId};

/// One named, uuid-scoped publish/subscribe endpoint.
///
/// `publish`, `subscribe`, `cancel_waiting_subscription` and
/// `clean_up_unused_resources` may be called concurrently from different
/// threads. Nothing blocks indefinitely: `subscribe` is bounded by its
/// timeout and `publish` returns an error rather than waiting out contention.
pub trait NotificationChannel: Send + Sync {
	/// Identity generated for this instance.
	fn subscriber_id(&self) -> SubscriberId;

	/// Allocates the underlying endpoint. Idempotent.
	fn initialize(&self) -> Result<()>;

	/// Best-effort delivery to every current subscriber of `message.event`.
	fn publish(&self, message: &ChannelMessage) -> Result<()>;

	/// Waits up to `timeout` for the next message of category `event`.
	///
	/// [`SubscribeOutcome::TryAgain`] and [`SubscribeOutcome::TimedOut`] are
	/// normal polling outcomes.
	fn subscribe(&self, event: EventType, subscriber: SubscriberId, timeout: Duration) -> SubscribeOutcome;

	/// Unblocks a thread waiting in `subscribe` for `subscriber`.
	///
	/// Safe to call when no subscribe is outstanding.
	fn cancel_waiting_subscription(&self, event: EventType, subscriber: SubscriberId) -> Result<()>;

	/// Periodic maintenance. Returns how many idle subscriptions were reclaimed.
	fn clean_up_unused_resources(&self) -> Result<usize>;

	/// Releases the endpoint. Later calls fail with [`crate::ChannelError::Terminated`].
	fn terminate(&self);
}

/// Opens initialized channel instances, each with a fresh subscriber identity.
pub trait ChannelFactory: Send + Sync {
	/// Opens and initializes one channel.
	fn open(&self) -> Result<Arc<dyn NotificationChannel>>;
}
