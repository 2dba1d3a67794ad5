//! Message transport contract and the bundled implementations.
//!
//! The scheduler only needs to hand a [`SessionMessage`] to a party and to
//! receive inbound messages from a channel. Delivery is assumed to be
//! at-least-once; the session protocol discards duplicates.

pub mod codec;
pub mod memory;
pub mod stream;

use std::future::Future;
use std::pin::Pin;

use crate::models::message::SessionMessage;
use crate::models::session::Party;
use crate::Result;

pub use memory::InMemoryNetwork;
pub use stream::StreamTransport;

/// Outbound half of a node's network connection.
pub trait Transport: Send + Sync {
    /// Hand `message` to the network for delivery to `destination`.
    ///
    /// # Errors
    ///
    /// Returns [`AppError::Transport`](crate::AppError::Transport) when the
    /// destination is unknown or unreachable.
    fn send<'a>(
        &'a self,
        destination: &'a Party,
        message: SessionMessage,
    ) -> Pin<Box<dyn Future<Output = Result<()>> + Send + 'a>>;
}
