//! Byte-stream transport: session messages exchanged as NDJSON over any
//! `AsyncRead`/`AsyncWrite` pair, one pair per peer.
//!
//! Outbound messages go through a bounded channel per peer drained by a
//! writer task; inbound frames are decoded by a reader task and forwarded
//! to the node's inbound channel.

use std::collections::HashMap;
use std::future::Future;
use std::pin::Pin;

use futures_util::{SinkExt, StreamExt};
use tokio::io::{AsyncRead, AsyncWrite};
use tokio::sync::{mpsc, RwLock};
use tokio::task::JoinHandle;
use tokio_util::codec::{FramedRead, FramedWrite};
use tokio_util::sync::CancellationToken;
use tracing::{debug, warn};

use super::codec::SessionCodec;
use super::Transport;
use crate::models::message::SessionMessage;
use crate::models::session::Party;
use crate::{AppError, Result};

/// Outbound frames buffered per peer before senders wait.
const OUTBOUND_BUFFER: usize = 256;

/// [`Transport`] over per-peer byte streams.
#[derive(Default)]
pub struct StreamTransport {
    peers: RwLock<HashMap<Party, mpsc::Sender<SessionMessage>>>,
}

impl StreamTransport {
    /// Transport with no peers.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Route messages for `party` to `writer` and start its writer task.
    ///
    /// Replaces any previous connection to the same party.
    pub async fn add_peer<W>(&self, party: Party, writer: W, cancel: CancellationToken) -> JoinHandle<Result<()>>
    where
        W: AsyncWrite + Unpin + Send + 'static,
    {
        let (tx, rx) = mpsc::channel(OUTBOUND_BUFFER);
        self.peers.write().await.insert(party.clone(), tx);
        debug!(%party, "stream peer added");
        tokio::spawn(run_writer(party, writer, rx, cancel))
    }

    /// Stop routing messages to `party`; its writer task drains and exits.
    pub async fn remove_peer(&self, party: &Party) {
        if self.peers.write().await.remove(party).is_some() {
            debug!(%party, "stream peer removed");
        }
    }

    async fn forward(&self, destination: &Party, message: SessionMessage) -> Result<()> {
        let sender = self
            .peers
            .read()
            .await
            .get(destination)
            .cloned()
            .ok_or_else(|| AppError::Transport(format!("no connection to {destination}")))?;
        sender
            .send(message)
            .await
            .map_err(|_| AppError::Transport(format!("connection to {destination} closed")))
    }
}

impl Transport for StreamTransport {
    fn send<'a>(
        &'a self,
        destination: &'a Party,
        message: SessionMessage,
    ) -> Pin<Box<dyn Future<Output = Result<()>> + Send + 'a>> {
        Box::pin(self.forward(destination, message))
    }
}

/// Writer task: encode queued messages for `peer` onto `writer`.
///
/// Exits when `cancel` fires or every sender is dropped.
///
/// # Errors
///
/// Returns `AppError::Io` if a write fails.
pub async fn run_writer<W>(
    peer: Party,
    writer: W,
    mut outbound: mpsc::Receiver<SessionMessage>,
    cancel: CancellationToken,
) -> Result<()>
where
    W: AsyncWrite + Unpin + Send,
{
    let mut framed = FramedWrite::new(writer, SessionCodec::new());

    loop {
        tokio::select! {
            biased;

            () = cancel.cancelled() => {
                debug!(%peer, "stream writer: cancellation received, stopping");
                break;
            }

            message = outbound.recv() => {
                let Some(message) = message else {
                    debug!(%peer, "stream writer: channel closed, stopping");
                    break;
                };
                if let Err(err) = framed.send(message).await {
                    warn!(%peer, %err, "stream writer: write failed");
                    return Err(err);
                }
            }
        }
    }

    Ok(())
}

/// Reader task: decode frames sent by `peer` and forward them to `inbound`.
///
/// Frames claiming a different sender are dropped and undecodable frames
/// are skipped. Stops on EOF, when `cancel` fires, or when `inbound` is
/// closed.
///
/// # Errors
///
/// Returns `AppError::Io` if reading from the stream fails.
pub async fn run_reader<R>(
    peer: Party,
    reader: R,
    inbound: mpsc::UnboundedSender<SessionMessage>,
    cancel: CancellationToken,
) -> Result<()>
where
    R: AsyncRead + Unpin + Send,
{
    let mut framed = FramedRead::new(reader, SessionCodec::new());
    // FramedRead yields one `None` after a decode error before resuming.
    let mut resume_after_error = false;

    loop {
        tokio::select! {
            biased;

            () = cancel.cancelled() => {
                debug!(%peer, "stream reader: cancellation received, stopping");
                break;
            }

            item = framed.next() => match item {
                None if resume_after_error => {
                    resume_after_error = false;
                }
                None => {
                    debug!(%peer, "stream reader: EOF");
                    break;
                }
                Some(Err(AppError::Codec(msg))) => {
                    warn!(%peer, error = msg.as_str(), "stream reader: bad frame, skipping");
                    resume_after_error = true;
                }
                Some(Err(err)) => {
                    warn!(%peer, %err, "stream reader: IO error, stopping");
                    return Err(err);
                }
                Some(Ok(message)) if message.sender != peer => {
                    warn!(%peer, claimed = %message.sender, "stream reader: frame from wrong sender dropped");
                }
                Some(Ok(message)) => {
                    if inbound.send(message).is_err() {
                        debug!(%peer, "stream reader: inbound channel closed, stopping");
                        break;
                    }
                }
            },
        }
    }

    Ok(())
}
