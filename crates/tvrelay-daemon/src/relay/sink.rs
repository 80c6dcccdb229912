//! Output side of a relay session.

use std::future::Future;
use std::io;

use bytes::Bytes;
use tokio::sync::mpsc;

/// The client went away.
#[derive(Debug, Clone, Copy, PartialEq, Eq, thiserror::Error)]
#[error("Relay sink closed")]
pub struct SinkClosed;

/// Destination for relayed chunks, usually a client connection.
pub trait RelaySink: Send {
    /// Deliver one chunk. Waits while the client is not ready for more.
    fn send(&mut self, chunk: Bytes) -> impl Future<Output = Result<(), SinkClosed>> + Send;

    /// Resolves once the sink can no longer accept data.
    ///
    /// Lets the relay notice a disconnect while it is still waiting on the
    /// transcoder, not only on the next failed write.
    fn closed(&self) -> impl Future<Output = ()> + Send;
}

/// Channel feeding a streaming HTTP body.
impl RelaySink for mpsc::Sender<Result<Bytes, io::Error>> {
    async fn send(&mut self, chunk: Bytes) -> Result<(), SinkClosed> {
        mpsc::Sender::send(self, Ok(chunk))
            .await
            .map_err(|_| SinkClosed)
    }

    async fn closed(&self) {
        mpsc::Sender::closed(self).await;
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used)]
mod tests {
    use super::*;
    use std::time::Duration;

    #[tokio::test]
    async fn channel_sink_delivers_chunks() {
        let (mut tx, mut rx) = mpsc::channel(1);
        RelaySink::send(&mut tx, Bytes::from_static(b"abc")).await.unwrap();
        assert_eq!(rx.recv().await.unwrap().unwrap(), "abc");
    }

    #[tokio::test]
    async fn channel_sink_reports_dropped_receiver() {
        let (mut tx, rx) = mpsc::channel(1);
        drop(rx);
        assert_eq!(
            RelaySink::send(&mut tx, Bytes::from_static(b"x")).await,
            Err(SinkClosed)
        );
        tokio::time::timeout(Duration::from_secs(1), RelaySink::closed(&tx))
            .await
            .unwrap();
    }
}
