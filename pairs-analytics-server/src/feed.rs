//! Upstream trade feed WebSocket handler.

use futures::{Stream, StreamExt, stream};
use std::time::Duration;
use tokio::sync::mpsc;
use tokio_tungstenite::{connect_async, tungstenite::Message};
use tracing::{debug, error, info, warn};

/// Reconnect delay schedule, doubling from `initial` up to `max` and reset after every
/// successful connection.
#[derive(Debug, Copy, Clone, PartialEq, Eq)]
pub struct Backoff {
    initial: Duration,
    max: Duration,
    current: Duration,
}

impl Backoff {
    pub fn new(initial: Duration, max: Duration) -> Self {
        Self {
            initial,
            max: max.max(initial),
            current: initial,
        }
    }

    /// Delay to wait before the next attempt.
    pub fn next_delay(&mut self) -> Duration {
        let delay = self.current;
        self.current = (self.current * 2).min(self.max);
        delay
    }

    pub fn reset(&mut self) {
        self.current = self.initial;
    }
}

/// Spawn a reconnecting WebSocket client for `url` and return its text frames as a
/// [`Stream`].
///
/// The stream ends once the connection task stops, which only happens after the stream
/// itself is dropped.
pub fn trade_frames(
    url: String,
    buffer: usize,
    backoff: Backoff,
) -> impl Stream<Item = String> + Send + 'static {
    let (frame_tx, frame_rx) = mpsc::channel(buffer.max(1));
    tokio::spawn(run_feed(url, frame_tx, backoff));

    stream::unfold(frame_rx, |mut frame_rx| async move {
        frame_rx.recv().await.map(|frame| (frame, frame_rx))
    })
}

async fn run_feed(url: String, frame_tx: mpsc::Sender<String>, mut backoff: Backoff) {
    info!(%url, "starting trade feed");

    loop {
        match connect_async(&url).await {
            Ok((ws_stream, _)) => {
                info!(%url, "connected to trade feed");
                backoff.reset();

                let (_, mut read) = ws_stream.split();
                while let Some(message) = read.next().await {
                    match message {
                        Ok(Message::Text(text)) => {
                            if frame_tx.send(text.to_string()).await.is_err() {
                                debug!(%url, "frame receiver dropped, stopping trade feed");
                                return;
                            }
                        }
                        Ok(Message::Close(frame)) => {
                            warn!(%url, ?frame, "trade feed closed by upstream");
                            break;
                        }
                        Ok(Message::Ping(_)) | Ok(Message::Pong(_)) => {}
                        Err(error) => {
                            error!(%url, %error, "trade feed error");
                            break;
                        }
                        _ => {}
                    }
                }
            }
            Err(error) => {
                error!(%url, %error, "failed to connect to trade feed");
            }
        }

        if frame_tx.is_closed() {
            return;
        }

        let delay = backoff.next_delay();
        warn!(%url, ?delay, "reconnecting to trade feed");
        tokio::time::sleep(delay).await;
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_backoff() {
        let mut backoff = Backoff::new(Duration::from_secs(1), Duration::from_secs(8));

        let delays = (0..5).map(|_| backoff.next_delay().as_secs()).collect::<Vec<_>>();
        assert_eq!(delays, vec![1, 2, 4, 8, 8]);

        backoff.reset();
        assert_eq!(backoff.next_delay(), Duration::from_secs(1));
    }
}
