use crate::{backoff, Error};
use futures_util::{SinkExt, Stream as FutStream, StreamExt};
use rand::{rngs::StdRng, SeedableRng};
use std::time::Duration;
use tokio::sync::mpsc;
use tokio_tungstenite::{connect_async, tungstenite::Message};
use tracing::{debug, info, trace, warn};
use unobot_types::api::{Notification, PlayerId, RoomId, Subscribe};
use url::Url;

const DEFAULT_CHANNEL_CAPACITY: usize = 1024;

/// What the feed task reports to its consumer.
#[derive(Clone, Debug, PartialEq)]
pub enum FeedEvent {
    /// A (re)connect completed and the room subscription was sent.
    Connected { reconnect: bool },
    Notification(Notification),
    /// The connection dropped; the task is backing off before redialing.
    Disconnected { reason: String },
    /// Reconnection gave up after `attempts` consecutive failures.
    Exhausted { attempts: u32 },
}

#[derive(Clone, Debug)]
pub struct FeedConfig {
    pub url: Url,
    pub room_id: RoomId,
    pub player_id: PlayerId,
    pub initial_backoff: Duration,
    pub max_backoff: Duration,
    pub max_reconnect_attempts: u32,
    pub connect_timeout: Duration,
    pub capacity: usize,
}

impl FeedConfig {
    pub fn new(url: Url, room_id: RoomId, player_id: PlayerId) -> Self {
        Self {
            url,
            room_id,
            player_id,
            initial_backoff: Duration::from_millis(500),
            max_backoff: Duration::from_secs(15),
            max_reconnect_attempts: 10,
            connect_timeout: Duration::from_secs(10),
            capacity: DEFAULT_CHANNEL_CAPACITY,
        }
    }

    pub fn with_backoff(mut self, initial: Duration, max: Duration) -> Self {
        self.initial_backoff = initial;
        self.max_backoff = max;
        self
    }

    pub fn with_max_reconnect_attempts(mut self, attempts: u32) -> Self {
        self.max_reconnect_attempts = attempts;
        self
    }

    pub fn with_capacity(mut self, capacity: usize) -> Self {
        self.capacity = capacity;
        self
    }

    fn subscribe_frame(&self) -> Result<String, Error> {
        Ok(serde_json::to_string(&Subscribe::JoinRoom {
            room_id: self.room_id.clone(),
            player_id: self.player_id.clone(),
        })?)
    }
}

/// Ordered server notifications for one room, kept alive across reconnects.
///
/// Dropping the feed stops the background task.
pub struct Feed {
    receiver: mpsc::Receiver<FeedEvent>,
    _handle: tokio::task::JoinHandle<()>,
}

impl Drop for Feed {
    fn drop(&mut self) {
        self._handle.abort();
    }
}

enum ReaderExit {
    ReceiverDropped,
    Closed { reason: String, delivered: bool },
}

impl Feed {
    pub fn connect(config: FeedConfig) -> Self {
        let capacity = if config.capacity == 0 {
            DEFAULT_CHANNEL_CAPACITY
        } else {
            config.capacity
        };
        let (tx, rx) = mpsc::channel(capacity);
        let handle = tokio::spawn(run(config, tx));
        Self {
            receiver: rx,
            _handle: handle,
        }
    }

    /// Receive the next event; `None` once the task has stopped.
    pub async fn next(&mut self) -> Option<FeedEvent> {
        self.receiver.recv().await
    }
}

impl FutStream for Feed {
    type Item = FeedEvent;

    fn poll_next(
        mut self: std::pin::Pin<&mut Self>,
        cx: &mut std::task::Context<'_>,
    ) -> std::task::Poll<Option<Self::Item>> {
        self.receiver.poll_recv(cx)
    }
}

async fn run(config: FeedConfig, tx: mpsc::Sender<FeedEvent>) {
    let mut rng = StdRng::from_entropy();
    let mut backoff = config.initial_backoff;
    let mut failures: u32 = 0;
    let mut connected_before = false;
    let subscribe = match config.subscribe_frame() {
        Ok(frame) => frame,
        Err(err) => {
            warn!(error = %err, "cannot encode room subscription");
            let _ = tx.send(FeedEvent::Exhausted { attempts: 0 }).await;
            return;
        }
    };

    loop {
        let dial = tokio::time::timeout(config.connect_timeout, connect_async(config.url.as_str()));
        let reason = match dial.await {
            Ok(Ok((ws, _))) => {
                let (mut sink, mut stream) = ws.split();
                match sink.send(Message::Text(subscribe.clone())).await {
                    Ok(()) => {
                        info!(url = %config.url, room = %config.room_id, reconnect = connected_before, "feed connected");
                        let event = FeedEvent::Connected {
                            reconnect: connected_before,
                        };
                        connected_before = true;
                        if tx.send(event).await.is_err() {
                            return;
                        }
                        match read_frames(&mut stream, &tx).await {
                            ReaderExit::ReceiverDropped => return,
                            ReaderExit::Closed { reason, delivered } => {
                                if delivered {
                                    failures = 0;
                                    backoff = config.initial_backoff;
                                }
                                reason
                            }
                        }
                    }
                    Err(err) => format!("subscribe failed: {err}"),
                }
            }
            Ok(Err(err)) => format!("connect failed: {}", Error::from(err)),
            Err(_) => Error::DialTimeout.to_string(),
        };

        failures += 1;
        warn!(url = %config.url, failures, %reason, "feed disconnected");
        if tx
            .send(FeedEvent::Disconnected {
                reason: reason.clone(),
            })
            .await
            .is_err()
        {
            return;
        }
        if failures >= config.max_reconnect_attempts {
            warn!(failures, "feed reconnect attempts exhausted");
            let _ = tx.send(FeedEvent::Exhausted { attempts: failures }).await;
            return;
        }
        let delay = backoff::jittered_backoff(&mut rng, backoff);
        debug!(?delay, "feed reconnect backoff");
        tokio::time::sleep(delay).await;
        backoff = backoff::next_backoff(backoff, config.max_backoff);
    }
}

async fn read_frames<S>(stream: &mut S, tx: &mpsc::Sender<FeedEvent>) -> ReaderExit
where
    S: futures_util::Stream<Item = Result<Message, tokio_tungstenite::tungstenite::Error>> + Unpin,
{
    let mut delivered = false;
    while let Some(msg) = stream.next().await {
        match msg {
            Ok(Message::Text(text)) => {
                trace!(len = text.len(), "received feed frame");
                match Notification::parse_frame(&text) {
                    Ok(Some(notification)) => {
                        delivered = true;
                        if tx.send(FeedEvent::Notification(notification)).await.is_err() {
                            return ReaderExit::ReceiverDropped;
                        }
                    }
                    Ok(None) => debug!("skipping unknown feed event"),
                    Err(err) => warn!(error = %err, "failed to decode feed frame"),
                }
            }
            Ok(Message::Close(frame)) => {
                debug!(?frame, "feed closed by server");
                return ReaderExit::Closed {
                    reason: Error::ConnectionClosed.to_string(),
                    delivered,
                };
            }
            Ok(_) => {}
            Err(err) => {
                return ReaderExit::Closed {
                    reason: Error::from(err).to_string(),
                    delivered,
                };
            }
        }
    }
    ReaderExit::Closed {
        reason: Error::ConnectionClosed.to_string(),
        delivered,
    }
}
