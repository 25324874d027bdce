//! WebSocket transport for the relay server.
//!
//! Each subscription owns one socket. A writer task drains an unbounded
//! queue of client frames so `publish` never suspends; a reader task turns
//! `deliver` frames into inbound envelopes. Dropping the link on
//! `unsubscribe` ends the writer, which closes the socket.

use std::collections::HashMap;
use std::sync::{Mutex, PoisonError};

use futures_util::{SinkExt, StreamExt};
use tokio::sync::mpsc;
use tokio_tungstenite::connect_async;
use tokio_tungstenite::tungstenite::Message;
use tracing::{debug, info, warn};

use super::{Subscription, Transport, TransportError};
use crate::message::{BoardSnapshot, ClientFrame, CodecError, ConnectionId, Envelope, ServerFrame};

const INBOUND_QUEUE_CAPACITY: usize = 256;

type LinkKey = (String, ConnectionId);

pub struct WsTransport {
    base_url: String,
    links: Mutex<HashMap<LinkKey, mpsc::UnboundedSender<ClientFrame>>>,
}

impl WsTransport {
    /// `base_url` is the relay root, e.g. `ws://127.0.0.1:3000`.
    pub fn new(base_url: impl Into<String>) -> Self {
        Self { base_url: base_url.into(), links: Mutex::new(HashMap::new()) }
    }

    fn topic_url(&self, topic: &str, rewind: bool) -> String {
        format!("{}/topics/{topic}/ws?rewind={rewind}", self.base_url.trim_end_matches('/'))
    }

    fn send(&self, topic: &str, from: &ConnectionId, frame: ClientFrame) -> Result<(), TransportError> {
        let links = self.links.lock().unwrap_or_else(PoisonError::into_inner);
        let Some(link) = links.get(&(topic.to_owned(), from.clone())) else {
            return Err(TransportError::NotSubscribed { topic: topic.to_owned(), connection_id: from.clone() });
        };
        link.send(frame).map_err(|_| TransportError::Closed)
    }
}

#[async_trait::async_trait]
impl Transport for WsTransport {
    async fn subscribe(&self, topic: &str, rewind: bool) -> Result<Subscription, TransportError> {
        let url = self.topic_url(topic, rewind);
        let (socket, _) = connect_async(url.as_str())
            .await
            .map_err(|e| TransportError::Unreachable(format!("{url}: {e}")))?;
        let (mut sink, mut stream) = socket.split();

        let (connection_id, snapshot) = loop {
            match stream.next().await {
                Some(Ok(Message::Text(text))) => match serde_json::from_str::<ServerFrame>(text.as_str()) {
                    Ok(ServerFrame::Welcome { connection_id, snapshot }) => break (connection_id, snapshot),
                    Ok(ServerFrame::Deliver { .. }) => debug!(%topic, "ws: delivery before welcome ignored"),
                    Err(e) => return Err(CodecError::from(e).into()),
                },
                Some(Ok(Message::Close(_))) | None => return Err(TransportError::Closed),
                Some(Ok(_)) => {}
                Some(Err(e)) => return Err(TransportError::Unreachable(e.to_string())),
            }
        };
        info!(%topic, %connection_id, rewound = snapshot.is_some(), "ws: subscribed");

        let (in_tx, in_rx) = mpsc::channel::<Envelope>(INBOUND_QUEUE_CAPACITY);
        let (out_tx, mut out_rx) = mpsc::unbounded_channel::<ClientFrame>();

        let writer_topic = topic.to_owned();
        tokio::spawn(async move {
            while let Some(frame) = out_rx.recv().await {
                let text = match serde_json::to_string(&frame) {
                    Ok(text) => text,
                    Err(e) => {
                        warn!(topic = %writer_topic, error = %e, "ws: failed to encode frame");
                        continue;
                    }
                };
                if let Err(e) = sink.send(Message::Text(text.into())).await {
                    warn!(topic = %writer_topic, error = %e, "ws: send failed");
                    break;
                }
            }
            if let Err(e) = sink.close().await {
                debug!(topic = %writer_topic, error = %e, "ws: close failed");
            }
        });

        let reader_topic = topic.to_owned();
        tokio::spawn(async move {
            while let Some(message) = stream.next().await {
                match message {
                    Ok(Message::Text(text)) => match serde_json::from_str::<ServerFrame>(text.as_str()) {
                        Ok(ServerFrame::Deliver { envelope }) => {
                            if in_tx.send(envelope).await.is_err() {
                                break;
                            }
                        }
                        Ok(ServerFrame::Welcome { .. }) => {
                            warn!(topic = %reader_topic, "ws: unexpected second welcome");
                        }
                        Err(e) => {
                            warn!(topic = %reader_topic, error = %e, "ws: invalid frame");
                        }
                    },
                    Ok(Message::Close(_)) => break,
                    Ok(_) => {}
                    Err(e) => {
                        warn!(topic = %reader_topic, error = %e, "ws: read failed");
                        break;
                    }
                }
            }
            debug!(topic = %reader_topic, "ws: reader finished");
        });

        self.links
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .insert((topic.to_owned(), connection_id.clone()), out_tx);

        Ok(Subscription { connection_id, snapshot, inbound: in_rx })
    }

    fn publish(&self, topic: &str, from: &ConnectionId, envelope: Envelope) -> Result<(), TransportError> {
        self.send(topic, from, ClientFrame::Publish { envelope })
    }

    fn retain(&self, topic: &str, from: &ConnectionId, snapshot: BoardSnapshot) -> Result<(), TransportError> {
        self.send(topic, from, ClientFrame::Retain { snapshot })
    }

    fn unsubscribe(&self, topic: &str, connection_id: &ConnectionId) {
        let removed = self
            .links
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .remove(&(topic.to_owned(), connection_id.clone()));
        if removed.is_some() {
            info!(%topic, %connection_id, "ws: unsubscribed");
        }
    }
}
