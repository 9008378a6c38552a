//! One authenticated connection: an outbound queue drained by the write
//! pump, an inbound pump feeding the hub, and at most one peer connection.

use axum::extract::ws::{Message, WebSocket};
use futures_util::stream::{SplitSink, SplitStream};
use futures_util::{SinkExt, StreamExt};
use serde_json::Value;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use tokio::sync::{mpsc, Notify, RwLock};
use tracing::{debug, error, warn};

use crate::hub::Hub;
use crate::media::{MediaPeer, PeerBinding};
use glimpse_protocol::Envelope;

/// Bounded outbound queue; overflow on the broadcast path severs the client.
pub const OUTBOUND_QUEUE_CAPACITY: usize = 256;

pub struct Client {
    pub user_id: i64,
    pub username: String,
    pub session_id: String,
    send: mpsc::Sender<Envelope>,
    queue_closed: AtomicBool,
    shutdown: Notify,
    peer: RwLock<Option<Arc<dyn MediaPeer>>>,
}

impl Client {
    /// Returns the client and the receiving end of its outbound queue; the
    /// caller hands the receiver to `write_pump` (or drains it in tests).
    pub fn new(
        user_id: i64,
        username: impl Into<String>,
        session_id: impl Into<String>,
    ) -> (Arc<Self>, mpsc::Receiver<Envelope>) {
        let (send, recv) = mpsc::channel(OUTBOUND_QUEUE_CAPACITY);
        let client = Arc::new(Self {
            user_id,
            username: username.into(),
            session_id: session_id.into(),
            send,
            queue_closed: AtomicBool::new(false),
            shutdown: Notify::new(),
            peer: RwLock::new(None),
        });
        (client, recv)
    }

    /// Non-blocking enqueue.  False when the queue is full or closed; the
    /// caller decides whether that drops the message or severs the client.
    pub fn try_send(&self, envelope: Envelope) -> bool {
        if self.queue_closed.load(Ordering::SeqCst) {
            return false;
        }
        self.send.try_send(envelope).is_ok()
    }

    /// Sender handle for the media stack's ICE-candidate callback.
    pub fn outbound_sender(&self) -> mpsc::Sender<Envelope> {
        self.send.clone()
    }

    /// Close the outbound queue; the write pump sends a close frame and
    /// terminates.  Idempotent.
    pub fn close_queue(&self) {
        if !self.queue_closed.swap(true, Ordering::SeqCst) {
            self.shutdown.notify_one();
        }
    }

    pub fn is_queue_closed(&self) -> bool {
        self.queue_closed.load(Ordering::SeqCst)
    }

    pub async fn peer(&self) -> Option<Arc<dyn MediaPeer>> {
        self.peer.read().await.clone()
    }

    pub async fn set_peer(&self, peer: Arc<dyn MediaPeer>) {
        *self.peer.write().await = Some(peer);
    }

    pub async fn take_peer(&self) -> Option<Arc<dyn MediaPeer>> {
        self.peer.write().await.take()
    }

    /// The critical SFU path: build a peer connection for this client,
    /// apply the remote offer, pre-load every other publisher's track,
    /// answer, and push the MID map once negotiation settles.
    ///
    /// Media failures abort this one negotiation; other participants are
    /// never disturbed.
    pub async fn process_offer(self: &Arc<Self>, hub: &Arc<Hub>, offer: Value, call_id: i64) {
        let Some(session) = hub.call_session(call_id).await else {
            warn!(user_id = self.user_id, call_id, "offer for unknown call");
            return;
        };

        let binding = PeerBinding {
            user_id: self.user_id,
            call_id,
            outbound: self.outbound_sender(),
            session: session.clone(),
        };
        let peer = match hub.media().create_peer(binding).await {
            Ok(peer) => peer,
            Err(e) => {
                error!(user_id = self.user_id, call_id, error = %e, "peer connection setup failed");
                return;
            }
        };

        if let Err(e) = peer.set_remote_offer(&offer).await {
            error!(user_id = self.user_id, call_id, error = %e, "remote offer rejected");
            peer.close().await;
            return;
        }

        // Pre-load all existing publishers so a late joiner renders everyone
        // from its very first answer.
        if let Err(e) = session
            .add_published_tracks_to_peer(&peer, self.user_id)
            .await
        {
            warn!(user_id = self.user_id, call_id, error = %e, "pre-loading published tracks failed");
        }

        match peer.answer().await {
            Ok(description) => {
                if !self.try_send(Envelope::answer(&description)) {
                    warn!(user_id = self.user_id, call_id, "outbound queue full, dropping answer");
                }
            }
            Err(e) => {
                error!(user_id = self.user_id, call_id, error = %e, "answer negotiation failed");
                peer.close().await;
                return;
            }
        }

        self.set_peer(peer).await;
        session.map_mids_for_participant(self).await;
    }
}

/// Drain the outbound queue onto the socket, one JSON text frame per
/// envelope.  Exits on write error or when the queue is closed.
pub async fn write_pump(
    client: Arc<Client>,
    mut outbound: mpsc::Receiver<Envelope>,
    mut sink: SplitSink<WebSocket, Message>,
) {
    loop {
        tokio::select! {
            maybe = outbound.recv() => {
                let Some(envelope) = maybe else { break };
                let Ok(json) = serde_json::to_string(&envelope) else { continue };
                if let Err(e) = sink.send(Message::Text(json)).await {
                    debug!(user_id = client.user_id, error = %e, "socket write error");
                    break;
                }
            }
            () = client.shutdown.notified() => {
                let _ = sink.send(Message::Close(None)).await;
                break;
            }
        }
    }
}

/// Read envelopes off the socket and feed them to the hub, in arrival
/// order.  Whatever the exit reason, the client is unregistered.
pub async fn read_pump(client: Arc<Client>, hub: Arc<Hub>, mut stream: SplitStream<WebSocket>) {
    while let Some(item) = stream.next().await {
        match item {
            Ok(Message::Text(text)) => match serde_json::from_str::<Envelope>(&text) {
                Ok(envelope) => hub.inbound(envelope).await,
                Err(e) => {
                    warn!(user_id = client.user_id, error = %e, "malformed envelope dropped");
                }
            },
            Ok(Message::Close(_)) => break,
            Ok(_) => {}
            Err(e) => {
                warn!(user_id = client.user_id, error = %e, "socket read error");
                break;
            }
        }
    }
    hub.submit(crate::hub::HubCommand::Unregister(client)).await;
}
