//! The global reactor: presence, session registry, message dispatch.
//!
//! All cross-user and cross-call decisions pass through here.  External
//! code talks to the hub through its command queue (`submit`) which the
//! `run` task drains in order; the maps live behind one lock, snapshots are
//! taken under it, and no media-stack call ever happens while it is held.

use chrono::Utc;
use sqlx::PgPool;
use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{mpsc, Mutex, RwLock};
use tracing::{debug, info, warn};

use crate::call_session::CallSession;
use crate::client::Client;
use crate::media::MediaStack;
use crate::repo;
use glimpse_protocol::{
    CallRecord, CallRef, CallStatus, Envelope, IceCandidatePayload, OfferPayload,
    ReconnectPayload, SignalMessage, TrackUpdatePayload, UserStatus, UserStatusSnapshot,
};

/// Window after socket loss during which a user keeps their place in
/// active calls.
const GRACE_PERIOD: Duration = Duration::from_secs(30);

/// Cadence of the `users_list` presence broadcast.
const PRESENCE_INTERVAL: Duration = Duration::from_secs(30);

const COMMAND_QUEUE_CAPACITY: usize = 1024;

pub enum HubCommand {
    Register(Arc<Client>),
    Unregister(Arc<Client>),
    Broadcast(Envelope),
    Inbound(Envelope),
}

#[derive(Default)]
struct HubState {
    user_clients: HashMap<i64, Arc<Client>>,
    user_statuses: HashMap<i64, UserStatusSnapshot>,
    call_sessions: HashMap<i64, Arc<CallSession>>,
    disconnected: HashMap<i64, Arc<Client>>,
}

pub struct Hub {
    pool: PgPool,
    media: Arc<dyn MediaStack>,
    grace_period: Duration,
    presence_interval: Duration,
    state: RwLock<HubState>,
    command_tx: mpsc::Sender<HubCommand>,
    command_rx: Mutex<Option<mpsc::Receiver<HubCommand>>>,
}

impl Hub {
    pub fn new(pool: PgPool, media: Arc<dyn MediaStack>) -> Arc<Self> {
        Self::with_timing(pool, media, GRACE_PERIOD, PRESENCE_INTERVAL)
    }

    /// Timing-injectable constructor; the test suites shrink both windows.
    pub fn with_timing(
        pool: PgPool,
        media: Arc<dyn MediaStack>,
        grace_period: Duration,
        presence_interval: Duration,
    ) -> Arc<Self> {
        let (command_tx, command_rx) = mpsc::channel(COMMAND_QUEUE_CAPACITY);
        Arc::new(Self {
            pool,
            media,
            grace_period,
            presence_interval,
            state: RwLock::new(HubState::default()),
            command_tx,
            command_rx: Mutex::new(Some(command_rx)),
        })
    }

    pub fn media(&self) -> &Arc<dyn MediaStack> {
        &self.media
    }

    pub fn pool(&self) -> &PgPool {
        &self.pool
    }

    /// Seed the presence table so every known user starts offline.
    pub async fn load_user_statuses(&self) {
        let users = match repo::users::list_users(&self.pool).await {
            Ok(users) => users,
            Err(e) => {
                warn!(error = %e, "failed to seed user statuses");
                return;
            }
        };
        let mut state = self.state.write().await;
        for user in users {
            state.user_statuses.entry(user.id).or_insert(UserStatusSnapshot {
                user_id: user.id,
                username: user.name,
                status: UserStatus::Offline,
                last_seen: user.last_seen,
            });
        }
    }

    // -- command queue ------------------------------------------------------

    pub async fn submit(&self, command: HubCommand) {
        if self.command_tx.send(command).await.is_err() {
            warn!("hub command queue closed");
        }
    }

    pub async fn inbound(&self, envelope: Envelope) {
        self.submit(HubCommand::Inbound(envelope)).await;
    }

    /// The reactor.  Drains commands in order and broadcasts the online set
    /// on a fixed tick.
    pub async fn run(self: Arc<Self>) {
        let Some(mut commands) = self.command_rx.lock().await.take() else {
            warn!("hub reactor already running");
            return;
        };
        let mut tick = tokio::time::interval(self.presence_interval);
        tick.tick().await;
        loop {
            tokio::select! {
                command = commands.recv() => {
                    let Some(command) = command else { break };
                    match command {
                        HubCommand::Register(client) => self.register(client).await,
                        HubCommand::Unregister(client) => self.unregister(client).await,
                        HubCommand::Broadcast(envelope) => self.broadcast(envelope).await,
                        HubCommand::Inbound(envelope) => self.dispatch(envelope).await,
                    }
                }
                _ = tick.tick() => {
                    let online = self.online_users().await;
                    self.broadcast(Envelope::users_list(&online)).await;
                }
            }
        }
    }

    // -- presence -----------------------------------------------------------

    /// Bind a connection to its user.  A second registration for the same
    /// user supersedes the first immediately: the old queue is closed, its
    /// peer connection torn down, and it is evicted from its call sessions.
    pub async fn register(self: &Arc<Self>, client: Arc<Client>) {
        let user_id = client.user_id;
        let (superseded, snapshot) = {
            let mut state = self.state.write().await;
            let superseded = state
                .user_clients
                .insert(user_id, client.clone())
                .filter(|prev| prev.session_id != client.session_id);
            let snapshot = state
                .user_statuses
                .entry(user_id)
                .and_modify(|s| {
                    s.status = UserStatus::Online;
                    s.last_seen = Utc::now();
                })
                .or_insert(UserStatusSnapshot {
                    user_id,
                    username: client.username.clone(),
                    status: UserStatus::Online,
                    last_seen: Utc::now(),
                })
                .clone();
            (superseded, snapshot)
        };

        if let Some(previous) = superseded {
            self.supersede(previous).await;
        }

        self.persist_status(user_id, UserStatus::Online).await;
        info!(user_id, username = %client.username, "user connected");
        self.broadcast(Envelope::user_status(&snapshot)).await;

        let online = self.online_users().await;
        if !client.try_send(Envelope::users_list(&online)) {
            // Queue already full at registration: give up on this conn.
            self.unregister(client).await;
        }
    }

    /// Tear down a superseded connection and evict it from its sessions, so
    /// a user never has two parallel media paths.
    async fn supersede(self: &Arc<Self>, previous: Arc<Client>) {
        debug!(user_id = previous.user_id, "superseding previous connection");
        previous.close_queue();
        if let Some(peer) = previous.take_peer().await {
            peer.close().await;
        }
        let sessions = self.sessions_snapshot().await;
        for session in sessions {
            if session.participant(previous.user_id).await.is_some() {
                session.remove_participant(previous.user_id, None).await;
            }
        }
    }

    /// Drop the connection from the live set and start the disconnect
    /// grace timer.  A reconnect within the window keeps the user's place
    /// in their calls.
    pub async fn unregister(self: &Arc<Self>, client: Arc<Client>) {
        let user_id = client.user_id;
        let snapshot = {
            let mut state = self.state.write().await;
            let is_current = state
                .user_clients
                .get(&user_id)
                .is_some_and(|current| current.session_id == client.session_id);
            if !is_current {
                // A superseded conn unwinding late; the live one stays.
                return;
            }
            state.user_clients.remove(&user_id);
            state.disconnected.insert(user_id, client.clone());
            state.user_statuses.get_mut(&user_id).map(|s| {
                s.status = UserStatus::Offline;
                s.last_seen = Utc::now();
                s.clone()
            })
        };

        self.persist_status(user_id, UserStatus::Offline).await;
        if let Some(snapshot) = snapshot {
            self.broadcast(Envelope::user_status(&snapshot)).await;
        }
        info!(user_id, username = %client.username, "user disconnected");

        let hub = Arc::clone(self);
        tokio::spawn(async move {
            tokio::time::sleep(hub.grace_period).await;
            hub.expire_disconnected(client).await;
        });
    }

    /// Grace expiry: re-check under the lock — the entry is gone if a
    /// `reconnect` consumed it, and eviction is skipped if the user is
    /// registered again.
    async fn expire_disconnected(self: &Arc<Self>, client: Arc<Client>) {
        let user_id = client.user_id;
        let (entry_taken, rebound) = {
            let mut state = self.state.write().await;
            match state.disconnected.get(&user_id) {
                Some(entry) if entry.session_id == client.session_id => {
                    state.disconnected.remove(&user_id);
                    (true, state.user_clients.contains_key(&user_id))
                }
                _ => (false, false),
            }
        };
        if !entry_taken {
            return;
        }
        if rebound {
            // The user re-registered without a reconnect envelope; just
            // retire the stale connection.
            client.close_queue();
            if let Some(peer) = client.take_peer().await {
                peer.close().await;
            }
            return;
        }

        debug!(user_id, "disconnect grace expired");
        let sessions = self.sessions_snapshot().await;
        for session in sessions {
            if session.participant(user_id).await.is_none() {
                continue;
            }
            let notice = Envelope::user_leave(session.id, user_id);
            self.finalize_leave(&session, user_id, Some(&notice), false)
                .await;
        }
        client.close_queue();
    }

    /// Non-blocking fan-out to every registered connection; a full queue
    /// severs that client (its write pump terminates on the closed queue).
    pub async fn broadcast(&self, envelope: Envelope) {
        let clients: Vec<Arc<Client>> = {
            let state = self.state.read().await;
            state.user_clients.values().cloned().collect()
        };
        for client in clients {
            if !client.try_send(envelope.clone()) {
                warn!(user_id = client.user_id, "outbound queue full, severing client");
                client.close_queue();
            }
        }
    }

    pub async fn online_users(&self) -> Vec<UserStatusSnapshot> {
        let state = self.state.read().await;
        let mut users: Vec<UserStatusSnapshot> = state
            .user_statuses
            .values()
            .filter(|s| s.status == UserStatus::Online)
            .cloned()
            .collect();
        users.sort_by_key(|s| s.user_id);
        users
    }

    pub async fn check_user_status(&self, user_id: i64) -> Option<UserStatusSnapshot> {
        self.state.read().await.user_statuses.get(&user_id).cloned()
    }

    pub async fn is_user_online(&self, user_id: i64) -> bool {
        self.state.read().await.user_clients.contains_key(&user_id)
    }

    pub async fn client_for(&self, user_id: i64) -> Option<Arc<Client>> {
        self.state.read().await.user_clients.get(&user_id).cloned()
    }

    // -- call sessions ------------------------------------------------------

    /// Runtime companion for a freshly persisted call; the caller's conn
    /// (when registered) is seeded as the first participant.
    pub async fn create_call_session(self: &Arc<Self>, call: CallRecord) -> Arc<CallSession> {
        let caller = self.client_for(call.caller_id).await;
        let session = CallSession::new(call);
        if let Some(caller) = caller {
            session.add_participant(caller).await;
        }
        self.state
            .write()
            .await
            .call_sessions
            .insert(session.id, session.clone());
        session
    }

    pub async fn call_session(&self, call_id: i64) -> Option<Arc<CallSession>> {
        self.state.read().await.call_sessions.get(&call_id).cloned()
    }

    async fn sessions_snapshot(&self) -> Vec<Arc<CallSession>> {
        self.state.read().await.call_sessions.values().cloned().collect()
    }

    // -- inbound dispatch ---------------------------------------------------

    /// One reactor step.  Defensive throughout: missing sessions, missing
    /// users, and malformed payloads are logged and become no-ops.
    pub async fn dispatch(self: &Arc<Self>, envelope: Envelope) {
        let message = match envelope.decode() {
            Ok(message) => message,
            Err(e) => {
                warn!(kind = %envelope.kind, error = %e, "malformed payload dropped");
                return;
            }
        };
        match message {
            SignalMessage::UserOnline | SignalMessage::Other => self.broadcast(envelope).await,
            SignalMessage::IncomingCall(call_ref) => self.handle_incoming_call(call_ref).await,
            SignalMessage::CallOffer(payload) => self.handle_call_offer(payload, false).await,
            SignalMessage::CallAccepted(payload) => self.handle_call_offer(payload, true).await,
            SignalMessage::CallRejected(call_ref) => {
                self.handle_call_rejected(call_ref, envelope).await;
            }
            SignalMessage::UserLeave(call_ref) => self.handle_user_leave(call_ref, envelope).await,
            SignalMessage::AddCallee(call_ref) => self.handle_add_callee(call_ref).await,
            SignalMessage::IceCandidate(payload) => self.handle_ice_candidate(payload).await,
            SignalMessage::TrackUpdate(payload) => self.handle_track_update(payload, envelope).await,
            SignalMessage::Reconnect(payload) => self.handle_reconnect(payload).await,
        }
    }

    /// Ring every online callee, start the caller's negotiation from the
    /// offer carried on the call, and mark the caller busy.
    async fn handle_incoming_call(self: &Arc<Self>, call_ref: CallRef) {
        let Some(session) = self.call_session(call_ref.call_id).await else {
            warn!(call_id = call_ref.call_id, "incoming_call for unknown session");
            return;
        };
        let call = session.call().await;
        let ring = Envelope::incoming_call(&call);

        for callee_id in &call.callee_ids {
            let online = self
                .check_user_status(*callee_id)
                .await
                .is_some_and(|s| s.status == UserStatus::Online);
            if !online {
                debug!(call_id = call.id, callee_id, "callee not online, not ringing");
                continue;
            }
            if let Some(conn) = self.client_for(*callee_id).await {
                if !conn.try_send(ring.clone()) {
                    warn!(call_id = call.id, callee_id, "ring dropped, queue full");
                }
            }
        }

        let Some(caller) = self.client_for(call.caller_id).await else {
            warn!(call_id = call.id, caller_id = call.caller_id, "caller not connected");
            return;
        };
        session.add_participant(caller.clone()).await;

        match call.offer {
            Some(offer) => {
                let hub = Arc::clone(self);
                let call_id = call.id;
                tokio::spawn(async move {
                    caller.process_offer(&hub, offer, call_id).await;
                });
            }
            None => warn!(call_id = call.id, "caller has no offer"),
        }

        self.transition(call.caller_id, UserStatus::Busy).await;
    }

    /// Shared by `call_offer` and `call_accepted`: join the session, start
    /// negotiation from the carried offer, go busy.  Acceptance also moves
    /// a ringing call to ongoing.
    async fn handle_call_offer(self: &Arc<Self>, payload: OfferPayload, accepted: bool) {
        let Some(session) = self.call_session(payload.call_id).await else {
            warn!(call_id = payload.call_id, "offer for unknown session");
            return;
        };
        let Some(conn) = self.client_for(payload.user_id).await else {
            warn!(user_id = payload.user_id, "offer from unknown user");
            return;
        };

        session.add_participant(conn.clone()).await;

        if accepted {
            let call = session
                .update_call(|call| {
                    if call.status == CallStatus::Ringing {
                        call.status = CallStatus::Ongoing;
                    }
                })
                .await;
            if call.status == CallStatus::Ongoing {
                if let Err(e) =
                    repo::calls::set_status(&self.pool, call.id, CallStatus::Ongoing).await
                {
                    warn!(call_id = call.id, error = %e, "call status update failed");
                }
            }
        }

        let hub = Arc::clone(self);
        let call_id = payload.call_id;
        let offer = payload.offer;
        tokio::spawn(async move {
            conn.process_offer(&hub, offer, call_id).await;
        });

        self.transition(payload.user_id, UserStatus::Busy).await;
    }

    /// A callee declined: record the miss, drop them from the session, and
    /// forward the rejection to the caller.  The call collapses to Missed
    /// when only the caller is left.
    async fn handle_call_rejected(self: &Arc<Self>, call_ref: CallRef, envelope: Envelope) {
        let Some(session) = self.call_session(call_ref.call_id).await else {
            warn!(call_id = call_ref.call_id, "rejection for unknown session");
            return;
        };
        let call = session.call().await;

        if let Err(e) = repo::history::insert(
            &self.pool,
            call_ref.user_id,
            call.id,
            CallStatus::Missed,
            "callee",
            Utc::now(),
        )
        .await
        {
            warn!(call_id = call.id, error = %e, "history write failed");
        }

        session.remove_participant(call_ref.user_id, None).await;
        if session.participant_count().await <= 1 {
            self.collapse_session(&session, CallStatus::Missed).await;
        }

        if let Some(caller) = self.client_for(call.caller_id).await {
            if !caller.try_send(envelope) {
                warn!(call_id = call.id, "rejection notice dropped, queue full");
            }
        }
    }

    async fn handle_user_leave(self: &Arc<Self>, call_ref: CallRef, envelope: Envelope) {
        let Some(session) = self.call_session(call_ref.call_id).await else {
            warn!(call_id = call_ref.call_id, "leave for unknown session");
            return;
        };
        self.finalize_leave(&session, call_ref.user_id, Some(&envelope), true)
            .await;
    }

    /// Attach another user to a live call and ring them with the current
    /// call record.
    async fn handle_add_callee(self: &Arc<Self>, call_ref: CallRef) {
        let Some(session) = self.call_session(call_ref.call_id).await else {
            warn!(call_id = call_ref.call_id, "add_callee for unknown session");
            return;
        };
        let Some(conn) = self.client_for(call_ref.user_id).await else {
            warn!(user_id = call_ref.user_id, "add_callee for offline user");
            return;
        };

        session.add_participant(conn.clone()).await;
        let call = session
            .update_call(|call| {
                if !call.callee_ids.contains(&call_ref.user_id) {
                    call.callee_ids.push(call_ref.user_id);
                }
            })
            .await;
        if let Err(e) = repo::calls::add_callee(&self.pool, call.id, call_ref.user_id).await {
            warn!(call_id = call.id, error = %e, "callee persist failed");
        }

        if !conn.try_send(Envelope::incoming_call(&call)) {
            warn!(call_id = call.id, user_id = call_ref.user_id, "ring dropped, queue full");
        }
    }

    /// Route a trickled candidate to the participant's peer connection;
    /// unknown call/user/peer drops silently.
    async fn handle_ice_candidate(&self, payload: IceCandidatePayload) {
        let Some(session) = self.call_session(payload.call_id).await else {
            return;
        };
        let Some(participant) = session.participant(payload.user_id).await else {
            return;
        };
        let Some(peer) = participant.peer().await else {
            return;
        };
        if let Err(e) = peer.add_remote_candidate(&payload.candidate).await {
            debug!(user_id = payload.user_id, error = %e, "ice candidate rejected");
        }
    }

    /// Mute-state changes fan out verbatim to everyone else in the call.
    async fn handle_track_update(&self, payload: TrackUpdatePayload, envelope: Envelope) {
        let Some(session) = self.call_session(payload.call_id).await else {
            return;
        };
        for participant in session.participants().await {
            if participant.user_id == payload.user_id {
                continue;
            }
            if !participant.try_send(envelope.clone()) {
                debug!(user_id = participant.user_id, "track update dropped, queue full");
            }
        }
    }

    /// A user came back inside the grace window: promote the fresh conn,
    /// carry the peer connection over when it survived, and renegotiate.
    async fn handle_reconnect(self: &Arc<Self>, payload: ReconnectPayload) {
        let (previous, current, session) = {
            let mut state = self.state.write().await;
            let Some(previous) = state.disconnected.remove(&payload.user_id) else {
                debug!(user_id = payload.user_id, "reconnect without disconnect entry");
                return;
            };
            let current = state.user_clients.get(&payload.user_id).cloned();
            let session = state.call_sessions.get(&payload.call_id).cloned();
            (previous, current, session)
        };

        let Some(current) = current else {
            warn!(user_id = payload.user_id, "reconnect from unregistered user");
            return;
        };

        if payload.pc_alive {
            if let Some(peer) = previous.take_peer().await {
                current.set_peer(peer).await;
            }
        } else if let Some(peer) = previous.take_peer().await {
            peer.close().await;
        }
        previous.close_queue();

        let Some(session) = session else {
            warn!(call_id = payload.call_id, "reconnect for unknown session");
            return;
        };
        session.add_participant(current.clone()).await;
        info!(user_id = payload.user_id, call_id = payload.call_id, "reconnected into call");

        if payload.pc_alive {
            let session = session.clone();
            tokio::spawn(async move {
                if let Err(e) = session.renegotiate_participant(&current).await {
                    warn!(user_id = current.user_id, error = %e, "reconnect renegotiation failed");
                    return;
                }
                tokio::time::sleep(Duration::from_millis(200)).await;
                session.map_mids_for_participant(&current).await;
            });
        }
    }

    // -- shared call teardown ----------------------------------------------

    /// One participant leaves: history row, removal (with optional notice to
    /// the others), collapse when ≤1 remains, and optionally presence back
    /// to online (not for grace-expired users, who are gone).
    async fn finalize_leave(
        self: &Arc<Self>,
        session: &Arc<CallSession>,
        user_id: i64,
        notice: Option<&Envelope>,
        back_online: bool,
    ) {
        if session.participant(user_id).await.is_none() {
            debug!(call_id = session.id, user_id, "leave from non-participant ignored");
            return;
        }
        let call = session.call().await;
        let role = if user_id == call.caller_id {
            "caller"
        } else {
            "callee"
        };
        if let Err(e) = repo::history::insert(
            &self.pool,
            user_id,
            call.id,
            CallStatus::Ended,
            role,
            Utc::now(),
        )
        .await
        {
            warn!(call_id = call.id, error = %e, "history write failed");
        }

        session.remove_participant(user_id, notice).await;
        if session.participant_count().await <= 1 {
            self.collapse_session(session, CallStatus::Ended).await;
        }

        if back_online {
            self.transition(user_id, UserStatus::Online).await;
        }
    }

    /// ≤1 participant left: write the remaining participant's history row,
    /// finish the call row, close the session, and return survivors to
    /// online.
    async fn collapse_session(self: &Arc<Self>, session: &Arc<CallSession>, terminal: CallStatus) {
        let remaining = session.participants().await;
        let now = Utc::now();
        let call = session
            .update_call(|call| {
                call.status = terminal;
                call.end_time = Some(now);
            })
            .await;

        if let Err(e) = repo::calls::finish(&self.pool, call.id, terminal, now).await {
            warn!(call_id = call.id, error = %e, "call finish persist failed");
        }
        for participant in &remaining {
            let role = if participant.user_id == call.caller_id {
                "caller"
            } else {
                "callee"
            };
            if let Err(e) = repo::history::insert(
                &self.pool,
                participant.user_id,
                call.id,
                terminal,
                role,
                now,
            )
            .await
            {
                warn!(call_id = call.id, error = %e, "history write failed");
            }
        }

        session.close().await;
        self.state.write().await.call_sessions.remove(&session.id);
        info!(call_id = call.id, status = terminal.as_str(), "call session closed");

        for participant in remaining {
            self.transition(participant.user_id, UserStatus::Online).await;
        }
    }

    // -- presence plumbing --------------------------------------------------

    /// In-memory transition + persisted mirror + broadcast.  The store is
    /// write-only during signaling; a failed write is logged and the
    /// in-memory state stays authoritative.
    async fn transition(&self, user_id: i64, status: UserStatus) {
        let snapshot = {
            let mut state = self.state.write().await;
            state.user_statuses.get_mut(&user_id).map(|s| {
                s.status = status;
                s.last_seen = Utc::now();
                s.clone()
            })
        };
        let Some(snapshot) = snapshot else { return };
        self.persist_status(user_id, status).await;
        self.broadcast(Envelope::user_status(&snapshot)).await;
    }

    async fn persist_status(&self, user_id: i64, status: UserStatus) {
        if let Err(e) = repo::users::update_status(&self.pool, user_id, status, Utc::now()).await {
            warn!(user_id, error = %e, "status persist failed");
        }
    }
}
