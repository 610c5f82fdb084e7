use std::{fmt::Display, sync::Arc, time::Duration};

use tokio::{
    sync::{mpsc, oneshot},
    task::JoinSet,
};
use tracing::Instrument;

use crate::{
    actor::{Actor, ActorError},
    entity::{GuildId, SessionId, VoiceTarget},
    notify::NotifySink,
    queue::TrackQueue,
    track::TrackDescriptor,
    transport::{
        Connection, EndReason, Player, PlayerEvents, PlayerSignal, PlaybackToken, Transport,
        TransportError,
    },
};

#[derive(Debug, Clone)]
pub struct GuildConfig {
    /// Upper bound for establishing a connection or starting a track.
    pub connect_timeout: Duration,
    /// How long an idle guild keeps its actor before retiring it.
    pub idle_timeout: Duration,
    pub mailbox: usize,
}

impl Default for GuildConfig {
    fn default() -> Self {
        Self {
            connect_timeout: Duration::from_secs(10),
            idle_timeout: Duration::from_secs(30),
            mailbox: 32,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, serde::Serialize)]
#[serde(rename_all = "snake_case")]
pub enum PlaybackState {
    Idle,
    Starting,
    Playing,
    Paused,
}

/// Result of a control command. Commands that do not apply to the current
/// state are ignored rather than rejected: racing pause/resume/skip requests
/// from several users are normal.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Outcome {
    Applied,
    Ignored(PlaybackState),
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Enqueued {
    pub added: usize,
    /// 1-based queue position of the first added track.
    pub position: Option<usize>,
    /// Whether this request moved the guild out of `Idle`.
    pub starting: bool,
}

#[derive(Debug, Clone, serde::Serialize)]
pub struct GuildStatus {
    pub state: PlaybackState,
    pub now_playing: Option<TrackDescriptor>,
    pub queued: Vec<TrackDescriptor>,
}

impl GuildStatus {
    pub fn idle() -> Self {
        Self {
            state: PlaybackState::Idle,
            now_playing: None,
            queued: Vec::new(),
        }
    }
}

pub struct EnqueueRequest {
    pub tracks: Vec<TrackDescriptor>,
    pub target: VoiceTarget,
    pub notify: Arc<dyn NotifySink>,
}

pub enum GuildMessage {
    Enqueue(EnqueueRequest, oneshot::Sender<Enqueued>),
    Skip(oneshot::Sender<Outcome>),
    Pause(oneshot::Sender<Outcome>),
    Resume(oneshot::Sender<Outcome>),
    Leave(oneshot::Sender<Outcome>),
    ListQueue(oneshot::Sender<Vec<String>>),
    Status(oneshot::Sender<GuildStatus>),
}

/// Live resources of a guild's current playback. Only ever owned by the
/// guild's actor.
struct Session {
    id: SessionId,
    target: VoiceTarget,
    notify: Arc<dyn NotifySink>,
    /// `None` while a start task holds it, or before the first connect.
    connection: Option<Box<dyn Connection>>,
    player: Option<Box<dyn Player>>,
    /// Track being started or played.
    current: Option<TrackDescriptor>,
    token: Option<PlaybackToken>,
    /// The current track reported its end before its start completed.
    ended_early: bool,
    /// Dropping it tells the pending start task that nobody waits for it.
    pending_start: Option<oneshot::Sender<()>>,
    seq: u64,
}

impl Session {
    fn new(target: VoiceTarget, notify: Arc<dyn NotifySink>) -> Self {
        Self {
            id: SessionId::new(),
            target,
            notify,
            connection: None,
            player: None,
            current: None,
            token: None,
            ended_early: false,
            pending_start: None,
            seq: 0,
        }
    }

    fn next_token(&mut self) -> PlaybackToken {
        self.seq += 1;
        PlaybackToken {
            session: self.id.clone(),
            seq: self.seq,
        }
    }

    /// Forgets the finished track. Its player is dropped without `stop`.
    fn clear_track(&mut self) {
        self.player = None;
        self.current = None;
        self.token = None;
        self.ended_early = false;
        self.pending_start = None;
    }
}

/// Connect (when needed) and play for one track, off the actor's task.
struct StartJob {
    transport: Arc<dyn Transport>,
    guild_id: GuildId,
    target: VoiceTarget,
    connection: Option<Box<dyn Connection>>,
    track: TrackDescriptor,
    events: PlayerEvents,
    limit: Duration,
    abandoned: oneshot::Receiver<()>,
}

struct StartOutcome {
    token: PlaybackToken,
    track: TrackDescriptor,
    /// Handed back whenever one exists, even if `play` failed.
    connection: Option<Box<dyn Connection>>,
    result: Result<Box<dyn Player>, TransportError>,
}

impl StartJob {
    async fn run(self) -> StartOutcome {
        let StartJob {
            transport,
            guild_id,
            target,
            connection,
            track,
            events,
            limit,
            mut abandoned,
        } = self;
        let token = events.token().clone();

        let connected = match connection {
            Some(connection) => Ok(connection),
            None => {
                tokio::select! {
                    biased;
                    _ = &mut abandoned => Err(TransportError::Control("start abandoned".to_string())),
                    res = with_timeout(limit, transport.connect(&guild_id, &target)) => res,
                }
            }
        };
        let mut connection = match connected {
            Ok(connection) => connection,
            Err(err) => {
                return StartOutcome {
                    token,
                    track,
                    connection: None,
                    result: Err(err),
                };
            }
        };

        if matches!(abandoned.try_recv(), Err(oneshot::error::TryRecvError::Closed)) {
            return StartOutcome {
                token,
                track,
                connection: Some(connection),
                result: Err(TransportError::Control("start abandoned".to_string())),
            };
        }
        let result = with_timeout(limit, connection.play(&track, events)).await;
        StartOutcome {
            token,
            track,
            connection: Some(connection),
            result,
        }
    }
}

/// Responsibilities:
/// * Own the guild's track queue
/// * Enforce at most one playback session for the guild
/// * Advance the queue on completion or failure, through one code path
/// * Apply user commands in arrival order, also while a track is starting
/// * Retire itself after staying idle for `idle_timeout`
pub struct GuildActor {
    guild_id: GuildId,
    config: GuildConfig,
    transport: Arc<dyn Transport>,
    receiver: mpsc::Receiver<GuildMessage>,
    signal_sender: mpsc::UnboundedSender<PlayerSignal>,
    signal_receiver: mpsc::UnboundedReceiver<PlayerSignal>,
    starts: JoinSet<StartOutcome>,

    queue: TrackQueue,
    state: PlaybackState,
    session: Option<Session>,
}

impl Actor for GuildActor {
    type ID = GuildId;

    fn kind(&self) -> &'static str {
        "guild"
    }

    fn id(&self) -> Self::ID {
        self.guild_id.clone()
    }

    async fn run(&mut self) -> Result<(), ActorError> {
        loop {
            let idle = self.is_idle();
            tokio::select! {
                biased;

                Some(signal) = self.signal_receiver.recv() => {
                    self.on_track_ended(signal).await;
                }

                Some(res) = self.starts.join_next() => {
                    match res {
                        Ok(outcome) => self.on_started(outcome).await,
                        Err(err) => return Err(ActorError::LogicError(format!("start task failed: {err}"))),
                    }
                }

                msg = self.receiver.recv() => {
                    match msg {
                        Some(msg) => self.handle_message(msg).await,
                        None => break,
                    }
                }

                _ = tokio::time::sleep(self.config.idle_timeout), if idle => {
                    tracing::info!("guild has been idle for {:?}, retiring", self.config.idle_timeout);
                    break;
                }
            }
        }

        Ok(())
    }

    async fn post_stop(&mut self) -> Result<(), ActorError> {
        // Anything still buffered was addressed to a retiring actor. Dropping
        // the reply senders tells callers to look the guild up again.
        self.receiver.close();
        let mut dropped = 0;
        while self.receiver.try_recv().is_ok() {
            dropped += 1;
        }
        if dropped > 0 {
            tracing::debug!(dropped, "bounced messages sent during retirement");
        }

        self.queue.clear();
        self.end_session("shutdown").await;
        while let Some(res) = self.starts.join_next().await {
            if let Ok(outcome) = res {
                release(outcome).await;
            }
        }
        Ok(())
    }
}

impl GuildActor {
    fn is_idle(&self) -> bool {
        self.state == PlaybackState::Idle && self.queue.is_empty() && self.starts.is_empty()
    }

    async fn handle_message(&mut self, msg: GuildMessage) {
        match msg {
            GuildMessage::Enqueue(req, reply) => {
                let added = req.tracks.len();
                let position = self.queue.enqueue(req.tracks);
                let starting = self.session.is_none() && position.is_some();
                tracing::debug!(added, ?position, "enqueued tracks");
                let _ = reply.send(Enqueued {
                    added,
                    position,
                    starting,
                });

                self.ensure_started(req.target, req.notify).await;
            }
            GuildMessage::Skip(reply) => {
                let _ = reply.send(self.skip());
            }
            GuildMessage::Pause(reply) => {
                let _ = reply.send(self.pause());
            }
            GuildMessage::Resume(reply) => {
                let _ = reply.send(self.resume());
            }
            GuildMessage::Leave(reply) => {
                let outcome = self.leave().await;
                let _ = reply.send(outcome);
            }
            GuildMessage::ListQueue(reply) => {
                let _ = reply.send(self.queue.titles());
            }
            GuildMessage::Status(reply) => {
                let _ = reply.send(GuildStatus {
                    state: self.state,
                    now_playing: self.session.as_ref().and_then(|s| s.current.clone()),
                    queued: self.queue.peek_all(),
                });
            }
        }
    }

    /// Starts a session if none exists and there is something to play.
    async fn ensure_started(&mut self, target: VoiceTarget, notify: Arc<dyn NotifySink>) {
        if self.session.is_some() {
            debug_assert_ne!(self.state, PlaybackState::Idle);
            return;
        }
        if self.queue.is_empty() {
            return;
        }

        let session = Session::new(target, notify);
        tracing::info!(session = %session.id, target = %session.target, "opening session");
        self.session = Some(session);
        metrics::gauge!("sessions_active").increment(1.0);
        self.advance().await;
    }

    /// Shared handler for natural completion, playback errors and skips.
    async fn on_track_ended(&mut self, signal: PlayerSignal) {
        let Some(session) = self.session.as_mut() else {
            tracing::debug!(token = ?signal.token, "ignoring completion signal, no session");
            return;
        };
        if session.token.as_ref() != Some(&signal.token) || session.ended_early {
            tracing::debug!(token = ?signal.token, "ignoring stale completion signal");
            return;
        }

        match &signal.reason {
            EndReason::Completed => tracing::debug!(token = ?signal.token, "track completed"),
            EndReason::Errored(details) => {
                tracing::warn!(token = ?signal.token, "track errored: {details}")
            }
        }
        metrics::counter!("tracks_ended_total", "reason" => signal.reason.label()).increment(1);

        if session.player.is_none() {
            // Still starting; the start outcome finishes the job.
            session.ended_early = true;
            return;
        }
        session.clear_track();
        self.advance().await;
    }

    /// Dequeues the next track and hands it to a start task. An exhausted
    /// queue closes the session.
    async fn advance(&mut self) {
        let limit = self.config.connect_timeout;
        let Some(session) = self.session.as_mut() else {
            return;
        };
        let Some(track) = self.queue.dequeue_next() else {
            self.end_session("queue exhausted").await;
            return;
        };

        let token = session.next_token();
        let (pending_start, abandoned) = oneshot::channel();
        session.current = Some(track.clone());
        session.token = Some(token.clone());
        session.pending_start = Some(pending_start);
        let job = StartJob {
            transport: self.transport.clone(),
            guild_id: self.guild_id.clone(),
            target: session.target.clone(),
            connection: session.connection.take(),
            track,
            events: PlayerEvents::new(token, self.signal_sender.clone()),
            limit,
            abandoned,
        };
        self.starts.spawn(job.run().in_current_span());
        self.set_state(PlaybackState::Starting);
    }

    /// Installs a started track, or moves past one that failed. Outcomes
    /// for a track the guild no longer waits on are released.
    async fn on_started(&mut self, outcome: StartOutcome) {
        let Some(session) = self
            .session
            .as_mut()
            .filter(|s| s.token.as_ref() == Some(&outcome.token))
        else {
            tracing::debug!(token = ?outcome.token, "releasing abandoned start");
            release(outcome).await;
            return;
        };

        session.connection = outcome.connection;
        session.pending_start = None;
        match outcome.result {
            Ok(player) if session.ended_early => {
                drop(player);
                session.clear_track();
            }
            Ok(player) => {
                session.player = Some(player);
                self.set_state(PlaybackState::Playing);
                metrics::counter!("tracks_started_total").increment(1);
                if let Some(session) = &self.session {
                    session
                        .notify
                        .notify(&self.guild_id, &format!("Now playing: {}", outcome.track));
                }
                return;
            }
            Err(err) => {
                tracing::warn!(title = outcome.track.title(), "skipping track: {err}");
                metrics::counter!("transport_failures_total", "stage" => err.stage())
                    .increment(1);
                session.clear_track();
            }
        }
        self.advance().await;
    }

    fn skip(&mut self) -> Outcome {
        if !matches!(self.state, PlaybackState::Playing | PlaybackState::Paused) {
            return self.ignored("skip");
        }
        let Some(session) = self.session.as_mut() else {
            return self.ignored("skip");
        };

        let stopped = match session.player.as_mut() {
            Some(player) => player.stop(),
            None => Err(TransportError::Control("no player".to_string())),
        };
        if let Err(err) = stopped {
            // The transport will not report the end, so report it ourselves
            // through the same channel.
            tracing::warn!("stop failed, advancing anyway: {err}");
            if let Some(token) = session.token.clone() {
                let _ = self.signal_sender.send(PlayerSignal {
                    token,
                    reason: EndReason::Errored(err.to_string()),
                });
            }
        }
        tracing::info!("skip requested");
        Outcome::Applied
    }

    fn pause(&mut self) -> Outcome {
        if self.state != PlaybackState::Playing {
            return self.ignored("pause");
        }
        match self.with_player(|player| player.pause()) {
            Ok(()) => {
                self.set_state(PlaybackState::Paused);
                Outcome::Applied
            }
            Err(err) => {
                tracing::warn!("pause failed: {err}");
                Outcome::Ignored(self.state)
            }
        }
    }

    fn resume(&mut self) -> Outcome {
        if self.state != PlaybackState::Paused {
            return self.ignored("resume");
        }
        match self.with_player(|player| player.resume()) {
            Ok(()) => {
                self.set_state(PlaybackState::Playing);
                Outcome::Applied
            }
            Err(err) => {
                tracing::warn!("resume failed: {err}");
                Outcome::Ignored(self.state)
            }
        }
    }

    async fn leave(&mut self) -> Outcome {
        let dropped = self.queue.clear();
        let had_session = self.session.is_some();
        self.end_session("leave").await;

        if had_session || dropped > 0 {
            tracing::info!(dropped, "left voice channel");
            Outcome::Applied
        } else {
            self.ignored("leave")
        }
    }

    /// Releases the session's resources and returns to `Idle`. Signals and
    /// start outcomes still in flight for the session no longer match any
    /// token and are ignored.
    async fn end_session(&mut self, reason: &str) {
        let Some(mut session) = self.session.take() else {
            return;
        };

        if let Some(mut player) = session.player.take() {
            if let Err(err) = player.stop() {
                tracing::debug!("stop during teardown failed: {err}");
            }
        }
        if let Some(connection) = session.connection.take() {
            connection.disconnect().await;
        }

        self.set_state(PlaybackState::Idle);
        metrics::gauge!("sessions_active").decrement(1.0);
        tracing::info!(session = %session.id, reason, "session closed");
    }

    fn with_player<F>(&mut self, f: F) -> Result<(), TransportError>
    where
        F: FnOnce(&mut dyn Player) -> Result<(), TransportError>,
    {
        match self.session.as_mut().and_then(|s| s.player.as_mut()) {
            Some(player) => f(&mut **player),
            None => Err(TransportError::Control("no player".to_string())),
        }
    }

    fn ignored(&self, command: &str) -> Outcome {
        tracing::debug!(state = ?self.state, command, "command does not apply, ignoring");
        Outcome::Ignored(self.state)
    }

    fn set_state(&mut self, to: PlaybackState) {
        if self.state != to {
            tracing::info!(from = ?self.state, to = ?to, "playback state changed");
            self.state = to;
        }
    }
}

/// Tears down what an abandoned start produced.
async fn release(outcome: StartOutcome) {
    if let Ok(mut player) = outcome.result {
        if let Err(err) = player.stop() {
            tracing::debug!("stop of abandoned player failed: {err}");
        }
    }
    if let Some(connection) = outcome.connection {
        connection.disconnect().await;
    }
}

async fn with_timeout<T>(
    limit: Duration,
    fut: impl Future<Output = Result<T, TransportError>>,
) -> Result<T, TransportError> {
    tokio::time::timeout(limit, fut)
        .await
        .map_err(|_| TransportError::Timeout(limit))?
}

#[derive(thiserror::Error, Debug, Clone, Copy, PartialEq, Eq)]
#[error("guild actor is no longer running")]
pub struct GuildUnavailable;

#[derive(Clone)]
pub struct GuildHandle {
    sender: mpsc::Sender<GuildMessage>,
    pub guild_id: GuildId,
}

impl GuildHandle {
    pub fn new(
        guild_id: GuildId,
        transport: Arc<dyn Transport>,
        config: GuildConfig,
    ) -> (Self, GuildActor) {
        let (sender, receiver) = mpsc::channel(config.mailbox.max(1));
        let (signal_sender, signal_receiver) = mpsc::unbounded_channel();
        let handle = GuildHandle {
            sender,
            guild_id: guild_id.clone(),
        };
        let actor = GuildActor {
            guild_id,
            config,
            transport,
            receiver,
            signal_sender,
            signal_receiver,
            starts: JoinSet::new(),
            queue: TrackQueue::new(),
            state: PlaybackState::Idle,
            session: None,
        };
        (handle, actor)
    }

    /// True once the actor has stopped accepting messages.
    pub fn is_closed(&self) -> bool {
        self.sender.is_closed()
    }

    pub async fn enqueue(&self, req: EnqueueRequest) -> Result<Enqueued, GuildUnavailable> {
        self.request(|reply| GuildMessage::Enqueue(req, reply)).await
    }

    pub async fn skip(&self) -> Result<Outcome, GuildUnavailable> {
        self.request(GuildMessage::Skip).await
    }

    pub async fn pause(&self) -> Result<Outcome, GuildUnavailable> {
        self.request(GuildMessage::Pause).await
    }

    pub async fn resume(&self) -> Result<Outcome, GuildUnavailable> {
        self.request(GuildMessage::Resume).await
    }

    pub async fn leave(&self) -> Result<Outcome, GuildUnavailable> {
        self.request(GuildMessage::Leave).await
    }

    pub async fn list_queue(&self) -> Result<Vec<String>, GuildUnavailable> {
        self.request(GuildMessage::ListQueue).await
    }

    pub async fn status(&self) -> Result<GuildStatus, GuildUnavailable> {
        self.request(GuildMessage::Status).await
    }

    async fn request<T>(
        &self,
        make: impl FnOnce(oneshot::Sender<T>) -> GuildMessage,
    ) -> Result<T, GuildUnavailable> {
        let (tx, rx) = oneshot::channel();
        self.sender
            .send(make(tx))
            .await
            .map_err(|_| GuildUnavailable)?;
        rx.await.map_err(|_| GuildUnavailable)
    }
}

impl Display for GuildHandle {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        Display::fmt(&self.guild_id, f)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{
        actor,
        sim::{SimEvent, SimTransport},
        test_utils::{guild, settle, target, track},
    };

    fn spawn_guild(transport: &SimTransport) -> GuildHandle {
        let config = GuildConfig {
            idle_timeout: Duration::from_secs(3600),
            ..Default::default()
        };
        let (handle, actor) = GuildHandle::new(guild("g1"), Arc::new(transport.clone()), config);
        tokio::spawn(actor::run(actor));
        handle
    }

    fn request(
        tracks: Vec<TrackDescriptor>,
    ) -> (EnqueueRequest, mpsc::UnboundedReceiver<(GuildId, String)>) {
        let (tx, rx) = mpsc::unbounded_channel();
        (
            EnqueueRequest {
                tracks,
                target: target("vc"),
                notify: Arc::new(tx),
            },
            rx,
        )
    }

    #[tokio::test(start_paused = true)]
    async fn plays_in_fifo_order_then_goes_idle() {
        let transport = SimTransport::new();
        let handle = spawn_guild(&transport);

        let (req, mut notes) = request(vec![track("A", 10), track("B", 10), track("C", 10)]);
        let enqueued = handle.enqueue(req).await.unwrap();
        assert_eq!(
            enqueued,
            Enqueued {
                added: 3,
                position: Some(1),
                starting: true
            }
        );

        tokio::time::sleep(Duration::from_secs(35)).await;

        assert_eq!(transport.played(), vec!["A", "B", "C"]);
        assert_eq!(transport.connects(), 1);
        assert_eq!(handle.status().await.unwrap().state, PlaybackState::Idle);
        assert!(
            transport
                .events()
                .iter()
                .any(|e| matches!(e, SimEvent::Disconnected { .. }))
        );

        let mut announced = Vec::new();
        while let Ok((_, msg)) = notes.try_recv() {
            announced.push(msg);
        }
        assert_eq!(
            announced,
            vec![
                "Now playing: A (0:10)",
                "Now playing: B (0:10)",
                "Now playing: C (0:10)"
            ]
        );
    }

    #[tokio::test(start_paused = true)]
    async fn enqueue_while_playing_does_not_restart() {
        let transport = SimTransport::new();
        let handle = spawn_guild(&transport);

        let (req, _notes) = request(vec![track("A", 10)]);
        handle.enqueue(req).await.unwrap();
        let (req, _notes2) = request(vec![track("B", 10)]);
        let enqueued = handle.enqueue(req).await.unwrap();
        assert_eq!(enqueued.position, Some(1));
        assert!(!enqueued.starting);

        assert_eq!(handle.list_queue().await.unwrap(), vec!["B"]);
        tokio::time::sleep(Duration::from_secs(25)).await;
        assert_eq!(transport.played(), vec!["A", "B"]);
        assert_eq!(transport.connects(), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn errored_track_advances_to_next() {
        let transport = SimTransport::new();
        transport.fail_midway("sim://A");
        let handle = spawn_guild(&transport);

        let (req, _notes) = request(vec![track("A", 10), track("B", 10)]);
        handle.enqueue(req).await.unwrap();

        tokio::time::sleep(Duration::from_secs(6)).await;
        let status = handle.status().await.unwrap();
        assert_eq!(status.state, PlaybackState::Playing);
        assert_eq!(status.now_playing.unwrap().title(), "B");
    }

    #[tokio::test(start_paused = true)]
    async fn single_errored_track_returns_to_idle() {
        let transport = SimTransport::new();
        transport.fail_midway("sim://A");
        let handle = spawn_guild(&transport);

        let (req, _notes) = request(vec![track("A", 10)]);
        handle.enqueue(req).await.unwrap();
        tokio::time::sleep(Duration::from_secs(6)).await;

        assert_eq!(handle.status().await.unwrap().state, PlaybackState::Idle);
        assert_eq!(transport.disconnects(), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn play_failure_moves_on_without_reconnecting() {
        let transport = SimTransport::new();
        transport.fail_play("sim://A");
        let handle = spawn_guild(&transport);

        let (req, _notes) = request(vec![track("A", 10), track("B", 10)]);
        handle.enqueue(req).await.unwrap();
        settle().await;

        let status = handle.status().await.unwrap();
        assert_eq!(status.state, PlaybackState::Playing);
        assert_eq!(status.now_playing.unwrap().title(), "B");
        assert_eq!(transport.connects(), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn connect_timeout_is_treated_as_failure() {
        let transport = SimTransport::new();
        transport.stall_connect("vc");
        let handle = spawn_guild(&transport);

        let (req, _notes) = request(vec![track("A", 10), track("B", 10)]);
        handle.enqueue(req).await.unwrap();

        // The actor keeps answering while the connect hangs.
        let status = handle.status().await.unwrap();
        assert_eq!(status.state, PlaybackState::Starting);
        assert_eq!(status.now_playing.unwrap().title(), "A");
        assert_eq!(status.queued.len(), 1);

        // Each candidate waits out the connect timeout, then is dropped.
        tokio::time::sleep(Duration::from_secs(25)).await;
        let status = handle.status().await.unwrap();
        assert_eq!(status.state, PlaybackState::Idle);
        assert!(status.queued.is_empty());
        assert!(transport.played().is_empty());
    }

    #[tokio::test(start_paused = true)]
    async fn pause_resume_keeps_current_track() {
        let transport = SimTransport::new();
        let handle = spawn_guild(&transport);

        let (req, _notes) = request(vec![track("A", 10), track("B", 10)]);
        handle.enqueue(req).await.unwrap();

        tokio::time::sleep(Duration::from_secs(4)).await;
        assert_eq!(handle.pause().await.unwrap(), Outcome::Applied);
        assert_eq!(
            handle.pause().await.unwrap(),
            Outcome::Ignored(PlaybackState::Paused)
        );

        // Paused time does not count towards the track.
        tokio::time::sleep(Duration::from_secs(60)).await;
        let status = handle.status().await.unwrap();
        assert_eq!(status.state, PlaybackState::Paused);
        assert_eq!(status.now_playing.unwrap().title(), "A");

        assert_eq!(handle.resume().await.unwrap(), Outcome::Applied);
        assert_eq!(
            handle.resume().await.unwrap(),
            Outcome::Ignored(PlaybackState::Playing)
        );
        let status = handle.status().await.unwrap();
        assert_eq!(status.state, PlaybackState::Playing);
        assert_eq!(status.now_playing.unwrap().title(), "A");

        tokio::time::sleep(Duration::from_secs(17)).await;
        assert_eq!(transport.played(), vec!["A", "B"]);
    }

    #[tokio::test(start_paused = true)]
    async fn commands_on_idle_guild_are_ignored() {
        let transport = SimTransport::new();
        let handle = spawn_guild(&transport);

        let idle = Outcome::Ignored(PlaybackState::Idle);
        assert_eq!(handle.pause().await.unwrap(), idle);
        assert_eq!(handle.resume().await.unwrap(), idle);
        assert_eq!(handle.skip().await.unwrap(), idle);
        assert_eq!(handle.leave().await.unwrap(), idle);
        assert!(transport.events().is_empty());
    }

    #[tokio::test(start_paused = true)]
    async fn skip_goes_through_completion_path() {
        let transport = SimTransport::new();
        let handle = spawn_guild(&transport);

        let (req, _notes) = request(vec![track("A", 100), track("B", 100)]);
        handle.enqueue(req).await.unwrap();
        settle().await;

        assert_eq!(handle.skip().await.unwrap(), Outcome::Applied);
        settle().await;
        let status = handle.status().await.unwrap();
        assert_eq!(status.now_playing.unwrap().title(), "B");
        assert!(
            transport
                .events()
                .iter()
                .any(|e| matches!(e, SimEvent::Stopped { title, .. } if title == "A"))
        );
    }

    #[tokio::test(start_paused = true)]
    async fn skip_while_paused_advances() {
        let transport = SimTransport::new();
        let handle = spawn_guild(&transport);

        let (req, _notes) = request(vec![track("A", 100), track("B", 100)]);
        handle.enqueue(req).await.unwrap();
        settle().await;
        handle.pause().await.unwrap();
        assert_eq!(handle.skip().await.unwrap(), Outcome::Applied);
        settle().await;

        let status = handle.status().await.unwrap();
        assert_eq!(status.state, PlaybackState::Playing);
        assert_eq!(status.now_playing.unwrap().title(), "B");
    }

    #[tokio::test(start_paused = true)]
    async fn leave_clears_queue_and_ignores_stale_signals() {
        let transport = SimTransport::new();
        let handle = spawn_guild(&transport);

        let (req, _notes) = request(vec![track("A", 100), track("B", 100)]);
        handle.enqueue(req).await.unwrap();
        settle().await;
        let stale = transport.last_events().unwrap();

        assert_eq!(handle.leave().await.unwrap(), Outcome::Applied);
        assert!(handle.list_queue().await.unwrap().is_empty());

        stale.ended(EndReason::Completed);
        stale.error("late failure");
        tokio::time::sleep(Duration::from_secs(1)).await;

        let status = handle.status().await.unwrap();
        assert_eq!(status.state, PlaybackState::Idle);
        assert!(status.now_playing.is_none());
        assert_eq!(transport.played(), vec!["A"]);
        assert_eq!(transport.connects(), 1);
        assert_eq!(
            handle.leave().await.unwrap(),
            Outcome::Ignored(PlaybackState::Idle)
        );
    }

    #[tokio::test(start_paused = true)]
    async fn duplicate_end_signals_advance_once() {
        let transport = SimTransport::new();
        let handle = spawn_guild(&transport);

        let (req, _notes) = request(vec![track("A", 100), track("B", 100), track("C", 100)]);
        handle.enqueue(req).await.unwrap();
        settle().await;
        let events = transport.last_events().unwrap();
        events.error("first");
        events.ended(EndReason::Errored("second".to_string()));
        settle().await;

        let status = handle.status().await.unwrap();
        assert_eq!(status.now_playing.unwrap().title(), "B");
        assert_eq!(status.queued.len(), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn leave_does_not_wait_for_a_hanging_connect() {
        let transport = SimTransport::new();
        transport.stall_connect("vc");
        let handle = spawn_guild(&transport);

        let (req, _notes) = request(vec![track("A", 10), track("B", 10)]);
        handle.enqueue(req).await.unwrap();
        settle().await;

        let before = tokio::time::Instant::now();
        assert_eq!(
            handle.skip().await.unwrap(),
            Outcome::Ignored(PlaybackState::Starting)
        );
        assert_eq!(handle.leave().await.unwrap(), Outcome::Applied);
        assert_eq!(before.elapsed(), Duration::ZERO);
        let status = handle.status().await.unwrap();
        assert_eq!(status.state, PlaybackState::Idle);
        assert!(status.now_playing.is_none());
        assert!(status.queued.is_empty());

        // The abandoned start times out later and changes nothing.
        tokio::time::sleep(Duration::from_secs(11)).await;
        let status = handle.status().await.unwrap();
        assert_eq!(status.state, PlaybackState::Idle);
        assert!(status.now_playing.is_none());
        assert!(transport.played().is_empty());
    }

    #[tokio::test(start_paused = true)]
    async fn idle_actor_retires() {
        let transport = SimTransport::new();
        let config = GuildConfig {
            idle_timeout: Duration::from_secs(5),
            ..Default::default()
        };
        let (handle, actor) = GuildHandle::new(guild("g1"), Arc::new(transport.clone()), config);
        let task = tokio::spawn(actor::run(actor));

        tokio::time::sleep(Duration::from_secs(6)).await;
        assert_eq!(task.await.unwrap(), actor::ActorStatus::ShutDown);
        assert!(handle.is_closed());
        assert_eq!(handle.status().await.unwrap_err(), GuildUnavailable);
    }
}
