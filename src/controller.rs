use std::{collections::HashMap, sync::Arc};

use tokio::{
    sync::{mpsc, oneshot},
    task::JoinSet,
};
use tracing::Instrument;

use crate::{
    actor::{self, Actor, ActorError, ActorStatus},
    entity::{GuildId, IdValidationError, VoiceTarget},
    guild::{
        EnqueueRequest, Enqueued, GuildConfig, GuildHandle, GuildStatus, GuildUnavailable,
        Outcome, PlaybackState,
    },
    notify::NotifySink,
    resolver::{ResolutionError, TrackResolver},
    track::TrackDescriptor,
    transport::Transport,
};

/// A guild actor can retire between lookup and delivery; callers look the
/// guild up again this many times before giving up.
const MAX_DELIVERY_ATTEMPTS: usize = 3;

#[derive(thiserror::Error, Debug)]
pub enum ControllerError {
    #[error(transparent)]
    Resolution(#[from] ResolutionError),

    #[error("invalid id: {0}")]
    InvalidId(#[from] IdValidationError),

    #[error("server is busy, please try again later.")]
    ServiceUnavailable,
}

pub enum ControllerMessage {
    /// Returns the guild's live handle, spawning an actor if `create` is set.
    Lookup(GuildId, bool, oneshot::Sender<Option<GuildHandle>>),
    ListGuilds(oneshot::Sender<Vec<GuildId>>),
}

struct GuildEntry {
    handle: GuildHandle,
    generation: u64,
}

/// Responsibilities:
/// * Keep the process-wide registry of guild actors
/// * Spawn guild actors lazily on first enqueue
/// * Forget guild actors once they retire
pub struct ControllerActor {
    id: Arc<String>,
    receiver: mpsc::Receiver<ControllerMessage>,
    transport: Arc<dyn Transport>,
    config: GuildConfig,

    guilds: HashMap<GuildId, GuildEntry>,
    guild_tasks: JoinSet<(GuildId, u64, ActorStatus)>,
    next_generation: u64,
}

impl Actor for ControllerActor {
    type ID = Arc<String>;

    fn kind(&self) -> &'static str {
        "controller"
    }

    fn id(&self) -> Self::ID {
        self.id.clone()
    }

    async fn run(&mut self) -> Result<(), ActorError> {
        loop {
            tokio::select! {
                msg = self.receiver.recv() => {
                    match msg {
                        Some(msg) => self.handle_message(msg),
                        None => break,
                    }
                }

                Some(Ok((guild_id, generation, status))) = self.guild_tasks.join_next() => {
                    self.handle_guild_exited(guild_id, generation, status);
                }
            }
        }
        Ok(())
    }

    async fn post_stop(&mut self) -> Result<(), ActorError> {
        // Dropping the handles closes every guild mailbox; guild actors tear
        // their sessions down and exit.
        self.guilds.clear();
        while let Some(res) = self.guild_tasks.join_next().await {
            if let Err(err) = res {
                tracing::warn!("guild task failed to join: {err}");
            }
        }
        metrics::gauge!("guild_actors_active").set(0.0);
        Ok(())
    }
}

impl ControllerActor {
    fn handle_message(&mut self, msg: ControllerMessage) {
        match msg {
            ControllerMessage::Lookup(guild_id, create, reply) => {
                let handle = if create {
                    Some(self.get_or_create_guild(guild_id))
                } else {
                    self.guilds
                        .get(&guild_id)
                        .map(|e| e.handle.clone())
                        .filter(|h| !h.is_closed())
                };
                let _ = reply.send(handle);
            }
            ControllerMessage::ListGuilds(reply) => {
                let mut ids: Vec<GuildId> = self.guilds.keys().cloned().collect();
                ids.sort();
                let _ = reply.send(ids);
            }
        }
    }

    fn get_or_create_guild(&mut self, guild_id: GuildId) -> GuildHandle {
        if let Some(entry) = self.guilds.get(&guild_id) {
            // A closed handle belongs to an actor that is retiring. It holds no
            // session, so a replacement cannot produce a second one.
            if !entry.handle.is_closed() {
                return entry.handle.clone();
            }
            tracing::debug!(guild = %guild_id, "replacing retired guild actor");
        }

        let generation = self.next_generation;
        self.next_generation += 1;

        let (handle, guild_actor) =
            GuildHandle::new(guild_id.clone(), self.transport.clone(), self.config.clone());
        self.guilds.insert(
            guild_id.clone(),
            GuildEntry {
                handle: handle.clone(),
                generation,
            },
        );
        self.guild_tasks.spawn(
            async move {
                let status = actor::run(guild_actor).await;
                (guild_id, generation, status)
            }
            .in_current_span(),
        );
        metrics::gauge!("guild_actors_active").set(self.guilds.len() as f64);
        handle
    }

    fn handle_guild_exited(&mut self, guild_id: GuildId, generation: u64, status: ActorStatus) {
        tracing::debug!(guild = %guild_id, generation, %status, "guild actor exited");
        let current = self
            .guilds
            .get(&guild_id)
            .is_some_and(|e| e.generation == generation);
        if current {
            self.guilds.remove(&guild_id);
        }
        metrics::gauge!("guild_actors_active").set(self.guilds.len() as f64);
    }
}

/// Entry point for command dispatchers. Cheap to clone.
#[derive(Clone)]
pub struct ControllerHandle {
    sender: mpsc::Sender<ControllerMessage>,
    resolver: Arc<dyn TrackResolver>,
}

impl ControllerHandle {
    pub fn new(
        transport: Arc<dyn Transport>,
        resolver: Arc<dyn TrackResolver>,
        config: GuildConfig,
        id: Arc<String>,
    ) -> (Self, ControllerActor) {
        let (sender, receiver) = mpsc::channel(64);
        let handle = ControllerHandle { sender, resolver };
        let actor = ControllerActor {
            id,
            receiver,
            transport,
            config,
            guilds: HashMap::new(),
            guild_tasks: JoinSet::new(),
            next_generation: 0,
        };
        (handle, actor)
    }

    /// Resolves `input` into tracks and enqueues them. Resolution runs in the
    /// caller's task; its failures leave the queue untouched.
    #[tracing::instrument(skip(self, guild, target, notify), fields(guild = %guild))]
    pub async fn play(
        &self,
        guild: &GuildId,
        input: &str,
        target: VoiceTarget,
        notify: Arc<dyn NotifySink>,
    ) -> Result<(Vec<TrackDescriptor>, Enqueued), ControllerError> {
        let tracks = self.resolver.resolve(input).await?;
        if tracks.is_empty() {
            return Err(ResolutionError::NotFound(input.to_string()).into());
        }
        let enqueued = self.enqueue(guild, tracks.clone(), target, notify).await?;
        Ok((tracks, enqueued))
    }

    /// Appends `tracks` to the guild's queue and starts playback if the guild
    /// is idle.
    pub async fn enqueue(
        &self,
        guild: &GuildId,
        tracks: Vec<TrackDescriptor>,
        target: VoiceTarget,
        notify: Arc<dyn NotifySink>,
    ) -> Result<Enqueued, ControllerError> {
        for _ in 0..MAX_DELIVERY_ATTEMPTS {
            let Some(handle) = self.lookup(guild, true).await? else {
                continue;
            };
            let req = EnqueueRequest {
                tracks: tracks.clone(),
                target: target.clone(),
                notify: notify.clone(),
            };
            match handle.enqueue(req).await {
                Ok(enqueued) => return Ok(enqueued),
                Err(GuildUnavailable) => {
                    tracing::debug!(guild = %guild, "guild actor retired mid-request, retrying");
                }
            }
        }
        Err(ControllerError::ServiceUnavailable)
    }

    pub async fn skip(&self, guild: &GuildId) -> Result<Outcome, ControllerError> {
        self.on_existing(guild, Outcome::Ignored(PlaybackState::Idle), |h| async move {
            h.skip().await
        })
        .await
    }

    pub async fn pause(&self, guild: &GuildId) -> Result<Outcome, ControllerError> {
        self.on_existing(guild, Outcome::Ignored(PlaybackState::Idle), |h| async move {
            h.pause().await
        })
        .await
    }

    pub async fn resume(&self, guild: &GuildId) -> Result<Outcome, ControllerError> {
        self.on_existing(guild, Outcome::Ignored(PlaybackState::Idle), |h| async move {
            h.resume().await
        })
        .await
    }

    pub async fn leave(&self, guild: &GuildId) -> Result<Outcome, ControllerError> {
        self.on_existing(guild, Outcome::Ignored(PlaybackState::Idle), |h| async move {
            h.leave().await
        })
        .await
    }

    /// Titles of the pending tracks, in play order.
    pub async fn list_queue(&self, guild: &GuildId) -> Result<Vec<String>, ControllerError> {
        self.on_existing(guild, Vec::new(), |h| async move { h.list_queue().await })
            .await
    }

    pub async fn status(&self, guild: &GuildId) -> Result<GuildStatus, ControllerError> {
        self.on_existing(guild, GuildStatus::idle(), |h| async move { h.status().await })
            .await
    }

    /// Guilds that currently have a live actor.
    pub async fn guilds(&self) -> Result<Vec<GuildId>, ControllerError> {
        let (tx, rx) = oneshot::channel();
        self.sender
            .send(ControllerMessage::ListGuilds(tx))
            .await
            .map_err(|_| ControllerError::ServiceUnavailable)?;
        rx.await.map_err(|_| ControllerError::ServiceUnavailable)
    }

    /// Runs `op` against the guild's actor. Guilds without an actor are idle
    /// by definition, so `idle` is returned without spawning one.
    async fn on_existing<T, F, Fut>(
        &self,
        guild: &GuildId,
        idle: T,
        op: F,
    ) -> Result<T, ControllerError>
    where
        F: Fn(GuildHandle) -> Fut,
        Fut: Future<Output = Result<T, GuildUnavailable>>,
    {
        for _ in 0..MAX_DELIVERY_ATTEMPTS {
            let Some(handle) = self.lookup(guild, false).await? else {
                return Ok(idle);
            };
            match op(handle).await {
                Ok(value) => return Ok(value),
                Err(GuildUnavailable) => {
                    tracing::debug!(guild = %guild, "guild actor retired mid-request, retrying");
                }
            }
        }
        Err(ControllerError::ServiceUnavailable)
    }

    async fn lookup(
        &self,
        guild: &GuildId,
        create: bool,
    ) -> Result<Option<GuildHandle>, ControllerError> {
        let (tx, rx) = oneshot::channel();
        self.sender
            .send(ControllerMessage::Lookup(guild.clone(), create, tx))
            .await
            .map_err(|_| ControllerError::ServiceUnavailable)?;
        rx.await.map_err(|_| ControllerError::ServiceUnavailable)
    }
}
