#![allow(dead_code)]

use std::{
    collections::HashMap,
    sync::{Arc, Mutex, MutexGuard},
    time::Duration,
};

use futures::{FutureExt, future::BoxFuture};
use guildcast::{
    actor,
    controller::ControllerHandle,
    entity::{GuildId, VoiceTarget},
    guild::{Enqueued, GuildConfig, PlaybackState},
    resolver::SearchResolver,
    sim::CatalogSearch,
    track::TrackDescriptor,
    transport::{Connection, EndReason, Player, PlayerEvents, Transport, TransportError},
};
use tokio::sync::{mpsc, watch};

pub fn guild(name: &str) -> GuildId {
    GuildId::new(name).unwrap()
}

pub fn target(name: &str) -> VoiceTarget {
    VoiceTarget::new(name).unwrap()
}

pub fn track(title: &str) -> TrackDescriptor {
    TrackDescriptor::new(title, format!("manual://{title}"))
}

pub fn tracks(titles: &[&str]) -> Vec<TrackDescriptor> {
    titles.iter().map(|t| track(t)).collect()
}

/// Lets spawned actors run until they block again. Time is paused in these
/// tests, so this never advances past a real deadline.
pub async fn settle() {
    tokio::time::sleep(Duration::from_millis(1)).await;
}

/// One line per transport call, e.g. `connect g1/vc`, `play g1/A`.
#[derive(Default)]
struct Recording {
    log: Vec<String>,
    /// Per guild: open connections now, and the most ever open at once.
    connections: HashMap<GuildId, (usize, usize)>,
    players: Vec<(GuildId, String, PlayerEvents)>,
    fail_play: Vec<String>,
}

/// Transport whose tracks only end when the test says so.
#[derive(Clone)]
pub struct ManualTransport {
    state: Arc<Mutex<Recording>>,
    connect_gate: watch::Sender<bool>,
}

impl ManualTransport {
    pub fn new() -> Self {
        let (connect_gate, _) = watch::channel(true);
        Self {
            state: Arc::default(),
            connect_gate,
        }
    }

    /// Connect calls block until [`ManualTransport::release_connects`].
    pub fn hold_connects(&self) {
        self.connect_gate.send_replace(false);
    }

    pub fn release_connects(&self) {
        self.connect_gate.send_replace(true);
    }

    pub fn fail_play(&self, title: &str) {
        self.lock().fail_play.push(title.to_string());
    }

    pub fn log(&self) -> Vec<String> {
        self.lock().log.clone()
    }

    pub fn log_for(&self, guild: &GuildId) -> Vec<String> {
        let prefix = format!(" {}/", guild.external());
        self.lock()
            .log
            .iter()
            .filter(|l| l.contains(&prefix))
            .cloned()
            .collect()
    }

    pub fn played(&self, guild: &GuildId) -> Vec<String> {
        let prefix = format!("play {}/", guild.external());
        self.lock()
            .log
            .iter()
            .filter_map(|l| l.strip_prefix(&prefix).map(str::to_string))
            .collect()
    }

    pub fn connects(&self) -> usize {
        self.lock()
            .log
            .iter()
            .filter(|l| l.starts_with("connect "))
            .count()
    }

    pub fn live_connections(&self, guild: &GuildId) -> usize {
        self.lock().connections.get(guild).map_or(0, |(live, _)| *live)
    }

    pub fn max_live_connections(&self, guild: &GuildId) -> usize {
        self.lock().connections.get(guild).map_or(0, |(_, max)| *max)
    }

    /// Events handle of the most recent play of `title` in `guild`.
    pub fn events(&self, guild: &GuildId, title: &str) -> PlayerEvents {
        self.lock()
            .players
            .iter()
            .rev()
            .find(|(g, t, _)| g == guild && t == title)
            .map(|(_, _, events)| events.clone())
            .unwrap_or_else(|| panic!("{title} was never played in {guild}"))
    }

    pub fn finish(&self, guild: &GuildId, title: &str) {
        self.events(guild, title).ended(EndReason::Completed);
    }

    pub fn fail(&self, guild: &GuildId, title: &str) {
        self.events(guild, title).error("stream dropped");
    }

    fn record(&self, line: String) {
        self.lock().log.push(line);
    }

    fn lock(&self) -> MutexGuard<'_, Recording> {
        self.state.lock().unwrap()
    }
}

impl Transport for ManualTransport {
    fn connect<'a>(
        &'a self,
        guild: &'a GuildId,
        target: &'a VoiceTarget,
    ) -> BoxFuture<'a, Result<Box<dyn Connection>, TransportError>> {
        async move {
            let mut gate = self.connect_gate.subscribe();
            gate.wait_for(|open| *open).await.unwrap();

            self.record(format!("connect {}/{}", guild.external(), target));
            {
                let mut state = self.lock();
                let (live, max) = state.connections.entry(guild.clone()).or_default();
                *live += 1;
                *max = (*max).max(*live);
            }

            Ok(Box::new(ManualConnection {
                transport: self.clone(),
                guild: guild.clone(),
            }) as Box<dyn Connection>)
        }
        .boxed()
    }
}

struct ManualConnection {
    transport: ManualTransport,
    guild: GuildId,
}

impl Connection for ManualConnection {
    fn play<'a>(
        &'a mut self,
        track: &'a TrackDescriptor,
        events: PlayerEvents,
    ) -> BoxFuture<'a, Result<Box<dyn Player>, TransportError>> {
        async move {
            let title = track.title().to_string();
            if self.transport.lock().fail_play.contains(&title) {
                self.transport
                    .record(format!("fail {}/{title}", self.guild.external()));
                return Err(TransportError::Play {
                    uri: track.playback_uri().to_string(),
                    reason: "refused".to_string(),
                });
            }

            self.transport
                .record(format!("play {}/{title}", self.guild.external()));
            self.transport
                .lock()
                .players
                .push((self.guild.clone(), title.clone(), events.clone()));
            Ok(Box::new(ManualPlayer {
                transport: self.transport.clone(),
                label: format!("{}/{title}", self.guild.external()),
                events,
            }) as Box<dyn Player>)
        }
        .boxed()
    }

    fn disconnect(self: Box<Self>) -> BoxFuture<'static, ()> {
        let ManualConnection { transport, guild } = *self;
        async move {
            transport.record(format!("disconnect {}/", guild.external()));
            if let Some((live, _)) = transport.lock().connections.get_mut(&guild) {
                *live -= 1;
            }
        }
        .boxed()
    }
}

struct ManualPlayer {
    transport: ManualTransport,
    label: String,
    events: PlayerEvents,
}

impl Player for ManualPlayer {
    fn pause(&mut self) -> Result<(), TransportError> {
        self.transport.record(format!("pause {}", self.label));
        Ok(())
    }

    fn resume(&mut self) -> Result<(), TransportError> {
        self.transport.record(format!("resume {}", self.label));
        Ok(())
    }

    /// Stopping a real player ends the track, which reports back as completed.
    fn stop(&mut self) -> Result<(), TransportError> {
        self.transport.record(format!("stop {}", self.label));
        self.events.ended(EndReason::Completed);
        Ok(())
    }
}

pub struct Harness {
    pub controller: ControllerHandle,
    pub transport: ManualTransport,
    pub notifications: mpsc::UnboundedReceiver<(GuildId, String)>,
    notify: mpsc::UnboundedSender<(GuildId, String)>,
}

impl Harness {
    pub fn new() -> Self {
        Self::with_config(GuildConfig::default())
    }

    pub fn with_config(config: GuildConfig) -> Self {
        let transport = ManualTransport::new();
        let resolver = SearchResolver::new(CatalogSearch::new(vec![]));
        let (controller, controller_actor) = ControllerHandle::new(
            Arc::new(transport.clone()),
            Arc::new(resolver),
            config,
            Arc::new("test".to_string()),
        );
        tokio::spawn(actor::run(controller_actor));

        let (notify, notifications) = mpsc::unbounded_channel();
        Self {
            controller,
            transport,
            notifications,
            notify,
        }
    }

    /// Enqueues `titles` and lets the guild start them.
    pub async fn enqueue(&self, guild: &GuildId, titles: &[&str]) -> Enqueued {
        let enqueued = self
            .controller
            .enqueue(guild, tracks(titles), target("vc"), Arc::new(self.notify.clone()))
            .await
            .unwrap();
        settle().await;
        enqueued
    }

    pub async fn state(&self, guild: &GuildId) -> PlaybackState {
        self.controller.status(guild).await.unwrap().state
    }

    pub async fn now_playing(&self, guild: &GuildId) -> Option<String> {
        self.controller
            .status(guild)
            .await
            .unwrap()
            .now_playing
            .map(|t| t.title().to_string())
    }

    /// Finishes `title` and waits for the guild to react.
    pub async fn finish(&self, guild: &GuildId, title: &str) {
        self.transport.finish(guild, title);
        settle().await;
    }

    pub fn drain_notifications(&mut self) -> Vec<String> {
        let mut out = Vec::new();
        while let Ok((_, msg)) = self.notifications.try_recv() {
            out.push(msg);
        }
        out
    }
}
