//! In-process stand-ins for the voice transport and the track providers.
//!
//! `SimTransport` "plays" a track by waiting out its duration hint on the
//! tokio clock, so tests can drive it with a paused runtime. Every action is
//! recorded as a [`SimEvent`] for later inspection.

use std::{
    collections::{HashMap, HashSet},
    sync::{Arc, Mutex, MutexGuard, PoisonError},
    time::Duration,
};

use futures::{FutureExt, future::BoxFuture};
use tokio::{sync::mpsc, time::Instant};

use crate::{
    entity::{GuildId, VoiceTarget},
    resolver::{LinkPreview, LinkPreviewData, ResolutionError, Search},
    track::TrackDescriptor,
    transport::{Connection, EndReason, Player, PlayerEvents, Transport, TransportError},
};

const DEFAULT_TRACK_DURATION: Duration = Duration::from_secs(180);

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SimEvent {
    Connected { guild: GuildId, target: VoiceTarget },
    Started { guild: GuildId, title: String },
    Paused { guild: GuildId, title: String },
    Resumed { guild: GuildId, title: String },
    Stopped { guild: GuildId, title: String },
    Finished { guild: GuildId, title: String, errored: bool },
    Disconnected { guild: GuildId },
}

#[derive(Default)]
struct SimState {
    events: Vec<SimEvent>,
    fail_connect: HashSet<String>,
    stall_connect: HashSet<String>,
    fail_play: HashSet<String>,
    fail_midway: HashSet<String>,
    last_events: Option<PlayerEvents>,
}

struct SimInner {
    speed: f64,
    state: Mutex<SimState>,
}

#[derive(Clone)]
pub struct SimTransport {
    inner: Arc<SimInner>,
}

impl Default for SimTransport {
    fn default() -> Self {
        Self::new()
    }
}

impl SimTransport {
    pub fn new() -> Self {
        Self::with_speed(1.0)
    }

    /// `speed` > 1 plays tracks faster than real time.
    pub fn with_speed(speed: f64) -> Self {
        Self {
            inner: Arc::new(SimInner {
                speed: if speed > 0.0 { speed } else { 1.0 },
                state: Mutex::new(SimState::default()),
            }),
        }
    }

    pub fn fail_connect(&self, target: &str) {
        self.state().fail_connect.insert(target.to_string());
    }

    /// Connecting to `target` never completes.
    pub fn stall_connect(&self, target: &str) {
        self.state().stall_connect.insert(target.to_string());
    }

    pub fn fail_play(&self, uri: &str) {
        self.state().fail_play.insert(uri.to_string());
    }

    /// The track starts, then errors halfway through.
    pub fn fail_midway(&self, uri: &str) {
        self.state().fail_midway.insert(uri.to_string());
    }

    pub fn events(&self) -> Vec<SimEvent> {
        self.state().events.clone()
    }

    /// Titles in the order they started playing.
    pub fn played(&self) -> Vec<String> {
        self.state()
            .events
            .iter()
            .filter_map(|e| match e {
                SimEvent::Started { title, .. } => Some(title.clone()),
                _ => None,
            })
            .collect()
    }

    pub fn connects(&self) -> usize {
        self.count(|e| matches!(e, SimEvent::Connected { .. }))
    }

    pub fn disconnects(&self) -> usize {
        self.count(|e| matches!(e, SimEvent::Disconnected { .. }))
    }

    /// Completion channel of the most recently started track.
    pub fn last_events(&self) -> Option<PlayerEvents> {
        self.state().last_events.clone()
    }

    fn count(&self, f: impl Fn(&SimEvent) -> bool) -> usize {
        self.state().events.iter().filter(|e| f(e)).count()
    }

    fn record(&self, event: SimEvent) {
        tracing::trace!(?event, "sim transport");
        self.state().events.push(event);
    }

    fn state(&self) -> MutexGuard<'_, SimState> {
        self.inner
            .state
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
    }
}

impl Transport for SimTransport {
    fn connect<'a>(
        &'a self,
        guild: &'a GuildId,
        target: &'a VoiceTarget,
    ) -> BoxFuture<'a, Result<Box<dyn Connection>, TransportError>> {
        async move {
            let (fail, stall) = {
                let state = self.state();
                (
                    state.fail_connect.contains(target.as_str()),
                    state.stall_connect.contains(target.as_str()),
                )
            };
            if stall {
                futures::future::pending::<()>().await;
            }
            if fail {
                return Err(TransportError::Connect {
                    target: target.to_string(),
                    reason: "simulated connect failure".to_string(),
                });
            }

            self.record(SimEvent::Connected {
                guild: guild.clone(),
                target: target.clone(),
            });
            Ok(Box::new(SimConnection {
                transport: self.clone(),
                guild: guild.clone(),
            }) as Box<dyn Connection>)
        }
        .boxed()
    }
}

struct SimConnection {
    transport: SimTransport,
    guild: GuildId,
}

impl Connection for SimConnection {
    fn play<'a>(
        &'a mut self,
        track: &'a TrackDescriptor,
        events: PlayerEvents,
    ) -> BoxFuture<'a, Result<Box<dyn Player>, TransportError>> {
        async move {
            let uri = track.playback_uri();
            let (fail, errored) = {
                let state = self.transport.state();
                (
                    state.fail_play.contains(uri),
                    state.fail_midway.contains(uri),
                )
            };
            if fail {
                return Err(TransportError::Play {
                    uri: uri.to_string(),
                    reason: "simulated stream failure".to_string(),
                });
            }

            let full = track
                .duration_hint()
                .unwrap_or(DEFAULT_TRACK_DURATION)
                .div_f64(self.transport.inner.speed);
            let play_for = if errored { full / 2 } else { full };

            self.transport.state().last_events = Some(events.clone());
            self.transport.record(SimEvent::Started {
                guild: self.guild.clone(),
                title: track.title().to_string(),
            });

            let (ctrl, ctrl_rx) = mpsc::unbounded_channel();
            tokio::spawn(run_player(
                SimPlayback {
                    transport: self.transport.clone(),
                    guild: self.guild.clone(),
                    title: track.title().to_string(),
                    errored,
                    events,
                },
                play_for,
                ctrl_rx,
            ));
            Ok(Box::new(SimPlayer { ctrl }) as Box<dyn Player>)
        }
        .boxed()
    }

    fn disconnect(self: Box<Self>) -> BoxFuture<'static, ()> {
        let SimConnection { transport, guild } = *self;
        async move {
            transport.record(SimEvent::Disconnected { guild });
        }
        .boxed()
    }
}

#[derive(Debug)]
enum PlayerCtrl {
    Pause,
    Resume,
    Stop,
}

struct SimPlayer {
    ctrl: mpsc::UnboundedSender<PlayerCtrl>,
}

impl SimPlayer {
    fn send(&self, ctrl: PlayerCtrl) -> Result<(), TransportError> {
        self.ctrl
            .send(ctrl)
            .map_err(|_| TransportError::Control("player has already finished".to_string()))
    }
}

impl Player for SimPlayer {
    fn pause(&mut self) -> Result<(), TransportError> {
        self.send(PlayerCtrl::Pause)
    }

    fn resume(&mut self) -> Result<(), TransportError> {
        self.send(PlayerCtrl::Resume)
    }

    fn stop(&mut self) -> Result<(), TransportError> {
        self.send(PlayerCtrl::Stop)
    }
}

struct SimPlayback {
    transport: SimTransport,
    guild: GuildId,
    title: String,
    errored: bool,
    events: PlayerEvents,
}

impl SimPlayback {
    fn record(&self, make: impl FnOnce(GuildId, String) -> SimEvent) {
        self.transport
            .record(make(self.guild.clone(), self.title.clone()));
    }
}

/// Plays one track. Exits quietly when the player handle is dropped, which is
/// what happens once the guild has moved past this track.
async fn run_player(
    playback: SimPlayback,
    mut remaining: Duration,
    mut ctrl: mpsc::UnboundedReceiver<PlayerCtrl>,
) {
    let mut paused = false;
    loop {
        if paused {
            match ctrl.recv().await {
                Some(PlayerCtrl::Resume) => {
                    paused = false;
                    playback.record(|guild, title| SimEvent::Resumed { guild, title });
                }
                Some(PlayerCtrl::Pause) => {}
                Some(PlayerCtrl::Stop) => {
                    playback.record(|guild, title| SimEvent::Stopped { guild, title });
                    playback.events.ended(EndReason::Completed);
                    return;
                }
                None => return,
            }
            continue;
        }

        let started = Instant::now();
        tokio::select! {
            _ = tokio::time::sleep(remaining) => {
                let errored = playback.errored;
                playback.record(|guild, title| SimEvent::Finished { guild, title, errored });
                if errored {
                    playback.events.error("simulated stream failure");
                } else {
                    playback.events.ended(EndReason::Completed);
                }
                return;
            }

            cmd = ctrl.recv() => {
                remaining = remaining.saturating_sub(started.elapsed());
                match cmd {
                    Some(PlayerCtrl::Pause) => {
                        paused = true;
                        playback.record(|guild, title| SimEvent::Paused { guild, title });
                    }
                    Some(PlayerCtrl::Resume) => {}
                    Some(PlayerCtrl::Stop) => {
                        playback.record(|guild, title| SimEvent::Stopped { guild, title });
                        playback.events.ended(EndReason::Completed);
                        return;
                    }
                    None => return,
                }
            }
        }
    }
}

/// Title search over an in-memory catalog. Every query word must appear in
/// the title (case-insensitive).
pub struct CatalogSearch {
    tracks: Vec<TrackDescriptor>,
    synthesize_misses: bool,
}

impl CatalogSearch {
    pub fn new(tracks: Vec<TrackDescriptor>) -> Self {
        Self {
            tracks,
            synthesize_misses: false,
        }
    }

    /// Answer unmatched queries with a made-up track instead of nothing.
    pub fn synthesize_misses(mut self, enabled: bool) -> Self {
        self.synthesize_misses = enabled;
        self
    }
}

impl Search for CatalogSearch {
    fn search<'a>(
        &'a self,
        query: &'a str,
    ) -> BoxFuture<'a, Result<Vec<TrackDescriptor>, ResolutionError>> {
        let words: Vec<String> = query.split_whitespace().map(str::to_lowercase).collect();
        let mut hits: Vec<TrackDescriptor> = self
            .tracks
            .iter()
            .filter(|t| {
                let title = t.title().to_lowercase();
                words.iter().all(|w| title.contains(w.as_str()))
            })
            .cloned()
            .collect();

        if hits.is_empty() && self.synthesize_misses && !words.is_empty() {
            let slug = words.join("-");
            hits.push(
                TrackDescriptor::new(query.trim(), format!("sim://search/{slug}"))
                    .with_duration(Duration::from_secs(30)),
            );
        }
        async move { Ok(hits) }.boxed()
    }
}

/// Link previews keyed by the id segment after `/track/`.
#[derive(Default)]
pub struct StaticLinkPreview {
    entries: HashMap<String, LinkPreviewData>,
}

impl StaticLinkPreview {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with(mut self, id: &str, title: &str, artist: &str) -> Self {
        self.entries.insert(
            id.to_string(),
            LinkPreviewData {
                title: title.to_string(),
                artist: artist.to_string(),
            },
        );
        self
    }
}

impl LinkPreview for StaticLinkPreview {
    fn preview<'a>(
        &'a self,
        link: &'a str,
    ) -> BoxFuture<'a, Result<LinkPreviewData, ResolutionError>> {
        let id = link
            .split_once("/track/")
            .map(|(_, rest)| rest.split(['?', '/', '#']).next().unwrap_or_default());
        let res = match id.and_then(|id| self.entries.get(id)) {
            Some(data) => Ok(data.clone()),
            None => Err(ResolutionError::NotFound(link.to_string())),
        };
        async move { res }.boxed()
    }
}

/// A handful of tracks for running the binary without any real provider.
pub fn demo_catalog() -> Vec<TrackDescriptor> {
    [
        ("Bohemian Rhapsody - Queen", 354),
        ("Blue - Joni Mitchell", 180),
        ("Clair de Lune - Debussy", 300),
        ("So What - Miles Davis", 562),
        ("Teardrop - Massive Attack", 330),
    ]
    .into_iter()
    .map(|(title, secs)| {
        let slug = title.to_lowercase().replace(' ', "-");
        TrackDescriptor::new(title, format!("sim://catalog/{slug}"))
            .with_duration(Duration::from_secs(secs))
    })
    .collect()
}

pub fn demo_previews() -> StaticLinkPreview {
    StaticLinkPreview::new()
        .with("4u7EnebtmKWzUH433cf5Qv", "Bohemian Rhapsody", "Queen")
        .with("67Hna13dNDkZvBpTXRIaOJ", "Teardrop", "Massive Attack")
}
