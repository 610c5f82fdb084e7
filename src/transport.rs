use std::time::Duration;

use futures::future::BoxFuture;
use tokio::sync::mpsc;

use crate::{
    entity::{GuildId, SessionId, VoiceTarget},
    track::TrackDescriptor,
};

#[derive(thiserror::Error, Debug, Clone, PartialEq, Eq)]
pub enum TransportError {
    #[error("failed to connect to {target}: {reason}")]
    Connect { target: String, reason: String },

    #[error("failed to start playback of {uri}: {reason}")]
    Play { uri: String, reason: String },

    #[error("player control failed: {0}")]
    Control(String),

    #[error("timed out after {0:?}")]
    Timeout(Duration),
}

impl TransportError {
    /// Short label used for metrics.
    pub fn stage(&self) -> &'static str {
        match self {
            TransportError::Connect { .. } => "connect",
            TransportError::Play { .. } => "play",
            TransportError::Control(_) => "control",
            TransportError::Timeout(_) => "timeout",
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum EndReason {
    Completed,
    Errored(String),
}

impl EndReason {
    pub fn label(&self) -> &'static str {
        match self {
            EndReason::Completed => "completed",
            EndReason::Errored(_) => "errored",
        }
    }
}

/// Identifies a single `play` call. A guild only acts on signals whose token
/// matches the track it is currently playing.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct PlaybackToken {
    pub session: SessionId,
    pub seq: u64,
}

#[derive(Debug)]
pub struct PlayerSignal {
    pub token: PlaybackToken,
    pub reason: EndReason,
}

/// Completion channel handed to the transport with every `play` call.
///
/// Emitting never blocks and never fails; signals sent after the guild has
/// moved on are dropped by the guild.
#[derive(Debug, Clone)]
pub struct PlayerEvents {
    token: PlaybackToken,
    sender: mpsc::UnboundedSender<PlayerSignal>,
}

impl PlayerEvents {
    pub fn new(token: PlaybackToken, sender: mpsc::UnboundedSender<PlayerSignal>) -> Self {
        Self { token, sender }
    }

    pub fn token(&self) -> &PlaybackToken {
        &self.token
    }

    pub fn ended(&self, reason: EndReason) {
        let _ = self.sender.send(PlayerSignal {
            token: self.token.clone(),
            reason,
        });
    }

    pub fn error(&self, details: impl Into<String>) {
        self.ended(EndReason::Errored(details.into()));
    }
}

/// Establishes voice connections. Implementations wrap the actual audio
/// transport (voice gateway, codec pipeline).
pub trait Transport: Send + Sync {
    fn connect<'a>(
        &'a self,
        guild: &'a GuildId,
        target: &'a VoiceTarget,
    ) -> BoxFuture<'a, Result<Box<dyn Connection>, TransportError>>;
}

/// A live voice connection, exclusively owned by one playback session.
pub trait Connection: Send {
    fn play<'a>(
        &'a mut self,
        track: &'a TrackDescriptor,
        events: PlayerEvents,
    ) -> BoxFuture<'a, Result<Box<dyn Player>, TransportError>>;

    fn disconnect(self: Box<Self>) -> BoxFuture<'static, ()>;
}

/// Controls the track currently streaming on a connection. `stop` must
/// eventually produce an `ended` signal on the track's [`PlayerEvents`].
pub trait Player: Send {
    fn pause(&mut self) -> Result<(), TransportError>;
    fn resume(&mut self) -> Result<(), TransportError>;
    fn stop(&mut self) -> Result<(), TransportError>;
}
