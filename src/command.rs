//! Chat commands and the dispatcher that turns them into scheduler calls.

use std::{fmt::Write, sync::Arc};

use crate::{
    controller::{ControllerError, ControllerHandle},
    entity::{GuildId, VoiceTarget},
    guild::{Outcome, PlaybackState},
    notify::NotifySink,
    resolver::ResolutionError,
};

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Command {
    Play(String),
    Skip,
    Pause,
    Resume,
    Leave,
    Queue,
    Now,
}

impl Command {
    /// Parses `text` as `<prefix><name> [args]`. Returns `None` for chatter
    /// and unknown commands.
    pub fn parse(prefix: &str, text: &str) -> Option<Command> {
        let body = text.trim_start().strip_prefix(prefix)?;
        let (name, args) = match body.split_once(char::is_whitespace) {
            Some((name, args)) => (name, args.trim()),
            None => (body, ""),
        };

        let cmd = match name.to_ascii_lowercase().as_str() {
            "play" | "p" => Command::Play(args.to_string()),
            "skip" => Command::Skip,
            "pause" => Command::Pause,
            "resume" => Command::Resume,
            "leave" | "stop" => Command::Leave,
            "queue" | "q" => Command::Queue,
            "now" | "np" => Command::Now,
            _ => return None,
        };
        Some(cmd)
    }
}

/// Executes commands on behalf of one chat surface and renders replies.
#[derive(Clone)]
pub struct Dispatcher {
    controller: ControllerHandle,
    prefix: Arc<str>,
}

impl Dispatcher {
    pub fn new(controller: ControllerHandle, prefix: impl Into<Arc<str>>) -> Self {
        Self {
            controller,
            prefix: prefix.into(),
        }
    }

    /// Handles one chat message. Messages that are not commands get no reply.
    pub async fn handle_message(
        &self,
        guild: &GuildId,
        target: Option<VoiceTarget>,
        notify: Arc<dyn NotifySink>,
        text: &str,
    ) -> Option<String> {
        let cmd = Command::parse(&self.prefix, text)?;
        Some(self.execute(guild, target, notify, cmd).await)
    }

    #[tracing::instrument(skip(self, guild, target, notify), fields(guild = %guild))]
    pub async fn execute(
        &self,
        guild: &GuildId,
        target: Option<VoiceTarget>,
        notify: Arc<dyn NotifySink>,
        cmd: Command,
    ) -> String {
        let reply = match cmd {
            Command::Play(query) => return self.play(guild, target, notify, &query).await,
            Command::Skip => self.controller.skip(guild).await.map(|o| match o {
                Outcome::Applied => "skipped".to_string(),
                Outcome::Ignored(_) => "nothing is playing".to_string(),
            }),
            Command::Pause => self.controller.pause(guild).await.map(|o| match o {
                Outcome::Applied => "paused".to_string(),
                Outcome::Ignored(PlaybackState::Paused) => "already paused".to_string(),
                Outcome::Ignored(_) => "nothing is playing".to_string(),
            }),
            Command::Resume => self.controller.resume(guild).await.map(|o| match o {
                Outcome::Applied => "resumed".to_string(),
                Outcome::Ignored(PlaybackState::Playing) => "already playing".to_string(),
                Outcome::Ignored(_) => "nothing is paused".to_string(),
            }),
            Command::Leave => self.controller.leave(guild).await.map(|o| match o {
                Outcome::Applied => "left the voice channel".to_string(),
                Outcome::Ignored(_) => "not connected".to_string(),
            }),
            Command::Queue => self.controller.list_queue(guild).await.map(|titles| {
                if titles.is_empty() {
                    return "the queue is empty".to_string();
                }
                let mut out = String::from("up next:");
                for (i, title) in titles.iter().enumerate() {
                    let _ = write!(out, "\n{}. {title}", i + 1);
                }
                out
            }),
            Command::Now => self.controller.status(guild).await.map(|status| {
                match (status.now_playing, status.state) {
                    (Some(track), PlaybackState::Paused) => format!("paused: {track}"),
                    (Some(track), PlaybackState::Starting) => format!("starting: {track}"),
                    (Some(track), _) => format!("now playing: {track}"),
                    (None, _) => "nothing is playing".to_string(),
                }
            }),
        };
        reply.unwrap_or_else(|err| error_reply(&err))
    }

    async fn play(
        &self,
        guild: &GuildId,
        target: Option<VoiceTarget>,
        notify: Arc<dyn NotifySink>,
        query: &str,
    ) -> String {
        if query.trim().is_empty() {
            return "enter a song name or link".to_string();
        }
        let Some(target) = target else {
            return "join a voice channel first".to_string();
        };

        match self.controller.play(guild, query, target, notify).await {
            Ok((tracks, enqueued)) => {
                let first = tracks[0].title();
                let extra = match tracks.len() {
                    1 => String::new(),
                    n => format!(" (+{} more)", n - 1),
                };
                match enqueued.position {
                    _ if enqueued.starting => format!("starting: {first}{extra}"),
                    Some(pos) => format!("queued at #{pos}: {first}{extra}"),
                    None => format!("queued: {first}{extra}"),
                }
            }
            Err(err) => error_reply(&err),
        }
    }
}

fn error_reply(err: &ControllerError) -> String {
    match err {
        ControllerError::Resolution(ResolutionError::NotFound(_)) => "song not found".to_string(),
        ControllerError::Resolution(ResolutionError::Malformed { .. }) => {
            "could not read the link".to_string()
        }
        ControllerError::Resolution(ResolutionError::Unreachable(_)) => {
            "search is unavailable right now".to_string()
        }
        other => {
            tracing::warn!("command failed: {other}");
            other.to_string()
        }
    }
}
