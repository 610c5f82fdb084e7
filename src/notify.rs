use tokio::sync::mpsc;

use crate::entity::GuildId;

/// Fire-and-forget channel back to the users of a guild.
pub trait NotifySink: Send + Sync {
    fn notify(&self, guild: &GuildId, message: &str);
}

/// Writes notifications to the log. Used when no chat channel is attached.
#[derive(Debug, Default, Clone, Copy)]
pub struct LogNotifier;

impl NotifySink for LogNotifier {
    fn notify(&self, guild: &GuildId, message: &str) {
        tracing::info!(guild = %guild, "{message}");
    }
}

impl NotifySink for mpsc::UnboundedSender<(GuildId, String)> {
    fn notify(&self, guild: &GuildId, message: &str) {
        if self.send((guild.clone(), message.to_string())).is_err() {
            tracing::debug!(guild = %guild, "notification dropped, receiver is gone");
        }
    }
}
