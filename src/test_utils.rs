use std::time::Duration;

use crate::{
    entity::{GuildId, VoiceTarget},
    track::TrackDescriptor,
};

pub fn guild(name: &str) -> GuildId {
    GuildId::new(name).unwrap()
}

pub fn target(name: &str) -> VoiceTarget {
    VoiceTarget::new(name).unwrap()
}

/// A track whose URI is `sim://<title>`, lasting `secs` seconds.
pub fn track(title: &str, secs: u64) -> TrackDescriptor {
    TrackDescriptor::new(title, format!("sim://{title}")).with_duration(Duration::from_secs(secs))
}

/// Lets spawned actors run until they block again.
pub async fn settle() {
    tokio::time::sleep(Duration::from_millis(1)).await;
}
