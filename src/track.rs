use std::{fmt, sync::Arc, time::Duration};

/// A resolved, playable unit. Immutable once created; clones share the
/// underlying strings.
#[derive(Clone, PartialEq, Eq, Hash, serde::Serialize)]
pub struct TrackDescriptor {
    title: Arc<str>,
    playback_uri: Arc<str>,
    #[serde(
        skip_serializing_if = "Option::is_none",
        serialize_with = "duration_secs::serialize"
    )]
    duration_hint: Option<Duration>,
}

impl TrackDescriptor {
    pub fn new(title: impl Into<Arc<str>>, playback_uri: impl Into<Arc<str>>) -> Self {
        Self {
            title: title.into(),
            playback_uri: playback_uri.into(),
            duration_hint: None,
        }
    }

    pub fn with_duration(mut self, duration: Duration) -> Self {
        self.duration_hint = Some(duration);
        self
    }

    pub fn title(&self) -> &str {
        &self.title
    }

    pub fn playback_uri(&self) -> &str {
        &self.playback_uri
    }

    pub fn duration_hint(&self) -> Option<Duration> {
        self.duration_hint
    }
}

impl fmt::Debug for TrackDescriptor {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("TrackDescriptor")
            .field("title", &&*self.title)
            .field("uri", &&*self.playback_uri)
            .field("duration", &self.duration_hint)
            .finish()
    }
}

impl fmt::Display for TrackDescriptor {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.title)?;
        if let Some(duration) = self.duration_hint {
            let secs = duration.as_secs();
            write!(f, " ({}:{:02})", secs / 60, secs % 60)?;
        }
        Ok(())
    }
}

mod duration_secs {
    use std::time::Duration;

    pub fn serialize<S: serde::Serializer>(
        value: &Option<Duration>,
        serializer: S,
    ) -> Result<S::Ok, S::Error> {
        match value {
            Some(d) => serializer.serialize_some(&d.as_secs_f64()),
            None => serializer.serialize_none(),
        }
    }
}
