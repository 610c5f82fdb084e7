use futures::future::BoxFuture;
use futures::FutureExt;

use crate::track::TrackDescriptor;

pub const DEFAULT_LINK_MARKER: &str = "spotify.com/track";

#[derive(thiserror::Error, Debug, Clone, PartialEq, Eq)]
pub enum ResolutionError {
    #[error("track provider is unreachable: {0}")]
    Unreachable(String),

    #[error("no track found for {0:?}")]
    NotFound(String),

    #[error("malformed reference {input:?}: {reason}")]
    Malformed { input: String, reason: String },
}

/// Turns raw user input into an ordered list of playable tracks.
///
/// Resolution always runs in the caller's task, never inside a guild actor.
pub trait TrackResolver: Send + Sync {
    fn resolve<'a>(
        &'a self,
        input: &'a str,
    ) -> BoxFuture<'a, Result<Vec<TrackDescriptor>, ResolutionError>>;
}

/// Free-text search against some track provider, best match first.
pub trait Search: Send + Sync {
    fn search<'a>(
        &'a self,
        query: &'a str,
    ) -> BoxFuture<'a, Result<Vec<TrackDescriptor>, ResolutionError>>;
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LinkPreviewData {
    pub title: String,
    pub artist: String,
}

impl LinkPreviewData {
    pub fn search_query(&self) -> String {
        format!("{} {}", self.title, self.artist).trim().to_string()
    }
}

/// Reads title/artist metadata behind a music-service link.
pub trait LinkPreview: Send + Sync {
    fn preview<'a>(
        &'a self,
        link: &'a str,
    ) -> BoxFuture<'a, Result<LinkPreviewData, ResolutionError>>;
}

/// Resolves input through a [`Search`] provider, keeping only the top hit
/// unless `take_all` is set.
pub struct SearchResolver<S> {
    search: S,
    take_all: bool,
}

impl<S: Search> SearchResolver<S> {
    pub fn new(search: S) -> Self {
        Self {
            search,
            take_all: false,
        }
    }

    pub fn take_all(mut self, take_all: bool) -> Self {
        self.take_all = take_all;
        self
    }
}

impl<S: Search> TrackResolver for SearchResolver<S> {
    fn resolve<'a>(
        &'a self,
        input: &'a str,
    ) -> BoxFuture<'a, Result<Vec<TrackDescriptor>, ResolutionError>> {
        async move {
            let query = input.trim();
            if query.is_empty() {
                return Err(ResolutionError::Malformed {
                    input: input.to_string(),
                    reason: "empty query".to_string(),
                });
            }

            let mut hits = self.search.search(query).await?;
            if hits.is_empty() {
                return Err(ResolutionError::NotFound(query.to_string()));
            }
            if !self.take_all {
                hits.truncate(1);
            }
            tracing::debug!(query, hits = hits.len(), "resolved search query");
            Ok(hits)
        }
        .boxed()
    }
}

/// Rewrites music-service links into a "<title> <artist>" query before
/// handing off to the inner resolver. Anything else passes straight through.
pub struct PreviewResolver<P, R> {
    preview: P,
    inner: R,
    marker: String,
}

impl<P: LinkPreview, R: TrackResolver> PreviewResolver<P, R> {
    pub fn new(preview: P, inner: R) -> Self {
        Self::with_marker(preview, inner, DEFAULT_LINK_MARKER)
    }

    pub fn with_marker(preview: P, inner: R, marker: impl Into<String>) -> Self {
        Self {
            preview,
            inner,
            marker: marker.into(),
        }
    }
}

impl<P: LinkPreview, R: TrackResolver> TrackResolver for PreviewResolver<P, R> {
    fn resolve<'a>(
        &'a self,
        input: &'a str,
    ) -> BoxFuture<'a, Result<Vec<TrackDescriptor>, ResolutionError>> {
        async move {
            if !input.contains(self.marker.as_str()) {
                return self.inner.resolve(input).await;
            }

            let data = self.preview.preview(input.trim()).await.map_err(|err| {
                tracing::warn!(link = input, "link preview failed: {err}");
                ResolutionError::Malformed {
                    input: input.to_string(),
                    reason: "could not read link metadata".to_string(),
                }
            })?;
            let query = data.search_query();
            tracing::debug!(link = input, %query, "link rewritten to search query");
            self.inner.resolve(&query).await
        }
        .boxed()
    }
}

impl<T: TrackResolver + ?Sized> TrackResolver for std::sync::Arc<T> {
    fn resolve<'a>(
        &'a self,
        input: &'a str,
    ) -> BoxFuture<'a, Result<Vec<TrackDescriptor>, ResolutionError>> {
        (**self).resolve(input)
    }
}
