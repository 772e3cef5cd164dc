//! Rendering gate: makes sure the right library build is loaded before a plot
//! is embedded into the render target.

pub mod html;

use std::sync::Arc;

use async_trait::async_trait;
use thiserror::Error;
use tracing::debug;

use crate::{
    execution::{PlotArtifact, VersionId},
    loader::{LoadError, Resource, VersionedLoader},
};

pub use html::HtmlFileTarget;

#[derive(Debug, Error)]
pub enum RenderError {
    #[error(transparent)]
    Load(#[from] LoadError),
    #[error("embedding plot into `{target}` failed: {message}")]
    Embed { target: String, message: String },
}

/// Where plots end up.
#[async_trait]
pub trait RenderTarget: Send + Sync {
    fn id(&self) -> &str;
    /// Drops everything previously rendered. Must not block on I/O for long.
    fn clear(&self);
    async fn embed(&self, resource: &Resource, artifact: &PlotArtifact) -> Result<(), RenderError>;
}

pub struct RenderGate {
    loader: Arc<VersionedLoader>,
    target: Arc<dyn RenderTarget>,
    fallback_version: VersionId,
}

impl RenderGate {
    pub fn new(
        loader: Arc<VersionedLoader>,
        target: Arc<dyn RenderTarget>,
        fallback_version: impl Into<VersionId>,
    ) -> Self {
        Self { loader, target, fallback_version: fallback_version.into() }
    }

    /// Clears the target, then embeds `artifact` if there is one.
    pub async fn render(&self, artifact: Option<&PlotArtifact>) -> Result<(), RenderError> {
        self.target.clear();
        let Some(artifact) = artifact else {
            return Ok(());
        };

        let required = self.required_version(artifact);
        let resource = self.loader.ensure_version(&required).await?;
        debug!(target: "hibiki", version = %resource.version, url = %resource.url, target_id = self.target.id(), "embedding plot");
        self.target.embed(&resource, artifact).await
    }

    /// The artifact's own version, else whatever is loaded, else the fallback.
    pub fn required_version(&self, artifact: &PlotArtifact) -> VersionId {
        artifact
            .version
            .clone()
            .filter(|v| !v.is_empty())
            .or_else(|| self.loader.loaded().map(|r| r.version.clone()))
            .unwrap_or_else(|| self.fallback_version.clone())
    }
}

#[cfg(test)]
pub(crate) mod tests {
    use super::*;
    use crate::loader::tests::{loader_with, CountingFetcher};
    use parking_lot::Mutex;
    use serde_json::Map;

    #[derive(Default)]
    pub(crate) struct RecordingTarget {
        pub clears: Mutex<usize>,
        pub embeds: Mutex<Vec<(VersionId, PlotArtifact)>>,
    }

    #[async_trait]
    impl RenderTarget for RecordingTarget {
        fn id(&self) -> &str {
            "bokeh-plot"
        }

        fn clear(&self) {
            *self.clears.lock() += 1;
        }

        async fn embed(&self, resource: &Resource, artifact: &PlotArtifact) -> Result<(), RenderError> {
            self.embeds.lock().push((resource.version.clone(), artifact.clone()));
            Ok(())
        }
    }

    pub(crate) fn plot(version: Option<&str>) -> PlotArtifact {
        let mut payload = Map::new();
        payload.insert("doc".into(), serde_json::json!({ "roots": [] }));
        PlotArtifact { version: version.map(str::to_string), payload }
    }

    fn gate() -> (RenderGate, Arc<CountingFetcher>, Arc<RecordingTarget>) {
        let fetcher = Arc::new(CountingFetcher::new());
        let target = Arc::new(RecordingTarget::default());
        let gate = RenderGate::new(Arc::new(loader_with(fetcher.clone())), target.clone(), "3.3.3");
        (gate, fetcher, target)
    }

    #[tokio::test(start_paused = true)]
    async fn none_only_clears() {
        let (gate, fetcher, target) = gate();
        gate.render(None).await.unwrap();
        assert_eq!(*target.clears.lock(), 1);
        assert!(target.embeds.lock().is_empty());
        assert_eq!(fetcher.count(), 0);
    }

    #[tokio::test(start_paused = true)]
    async fn clears_before_loading() {
        let (gate, _fetcher, target) = gate();
        let artifact = plot(Some("3.4.0"));
        let render = gate.render(Some(&artifact));
        futures::pin_mut!(render);

        // First poll clears synchronously, then parks on the load.
        assert!(futures::poll!(render.as_mut()).is_pending());
        assert_eq!(*target.clears.lock(), 1);
        assert!(target.embeds.lock().is_empty());

        render.await.unwrap();
        assert_eq!(target.embeds.lock()[0].0, "3.4.0");
    }

    #[tokio::test(start_paused = true)]
    async fn version_fallbacks() {
        let (gate, fetcher, target) = gate();

        // Nothing loaded, no metadata: fixed fallback.
        assert_eq!(gate.required_version(&plot(None)), "3.3.3");
        gate.render(Some(&plot(Some("3.4.0")))).await.unwrap();

        // Loaded build wins over the fallback.
        assert_eq!(gate.required_version(&plot(None)), "3.4.0");
        gate.render(Some(&plot(None))).await.unwrap();

        assert_eq!(fetcher.count(), 1);
        assert_eq!(target.embeds.lock().len(), 2);
    }

    #[tokio::test(start_paused = true)]
    async fn load_failure_propagates_after_clearing() {
        let fetcher = Arc::new(CountingFetcher { fail: true, ..CountingFetcher::new() });
        let target = Arc::new(RecordingTarget::default());
        let gate = RenderGate::new(Arc::new(loader_with(fetcher)), target.clone(), "3.3.3");

        let err = gate.render(Some(&plot(Some("3.3.3")))).await.unwrap_err();
        assert!(matches!(err, RenderError::Load(LoadError::Fetch { .. })));
        assert_eq!(*target.clears.lock(), 1);
        assert!(target.embeds.lock().is_empty());
    }
}
