//! Versioned resource loader.
//!
//! Loads the rendering library for a given version at most once. While a load
//! is outstanding every caller joins it instead of starting another, so a
//! burst of renders against the same version produces a single fetch.

pub mod fetch;

use std::sync::{
    atomic::{AtomicU64, Ordering},
    Arc, OnceLock,
};

use async_trait::async_trait;
use futures::future::{BoxFuture, FutureExt, Shared};
use parking_lot::Mutex;
use regex::Regex;
use thiserror::Error;
use tracing::{debug, info, warn};

use crate::execution::VersionId;

pub use fetch::HttpScriptFetcher;

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum LoadError {
    #[error("failed to load: {url}: {message}")]
    Fetch { url: String, message: String },
    #[error("{url} did not define the `{entry_point}` entry point")]
    MissingEntryPoint { url: String, entry_point: String },
    #[error("load of {url} was aborted")]
    Aborted { url: String },
}

/// Retrieves the script text behind a URL.
#[async_trait]
pub trait ScriptFetcher: Send + Sync {
    async fn fetch(&self, url: &str) -> Result<String, LoadError>;
}

/// A successfully loaded build of the rendering library.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Resource {
    /// Version asked for.
    pub requested: VersionId,
    /// Version the script reports about itself, else `requested`.
    pub version: VersionId,
    pub url: String,
    pub source: String,
}

impl Resource {
    fn satisfies(&self, required: &str) -> bool {
        self.version == required || self.requested == required
    }
}

type LoadFuture = Shared<BoxFuture<'static, Result<Arc<Resource>, LoadError>>>;

struct InFlight {
    id: u64,
    version: VersionId,
    future: LoadFuture,
}

/// Name of the global a build must define, with the pattern that finds the definition.
#[derive(Clone)]
struct EntryPoint {
    name: String,
    definition: Option<Regex>,
}

impl EntryPoint {
    fn new(name: String) -> Self {
        let escaped = regex::escape(&name);
        let pattern = format!(
            r#"(?:\.\s*{0}|\[\s*["']{0}["']\s*\])\s*=[^=]|\b(?:var|let|const)\s+{0}\s*="#,
            escaped
        );
        Self { definition: Regex::new(&pattern).ok(), name }
    }

    /// Whether `source` assigns the global, e.g. `root.Bokeh = bokeh` or `window["Bokeh"] = ...`.
    fn defined_in(&self, source: &str) -> bool {
        match &self.definition {
            Some(re) => re.is_match(source),
            None => source.contains(&self.name),
        }
    }
}

#[derive(Default)]
struct LoadState {
    loaded: Option<Arc<Resource>>,
    in_flight: Option<InFlight>,
}

pub struct VersionedLoader {
    fetcher: Arc<dyn ScriptFetcher>,
    url_template: String,
    entry_point: EntryPoint,
    state: Arc<Mutex<LoadState>>,
    next_id: AtomicU64,
}

impl VersionedLoader {
    pub fn new(
        fetcher: Arc<dyn ScriptFetcher>,
        url_template: impl Into<String>,
        entry_point: impl Into<String>,
    ) -> Self {
        Self {
            fetcher,
            url_template: url_template.into(),
            entry_point: EntryPoint::new(entry_point.into()),
            state: Arc::new(Mutex::new(LoadState::default())),
            next_id: AtomicU64::new(0),
        }
    }

    pub fn url_for(&self, version: &str) -> String {
        self.url_template.replace("{version}", version)
    }

    /// The currently loaded build, if any.
    pub fn loaded(&self) -> Option<Arc<Resource>> {
        self.state.lock().loaded.clone()
    }

    /// Resolves once a build matching `required` is loaded.
    ///
    /// An outstanding load for another version is awaited first (its failure
    /// is ignored here) and the check repeated. An outstanding load for the
    /// same version is joined, and its failure is returned to every caller
    /// that joined it. Nothing is retried automatically.
    pub async fn ensure_version(&self, required: &str) -> Result<Arc<Resource>, LoadError> {
        loop {
            let (pending, pending_version) = {
                let mut state = self.state.lock();
                if let Some(resource) = state.loaded.as_ref().filter(|r| r.satisfies(required)) {
                    return Ok(resource.clone());
                }
                match &state.in_flight {
                    Some(in_flight) => {
                        debug!(target: "hibiki", required, in_flight = %in_flight.version, "joining in-flight load");
                        (in_flight.future.clone(), in_flight.version.clone())
                    }
                    None => {
                        let in_flight = self.start_load(required);
                        let pending = in_flight.future.clone();
                        state.in_flight = Some(in_flight);
                        (pending, required.to_string())
                    }
                }
            };

            if pending_version == required {
                return pending.await;
            }
            let _ = pending.await;
        }
    }

    // Called with the state lock held; the spawned task records the outcome.
    fn start_load(&self, required: &str) -> InFlight {
        let id = self.next_id.fetch_add(1, Ordering::Relaxed);
        let url = self.url_for(required);
        info!(target: "hibiki", version = required, url = %url, "loading rendering library");

        let fetcher = self.fetcher.clone();
        let state = self.state.clone();
        let entry_point = self.entry_point.clone();
        let requested = required.to_string();
        let task_url = url.clone();
        let task = tokio::spawn(async move {
            let _release = Release { state: state.clone(), id };
            let outcome = load_resource(fetcher.as_ref(), &task_url, &requested, &entry_point).await;
            match &outcome {
                Ok(resource) => {
                    info!(target: "hibiki", version = %resource.version, "rendering library loaded");
                    state.lock().loaded = Some(resource.clone());
                }
                Err(e) => warn!(target: "hibiki", error = %e, "rendering library load failed"),
            }
            outcome
        });

        let future = async move {
            match task.await {
                Ok(outcome) => outcome,
                Err(e) => {
                    warn!(target: "hibiki", url = %url, error = %e, "rendering library load aborted");
                    Err(LoadError::Aborted { url })
                }
            }
        }
        .boxed()
        .shared();

        InFlight { id, version: required.to_string(), future }
    }
}

// Frees the in-flight slot when the load task finishes, panics or is cancelled.
struct Release {
    state: Arc<Mutex<LoadState>>,
    id: u64,
}

impl Drop for Release {
    fn drop(&mut self) {
        let mut state = self.state.lock();
        if state.in_flight.as_ref().is_some_and(|f| f.id == self.id) {
            state.in_flight = None;
        }
    }
}

async fn load_resource(
    fetcher: &dyn ScriptFetcher,
    url: &str,
    requested: &str,
    entry_point: &EntryPoint,
) -> Result<Arc<Resource>, LoadError> {
    let source = fetcher.fetch(url).await?;
    if !entry_point.defined_in(&source) {
        return Err(LoadError::MissingEntryPoint {
            url: url.to_string(),
            entry_point: entry_point.name.clone(),
        });
    }
    let version = reported_version(&source).unwrap_or_else(|| requested.to_string());
    Ok(Arc::new(Resource {
        requested: requested.to_string(),
        version,
        url: url.to_string(),
        source,
    }))
}

/// The `version: "x.y.z"` a build embeds about itself.
pub fn reported_version(source: &str) -> Option<String> {
    static PATTERN: OnceLock<Option<Regex>> = OnceLock::new();
    let re = PATTERN
        .get_or_init(|| {
            Regex::new(r#"\bversion\s*[:=]\s*["'](\d+\.\d+\.\d+[0-9A-Za-z.\-]*)["']"#).ok()
        })
        .as_ref()?;
    Some(re.captures(source)?.get(1)?.as_str().to_string())
}
