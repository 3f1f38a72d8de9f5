use std::sync::Arc;

use metrics::counter;
use thiserror::Error;
use tracing::{info, warn};

use crate::api::{FetchError, ReportError};
use crate::config::{Config, ConfigError};
use crate::dedup::DedupStore;
use crate::fetcher::{HttpFetcher, PromotedEntitySource};
use crate::metrics_consts::STORAGE_FALLBACK_COUNTER;
use crate::reporter::{AttributionReporter, AttributionSink, HttpSink, PrintSink};
use crate::session::{SessionProvider, StoredSession};
use crate::storage::{FileStorage, MemoryStorage, Storage};
use crate::surface::{AdSurface, Navigator};
use crate::time::SystemTime;
use crate::visibility::VisibilityDetector;

#[derive(Error, Debug)]
pub enum TrackerError {
    #[error("invalid configuration: {0}")]
    Config(#[from] ConfigError),
    #[error("failed to build http client: {0}")]
    HttpClient(#[from] reqwest::Error),
    #[error("failed to set up promoted entity fetcher: {0}")]
    Fetcher(#[from] FetchError),
    #[error("failed to set up attribution sink: {0}")]
    Sink(#[from] ReportError),
}

/// The collaborators every surface shares: one storage scope (through the session
/// provider and the dedup store), one fetcher and one reporter.
///
/// Cloning is cheap and clones share state, so surfaces built from clones of the
/// same tracker dedup against the same partitions.
#[derive(Clone)]
pub struct Tracker {
    source: Arc<dyn PromotedEntitySource>,
    dedup: Arc<DedupStore>,
    session: Arc<dyn SessionProvider>,
    reporter: Arc<AttributionReporter>,
    visibility_threshold: f64,
}

impl Tracker {
    pub fn new(
        source: Arc<dyn PromotedEntitySource>,
        dedup: Arc<DedupStore>,
        session: Arc<dyn SessionProvider>,
        reporter: Arc<AttributionReporter>,
    ) -> Self {
        Self {
            source,
            dedup,
            session,
            reporter,
            visibility_threshold: VisibilityDetector::DEFAULT_THRESHOLD,
        }
    }

    pub fn with_visibility_threshold(mut self, threshold: f64) -> Self {
        self.visibility_threshold = threshold;
        self
    }

    /// Swap where promoted entities come from, keeping storage and reporting.
    pub fn with_source(mut self, source: Arc<dyn PromotedEntitySource>) -> Self {
        self.source = source;
        self
    }

    pub fn from_config(config: &Config) -> Result<Self, TrackerError> {
        config.validate()?;
        let api_base = config.api_base()?;

        let storage = open_storage(config);
        let session = Arc::new(StoredSession::new(storage.clone()));
        let dedup = Arc::new(DedupStore::new(storage));

        let client = reqwest::Client::builder()
            .user_agent("promo-tracker")
            .timeout(config.request_timeout.0)
            .build()?;

        let source = Arc::new(HttpFetcher::new(client.clone(), &api_base)?);
        let sink: Arc<dyn AttributionSink> = if config.print_sink {
            Arc::new(PrintSink {})
        } else {
            Arc::new(HttpSink::new(client, &api_base)?)
        };
        let reporter = Arc::new(AttributionReporter::new(sink, Arc::new(SystemTime {})));

        Ok(Self::new(source, dedup, session, reporter)
            .with_visibility_threshold(config.visibility_threshold))
    }

    pub fn surface(
        &self,
        page_location: impl Into<String>,
        navigator: Arc<dyn Navigator>,
    ) -> AdSurface {
        AdSurface::new(self.clone(), page_location, navigator)
    }

    pub fn source(&self) -> &Arc<dyn PromotedEntitySource> {
        &self.source
    }

    pub fn dedup(&self) -> &Arc<DedupStore> {
        &self.dedup
    }

    pub fn session(&self) -> &Arc<dyn SessionProvider> {
        &self.session
    }

    pub fn reporter(&self) -> &Arc<AttributionReporter> {
        &self.reporter
    }

    pub fn visibility_threshold(&self) -> f64 {
        self.visibility_threshold
    }
}

/// The configured file scope, or memory when there is none or it cannot be opened.
fn open_storage(config: &Config) -> Arc<dyn Storage> {
    let Some(path) = &config.storage_path else {
        info!("no storage path configured, tracking state lives in memory");
        return Arc::new(MemoryStorage::new());
    };

    match FileStorage::open(path) {
        Ok(storage) => {
            info!("tracking state stored at {}", storage.path().display());
            Arc::new(storage)
        }
        Err(e) => {
            warn!(
                "failed to open storage at {}, falling back to memory: {}",
                path.display(),
                e
            );
            counter!(STORAGE_FALLBACK_COUNTER, "store" => "scope").increment(1);
            Arc::new(MemoryStorage::new())
        }
    }
}
