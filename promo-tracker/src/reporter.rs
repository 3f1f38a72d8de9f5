use std::future::Future;
use std::sync::Arc;

use async_trait::async_trait;
use metrics::counter;
use tokio::runtime::Handle;
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};
use url::Url;

use crate::api::{ClickEvent, ImpressionEvent, ReportError};
use crate::dedup::EventKind;
use crate::metrics_consts::{
    REPORTS_DISPATCHED_COUNTER, REPORTS_DROPPED_COUNTER, REPORTS_FAILED_COUNTER,
};
use crate::time::TimeSource;
use crate::utils::endpoint_url;

#[async_trait]
pub trait AttributionSink: Send + Sync {
    async fn record_impression(&self, event: ImpressionEvent) -> Result<(), ReportError>;
    async fn record_click(&self, event: ClickEvent) -> Result<(), ReportError>;
}

pub struct PrintSink {}

#[async_trait]
impl AttributionSink for PrintSink {
    async fn record_impression(&self, event: ImpressionEvent) -> Result<(), ReportError> {
        info!("impression: {:?}", event);
        Ok(())
    }

    async fn record_click(&self, event: ClickEvent) -> Result<(), ReportError> {
        info!("click: {:?}", event);
        Ok(())
    }
}

/// Posts JSON events to `{api_base}/impressions` and `{api_base}/clicks`.
pub struct HttpSink {
    client: reqwest::Client,
    impressions: Url,
    clicks: Url,
}

impl HttpSink {
    pub fn new(client: reqwest::Client, api_base: &Url) -> Result<Self, ReportError> {
        Ok(Self {
            client,
            impressions: endpoint_url(api_base, "impressions")?,
            clicks: endpoint_url(api_base, "clicks")?,
        })
    }
}

#[async_trait]
impl AttributionSink for HttpSink {
    async fn record_impression(&self, event: ImpressionEvent) -> Result<(), ReportError> {
        self.client
            .post(self.impressions.clone())
            .json(&event)
            .send()
            .await?
            .error_for_status()?;
        Ok(())
    }

    async fn record_click(&self, event: ClickEvent) -> Result<(), ReportError> {
        self.client
            .post(self.clicks.clone())
            .json(&event)
            .send()
            .await?
            .error_for_status()?;
        Ok(())
    }
}

/// Fire-and-forget front of an [`AttributionSink`].
///
/// Every report runs as a detached task on the current tokio runtime. Failures are
/// logged at debug level and counted, never retried and never returned. The
/// handle is only there for callers that want to wait for delivery to settle;
/// dropping it leaves the task running.
pub struct AttributionReporter {
    sink: Arc<dyn AttributionSink>,
    timesource: Arc<dyn TimeSource + Send + Sync>,
}

impl AttributionReporter {
    pub fn new(
        sink: Arc<dyn AttributionSink>,
        timesource: Arc<dyn TimeSource + Send + Sync>,
    ) -> Self {
        Self { sink, timesource }
    }

    pub fn report_impression(
        &self,
        entity_id: &str,
        page_location: &str,
        session_id: &str,
        referrer: Option<&str>,
    ) -> Option<JoinHandle<()>> {
        let event = ImpressionEvent {
            entity_id: entity_id.to_owned(),
            page_location: page_location.to_owned(),
            session_id: session_id.to_owned(),
            referrer: referrer.map(str::to_owned),
            timestamp: self.timesource.current_time(),
        };
        let sink = self.sink.clone();

        Self::dispatch(EventKind::Impression, async move {
            sink.record_impression(event).await
        })
    }

    pub fn report_click(
        &self,
        entity_id: &str,
        page_location: &str,
        session_id: &str,
    ) -> Option<JoinHandle<()>> {
        let event = ClickEvent {
            entity_id: entity_id.to_owned(),
            page_location: page_location.to_owned(),
            session_id: session_id.to_owned(),
            timestamp: self.timesource.current_time(),
        };
        let sink = self.sink.clone();

        Self::dispatch(EventKind::Click, async move { sink.record_click(event).await })
    }

    fn dispatch<F>(kind: EventKind, delivery: F) -> Option<JoinHandle<()>>
    where
        F: Future<Output = Result<(), ReportError>> + Send + 'static,
    {
        let runtime = match Handle::try_current() {
            Ok(runtime) => runtime,
            Err(e) => {
                warn!("no async runtime, dropping {} report: {}", kind, e);
                counter!(REPORTS_DROPPED_COUNTER, "kind" => kind.as_str()).increment(1);
                return None;
            }
        };

        counter!(REPORTS_DISPATCHED_COUNTER, "kind" => kind.as_str()).increment(1);

        Some(runtime.spawn(async move {
            if let Err(e) = delivery.await {
                debug!("{} report failed: {}", kind, e);
                counter!(REPORTS_FAILED_COUNTER, "kind" => kind.as_str()).increment(1);
            }
        }))
    }
}
