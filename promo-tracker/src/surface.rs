//! The ad surface: one placement of promoted slots on a page.
//!
//! ```text
//! Idle --mount--> Loading --fetch done--> Rendered --unmount--> Unmounted
//!                    ^                        |
//!                    +--page location change--+
//! ```
//!
//! A failed fetch still lands in `Rendered`, just with no slots. While rendered,
//! layout snapshots drive impressions and clicks drive click reports plus
//! navigation. Both go through the same sequence: claim the id in the dedup store,
//! then hand the report to the reporter. The claim is synchronous and happens
//! before the report task exists, so a second signal for the same id always sees
//! the mark, whether or not the first report has finished.
use std::sync::Arc;

use metrics::counter;
use tokio::task::JoinHandle;
use tracing::{debug, instrument, warn};

use crate::api::PromotedEntity;
use crate::dedup::EventKind;
use crate::metrics_consts::{
    DEDUP_SKIPPED_COUNTER, FETCH_FAILURES_COUNTER, NAVIGATIONS_COUNTER, SLOTS_RENDERED_COUNTER,
};
use crate::tracker::Tracker;
use crate::visibility::{LayoutSnapshot, SlotTag, VisibilityDetector};

/// Routing boundary. Receives the detail path of a clicked entity.
pub trait Navigator: Send + Sync {
    fn navigate(&self, path: &str);
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum SurfaceState {
    Idle,
    Loading,
    Rendered,
    Unmounted,
}

pub struct AdSurface {
    tracker: Tracker,
    navigator: Arc<dyn Navigator>,
    page_location: String,
    referrer: Option<String>,
    state: SurfaceState,
    slots: Vec<PromotedEntity>,
    detector: VisibilityDetector,
    in_flight: Vec<JoinHandle<()>>,
}

impl AdSurface {
    pub fn new(
        tracker: Tracker,
        page_location: impl Into<String>,
        navigator: Arc<dyn Navigator>,
    ) -> Self {
        let detector = VisibilityDetector::new(tracker.visibility_threshold());
        Self {
            tracker,
            navigator,
            page_location: page_location.into(),
            referrer: None,
            state: SurfaceState::Idle,
            slots: Vec::new(),
            detector,
            in_flight: Vec::new(),
        }
    }

    /// The page URL reported alongside impressions.
    pub fn with_referrer(mut self, referrer: impl Into<String>) -> Self {
        self.referrer = Some(referrer.into());
        self
    }

    pub fn state(&self) -> SurfaceState {
        self.state
    }

    pub fn page_location(&self) -> &str {
        &self.page_location
    }

    pub fn slots(&self) -> &[PromotedEntity] {
        &self.slots
    }

    /// Slots still waiting for their first visibility signal.
    pub fn observed_count(&self) -> usize {
        self.detector.observed_count()
    }

    pub async fn mount(&mut self) {
        match self.state {
            // Still `Loading` means an earlier mount was dropped mid-fetch.
            SurfaceState::Idle | SurfaceState::Loading => self.load().await,
            SurfaceState::Unmounted => debug!("ignoring mount of an unmounted surface"),
            _ => debug!("surface already mounted"),
        }
    }

    /// Switch placement. Drops every slot and observation of the previous one and
    /// fetches afresh.
    pub async fn set_page_location(&mut self, page_location: impl Into<String>) {
        let page_location = page_location.into();
        if self.state == SurfaceState::Unmounted {
            return;
        }
        if page_location == self.page_location && self.state == SurfaceState::Rendered {
            return;
        }

        self.page_location = page_location;
        self.load().await;
    }

    #[instrument(skip_all, fields(page_location = %self.page_location))]
    async fn load(&mut self) {
        self.detector.disconnect();
        self.slots.clear();
        self.state = SurfaceState::Loading;

        let entities = match self
            .tracker
            .source()
            .promoted_entities(&self.page_location)
            .await
        {
            Ok(entities) => entities,
            Err(e) => {
                warn!("promoted entities unavailable, rendering none: {}", e);
                counter!(FETCH_FAILURES_COUNTER).increment(1);
                Vec::new()
            }
        };

        let mut detector = VisibilityDetector::new(self.tracker.visibility_threshold());
        for (slot, entity) in entities.iter().enumerate() {
            detector.observe(SlotTag {
                slot,
                entity_id: entity.id.clone(),
                page_location: self.page_location.clone(),
            });
        }

        counter!(SLOTS_RENDERED_COUNTER).increment(entities.len() as u64);
        debug!(slots = entities.len(), "surface rendered");

        self.detector = detector;
        self.slots = entities;
        self.state = SurfaceState::Rendered;
    }

    /// Feed the current geometry. Every slot crossing the threshold for the first
    /// time runs its impression flow.
    pub fn on_layout(&mut self, layout: &LayoutSnapshot) {
        if self.state != SurfaceState::Rendered {
            return;
        }

        for signal in self.detector.evaluate(layout) {
            self.track(EventKind::Impression, &signal.tag.entity_id);
        }
    }

    /// User activation of a slot. The click is reported at most once per session
    /// and page location; navigation happens every time regardless.
    pub fn click(&mut self, slot: usize) {
        if self.state != SurfaceState::Rendered {
            return;
        }
        let Some(entity) = self.slots.get(slot) else {
            debug!(slot, "click on unknown slot");
            return;
        };
        let entity_id = entity.id.clone();
        let path = entity.detail_path();

        self.track(EventKind::Click, &entity_id);

        counter!(NAVIGATIONS_COUNTER).increment(1);
        self.navigator.navigate(&path);
    }

    fn track(&mut self, kind: EventKind, entity_id: &str) {
        if !self
            .tracker
            .dedup()
            .claim(&self.page_location, kind, entity_id)
        {
            debug!(entity_id, %kind, "already tracked this session");
            counter!(DEDUP_SKIPPED_COUNTER, "kind" => kind.as_str()).increment(1);
            return;
        }

        let session_id = self.tracker.session().get_or_create_session_id();
        let reporter = self.tracker.reporter();
        let handle = match kind {
            EventKind::Impression => reporter.report_impression(
                entity_id,
                &self.page_location,
                &session_id,
                self.referrer.as_deref(),
            ),
            EventKind::Click => reporter.report_click(entity_id, &self.page_location, &session_id),
        };

        self.in_flight.retain(|h| !h.is_finished());
        self.in_flight.extend(handle);
    }

    /// Stop observing. Later layouts and clicks are ignored; reports already sent
    /// keep running in the background.
    pub fn unmount(&mut self) {
        self.detector.disconnect();
        self.slots.clear();
        self.state = SurfaceState::Unmounted;
    }

    /// Wait for every report this surface dispatched to finish.
    pub async fn settle(&mut self) {
        for handle in self.in_flight.drain(..) {
            if let Err(e) = handle.await {
                debug!("report task ended abnormally: {}", e);
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Mutex;
    use std::time::Duration;

    use async_trait::async_trait;

    use crate::api::{ClickEvent, EntityKind, FetchError, ImpressionEvent, ReportError};
    use crate::dedup::DedupStore;
    use crate::fetcher::{PromotedEntitySource, StaticSource};
    use crate::reporter::{AttributionReporter, AttributionSink};
    use crate::session::{FixedSession, SessionProvider, StoredSession};
    use crate::storage::{MemoryStorage, Storage, UnavailableStorage};
    use crate::time::FixedTime;
    use crate::visibility::Rect;

    #[derive(Clone, Default)]
    struct MemorySink {
        impressions: Arc<Mutex<Vec<ImpressionEvent>>>,
        clicks: Arc<Mutex<Vec<ClickEvent>>>,
    }

    impl MemorySink {
        fn impressions(&self) -> Vec<ImpressionEvent> {
            self.impressions.lock().unwrap().clone()
        }

        fn clicks(&self) -> Vec<ClickEvent> {
            self.clicks.lock().unwrap().clone()
        }
    }

    #[async_trait]
    impl AttributionSink for MemorySink {
        async fn record_impression(&self, event: ImpressionEvent) -> Result<(), ReportError> {
            self.impressions.lock().unwrap().push(event);
            Ok(())
        }

        async fn record_click(&self, event: ClickEvent) -> Result<(), ReportError> {
            self.clicks.lock().unwrap().push(event);
            Ok(())
        }
    }

    /// Counts attempts, delivers nothing.
    #[derive(Clone, Default)]
    struct FailSink {
        attempts: Arc<Mutex<usize>>,
    }

    #[async_trait]
    impl AttributionSink for FailSink {
        async fn record_impression(&self, _event: ImpressionEvent) -> Result<(), ReportError> {
            *self.attempts.lock().unwrap() += 1;
            Err(ReportError::Unavailable("network down".to_string()))
        }

        async fn record_click(&self, _event: ClickEvent) -> Result<(), ReportError> {
            *self.attempts.lock().unwrap() += 1;
            Err(ReportError::Unavailable("network down".to_string()))
        }
    }

    struct FailingSource;

    #[async_trait]
    impl PromotedEntitySource for FailingSource {
        async fn promoted_entities(
            &self,
            _page_location: &str,
        ) -> Result<Vec<PromotedEntity>, FetchError> {
            Err(FetchError::DecodingError(
                serde_json::from_str::<Vec<PromotedEntity>>("<html>").unwrap_err(),
            ))
        }
    }

    /// Stalls on its first fetch, answers every later one straight away.
    struct StallFirstSource {
        calls: Mutex<usize>,
    }

    #[async_trait]
    impl PromotedEntitySource for StallFirstSource {
        async fn promoted_entities(
            &self,
            _page_location: &str,
        ) -> Result<Vec<PromotedEntity>, FetchError> {
            let first = {
                let mut calls = self.calls.lock().unwrap();
                *calls += 1;
                *calls == 1
            };
            if first {
                tokio::time::sleep(Duration::from_secs(5)).await;
            }
            Ok(catalogue())
        }
    }

    #[derive(Default)]
    struct RecordingNavigator {
        visited: Mutex<Vec<String>>,
    }

    impl RecordingNavigator {
        fn visited(&self) -> Vec<String> {
            self.visited.lock().unwrap().clone()
        }
    }

    impl Navigator for RecordingNavigator {
        fn navigate(&self, path: &str) {
            self.visited.lock().unwrap().push(path.to_owned());
        }
    }

    fn entity(id: &str, kind: EntityKind) -> PromotedEntity {
        PromotedEntity {
            id: id.to_string(),
            kind,
            title: format!("Featured {id}"),
            ..Default::default()
        }
    }

    fn catalogue() -> Vec<PromotedEntity> {
        vec![
            entity("V1", EntityKind::Vehicle),
            entity("J1", EntityKind::Job),
            entity("S1", EntityKind::Supplier),
        ]
    }

    fn tracker_with(
        source: Arc<dyn PromotedEntitySource>,
        storage: Arc<dyn Storage>,
        session: Arc<dyn SessionProvider>,
        sink: Arc<dyn AttributionSink>,
    ) -> Tracker {
        let reporter = AttributionReporter::new(
            sink,
            Arc::new(FixedTime {
                time: "2024-03-01T10:00:00Z".to_string(),
            }),
        );
        Tracker::new(
            source,
            Arc::new(DedupStore::new(storage)),
            session,
            Arc::new(reporter),
        )
    }

    fn tracker(sink: Arc<dyn AttributionSink>) -> Tracker {
        tracker_with(
            Arc::new(StaticSource::new(catalogue())),
            Arc::new(MemoryStorage::new()),
            Arc::new(FixedSession("session-1".to_string())),
            sink,
        )
    }

    fn viewport() -> Rect {
        Rect::new(0.0, 0.0, 1200.0, 800.0)
    }

    /// Slot `slot` with 60% of its 100px height on screen.
    fn sixty_percent(slot: usize) -> LayoutSnapshot {
        LayoutSnapshot::new(viewport()).with_slot(slot, Rect::new(0.0, 740.0, 300.0, 100.0))
    }

    fn scrolled_away(slot: usize) -> LayoutSnapshot {
        LayoutSnapshot::new(viewport()).with_slot(slot, Rect::new(0.0, -900.0, 300.0, 100.0))
    }

    #[tokio::test]
    async fn mount_renders_and_observes_every_slot() {
        let tracker = tracker(Arc::new(MemorySink::default()));
        let mut surface = tracker.surface("landing", Arc::new(RecordingNavigator::default()));
        assert_eq!(surface.state(), SurfaceState::Idle);

        surface.mount().await;

        assert_eq!(surface.state(), SurfaceState::Rendered);
        assert_eq!(surface.slots().len(), 3);
        assert_eq!(surface.observed_count(), 3);
    }

    #[tokio::test]
    async fn impression_reported_once_per_session() {
        let sink = MemorySink::default();
        let tracker = tracker(Arc::new(sink.clone()));
        let mut surface = tracker
            .surface("landing", Arc::new(RecordingNavigator::default()))
            .with_referrer("https://market.example/");
        surface.mount().await;

        surface.on_layout(&sixty_percent(0));
        surface.on_layout(&scrolled_away(0));
        surface.on_layout(&sixty_percent(0));
        surface.settle().await;

        assert_eq!(
            sink.impressions(),
            vec![ImpressionEvent {
                entity_id: "V1".to_string(),
                page_location: "landing".to_string(),
                session_id: "session-1".to_string(),
                referrer: Some("https://market.example/".to_string()),
                timestamp: "2024-03-01T10:00:00Z".to_string(),
            }]
        );
        assert!(sink.clicks().is_empty());
    }

    #[tokio::test]
    async fn below_threshold_is_not_an_impression() {
        let sink = MemorySink::default();
        let tracker = tracker(Arc::new(sink.clone()));
        let mut surface = tracker.surface("landing", Arc::new(RecordingNavigator::default()));
        surface.mount().await;

        // 40px of 100px on screen.
        let layout = LayoutSnapshot::new(viewport())
            .with_slot(0, Rect::new(0.0, 760.0, 300.0, 100.0));
        surface.on_layout(&layout);
        surface.settle().await;

        assert!(sink.impressions().is_empty());
        assert_eq!(surface.observed_count(), 3);
    }

    #[tokio::test]
    async fn remount_does_not_report_again() {
        let sink = MemorySink::default();
        let tracker = tracker(Arc::new(sink.clone()));
        let navigator = Arc::new(RecordingNavigator::default());

        let mut first = tracker.surface("landing", navigator.clone());
        first.mount().await;
        first.on_layout(&sixty_percent(0));
        first.click(1);
        first.settle().await;
        first.unmount();

        let mut second = tracker.surface("landing", navigator.clone());
        second.mount().await;
        assert_eq!(second.slots().len(), 3);
        second.on_layout(&sixty_percent(0));
        second.click(1);
        second.settle().await;

        assert_eq!(sink.impressions().len(), 1);
        assert_eq!(sink.clicks().len(), 1);
        // Navigation is never deduplicated.
        assert_eq!(navigator.visited(), vec!["/jobs/J1", "/jobs/J1"]);
    }

    #[tokio::test]
    async fn click_without_impression_navigates_and_reports_once() {
        let sink = MemorySink::default();
        let tracker = tracker(Arc::new(sink.clone()));
        let navigator = Arc::new(RecordingNavigator::default());
        let mut surface = tracker.surface("landing", navigator.clone());
        surface.mount().await;

        surface.click(0);
        surface.settle().await;

        assert_eq!(sink.clicks().len(), 1);
        assert_eq!(sink.clicks()[0].entity_id, "V1");
        assert!(sink.impressions().is_empty());
        assert_eq!(navigator.visited(), vec!["/vehicles/V1"]);
        assert!(!tracker
            .dedup()
            .has_tracked("landing", EventKind::Impression, "V1"));
    }

    #[tokio::test]
    async fn impression_and_click_are_independent() {
        let sink = MemorySink::default();
        let tracker = tracker(Arc::new(sink.clone()));
        let mut surface = tracker.surface("landing", Arc::new(RecordingNavigator::default()));
        surface.mount().await;

        surface.on_layout(&sixty_percent(0));
        assert!(!tracker.dedup().has_tracked("landing", EventKind::Click, "V1"));

        surface.click(0);
        surface.settle().await;

        assert_eq!(sink.impressions().len(), 1);
        assert_eq!(sink.clicks().len(), 1);
    }

    #[tokio::test]
    async fn failed_click_report_still_navigates() {
        let sink = FailSink::default();
        let tracker = tracker(Arc::new(sink.clone()));
        let navigator = Arc::new(RecordingNavigator::default());
        let mut surface = tracker.surface("landing", navigator.clone());
        surface.mount().await;

        surface.click(2);
        surface.click(2);
        surface.settle().await;

        assert_eq!(navigator.visited(), vec!["/suppliers/S1", "/suppliers/S1"]);
        // The mark stays even though delivery failed, and nothing is retried.
        assert_eq!(*sink.attempts.lock().unwrap(), 1);
        assert!(tracker.dedup().has_tracked("landing", EventKind::Click, "S1"));
    }

    #[tokio::test]
    async fn failed_fetch_renders_nothing() {
        let sink = MemorySink::default();
        let tracker = tracker_with(
            Arc::new(FailingSource),
            Arc::new(MemoryStorage::new()),
            Arc::new(FixedSession("session-1".to_string())),
            Arc::new(sink.clone()),
        );
        let navigator = Arc::new(RecordingNavigator::default());
        let mut surface = tracker.surface("landing", navigator.clone());

        surface.mount().await;
        surface.on_layout(&sixty_percent(0));
        surface.click(0);
        surface.settle().await;

        assert_eq!(surface.state(), SurfaceState::Rendered);
        assert!(surface.slots().is_empty());
        assert_eq!(surface.observed_count(), 0);
        assert!(sink.impressions().is_empty());
        assert!(navigator.visited().is_empty());
    }

    #[tokio::test]
    async fn page_locations_are_tracked_independently() {
        let sink = MemorySink::default();
        let tracker = tracker(Arc::new(sink.clone()));

        let mut landing = tracker.surface("landing", Arc::new(RecordingNavigator::default()));
        let mut browse = tracker.surface("browse", Arc::new(RecordingNavigator::default()));
        landing.mount().await;
        browse.mount().await;

        landing.on_layout(&sixty_percent(0));
        browse.on_layout(&sixty_percent(0));
        landing.settle().await;
        browse.settle().await;

        let mut locations: Vec<_> = sink
            .impressions()
            .into_iter()
            .map(|e| (e.entity_id, e.page_location))
            .collect();
        locations.sort();
        assert_eq!(
            locations,
            vec![
                ("V1".to_string(), "browse".to_string()),
                ("V1".to_string(), "landing".to_string()),
            ]
        );
    }

    #[tokio::test]
    async fn same_page_location_surfaces_share_a_partition() {
        let sink = MemorySink::default();
        let tracker = tracker(Arc::new(sink.clone()));

        let mut header = tracker.surface("landing", Arc::new(RecordingNavigator::default()));
        let mut sidebar = tracker.surface("landing", Arc::new(RecordingNavigator::default()));
        header.mount().await;
        sidebar.mount().await;

        header.on_layout(&sixty_percent(0));
        sidebar.on_layout(&sixty_percent(0));
        header.settle().await;
        sidebar.settle().await;

        assert_eq!(sink.impressions().len(), 1);
    }

    #[tokio::test]
    async fn page_location_change_starts_fresh() {
        let sink = MemorySink::default();
        let tracker = tracker(Arc::new(sink.clone()));
        let mut surface = tracker.surface("landing", Arc::new(RecordingNavigator::default()));
        surface.mount().await;
        surface.on_layout(&sixty_percent(0));
        assert_eq!(surface.observed_count(), 2);

        surface.set_page_location("browse").await;

        assert_eq!(surface.page_location(), "browse");
        assert_eq!(surface.state(), SurfaceState::Rendered);
        assert_eq!(surface.observed_count(), 3);

        surface.on_layout(&sixty_percent(0));
        surface.settle().await;

        let impressions = sink.impressions();
        assert_eq!(impressions.len(), 2);
        assert!(impressions
            .iter()
            .any(|e| e.entity_id == "V1" && e.page_location == "browse"));
    }

    #[tokio::test]
    async fn unmounted_surface_ignores_signals() {
        let sink = MemorySink::default();
        let tracker = tracker(Arc::new(sink.clone()));
        let navigator = Arc::new(RecordingNavigator::default());
        let mut surface = tracker.surface("landing", navigator.clone());
        surface.mount().await;

        surface.unmount();
        surface.on_layout(&sixty_percent(0));
        surface.click(0);
        surface.mount().await;
        surface.settle().await;

        assert_eq!(surface.state(), SurfaceState::Unmounted);
        assert!(surface.slots().is_empty());
        assert!(sink.impressions().is_empty());
        assert!(sink.clicks().is_empty());
        assert!(navigator.visited().is_empty());
    }

    #[tokio::test]
    async fn broken_storage_still_renders_and_dedups_within_the_store() {
        let storage: Arc<dyn Storage> = Arc::new(UnavailableStorage);
        let sink = MemorySink::default();
        let tracker = tracker_with(
            Arc::new(StaticSource::new(catalogue())),
            storage.clone(),
            Arc::new(StoredSession::new(storage)),
            Arc::new(sink.clone()),
        );
        let navigator = Arc::new(RecordingNavigator::default());
        let mut surface = tracker.surface("landing", navigator.clone());
        surface.mount().await;

        surface.on_layout(&sixty_percent(0));
        surface.click(0);
        surface.click(0);
        surface.settle().await;

        assert_eq!(sink.impressions().len(), 1);
        assert_eq!(sink.clicks().len(), 1);
        assert!(!sink.impressions()[0].session_id.is_empty());
        assert_eq!(navigator.visited().len(), 2);
    }

    #[tokio::test]
    async fn mount_recovers_from_a_dropped_fetch() {
        let sink = MemorySink::default();
        let tracker = tracker_with(
            Arc::new(StallFirstSource {
                calls: Mutex::new(0),
            }),
            Arc::new(MemoryStorage::new()),
            Arc::new(FixedSession("session-1".to_string())),
            Arc::new(sink.clone()),
        );
        let mut surface = tracker.surface("landing", Arc::new(RecordingNavigator::default()));

        let timed_out = tokio::time::timeout(Duration::from_millis(10), surface.mount()).await;
        assert!(timed_out.is_err());
        assert_eq!(surface.state(), SurfaceState::Loading);

        surface.mount().await;

        assert_eq!(surface.state(), SurfaceState::Rendered);
        assert_eq!(surface.slots().len(), 3);
        surface.on_layout(&sixty_percent(0));
        surface.settle().await;
        assert_eq!(sink.impressions().len(), 1);
    }
}
