//! Replay a scripted browsing session against one ad surface.
use std::sync::Arc;

use envconfig::Envconfig;
use promo_tracker::api::{EntityKind, PromotedEntity};
use promo_tracker::config::Config;
use promo_tracker::fetcher::StaticSource;
use promo_tracker::surface::Navigator;
use promo_tracker::tracker::Tracker;
use promo_tracker::visibility::{LayoutSnapshot, Rect};
use tracing::info;
use tracing_subscriber::EnvFilter;

const VIEWPORT_HEIGHT: f64 = 800.0;
const SLOT_HEIGHT: f64 = 240.0;
const SLOT_GAP: f64 = 60.0;
// The surface starts below the fold.
const SURFACE_TOP: f64 = 900.0;

#[derive(Envconfig)]
struct DemoConfig {
    #[envconfig(nested = true)]
    tracker: Config,

    #[envconfig(default = "landing")]
    page_location: String,

    #[envconfig(default = "https://market.example/")]
    referrer: String,

    // Serve a built-in catalogue instead of calling the backend for entities.
    #[envconfig(default = "false")]
    offline: bool,
}

struct LogNavigator;

impl Navigator for LogNavigator {
    fn navigate(&self, path: &str) {
        info!("navigating to {}", path);
    }
}

fn sample_catalogue() -> Vec<PromotedEntity> {
    vec![
        PromotedEntity {
            id: "V1".to_string(),
            kind: EntityKind::Vehicle,
            title: "2019 Toyota Hilux 2.8 GD-6".to_string(),
            subtitle: Some("84 000 km".to_string()),
            ..Default::default()
        },
        PromotedEntity {
            id: "J1".to_string(),
            kind: EntityKind::Job,
            title: "Diesel mechanic".to_string(),
            ..Default::default()
        },
        PromotedEntity {
            id: "S1".to_string(),
            kind: EntityKind::Supplier,
            title: "Northside tyre depot".to_string(),
            ..Default::default()
        },
    ]
}

/// Slots stacked vertically, seen through a viewport scrolled down by `scroll`.
fn layout_at(scroll: f64, slots: usize) -> LayoutSnapshot {
    (0..slots).fold(
        LayoutSnapshot::new(Rect::new(0.0, 0.0, 1280.0, VIEWPORT_HEIGHT)),
        |layout, slot| {
            let top = SURFACE_TOP + slot as f64 * (SLOT_HEIGHT + SLOT_GAP) - scroll;
            layout.with_slot(slot, Rect::new(40.0, top, 360.0, SLOT_HEIGHT))
        },
    )
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::from_default_env())
        .init();

    let config = DemoConfig::init_from_env().expect("Invalid configuration:");

    let mut tracker = Tracker::from_config(&config.tracker)?;
    if config.offline {
        tracker = tracker.with_source(Arc::new(StaticSource::new(sample_catalogue())));
    }

    let session_id = tracker.session().get_or_create_session_id();
    info!("tracking session {}", session_id);

    let mut surface = tracker
        .surface(config.page_location.as_str(), Arc::new(LogNavigator))
        .with_referrer(config.referrer.as_str());
    surface.mount().await;
    info!(slots = surface.slots().len(), "surface mounted");

    // Scroll down past every slot and back up again.
    let slots = surface.slots().len();
    let bottom = SURFACE_TOP + slots as f64 * (SLOT_HEIGHT + SLOT_GAP);
    let mut scroll = 0.0;
    while scroll <= bottom {
        surface.on_layout(&layout_at(scroll, slots));
        scroll += 200.0;
    }
    while scroll >= 0.0 {
        surface.on_layout(&layout_at(scroll, slots));
        scroll -= 200.0;
    }

    if slots > 0 {
        surface.click(0);
    }

    surface.settle().await;
    surface.unmount();
    info!("done");

    Ok(())
}
