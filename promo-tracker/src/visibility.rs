//! Geometry-polling visibility detection for promoted slots.
//!
//! The host feeds a [`LayoutSnapshot`] whenever layout or scroll position changes;
//! the detector compares each observed slot's bounds with the viewport and emits a
//! [`BecameVisible`] signal the first time at least `threshold` of the slot's area
//! is on screen. A slot is dropped from observation once it has signalled.
use std::collections::{BTreeMap, HashMap};

#[derive(Clone, Copy, Debug, Default, PartialEq)]
pub struct Rect {
    pub x: f64,
    pub y: f64,
    pub width: f64,
    pub height: f64,
}

impl Rect {
    pub fn new(x: f64, y: f64, width: f64, height: f64) -> Self {
        Self {
            x,
            y,
            width,
            height,
        }
    }

    pub fn area(&self) -> f64 {
        self.width.max(0.0) * self.height.max(0.0)
    }

    pub fn intersection_area(&self, other: &Rect) -> f64 {
        let width = (self.x + self.width).min(other.x + other.width) - self.x.max(other.x);
        let height = (self.y + self.height).min(other.y + other.height) - self.y.max(other.y);
        width.max(0.0) * height.max(0.0)
    }

    /// Share of this rectangle's area inside `viewport`, in `[0, 1]`. Degenerate
    /// rectangles are never visible.
    pub fn visible_fraction(&self, viewport: &Rect) -> f64 {
        let area = self.area();
        if area <= 0.0 {
            return 0.0;
        }
        (self.intersection_area(viewport) / area).min(1.0)
    }
}

/// Identifies a rendered slot: its position on the surface plus what it shows.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct SlotTag {
    pub slot: usize,
    pub entity_id: String,
    pub page_location: String,
}

#[derive(Clone, Debug, PartialEq)]
pub struct BecameVisible {
    pub tag: SlotTag,
    pub fraction: f64,
}

/// Viewport plus the bounds of every slot currently laid out, keyed by slot index.
/// Slots absent from the snapshot count as off screen.
#[derive(Clone, Debug, Default)]
pub struct LayoutSnapshot {
    pub viewport: Rect,
    pub slots: HashMap<usize, Rect>,
}

impl LayoutSnapshot {
    pub fn new(viewport: Rect) -> Self {
        Self {
            viewport,
            slots: HashMap::new(),
        }
    }

    pub fn with_slot(mut self, slot: usize, bounds: Rect) -> Self {
        self.slots.insert(slot, bounds);
        self
    }
}

pub struct VisibilityDetector {
    threshold: f64,
    observed: BTreeMap<usize, SlotTag>,
    connected: bool,
}

impl VisibilityDetector {
    pub const DEFAULT_THRESHOLD: f64 = 0.5;

    /// `threshold` is clamped into `(0, 1]`.
    pub fn new(threshold: f64) -> Self {
        let threshold = if threshold.is_finite() {
            threshold.clamp(f64::EPSILON, 1.0)
        } else {
            Self::DEFAULT_THRESHOLD
        };

        Self {
            threshold,
            observed: BTreeMap::new(),
            connected: true,
        }
    }

    pub fn threshold(&self) -> f64 {
        self.threshold
    }

    /// Start watching a slot. Ignored once the detector is disconnected.
    pub fn observe(&mut self, tag: SlotTag) {
        if self.connected {
            self.observed.insert(tag.slot, tag);
        }
    }

    pub fn observed_count(&self) -> usize {
        self.observed.len()
    }

    /// Stop watching everything. A disconnected detector never signals again.
    pub fn disconnect(&mut self) {
        self.connected = false;
        self.observed.clear();
    }

    pub fn evaluate(&mut self, layout: &LayoutSnapshot) -> Vec<BecameVisible> {
        if !self.connected {
            return Vec::new();
        }

        let threshold = self.threshold;
        let mut signals = Vec::new();

        self.observed.retain(|slot, tag| {
            let Some(bounds) = layout.slots.get(slot) else {
                return true;
            };

            let fraction = bounds.visible_fraction(&layout.viewport);
            if fraction >= threshold {
                signals.push(BecameVisible {
                    tag: tag.clone(),
                    fraction,
                });
                false
            } else {
                true
            }
        });

        signals
    }
}

impl Default for VisibilityDetector {
    fn default() -> Self {
        Self::new(Self::DEFAULT_THRESHOLD)
    }
}
