// ==== Surface metrics ====
/// Counter for promoted entity fetches that failed and rendered nothing
pub const FETCH_FAILURES_COUNTER: &str = "promo_fetch_failures_total";

/// Counter for slots rendered after a successful fetch
pub const SLOTS_RENDERED_COUNTER: &str = "promo_slots_rendered_total";

/// Counter for navigations triggered by a slot click
pub const NAVIGATIONS_COUNTER: &str = "promo_navigations_total";

// ==== Attribution metrics ====
/// Counter for attribution events handed to the reporter, labelled by kind
pub const REPORTS_DISPATCHED_COUNTER: &str = "promo_reports_dispatched_total";

/// Counter for attribution events that failed delivery, labelled by kind
pub const REPORTS_FAILED_COUNTER: &str = "promo_reports_failed_total";

/// Counter for attribution events dropped because no async runtime was available
pub const REPORTS_DROPPED_COUNTER: &str = "promo_reports_dropped_total";

/// Counter for events skipped because they were already tracked, labelled by kind
pub const DEDUP_SKIPPED_COUNTER: &str = "promo_dedup_skipped_total";

// ==== Storage metrics ====
/// Counter for storage operations that failed and fell back to memory
pub const STORAGE_FALLBACK_COUNTER: &str = "promo_storage_fallback_total";
