/// Counter for handled events, labelled by outcome
pub const EVENTS_PROCESSED: &str = "loyalty_events_processed_total";

/// Histogram for the time spent handling one event
pub const EVENT_PROCESSING_DURATION: &str = "loyalty_event_processing_duration_seconds";

/// Counter for post-commit cache refreshes, labelled by status
pub const CACHE_REFRESH: &str = "loyalty_cache_refresh_total";
