//! Event-driven analytics: store-write notifications, the queue they travel
//! through, and the consumer that recomputes the aggregations.

pub mod consumer;
pub mod notification;
pub mod queue;
pub mod relay;
pub mod stats;

pub use consumer::{
    AnalyticsConsumer, AnalyticsSettings, BatchOutcome, DrainSummary, MessageOutcome,
    ValidationOutcome,
};
pub use notification::{
    decode_event_key, encode_event_key, extract_object_refs, object_created_event,
    wrap_in_notification, NotificationError,
};
pub use queue::{
    parse_queue_event, InProcessQueue, NotificationSink, QueueConsumer, QueueError, QueueMessage,
};
pub use relay::NotifyingStore;
pub use stats::{
    best_year_per_series, join_series_population, mean_population, population_stats,
    AnalyticsReport, BestYear, JoinedRow, PopulationStats,
};

pub const CRATE_NAME: &str = "popbls-analytics";
