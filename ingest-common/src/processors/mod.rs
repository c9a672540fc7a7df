//! Capability sets of the five processing units.
pub mod analytics;
pub mod batch;
pub mod events;
pub mod ml;
pub mod user_events;

pub use analytics::AnalyticsProcessor;
pub use batch::BatchProcessor;
pub use events::EventProcessor;
pub use ml::MlProcessor;
pub use user_events::UserEventProcessor;
