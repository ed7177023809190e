//! Progress aggregation and broadcast.

pub mod bus;
pub mod meter;

pub use bus::{ProgressBus, SubscriptionHandle};
pub use meter::{AggregateProgress, aggregate, format_duration, format_percent, format_speed};
