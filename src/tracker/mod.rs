pub mod price_tracker;
pub mod stats;

pub use price_tracker::PriceTracker;
