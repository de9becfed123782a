pub mod smart;

pub use smart::{LayerConfig, LayerStatus, SmartScheduler};
