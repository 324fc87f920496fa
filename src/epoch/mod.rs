pub mod manager;
pub mod vector;

pub use manager::{EpochGuard, EpochManager};
pub use vector::{EpochVector, EPOCH_MIN_ACTIVE, EPOCH_NO_PARTICIPANT};
