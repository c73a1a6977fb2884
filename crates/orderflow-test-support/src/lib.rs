//! Shared test mocks and utilities for the Orderflow dispatch core.

mod clock;
mod handler;
mod repository;
mod rng;

pub use clock::{FixedClock, ManualClock};
pub use handler::{PanickingHandler, ScriptedHandler};
pub use repository::FailingStore;
pub use rng::{MockRng, SequenceRng};
