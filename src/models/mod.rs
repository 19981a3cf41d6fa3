pub mod direction;
pub mod order_status;
pub mod signal;

pub use direction::*;
pub use order_status::{DemoStatus, StatusClass};
pub use signal::{Signal, SignalEvent, SignalUpdate};
