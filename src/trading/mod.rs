pub mod breakeven;
pub mod context;
pub mod engine;
pub mod store;
pub mod watcher;

pub use breakeven::BreakevenManager;
pub use context::TradingContext;
pub use engine::{OrderPlacementEngine, Outcome};
pub use store::{Bucket, CasOutcome, JsonFileStore, MemorySignalStore, SignalStore, StoreError};
pub use watcher::{ReconciliationWatcher, SweepReport};
