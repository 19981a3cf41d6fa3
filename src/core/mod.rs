pub mod invalidation;
pub mod order_params;
pub mod risk;

pub use invalidation::{classify, Classification, Invalidation, InvalidationThresholds};
pub use order_params::OrderParams;
pub use risk::{RiskCheck, RiskGuard};
