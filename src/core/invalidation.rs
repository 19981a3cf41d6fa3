use serde::{Deserialize, Serialize};

use crate::models::{DemoStatus, Direction};

#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct InvalidationThresholds {
    /// Direction-agnostic distance from the level, as a fraction (0.02 = 2%).
    pub max_deviation: f64,
    /// Tolerance before a level counts as broken, as a fraction (0.002 = 0.2%).
    pub level_break: f64,
}

impl Default for InvalidationThresholds {
    fn default() -> Self {
        Self {
            max_deviation: 0.02,
            level_break: 0.002,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum Invalidation {
    Ok,
    LevelBroken,
    DeviationTooLarge,
}

impl Invalidation {
    pub fn demo_status(self) -> Option<DemoStatus> {
        match self {
            Invalidation::Ok => None,
            Invalidation::LevelBroken => Some(DemoStatus::LevelBroken),
            Invalidation::DeviationTooLarge => Some(DemoStatus::PriceDeviationTooLarge),
        }
    }
}

/// Both checks evaluated independently.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Classification {
    pub level_broken: bool,
    pub deviation_too_large: bool,
}

impl Classification {
    /// A move far enough to break the level by more than the deviation
    /// threshold is reported as a deviation.
    pub fn verdict(self) -> Invalidation {
        if self.deviation_too_large {
            Invalidation::DeviationTooLarge
        } else if self.level_broken {
            Invalidation::LevelBroken
        } else {
            Invalidation::Ok
        }
    }
}

impl InvalidationThresholds {
    pub fn evaluate(&self, direction: Direction, level_price: f64, current_price: f64) -> Classification {
        let deviation = (current_price / level_price - 1.0).abs();
        let level_broken = match direction {
            Direction::Long => current_price < level_price * (1.0 - self.level_break),
            Direction::Short => current_price > level_price * (1.0 + self.level_break),
        };
        Classification {
            level_broken,
            deviation_too_large: deviation > self.max_deviation,
        }
    }

    pub fn classify(&self, direction: Direction, level_price: f64, current_price: f64) -> Invalidation {
        self.evaluate(direction, level_price, current_price).verdict()
    }
}

/// Classify with default thresholds.
pub fn classify(direction: Direction, level_price: f64, current_price: f64) -> Invalidation {
    InvalidationThresholds::default().classify(direction, level_price, current_price)
}
