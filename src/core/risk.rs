use chrono::{DateTime, Duration, TimeZone, Utc};
use chrono_tz::Tz;
use tracing::warn;

use crate::config::Config;
use crate::models::{Direction, Signal};

const STREAK_WINDOW: usize = 10;

#[derive(Debug, Clone, PartialEq)]
pub enum RiskCheck {
    Ok,
    Breached(String),
}

/// Blocks new submissions after a bad trading day or a losing streak.
#[derive(Debug, Clone)]
pub struct RiskGuard {
    pub daily_loss_limit_pct: f64,
    pub max_consecutive_losses: usize,
    pub commission_pct: f64,
    pub timezone: Tz,
}

impl RiskGuard {
    pub fn new(cfg: &Config) -> Self {
        let timezone = cfg.risk_timezone.parse::<Tz>().unwrap_or_else(|_| {
            warn!("Unknown RISK_TIMEZONE '{}', using Europe/Moscow", cfg.risk_timezone);
            chrono_tz::Europe::Moscow
        });
        Self {
            daily_loss_limit_pct: cfg.daily_loss_limit_pct,
            max_consecutive_losses: cfg.max_consecutive_losses,
            commission_pct: cfg.commission_pct,
            timezone,
        }
    }

    /// Net P&L of a closed trade in percent, after round-trip commission.
    pub fn net_pnl_pct(&self, trade: &Signal) -> Option<f64> {
        let entry = trade.entry_price.filter(|p| *p > 0.0)?;
        let exit = trade.exit_price.filter(|p| *p > 0.0)?;
        let gross = match trade.direction {
            Direction::Long => (exit - entry) / entry * 100.0,
            Direction::Short => (entry - exit) / entry * 100.0,
        };
        Some(gross - self.commission_pct * 2.0)
    }

    /// UTC instant of local midnight for `now` in the guard's timezone.
    pub fn day_start(&self, now: DateTime<Utc>) -> DateTime<Utc> {
        let local = now.with_timezone(&self.timezone).date_naive();
        local
            .and_hms_opt(0, 0, 0)
            .and_then(|midnight| self.timezone.from_local_datetime(&midnight).earliest())
            .map(|dt| dt.with_timezone(&Utc))
            .unwrap_or(now - Duration::days(1))
    }

    pub fn daily_pnl_pct(&self, closed: &[Signal], now: DateTime<Utc>) -> f64 {
        let start = self.day_start(now);
        closed
            .iter()
            .filter(|s| s.timestamp >= start)
            .filter_map(|s| self.net_pnl_pct(s))
            .sum()
    }

    /// Losing trades in a row, newest first, within the last ten closed trades.
    pub fn consecutive_losses(&self, closed: &[Signal]) -> usize {
        let mut trades: Vec<&Signal> = closed.iter().collect();
        trades.sort_by(|a, b| {
            b.exit_timestamp
                .cmp(&a.exit_timestamp)
                .then(b.timestamp.cmp(&a.timestamp))
        });
        trades
            .into_iter()
            .take(STREAK_WINDOW)
            .filter_map(|s| self.net_pnl_pct(s))
            .take_while(|pnl| *pnl < 0.0)
            .count()
    }

    pub fn check(&self, closed: &[Signal], now: DateTime<Utc>) -> RiskCheck {
        let daily = self.daily_pnl_pct(closed, now);
        if daily <= self.daily_loss_limit_pct {
            return RiskCheck::Breached(format!(
                "daily loss limit reached: {:.2}% (limit {:.2}%)",
                daily, self.daily_loss_limit_pct
            ));
        }

        let streak = self.consecutive_losses(closed);
        if self.max_consecutive_losses > 0 && streak >= self.max_consecutive_losses {
            return RiskCheck::Breached(format!(
                "{} losing trades in a row (limit {})",
                streak, self.max_consecutive_losses
            ));
        }

        RiskCheck::Ok
    }
}
