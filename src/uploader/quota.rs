use async_trait::async_trait;
use chrono::{DateTime, Duration, NaiveDate, TimeZone, Utc};
use chrono_tz::Tz;
use serde::{Deserialize, Serialize};
use std::sync::Arc;

use crate::errors::{AppError, AppResult};

/// Published cost, in quota units, of the calls this tool makes.
pub mod cost {
    pub const VIDEO_INSERT: u32 = 1600;
    pub const THUMBNAIL_SET: u32 = 50;
    pub const PLAYLIST_ITEM_INSERT: u32 = 50;
    pub const READ: u32 = 1;
}

pub trait Clock: Send + Sync {
    fn now(&self) -> DateTime<Utc>;
}

pub struct SystemClock;

impl Clock for SystemClock {
    fn now(&self) -> DateTime<Utc> {
        Utc::now()
    }
}

/// Units spent on one calendar day of the quota timezone.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct QuotaLedger {
    pub day: NaiveDate,
    pub consumed: u32,
    pub budget: u32,
}

impl QuotaLedger {
    pub fn fresh(day: NaiveDate, budget: u32) -> Self {
        Self {
            day,
            consumed: 0,
            budget,
        }
    }

    pub fn remaining(&self) -> u32 {
        self.budget.saturating_sub(self.consumed)
    }
}

#[async_trait]
pub trait LedgerStore: Send + Sync {
    async fn load_ledger(&self, day: NaiveDate) -> AppResult<Option<QuotaLedger>>;
    async fn save_ledger(&self, ledger: &QuotaLedger) -> AppResult<()>;
}

#[derive(Debug, Clone, PartialEq)]
pub enum QuotaDecision {
    Allowed,
    Denied {
        reason: String,
        resets_at: DateTime<Utc>,
    },
}

impl QuotaDecision {
    pub fn is_allowed(&self) -> bool {
        matches!(self, QuotaDecision::Allowed)
    }

    pub fn into_result(self) -> AppResult<()> {
        match self {
            QuotaDecision::Allowed => Ok(()),
            QuotaDecision::Denied { reason, resets_at } => Err(AppError::QuotaExceeded {
                message: reason,
                resets_at,
            }),
        }
    }
}

/// Daily budget guard. The ledger rolls over lazily on the first access of a
/// new day; nothing runs in the background.
pub struct QuotaTracker {
    ledger: QuotaLedger,
    timezone: Tz,
    clock: Arc<dyn Clock>,
    store: Arc<dyn LedgerStore>,
    allow_overrun: bool,
}

impl QuotaTracker {
    pub async fn load(
        store: Arc<dyn LedgerStore>,
        budget: u32,
        timezone: Tz,
        clock: Arc<dyn Clock>,
    ) -> AppResult<Self> {
        let day = clock.now().with_timezone(&timezone).date_naive();
        let ledger = match store.load_ledger(day).await? {
            Some(mut ledger) => {
                ledger.budget = budget;
                ledger
            }
            None => QuotaLedger::fresh(day, budget),
        };

        log::debug!(
            "Quota ledger for {}: {}/{} units used",
            ledger.day,
            ledger.consumed,
            ledger.budget
        );

        Ok(Self {
            ledger,
            timezone,
            clock,
            store,
            allow_overrun: false,
        })
    }

    /// Lets reservations past the budget through (with a warning).
    pub fn with_overrun(mut self, allow_overrun: bool) -> Self {
        self.allow_overrun = allow_overrun;
        self
    }

    fn today(&self) -> NaiveDate {
        self.clock.now().with_timezone(&self.timezone).date_naive()
    }

    fn roll_over(&mut self) {
        let today = self.today();
        if today != self.ledger.day {
            log::info!(
                "Quota day changed from {} to {}, resetting usage",
                self.ledger.day,
                today
            );
            self.ledger = QuotaLedger::fresh(today, self.ledger.budget);
        }
    }

    /// Next local midnight in the quota timezone.
    pub fn resets_at(&self) -> DateTime<Utc> {
        let now = self.clock.now();
        let next_day = now.with_timezone(&self.timezone).date_naive() + Duration::days(1);
        next_day
            .and_hms_opt(0, 0, 0)
            .and_then(|midnight| self.timezone.from_local_datetime(&midnight).earliest())
            .map(|local| local.with_timezone(&Utc))
            .unwrap_or_else(|| now + Duration::days(1))
    }

    /// Checks whether `cost` fits today's budget. Never mutates usage.
    pub fn reserve(&mut self, cost: u32) -> QuotaDecision {
        self.roll_over();

        let wanted = self.ledger.consumed.saturating_add(cost);
        if wanted <= self.ledger.budget {
            return QuotaDecision::Allowed;
        }

        if self.allow_overrun {
            log::warn!(
                "Quota override: {} units requested with {} of {} remaining",
                cost,
                self.ledger.remaining(),
                self.ledger.budget
            );
            return QuotaDecision::Allowed;
        }

        QuotaDecision::Denied {
            reason: format!(
                "{} units needed, {} of {} remaining today",
                cost,
                self.ledger.remaining(),
                self.ledger.budget
            ),
            resets_at: self.resets_at(),
        }
    }

    /// Charges `cost` after the operation it was reserved for succeeded.
    pub async fn commit(&mut self, cost: u32) -> AppResult<()> {
        self.roll_over();

        let consumed = self.ledger.consumed.saturating_add(cost);
        if consumed > self.ledger.budget && !self.allow_overrun {
            return Err(AppError::QuotaExceeded {
                message: format!("commit of {} units would exceed the budget", cost),
                resets_at: self.resets_at(),
            });
        }

        self.ledger.consumed = consumed;
        self.store.save_ledger(&self.ledger).await?;
        log::debug!(
            "Committed {} quota units ({}/{})",
            cost,
            self.ledger.consumed,
            self.ledger.budget
        );
        Ok(())
    }

    /// The remote service reported the quota as spent; trust it for the rest of the day.
    pub async fn mark_exhausted(&mut self) -> AppResult<()> {
        self.roll_over();
        self.ledger.consumed = self.ledger.consumed.max(self.ledger.budget);
        self.store.save_ledger(&self.ledger).await
    }

    /// Rewrites a remote quota error to carry this tracker's reset time.
    /// Other errors pass through untouched.
    pub fn with_local_reset(&self, error: AppError) -> AppError {
        match error {
            AppError::QuotaExceeded { message, .. } => AppError::QuotaExceeded {
                message,
                resets_at: self.resets_at(),
            },
            other => other,
        }
    }

    pub fn current_usage(&mut self) -> u32 {
        self.roll_over();
        self.ledger.consumed
    }

    pub fn ledger(&mut self) -> &QuotaLedger {
        self.roll_over();
        &self.ledger
    }
}
