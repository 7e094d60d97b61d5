//! Admission control: throughput, daily volume and token allowance guards.
//!
//! Guards run cheapest first and the first denial wins. A guard whose backing store cannot be
//! reached is skipped and the request is let through as [`AdmissionDecision::Degraded`].

mod window;

pub use window::{InMemoryWindowStore, RedisWindowStore, SlidingWindowStore};

use crate::store::{LedgerStore, Plan, UsageStore};
use chrono::{DateTime, Days, Local, NaiveTime, TimeZone, Utc};
use serde::Serialize;
use std::sync::Arc;
use std::time::Duration;

/// Rate-limit telemetry surfaced as response headers.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub struct RateLimitInfo {
    pub limit: u32,
    pub remaining: u32,
    pub reset_at: DateTime<Utc>,
}

impl RateLimitInfo {
    pub fn reset_unix(&self) -> i64 {
        self.reset_at.timestamp()
    }

    /// Whole seconds until reset, never below 1.
    pub fn retry_after_secs(&self, now: DateTime<Utc>) -> u64 {
        retry_after(self.reset_at, now)
    }
}

pub(crate) fn retry_after(reset_at: DateTime<Utc>, now: DateTime<Utc>) -> u64 {
    let millis = (reset_at - now).num_milliseconds().max(0) as u64;
    millis.div_ceil(1000).max(1)
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum DenialReason {
    /// Too many requests in the sliding window. Retry after `reset_at`.
    Throughput { limit: u32, reset_at: DateTime<Utc> },
    /// Daily request volume used up. Retry after the next local midnight.
    DailyQuota { limit: u32, used: u64, reset_at: DateTime<Utc> },
    /// Monthly token allowance exhausted and no usable credit.
    Allowance { allowance: u64, used: u64 },
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum AdmissionDecision {
    Allowed,
    Denied(DenialReason),
    /// Allowed anyway because a guard's backing store was unreachable.
    Degraded { cause: String },
}

impl AdmissionDecision {
    pub fn is_allowed(&self) -> bool {
        !matches!(self, AdmissionDecision::Denied(_))
    }
}

/// Decision plus the throughput telemetry gathered on the way.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Admission {
    pub decision: AdmissionDecision,
    pub rate_limit: Option<RateLimitInfo>,
}

pub struct AdmissionController {
    window_store: Arc<dyn SlidingWindowStore>,
    usage: Arc<dyn UsageStore>,
    ledger: Arc<dyn LedgerStore>,
    window: Duration,
}

impl AdmissionController {
    pub fn new(
        window_store: Arc<dyn SlidingWindowStore>,
        usage: Arc<dyn UsageStore>,
        ledger: Arc<dyn LedgerStore>,
        window: Duration,
    ) -> Self {
        Self {
            window_store,
            usage,
            ledger,
            window,
        }
    }

    pub fn backend(&self) -> &'static str {
        self.window_store.backend()
    }

    pub async fn check(&self, caller_id: &str, plan: &Plan) -> Admission {
        self.check_at(caller_id, plan, Local::now()).await
    }

    pub async fn check_at(&self, caller_id: &str, plan: &Plan, now: DateTime<Local>) -> Admission {
        let mut degraded: Option<String> = None;
        let mut rate_limit = None;

        if let Some(limit) = plan.requests_per_minute {
            match self.throughput(caller_id, limit, now.with_timezone(&Utc)).await {
                Ok((info, count)) => {
                    rate_limit = Some(info);
                    if count > u64::from(limit) {
                        return Admission {
                            decision: AdmissionDecision::Denied(DenialReason::Throughput {
                                limit,
                                reset_at: info.reset_at,
                            }),
                            rate_limit,
                        };
                    }
                }
                Err(e) => {
                    tracing::warn!(
                        caller_id,
                        backend = self.window_store.backend(),
                        error = %e,
                        "Throughput store unreachable, admitting request"
                    );
                    degraded = Some(format!("throughput store: {}", e));
                }
            }
        }

        if let Some(limit) = plan.requests_per_day {
            let since = local_midnight(now);
            match self.usage.count_since(caller_id, since).await {
                Ok(used) if used >= u64::from(limit) => {
                    return Admission {
                        decision: AdmissionDecision::Denied(DenialReason::DailyQuota {
                            limit,
                            used,
                            reset_at: next_local_midnight(now),
                        }),
                        rate_limit,
                    };
                }
                Ok(_) => {}
                Err(e) => {
                    tracing::warn!(caller_id, error = %e, "Usage store unreachable, skipping daily quota");
                    degraded.get_or_insert_with(|| format!("usage store: {}", e));
                }
            }
        }

        if let Some(allowance) = plan.token_allowance {
            match self.ledger.get_monthly_usage(caller_id).await {
                Ok(ledger) if ledger.monthly_tokens >= allowance => {
                    if plan.pay_as_you_go && ledger.credit_balance > 0 {
                        tracing::debug!(
                            caller_id,
                            credit_balance = ledger.credit_balance,
                            "Allowance exhausted, drawing on credit"
                        );
                    } else {
                        return Admission {
                            decision: AdmissionDecision::Denied(DenialReason::Allowance {
                                allowance,
                                used: ledger.monthly_tokens,
                            }),
                            rate_limit,
                        };
                    }
                }
                Ok(_) => {}
                Err(e) => {
                    tracing::warn!(caller_id, error = %e, "Ledger unreachable, skipping allowance check");
                    degraded.get_or_insert_with(|| format!("ledger: {}", e));
                }
            }
        }

        let decision = match degraded {
            Some(cause) => AdmissionDecision::Degraded { cause },
            None => AdmissionDecision::Allowed,
        };
        Admission { decision, rate_limit }
    }

    async fn throughput(
        &self,
        caller_id: &str,
        limit: u32,
        now: DateTime<Utc>,
    ) -> Result<(RateLimitInfo, u64), crate::store::StoreError> {
        let count = self
            .window_store
            .hit(caller_id, now.timestamp_millis(), self.window)
            .await?;
        let remaining = u64::from(limit).saturating_sub(count) as u32;
        let window = chrono::Duration::from_std(self.window).unwrap_or(chrono::Duration::seconds(60));
        let info = RateLimitInfo {
            limit,
            remaining,
            reset_at: now + window,
        };
        Ok((info, count))
    }
}

/// Start of the local calendar day containing `now`.
pub fn local_midnight(now: DateTime<Local>) -> DateTime<Utc> {
    midnight_of(now, now.date_naive())
}

/// Start of the next local calendar day.
pub fn next_local_midnight(now: DateTime<Local>) -> DateTime<Utc> {
    let tomorrow = now
        .date_naive()
        .checked_add_days(Days::new(1))
        .unwrap_or(now.date_naive());
    midnight_of(now, tomorrow)
}

fn midnight_of(now: DateTime<Local>, date: chrono::NaiveDate) -> DateTime<Utc> {
    // Midnight can be skipped by a DST jump; fall back to the earliest valid instant that day.
    Local
        .from_local_datetime(&date.and_time(NaiveTime::MIN))
        .earliest()
        .or_else(|| {
            NaiveTime::from_hms_opt(1, 0, 0)
                .and_then(|t| Local.from_local_datetime(&date.and_time(t)).earliest())
        })
        .unwrap_or(now)
        .with_timezone(&Utc)
}
