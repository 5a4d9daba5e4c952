//! ============================================================================
//! Daily Summary - Scheduled per-project totals
//! ============================================================================
//! Once a day, at the `summary_time` setting (HH:MM, local time), pushes one
//! summary card per active project that received confirmed donations today
//! to the conversation named by `summary_group_id`.
//! ============================================================================

use anyhow::Result;
use chrono::{Duration as ChronoDuration, Local, NaiveDateTime, NaiveTime};
use std::sync::Arc;
use std::time::Duration;
use tokio::task::JoinHandle;
use tracing::{error, info, warn};

use crate::composer;
use crate::ledger::DonationLedger;
use crate::messaging::MessagingClient;
use crate::types::settings;

/// Donors listed on a scheduled summary card
const SUMMARY_DONORS: usize = 10;

/// Parse `HH:MM` (24h)
pub fn parse_summary_time(value: &str) -> Option<NaiveTime> {
    NaiveTime::parse_from_str(value.trim(), "%H:%M").ok()
}

/// First instant strictly after `now` whose wall-clock time is `at`
pub fn next_run_after(now: NaiveDateTime, at: NaiveTime) -> NaiveDateTime {
    let today = now.date().and_time(at);
    if today > now {
        today
    } else {
        today + ChronoDuration::days(1)
    }
}

pub struct SummaryScheduler {
    ledger: DonationLedger,
    messenger: Arc<dyn MessagingClient>,
}

impl SummaryScheduler {
    pub fn new(ledger: DonationLedger, messenger: Arc<dyn MessagingClient>) -> Self {
        Self { ledger, messenger }
    }

    /// Configured send time; malformed values fall back to the default
    pub fn summary_time(&self) -> NaiveTime {
        let raw = self
            .ledger
            .setting_or(settings::SUMMARY_TIME, settings::DEFAULT_SUMMARY_TIME);
        parse_summary_time(&raw).unwrap_or_else(|| {
            warn!("Invalid summary_time '{}', using {}", raw, settings::DEFAULT_SUMMARY_TIME);
            NaiveTime::from_hms_opt(19, 0, 0).unwrap_or(NaiveTime::MIN)
        })
    }

    /// Push today's cards. Returns how many were sent.
    pub async fn send_daily_summary(&self) -> Result<usize> {
        let Some(group_id) = self
            .ledger
            .db()
            .get_setting(settings::SUMMARY_GROUP_ID)?
            .filter(|id| !id.trim().is_empty())
        else {
            info!("No summary group ID configured, skipping daily summary");
            return Ok(0);
        };

        let mut sent = 0;
        for total in self.ledger.daily_project_totals(SUMMARY_DONORS)? {
            let card = composer::daily_summary(
                &total.project_name,
                total.total_amount,
                total.donation_count,
                &total.recent,
            );
            match self.messenger.push(&group_id, &[card]).await {
                Ok(()) => sent += 1,
                Err(e) => warn!("Failed to push summary for {}: {}", total.project_name, e),
            }
        }

        info!("Daily summary sent ({} card(s))", sent);
        Ok(sent)
    }

    /// Run forever on the tokio runtime
    pub fn spawn(self: Arc<Self>) -> JoinHandle<()> {
        tokio::spawn(async move {
            loop {
                let at = self.summary_time();
                let now = Local::now().naive_local();
                let next = next_run_after(now, at);
                let wait = (next - now).to_std().unwrap_or(Duration::from_secs(60));
                info!("Next daily summary at {}", next.format("%Y-%m-%d %H:%M"));

                tokio::time::sleep(wait).await;
                if let Err(e) = self.send_daily_summary().await {
                    error!("Error sending daily summary: {:#}", e);
                }
            }
        })
    }
}
