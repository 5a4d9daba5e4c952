//! ============================================================================
//! Donation Ledger - Records and project accounting
//! ============================================================================
//! Service layer over `LedgerDb` used by the state machine, the summary
//! scheduler and the CLI. Confirmation is the only path that moves a
//! project's collected total.
//! ============================================================================

use anyhow::Result;
use chrono::{Local, TimeZone};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::sync::Arc;
use tracing::{debug, info};

use crate::db::{DonationFilter, LedgerDb};
use crate::types::{
    now_millis, settings, ConversationKey, ConversationType, DonationRecord, DonationStatus,
    Expense, KeywordAction, NewDonation, ProjectStatus, TambunError,
};

/// Chat keywords installed by `tambun seed`
pub const DEFAULT_KEYWORDS: &[(&str, KeywordAction)] = &[
    ("ทำบุญ", KeywordAction::ShowProjects),
    ("บริจาค", KeywordAction::ShowProjects),
    ("donate", KeywordAction::ShowProjects),
    ("สรุป", KeywordAction::ShowSummary),
    ("summary", KeywordAction::ShowSummary),
];

/// Donors listed on a summary card requested from chat
pub const CHAT_SUMMARY_DONORS: usize = 5;

/// Confirmed donations of one project within one day
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ProjectDayTotal {
    pub project_id: String,
    pub project_name: String,
    pub donation_count: usize,
    pub total_amount: f64,
    /// Latest confirmations first
    pub recent: Vec<DonationRecord>,
}

/// Money in, money out and what is left for one project
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ProjectBalance {
    pub project_id: String,
    pub name: String,
    pub collected: f64,
    pub expenses: f64,
    pub balance: f64,
}

/// Unix millis of local midnight today
pub fn start_of_today() -> i64 {
    Local::now()
        .date_naive()
        .and_hms_opt(0, 0, 0)
        .and_then(|midnight| Local.from_local_datetime(&midnight).earliest())
        .map(|dt| dt.timestamp_millis())
        .unwrap_or_else(|| now_millis() - 86_400_000)
}

#[derive(Clone)]
pub struct DonationLedger {
    db: Arc<LedgerDb>,
}

impl DonationLedger {
    pub fn new(db: Arc<LedgerDb>) -> Self {
        Self { db }
    }

    pub fn db(&self) -> &LedgerDb {
        &self.db
    }

    /// New record awaiting its typed amount
    pub fn create_pending(
        &self,
        key: &ConversationKey,
        conversation_type: ConversationType,
        project_id: &str,
        display_name: &str,
    ) -> Result<DonationRecord> {
        self.db.insert_donation(NewDonation {
            project_id: project_id.to_string(),
            key: key.clone(),
            conversation_type,
            display_name: display_name.to_string(),
            status: DonationStatus::WaitingConfirmation,
        })
    }

    pub fn attach_slip(&self, donation_id: &str, path: &str) -> Result<()> {
        let updated = self.db.update_donation(donation_id, |d| {
            *d.slip_image_path = Some(path.to_string());
        })?;
        match updated {
            Some(_) => {
                debug!("Attached slip {} to donation {}", path, donation_id);
                Ok(())
            }
            None => Err(TambunError::NotFound(format!("donation {}", donation_id)).into()),
        }
    }

    /// Most recent record still waiting for an amount
    pub fn latest_awaiting(&self, key: &ConversationKey, project_id: &str) -> Result<Option<DonationRecord>> {
        let filter = DonationFilter::for_key(key, project_id)
            .with_statuses(&[DonationStatus::WaitingConfirmation]);
        self.db.latest_donation(&filter)
    }

    /// An awaiting or confirmed record created at or after `since`
    pub fn recent_open_or_confirmed(
        &self,
        key: &ConversationKey,
        project_id: &str,
        since: i64,
    ) -> Result<Option<DonationRecord>> {
        let filter = DonationFilter::for_key(key, project_id)
            .with_statuses(&[DonationStatus::WaitingConfirmation, DonationStatus::Confirmed])
            .since(since);
        self.db.latest_donation(&filter)
    }

    /// Confirm and credit the project. Domain failures come back typed.
    pub fn confirm(
        &self,
        donation_id: &str,
        amount: f64,
        recipient_label: Option<&str>,
    ) -> std::result::Result<DonationRecord, TambunError> {
        self.db
            .confirm_donation(donation_id, amount, recipient_label)
            .map_err(TambunError::from_anyhow)
    }

    /// Confirmed donations of a project, latest confirmation first
    pub fn recent_confirmed(&self, project_id: &str, limit: usize) -> Result<Vec<DonationRecord>> {
        self.confirmed_since(project_id, 0, limit)
    }

    fn confirmed_since(&self, project_id: &str, since: i64, limit: usize) -> Result<Vec<DonationRecord>> {
        let filter = DonationFilter {
            project_id: Some(project_id.to_string()),
            ..Default::default()
        }
        .with_statuses(&[DonationStatus::Confirmed])
        .since(since);

        let mut records = self.db.list_donations(&filter)?;
        records.sort_by(|a, b| b.confirmed_at.cmp(&a.confirmed_at));
        records.truncate(limit);
        Ok(records)
    }

    /// Today's confirmed donations made in one conversation, per project
    pub fn today_summary(
        &self,
        conversation_type: ConversationType,
        conversation_id: &str,
    ) -> Result<Vec<ProjectDayTotal>> {
        let since = start_of_today();
        let filter = DonationFilter {
            conversation: Some((conversation_type, conversation_id.to_string())),
            ..Default::default()
        }
        .with_statuses(&[DonationStatus::Confirmed])
        .since(since);

        let mut grouped: HashMap<String, (usize, f64)> = HashMap::new();
        for record in self.db.list_donations(&filter)? {
            let entry = grouped.entry(record.project_id).or_insert((0, 0.0));
            entry.0 += 1;
            entry.1 += record.final_amount;
        }

        let mut totals = Vec::with_capacity(grouped.len());
        for (project_id, (donation_count, total_amount)) in grouped {
            let project_name = self
                .db
                .get_project(&project_id)?
                .map(|p| p.name)
                .unwrap_or_else(|| "โปรเจกต์".to_string());
            let recent = self.recent_confirmed(&project_id, CHAT_SUMMARY_DONORS)?;
            totals.push(ProjectDayTotal {
                project_id,
                project_name,
                donation_count,
                total_amount,
                recent,
            });
        }
        totals.sort_by(|a, b| a.project_name.cmp(&b.project_name));
        Ok(totals)
    }

    /// Today's totals for every active project that received something
    pub fn daily_project_totals(&self, recent_limit: usize) -> Result<Vec<ProjectDayTotal>> {
        let since = start_of_today();
        let mut totals = Vec::new();
        for project in self.db.list_projects(Some(ProjectStatus::Active))? {
            let filter = DonationFilter {
                project_id: Some(project.id.clone()),
                ..Default::default()
            }
            .with_statuses(&[DonationStatus::Confirmed])
            .since(since);
            let records = self.db.list_donations(&filter)?;
            if records.is_empty() {
                continue;
            }

            totals.push(ProjectDayTotal {
                donation_count: records.len(),
                total_amount: records.iter().map(|r| r.final_amount).sum(),
                recent: self.confirmed_since(&project.id, since, recent_limit)?,
                project_id: project.id,
                project_name: project.name,
            });
        }
        Ok(totals)
    }

    pub fn balance(&self, project_id: &str) -> Result<ProjectBalance> {
        let project = self
            .db
            .get_project(project_id)?
            .ok_or_else(|| TambunError::NotFound(format!("project {}", project_id)))?;
        Ok(ProjectBalance {
            balance: project.balance(),
            collected: project.current_amount,
            expenses: project.total_expenses,
            project_id: project.id,
            name: project.name,
        })
    }

    /// Spend from a project; returns the expense and the new balance
    pub fn spend(
        &self,
        project_id: &str,
        amount: f64,
        description: &str,
        receipt_url: Option<String>,
    ) -> Result<(Expense, ProjectBalance)> {
        let expense = self.db.record_expense(project_id, amount, description, receipt_url)?;
        let balance = self.balance(project_id)?;
        info!(
            "Project {} balance after expense: {:.2}",
            balance.name, balance.balance
        );
        Ok((expense, balance))
    }

    /// Install default keywords, plus default settings that are unset.
    /// Returns how many rows were written.
    pub fn seed_defaults(&self) -> Result<usize> {
        let mut written = 0;
        for (keyword, action) in DEFAULT_KEYWORDS {
            self.db.upsert_keyword(keyword, *action, true)?;
            written += 1;
        }
        for (key, value) in [
            (settings::THANK_YOU_MESSAGE, settings::DEFAULT_THANK_YOU),
            (settings::SUMMARY_TIME, settings::DEFAULT_SUMMARY_TIME),
        ] {
            if self.db.get_setting(key)?.is_none() {
                self.db.put_setting(key, value)?;
                written += 1;
            }
        }
        info!("Seeded {} default rows", written);
        Ok(written)
    }

    /// Configured thank-you text, or the default
    pub fn thank_you_message(&self) -> String {
        self.setting_or(settings::THANK_YOU_MESSAGE, settings::DEFAULT_THANK_YOU)
    }

    /// Setting value with a fallback; a read failure counts as unset
    pub fn setting_or(&self, key: &str, default: &str) -> String {
        match self.db.get_setting(key) {
            Ok(Some(value)) if !value.trim().is_empty() => value,
            Ok(_) => default.to_string(),
            Err(e) => {
                tracing::warn!("Failed to read setting {}: {}", key, e);
                default.to_string()
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::types::NewProject;

    fn ledger() -> DonationLedger {
        DonationLedger::new(Arc::new(LedgerDb::open_in_memory().unwrap()))
    }

    fn project(ledger: &DonationLedger, name: &str) -> String {
        ledger
            .db()
            .create_project(NewProject {
                name: name.into(),
                goal_amount: Some(1000.0),
                ..Default::default()
            })
            .unwrap()
            .id
    }

    #[test]
    fn test_confirm_maps_domain_errors() {
        let ledger = ledger();
        let p = project(&ledger, "A");
        let key = ConversationKey::new("U1", "U1");
        let record = ledger.create_pending(&key, ConversationType::Direct, &p, "Somchai").unwrap();

        assert!(matches!(ledger.confirm("missing", 10.0, None), Err(TambunError::NotFound(_))));
        assert!(matches!(ledger.confirm(&record.id, -1.0, None), Err(TambunError::InvalidAmount(_))));
        ledger.confirm(&record.id, 100.0, None).unwrap();
        assert!(matches!(
            ledger.confirm(&record.id, 100.0, None),
            Err(TambunError::AlreadyConfirmed(_))
        ));
        assert_eq!(ledger.balance(&p).unwrap().collected, 100.0);
    }

    #[test]
    fn test_today_summary_groups_per_project() {
        let ledger = ledger();
        let a = project(&ledger, "A");
        let b = project(&ledger, "B");
        let key = ConversationKey::new("U1", "G1");
        let other = ConversationKey::new("U2", "G2");

        for (project_id, amount) in [(&a, 100.0), (&a, 250.0), (&b, 40.0)] {
            let r = ledger.create_pending(&key, ConversationType::Group, project_id, "x").unwrap();
            ledger.confirm(&r.id, amount, None).unwrap();
        }
        let elsewhere = ledger.create_pending(&other, ConversationType::Group, &a, "y").unwrap();
        ledger.confirm(&elsewhere.id, 999.0, None).unwrap();
        // unconfirmed records never count
        ledger.create_pending(&key, ConversationType::Group, &a, "x").unwrap();

        let summary = ledger.today_summary(ConversationType::Group, "G1").unwrap();
        assert_eq!(summary.len(), 2);
        assert_eq!(summary[0].project_name, "A");
        assert_eq!(summary[0].donation_count, 2);
        assert_eq!(summary[0].total_amount, 350.0);
        assert_eq!(summary[1].total_amount, 40.0);

        assert!(ledger.today_summary(ConversationType::Direct, "G1").unwrap().is_empty());
    }

    #[test]
    fn test_daily_totals_skip_quiet_projects() {
        let ledger = ledger();
        let a = project(&ledger, "A");
        project(&ledger, "B");
        let key = ConversationKey::new("U1", "U1");
        for amount in [10.0, 20.0, 30.0] {
            let r = ledger.create_pending(&key, ConversationType::Direct, &a, "x").unwrap();
            ledger.confirm(&r.id, amount, None).unwrap();
        }

        let totals = ledger.daily_project_totals(2).unwrap();
        assert_eq!(totals.len(), 1);
        assert_eq!(totals[0].donation_count, 3);
        assert_eq!(totals[0].total_amount, 60.0);
        assert_eq!(totals[0].recent.len(), 2);
    }

    #[test]
    fn test_spend_and_balance() {
        let ledger = ledger();
        let a = project(&ledger, "A");
        let key = ConversationKey::new("U1", "U1");
        for amount in [300.0, 700.0] {
            let r = ledger.create_pending(&key, ConversationType::Direct, &a, "x").unwrap();
            ledger.confirm(&r.id, amount, None).unwrap();
        }
        let (_, balance) = ledger.spend(&a, 200.0, "tiles", None).unwrap();
        assert_eq!(balance.collected, 1000.0);
        assert_eq!(balance.expenses, 200.0);
        assert_eq!(balance.balance, 800.0);
    }

    #[test]
    fn test_thank_you_message_fallback() {
        let ledger = ledger();
        assert_eq!(ledger.thank_you_message(), settings::DEFAULT_THANK_YOU);
        ledger.db().put_setting(settings::THANK_YOU_MESSAGE, "  ").unwrap();
        assert_eq!(ledger.thank_you_message(), settings::DEFAULT_THANK_YOU);
        ledger.db().put_setting(settings::THANK_YOU_MESSAGE, "Anumodana").unwrap();
        assert_eq!(ledger.thank_you_message(), "Anumodana");
    }

    #[test]
    fn test_seed_keeps_existing_settings() {
        let ledger = ledger();
        ledger.db().put_setting(settings::SUMMARY_TIME, "08:30").unwrap();
        assert_eq!(ledger.seed_defaults().unwrap(), DEFAULT_KEYWORDS.len() + 1);
        assert_eq!(
            ledger.db().get_setting(settings::SUMMARY_TIME).unwrap().as_deref(),
            Some("08:30")
        );
        assert_eq!(ledger.db().find_keyword("DONATE").unwrap(), Some(KeywordAction::ShowProjects));
        assert_eq!(ledger.db().find_keyword("สรุป").unwrap(), Some(KeywordAction::ShowSummary));
    }

    #[test]
    fn test_attach_slip_and_recent_window() {
        let ledger = ledger();
        let key = ConversationKey::new("U1", "U1");
        let r = ledger.create_pending(&key, ConversationType::Direct, "p1", "x").unwrap();
        ledger.attach_slip(&r.id, "/uploads/m1.jpg").unwrap();
        assert!(ledger.attach_slip("missing", "/x").is_err());

        assert!(ledger.recent_open_or_confirmed(&key, "p1", r.created_at).unwrap().is_some());
        assert!(ledger.recent_open_or_confirmed(&key, "p1", r.created_at + 1).unwrap().is_none());
        assert!(ledger.recent_open_or_confirmed(&key, "p2", 0).unwrap().is_none());
        assert_eq!(
            ledger.latest_awaiting(&key, "p1").unwrap().unwrap().slip_image_path.as_deref(),
            Some("/uploads/m1.jpg")
        );
    }
}
