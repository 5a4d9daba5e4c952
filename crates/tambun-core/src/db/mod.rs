// ============================================================================
// LedgerDb - Embedded Database (redb)
// ============================================================================
// Persistent storage for projects, donations, conversation state, expenses,
// keywords and settings. Default path: ~/.tambun/ledger.redb (override via
// TAMBUN_DB_PATH env var).
//
// redb runs one write transaction at a time, so every conditional or
// multi-record mutation below is a single atomic read-modify-write.
// ============================================================================

pub mod types;

pub use types::{DbStats, DonationFilter};

use anyhow::{anyhow, Result};
use redb::{
    backends::InMemoryBackend, Database, ReadTransaction, ReadableTable, ReadableTableMetadata,
    TableDefinition, WriteTransaction,
};
use serde::{de::DeserializeOwned, Serialize};
use std::collections::HashMap;
use std::path::{Path, PathBuf};
use tracing::{debug, info, warn};

use crate::types::{
    now_millis, ConversationKey, ConversationState, DonationRecord, DonationStatus, Expense,
    Keyword, KeywordAction, NewDonation, NewProject, Phase, Project, ProjectStatus, TambunError,
};

type RecordTable = TableDefinition<'static, &'static str, &'static [u8]>;

// Table definitions
const PROJECTS: RecordTable = TableDefinition::new("projects");
const DONATIONS: RecordTable = TableDefinition::new("donations");
const STATES: RecordTable = TableDefinition::new("conversation_states");
const EXPENSES: RecordTable = TableDefinition::new("expenses");
const KEYWORDS: RecordTable = TableDefinition::new("keywords");
const SETTINGS: TableDefinition<&str, &str> = TableDefinition::new("settings");

fn encode<T: Serialize>(value: &T, what: &str) -> Result<Vec<u8>> {
    bincode::serialize(value).map_err(|e| anyhow!("Failed to serialize {}: {}", what, e))
}

fn decode<T: DeserializeOwned>(bytes: &[u8], what: &str) -> Result<T> {
    bincode::deserialize(bytes).map_err(|e| anyhow!("Failed to deserialize {}: {}", what, e))
}

fn load<T: DeserializeOwned>(
    table: &impl ReadableTable<&'static str, &'static [u8]>,
    key: &str,
    what: &str,
) -> Result<Option<T>> {
    table
        .get(key)
        .map_err(|e| anyhow!("Failed to get {}: {}", what, e))?
        .map(|value| decode(value.value(), what))
        .transpose()
}

fn scan<T: DeserializeOwned>(
    table: &impl ReadableTable<&'static str, &'static [u8]>,
    what: &str,
) -> Result<Vec<T>> {
    let iter = table
        .range::<&str>(..)
        .map_err(|e| anyhow!("Failed to iterate {}: {}", what, e))?;
    let mut results = Vec::new();
    for entry in iter {
        let (_key, value) = entry.map_err(|e| anyhow!("Failed to read entry: {}", e))?;
        results.push(decode(value.value(), what)?);
    }
    Ok(results)
}

/// Embedded database holding the donation ledger
pub struct LedgerDb {
    db: Database,
    path: Option<PathBuf>,
}

impl LedgerDb {
    /// Open (or create) the database at the given path.
    /// If `path` is None, uses TAMBUN_DB_PATH env var or ~/.tambun/ledger.redb
    pub fn open(path: Option<&str>) -> Result<Self> {
        let db_path = if let Some(p) = path {
            PathBuf::from(p)
        } else if let Ok(env_path) = std::env::var("TAMBUN_DB_PATH") {
            PathBuf::from(env_path)
        } else {
            let home = dirs::home_dir().ok_or_else(|| anyhow!("Cannot determine home directory"))?;
            let tambun_dir = home.join(".tambun");
            std::fs::create_dir_all(&tambun_dir)
                .map_err(|e| anyhow!("Failed to create .tambun directory: {}", e))?;
            tambun_dir.join("ledger.redb")
        };

        info!("Opening ledger database at: {}", db_path.display());

        let db = Database::create(&db_path)
            .map_err(|e| anyhow!("Failed to open database: {}", e))?;
        let ledger = Self { db, path: Some(db_path) };
        ledger.init_tables()?;

        info!("Ledger database ready");
        Ok(ledger)
    }

    /// Volatile database, used by tests and dry runs
    pub fn open_in_memory() -> Result<Self> {
        let db = Database::builder()
            .create_with_backend(InMemoryBackend::new())
            .map_err(|e| anyhow!("Failed to create in-memory database: {}", e))?;
        let ledger = Self { db, path: None };
        ledger.init_tables()?;
        Ok(ledger)
    }

    fn init_tables(&self) -> Result<()> {
        // Ensure tables exist by doing a write transaction
        let txn = self.write()?;
        {
            for (name, table) in [
                ("projects", PROJECTS),
                ("donations", DONATIONS),
                ("conversation_states", STATES),
                ("expenses", EXPENSES),
                ("keywords", KEYWORDS),
            ] {
                txn.open_table(table)
                    .map_err(|e| anyhow!("Failed to create {} table: {}", name, e))?;
            }
            txn.open_table(SETTINGS)
                .map_err(|e| anyhow!("Failed to create settings table: {}", e))?;
        }
        txn.commit().map_err(|e| anyhow!("Failed to commit init: {}", e))
    }

    /// Database file path (None for in-memory databases)
    pub fn path(&self) -> Option<&Path> {
        self.path.as_deref()
    }

    fn write(&self) -> Result<WriteTransaction> {
        self.db
            .begin_write()
            .map_err(|e| anyhow!("Failed to begin write: {}", e))
    }

    fn read(&self) -> Result<ReadTransaction> {
        self.db
            .begin_read()
            .map_err(|e| anyhow!("Failed to begin read: {}", e))
    }

    fn get_record<T: DeserializeOwned>(&self, table: RecordTable, key: &str, what: &str) -> Result<Option<T>> {
        let txn = self.read()?;
        let table = txn
            .open_table(table)
            .map_err(|e| anyhow!("Failed to open {} table: {}", what, e))?;
        load(&table, key, what)
    }

    fn list_records<T: DeserializeOwned>(&self, table: RecordTable, what: &str) -> Result<Vec<T>> {
        let txn = self.read()?;
        let table = txn
            .open_table(table)
            .map_err(|e| anyhow!("Failed to open {} table: {}", what, e))?;
        scan(&table, what)
    }

    fn put_record<T: Serialize>(&self, table: RecordTable, key: &str, value: &T, what: &str) -> Result<()> {
        let bytes = encode(value, what)?;
        let txn = self.write()?;
        {
            let mut table = txn
                .open_table(table)
                .map_err(|e| anyhow!("Failed to open {} table: {}", what, e))?;
            table
                .insert(key, bytes.as_slice())
                .map_err(|e| anyhow!("Failed to insert {}: {}", what, e))?;
        }
        txn.commit().map_err(|e| anyhow!("Failed to commit: {}", e))
    }

    /// Load, patch and store one record inside a single write transaction
    fn modify_record<T, F>(&self, table: RecordTable, key: &str, what: &str, patch: F) -> Result<Option<T>>
    where
        T: Serialize + DeserializeOwned,
        F: FnOnce(&mut T),
    {
        let txn = self.write()?;
        let updated = {
            let mut table = txn
                .open_table(table)
                .map_err(|e| anyhow!("Failed to open {} table: {}", what, e))?;
            match load::<T>(&table, key, what)? {
                Some(mut record) => {
                    patch(&mut record);
                    let bytes = encode(&record, what)?;
                    table
                        .insert(key, bytes.as_slice())
                        .map_err(|e| anyhow!("Failed to update {}: {}", what, e))?;
                    Some(record)
                }
                None => None,
            }
        };
        txn.commit().map_err(|e| anyhow!("Failed to commit: {}", e))?;
        Ok(updated)
    }

    // ========================================================================
    // Project Operations
    // ========================================================================

    pub fn create_project(&self, new: NewProject) -> Result<Project> {
        let now = now_millis();
        let project = Project {
            id: uuid::Uuid::new_v4().to_string(),
            name: new.name.trim().to_string(),
            description: new.description,
            destination: new.destination,
            promptpay_qr_url: new.promptpay_qr_url,
            goal_amount: new.goal_amount,
            current_amount: 0.0,
            total_expenses: 0.0,
            status: ProjectStatus::Active,
            created_at: now,
            updated_at: now,
        };
        self.put_record(PROJECTS, &project.id, &project, "project")?;
        info!("Created project {} ({})", project.id, project.name);
        Ok(project)
    }

    pub fn get_project(&self, project_id: &str) -> Result<Option<Project>> {
        self.get_record(PROJECTS, project_id, "project")
    }

    /// Projects, newest first, optionally filtered by status
    pub fn list_projects(&self, status: Option<ProjectStatus>) -> Result<Vec<Project>> {
        let mut projects: Vec<Project> = self.list_records(PROJECTS, "project")?;
        if let Some(status) = status {
            projects.retain(|p| p.status == status);
        }
        projects.sort_by(|a, b| b.created_at.cmp(&a.created_at));
        Ok(projects)
    }

    /// Edit descriptive fields. Totals are not reachable from here.
    pub fn update_project<F>(&self, project_id: &str, patch: F) -> Result<Option<Project>>
    where
        F: FnOnce(&mut ProjectDetails<'_>),
    {
        self.modify_record(PROJECTS, project_id, "project", |project: &mut Project| {
            let mut details = ProjectDetails {
                name: &mut project.name,
                description: &mut project.description,
                destination: &mut project.destination,
                promptpay_qr_url: &mut project.promptpay_qr_url,
                goal_amount: &mut project.goal_amount,
                status: &mut project.status,
            };
            patch(&mut details);
            project.updated_at = now_millis();
        })
    }

    pub fn delete_project(&self, project_id: &str) -> Result<bool> {
        let txn = self.write()?;
        let removed;
        {
            let mut table = txn
                .open_table(PROJECTS)
                .map_err(|e| anyhow!("Failed to open projects table: {}", e))?;
            removed = table
                .remove(project_id)
                .map_err(|e| anyhow!("Failed to remove project: {}", e))?
                .is_some();
        }
        txn.commit().map_err(|e| anyhow!("Failed to commit delete: {}", e))?;

        if removed {
            debug!("Deleted project: {}", project_id);
        }
        Ok(removed)
    }

    // ========================================================================
    // Conversation State Operations
    // ========================================================================

    pub fn get_state(&self, key: &ConversationKey) -> Result<Option<ConversationState>> {
        self.get_record(STATES, &key.storage_key(), "conversation state")
    }

    /// Unconditional upsert. A `Phase::None` state removes the row.
    pub fn set_state(&self, state: &ConversationState) -> Result<()> {
        if state.phase == Phase::None {
            self.clear_state(&state.key)?;
            return Ok(());
        }
        self.put_record(STATES, &state.key.storage_key(), state, "conversation state")?;
        debug!("Set state for {}: {:?}", state.key, state.phase);
        Ok(())
    }

    pub fn clear_state(&self, key: &ConversationKey) -> Result<bool> {
        let storage_key = key.storage_key();
        let txn = self.write()?;
        let removed;
        {
            let mut table = txn
                .open_table(STATES)
                .map_err(|e| anyhow!("Failed to open states table: {}", e))?;
            removed = table
                .remove(storage_key.as_str())
                .map_err(|e| anyhow!("Failed to remove state: {}", e))?
                .is_some();
        }
        txn.commit().map_err(|e| anyhow!("Failed to commit delete: {}", e))?;

        if removed {
            debug!("Cleared state for {}", key);
        }
        Ok(removed)
    }

    /// Compare-and-swap on a conversation's state.
    ///
    /// `predicate` sees the current row (None when absent). When it holds,
    /// `patch` builds the replacement, which is written in the same write
    /// transaction and returned. When it fails nothing is written and
    /// `Ok(None)` comes back.
    pub fn update_state_if<P, F>(
        &self,
        key: &ConversationKey,
        predicate: P,
        patch: F,
    ) -> Result<Option<ConversationState>>
    where
        P: FnOnce(Option<&ConversationState>) -> bool,
        F: FnOnce(Option<ConversationState>) -> ConversationState,
    {
        let storage_key = key.storage_key();
        let txn = self.write()?;
        let written = {
            let mut table = txn
                .open_table(STATES)
                .map_err(|e| anyhow!("Failed to open states table: {}", e))?;
            let current: Option<ConversationState> =
                load(&table, &storage_key, "conversation state")?;

            if !predicate(current.as_ref()) {
                None
            } else {
                let next = patch(current);
                if next.phase == Phase::None {
                    table
                        .remove(storage_key.as_str())
                        .map_err(|e| anyhow!("Failed to remove state: {}", e))?;
                } else {
                    let bytes = encode(&next, "conversation state")?;
                    table
                        .insert(storage_key.as_str(), bytes.as_slice())
                        .map_err(|e| anyhow!("Failed to update state: {}", e))?;
                }
                Some(next)
            }
        };

        if written.is_none() {
            txn.abort().map_err(|e| anyhow!("Failed to abort: {}", e))?;
            return Ok(None);
        }
        txn.commit().map_err(|e| anyhow!("Failed to commit: {}", e))?;
        Ok(written)
    }

    pub fn list_states(&self) -> Result<Vec<ConversationState>> {
        self.list_records(STATES, "conversation state")
    }

    // ========================================================================
    // Donation Operations
    // ========================================================================

    pub fn insert_donation(&self, new: NewDonation) -> Result<DonationRecord> {
        let record = DonationRecord {
            id: uuid::Uuid::new_v4().to_string(),
            project_id: new.project_id,
            user_id: new.key.user_id,
            conversation_id: new.key.conversation_id,
            conversation_type: new.conversation_type,
            display_name: new.display_name,
            ocr_amount: None,
            final_amount: 0.0,
            slip_image_path: None,
            status: new.status,
            is_anonymous: false,
            recipient_label: None,
            created_at: now_millis(),
            confirmed_at: None,
        };
        self.put_record(DONATIONS, &record.id, &record, "donation")?;
        debug!("Stored donation {} ({:?})", record.id, record.status);
        Ok(record)
    }

    pub fn get_donation(&self, donation_id: &str) -> Result<Option<DonationRecord>> {
        self.get_record(DONATIONS, donation_id, "donation")
    }

    /// Patch a record's non-ledger fields (slip path, display name, ...).
    /// Status and amounts change only through `confirm_donation`.
    pub fn update_donation<F>(&self, donation_id: &str, patch: F) -> Result<Option<DonationRecord>>
    where
        F: FnOnce(&mut DonationDetails<'_>),
    {
        self.modify_record(DONATIONS, donation_id, "donation", |record: &mut DonationRecord| {
            let mut details = DonationDetails {
                display_name: &mut record.display_name,
                ocr_amount: &mut record.ocr_amount,
                slip_image_path: &mut record.slip_image_path,
                is_anonymous: &mut record.is_anonymous,
            };
            patch(&mut details);
        })
    }

    /// Matching donations, newest first
    pub fn list_donations(&self, filter: &DonationFilter) -> Result<Vec<DonationRecord>> {
        let mut records: Vec<DonationRecord> = self.list_records(DONATIONS, "donation")?;
        records.retain(|r| filter.matches(r));
        records.sort_by(|a, b| b.created_at.cmp(&a.created_at));
        Ok(records)
    }

    /// Most recently created matching donation
    pub fn latest_donation(&self, filter: &DonationFilter) -> Result<Option<DonationRecord>> {
        Ok(self.list_donations(filter)?.into_iter().next())
    }

    /// Confirm a donation and credit its project, atomically.
    ///
    /// Fails with `TambunError::AlreadyConfirmed` instead of crediting twice.
    pub fn confirm_donation(
        &self,
        donation_id: &str,
        amount: f64,
        recipient_label: Option<&str>,
    ) -> Result<DonationRecord> {
        if !(amount.is_finite() && amount > 0.0) {
            return Err(TambunError::InvalidAmount(amount.to_string()).into());
        }

        let txn = self.write()?;
        let record = {
            let mut donations = txn
                .open_table(DONATIONS)
                .map_err(|e| anyhow!("Failed to open donations table: {}", e))?;
            let mut record: DonationRecord = load(&donations, donation_id, "donation")?
                .ok_or_else(|| TambunError::NotFound(format!("donation {}", donation_id)))?;

            if record.is_confirmed() {
                return Err(TambunError::AlreadyConfirmed(donation_id.to_string()).into());
            }

            let now = now_millis();
            record.status = DonationStatus::Confirmed;
            record.final_amount = amount;
            record.confirmed_at = Some(now);
            if let Some(label) = recipient_label {
                record.recipient_label = Some(label.to_string());
            }
            let bytes = encode(&record, "donation")?;
            donations
                .insert(donation_id, bytes.as_slice())
                .map_err(|e| anyhow!("Failed to update donation: {}", e))?;

            let mut projects = txn
                .open_table(PROJECTS)
                .map_err(|e| anyhow!("Failed to open projects table: {}", e))?;
            match load::<Project>(&projects, &record.project_id, "project")? {
                Some(mut project) => {
                    project.current_amount += amount;
                    project.updated_at = now;
                    let bytes = encode(&project, "project")?;
                    projects
                        .insert(project.id.as_str(), bytes.as_slice())
                        .map_err(|e| anyhow!("Failed to update project: {}", e))?;
                }
                None => warn!(
                    "Donation {} confirmed for missing project {}",
                    donation_id, record.project_id
                ),
            }
            record
        };
        txn.commit().map_err(|e| anyhow!("Failed to commit confirmation: {}", e))?;

        info!(
            "Confirmed donation {} for {:.2} (project {})",
            record.id, amount, record.project_id
        );
        Ok(record)
    }

    // ========================================================================
    // Expense Operations
    // ========================================================================

    /// Apply `delta` to a project's expense total inside `txn`
    fn adjust_expenses(txn: &WriteTransaction, project_id: &str, delta: f64) -> Result<()> {
        let mut projects = txn
            .open_table(PROJECTS)
            .map_err(|e| anyhow!("Failed to open projects table: {}", e))?;
        let mut project: Project = load(&projects, project_id, "project")?
            .ok_or_else(|| TambunError::NotFound(format!("project {}", project_id)))?;
        project.total_expenses += delta;
        project.updated_at = now_millis();
        let bytes = encode(&project, "project")?;
        projects
            .insert(project_id, bytes.as_slice())
            .map_err(|e| anyhow!("Failed to update project: {}", e))?;
        Ok(())
    }

    pub fn record_expense(
        &self,
        project_id: &str,
        amount: f64,
        description: &str,
        receipt_url: Option<String>,
    ) -> Result<Expense> {
        if !(amount.is_finite() && amount > 0.0) {
            return Err(TambunError::InvalidAmount(amount.to_string()).into());
        }
        if description.trim().is_empty() {
            return Err(TambunError::MissingField("description").into());
        }

        let expense = Expense {
            id: uuid::Uuid::new_v4().to_string(),
            project_id: project_id.to_string(),
            amount,
            description: description.trim().to_string(),
            receipt_url,
            created_at: now_millis(),
        };
        let bytes = encode(&expense, "expense")?;

        let txn = self.write()?;
        Self::adjust_expenses(&txn, project_id, amount)?;
        {
            let mut expenses = txn
                .open_table(EXPENSES)
                .map_err(|e| anyhow!("Failed to open expenses table: {}", e))?;
            expenses
                .insert(expense.id.as_str(), bytes.as_slice())
                .map_err(|e| anyhow!("Failed to insert expense: {}", e))?;
        }
        txn.commit().map_err(|e| anyhow!("Failed to commit expense: {}", e))?;

        info!("Recorded expense {:.2} on project {}", amount, project_id);
        Ok(expense)
    }

    /// Change an expense; the project total moves by the difference
    pub fn update_expense(
        &self,
        expense_id: &str,
        amount: Option<f64>,
        description: Option<String>,
        receipt_url: Option<String>,
    ) -> Result<Option<Expense>> {
        if let Some(amount) = amount {
            if !(amount.is_finite() && amount > 0.0) {
                return Err(TambunError::InvalidAmount(amount.to_string()).into());
            }
        }

        let txn = self.write()?;
        let updated = {
            let mut expenses = txn
                .open_table(EXPENSES)
                .map_err(|e| anyhow!("Failed to open expenses table: {}", e))?;
            match load::<Expense>(&expenses, expense_id, "expense")? {
                None => None,
                Some(mut expense) => {
                    if let Some(amount) = amount {
                        Self::adjust_expenses(&txn, &expense.project_id, amount - expense.amount)?;
                        expense.amount = amount;
                    }
                    if let Some(description) = description {
                        expense.description = description;
                    }
                    if receipt_url.is_some() {
                        expense.receipt_url = receipt_url;
                    }
                    let bytes = encode(&expense, "expense")?;
                    expenses
                        .insert(expense_id, bytes.as_slice())
                        .map_err(|e| anyhow!("Failed to update expense: {}", e))?;
                    Some(expense)
                }
            }
        };
        if updated.is_none() {
            txn.abort().map_err(|e| anyhow!("Failed to abort: {}", e))?;
            return Ok(None);
        }
        txn.commit().map_err(|e| anyhow!("Failed to commit expense: {}", e))?;
        Ok(updated)
    }

    pub fn delete_expense(&self, expense_id: &str) -> Result<bool> {
        let txn = self.write()?;
        let removed = {
            let mut expenses = txn
                .open_table(EXPENSES)
                .map_err(|e| anyhow!("Failed to open expenses table: {}", e))?;
            let expense: Option<Expense> = load(&expenses, expense_id, "expense")?;
            match expense {
                Some(expense) => {
                    Self::adjust_expenses(&txn, &expense.project_id, -expense.amount)?;
                    expenses
                        .remove(expense_id)
                        .map_err(|e| anyhow!("Failed to remove expense: {}", e))?;
                    true
                }
                None => false,
            }
        };
        if removed {
            txn.commit().map_err(|e| anyhow!("Failed to commit delete: {}", e))?;
            debug!("Deleted expense: {}", expense_id);
        } else {
            txn.abort().map_err(|e| anyhow!("Failed to abort: {}", e))?;
        }
        Ok(removed)
    }

    /// Expenses of a project, newest first
    pub fn list_expenses(&self, project_id: &str) -> Result<Vec<Expense>> {
        let mut expenses: Vec<Expense> = self.list_records(EXPENSES, "expense")?;
        expenses.retain(|e| e.project_id == project_id);
        expenses.sort_by(|a, b| b.created_at.cmp(&a.created_at));
        Ok(expenses)
    }

    // ========================================================================
    // Keyword Operations
    // ========================================================================

    pub fn upsert_keyword(&self, keyword: &str, action: KeywordAction, is_active: bool) -> Result<Keyword> {
        let normalized = keyword.trim().to_lowercase();
        if normalized.is_empty() {
            return Err(TambunError::MissingField("keyword").into());
        }
        let record = Keyword {
            keyword: normalized.clone(),
            action,
            is_active,
            created_at: now_millis(),
        };
        self.put_record(KEYWORDS, &normalized, &record, "keyword")?;
        debug!("Stored keyword '{}' -> {:?}", normalized, action);
        Ok(record)
    }

    /// Case-insensitive exact lookup among active keywords
    pub fn find_keyword(&self, text: &str) -> Result<Option<KeywordAction>> {
        let normalized = text.trim().to_lowercase();
        if normalized.is_empty() {
            return Ok(None);
        }
        let keyword: Option<Keyword> = self.get_record(KEYWORDS, &normalized, "keyword")?;
        Ok(keyword.filter(|k| k.is_active).map(|k| k.action))
    }

    pub fn list_keywords(&self) -> Result<Vec<Keyword>> {
        self.list_records(KEYWORDS, "keyword")
    }

    // ========================================================================
    // Settings Operations
    // ========================================================================

    pub fn get_setting(&self, key: &str) -> Result<Option<String>> {
        let txn = self.read()?;
        let table = txn
            .open_table(SETTINGS)
            .map_err(|e| anyhow!("Failed to open settings table: {}", e))?;
        let value = table
            .get(key)
            .map_err(|e| anyhow!("Failed to get setting: {}", e))?
            .map(|v| v.value().to_string());
        Ok(value)
    }

    pub fn put_setting(&self, key: &str, value: &str) -> Result<()> {
        let txn = self.write()?;
        {
            let mut table = txn
                .open_table(SETTINGS)
                .map_err(|e| anyhow!("Failed to open settings table: {}", e))?;
            table
                .insert(key, value)
                .map_err(|e| anyhow!("Failed to insert setting: {}", e))?;
        }
        txn.commit().map_err(|e| anyhow!("Failed to commit: {}", e))?;
        debug!("Stored setting {}", key);
        Ok(())
    }

    pub fn list_settings(&self) -> Result<Vec<(String, String)>> {
        let txn = self.read()?;
        let table = txn
            .open_table(SETTINGS)
            .map_err(|e| anyhow!("Failed to open settings table: {}", e))?;
        let mut results = Vec::new();
        let iter = table
            .range::<&str>(..)
            .map_err(|e| anyhow!("Failed to iterate settings: {}", e))?;
        for entry in iter {
            let (key, value) = entry.map_err(|e| anyhow!("Failed to read entry: {}", e))?;
            results.push((key.value().to_string(), value.value().to_string()));
        }
        Ok(results)
    }

    // ========================================================================
    // Statistics
    // ========================================================================

    pub fn stats(&self) -> Result<DbStats> {
        let projects = self.list_projects(None)?;
        let donations = self.list_donations(&DonationFilter::default())?;

        let txn = self.read()?;
        let states = txn
            .open_table(STATES)
            .map_err(|e| anyhow!("Failed to open states table: {}", e))?;
        let open_conversations = states
            .len()
            .map_err(|e| anyhow!("Failed to count states: {}", e))? as usize;
        let expenses = txn
            .open_table(EXPENSES)
            .map_err(|e| anyhow!("Failed to open expenses table: {}", e))?;
        let total_expenses = expenses
            .len()
            .map_err(|e| anyhow!("Failed to count expenses: {}", e))? as usize;

        let mut donation_counts = HashMap::new();
        for donation in &donations {
            *donation_counts
                .entry(donation.status.as_str().to_string())
                .or_insert(0usize) += 1;
        }

        Ok(DbStats {
            total_projects: projects.len(),
            active_projects: projects
                .iter()
                .filter(|p| p.status == ProjectStatus::Active)
                .count(),
            total_donations: donations.len(),
            donation_counts,
            confirmed_amount: donations
                .iter()
                .filter(|d| d.is_confirmed())
                .map(|d| d.final_amount)
                .sum(),
            open_conversations,
            total_expenses,
        })
    }
}

/// Editable view of a project's descriptive fields
pub struct ProjectDetails<'a> {
    pub name: &'a mut String,
    pub description: &'a mut Option<String>,
    pub destination: &'a mut Option<String>,
    pub promptpay_qr_url: &'a mut Option<String>,
    pub goal_amount: &'a mut Option<f64>,
    pub status: &'a mut ProjectStatus,
}

/// Editable view of a donation's non-ledger fields
pub struct DonationDetails<'a> {
    pub display_name: &'a mut String,
    pub ocr_amount: &'a mut Option<f64>,
    pub slip_image_path: &'a mut Option<String>,
    pub is_anonymous: &'a mut bool,
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::types::ConversationType;

    fn db() -> LedgerDb {
        LedgerDb::open_in_memory().unwrap()
    }

    fn project(db: &LedgerDb, name: &str, goal: f64) -> Project {
        db.create_project(NewProject {
            name: name.to_string(),
            goal_amount: Some(goal),
            ..Default::default()
        })
        .unwrap()
    }

    fn pending(db: &LedgerDb, key: &ConversationKey, project_id: &str) -> DonationRecord {
        db.insert_donation(NewDonation {
            project_id: project_id.to_string(),
            key: key.clone(),
            conversation_type: ConversationType::Direct,
            display_name: "Somchai".into(),
            status: DonationStatus::WaitingConfirmation,
        })
        .unwrap()
    }

    fn state(key: &ConversationKey, phase: Phase) -> ConversationState {
        ConversationState {
            key: key.clone(),
            conversation_type: ConversationType::Direct,
            phase,
            created_at: 0,
            updated_at: 0,
        }
    }

    #[test]
    fn test_project_crud() {
        let db = db();
        let p = project(&db, "  Temple roof ", 1000.0);
        assert_eq!(p.name, "Temple roof");
        assert_eq!(db.get_project(&p.id).unwrap().unwrap(), p);

        let updated = db
            .update_project(&p.id, |d| *d.status = ProjectStatus::Completed)
            .unwrap()
            .unwrap();
        assert_eq!(updated.status, ProjectStatus::Completed);
        assert!(db.list_projects(Some(ProjectStatus::Active)).unwrap().is_empty());

        assert!(db.delete_project(&p.id).unwrap());
        assert!(!db.delete_project(&p.id).unwrap());
        assert!(db.get_project(&p.id).unwrap().is_none());
    }

    #[test]
    fn test_confirm_credits_project_once() {
        let db = db();
        let p = project(&db, "Temple roof", 1000.0);
        let key = ConversationKey::new("U1", "U1");
        let record = pending(&db, &key, &p.id);

        let confirmed = db.confirm_donation(&record.id, 500.0, Some("Abbot")).unwrap();
        assert_eq!(confirmed.status, DonationStatus::Confirmed);
        assert_eq!(confirmed.final_amount, 500.0);
        assert!(confirmed.confirmed_at.is_some());
        assert_eq!(confirmed.recipient_label.as_deref(), Some("Abbot"));

        let err = db.confirm_donation(&record.id, 500.0, None).unwrap_err();
        assert!(matches!(
            err.downcast_ref::<TambunError>(),
            Some(TambunError::AlreadyConfirmed(_))
        ));
        assert_eq!(db.get_project(&p.id).unwrap().unwrap().current_amount, 500.0);
    }

    #[test]
    fn test_confirm_rejects_bad_input() {
        let db = db();
        let err = db.confirm_donation("missing", 10.0, None).unwrap_err();
        assert!(matches!(err.downcast_ref::<TambunError>(), Some(TambunError::NotFound(_))));

        let err = db.confirm_donation("missing", 0.0, None).unwrap_err();
        assert!(matches!(err.downcast_ref::<TambunError>(), Some(TambunError::InvalidAmount(_))));
    }

    #[test]
    fn test_balance_after_expense() {
        let db = db();
        let a = project(&db, "A", 1000.0);
        let b = project(&db, "B", 1000.0);
        let key = ConversationKey::new("U1", "U1");

        for amount in [300.0, 700.0] {
            let record = pending(&db, &key, &a.id);
            db.confirm_donation(&record.id, amount, None).unwrap();
        }
        db.record_expense(&a.id, 200.0, "roof tiles", None).unwrap();

        let a = db.get_project(&a.id).unwrap().unwrap();
        assert_eq!(a.current_amount, 1000.0);
        assert_eq!(a.balance(), 800.0);
        assert_eq!(db.get_project(&b.id).unwrap().unwrap().balance(), 0.0);
    }

    #[test]
    fn test_expense_update_and_delete_adjust_totals() {
        let db = db();
        let p = project(&db, "A", 1000.0);
        let expense = db.record_expense(&p.id, 200.0, "tiles", None).unwrap();

        db.update_expense(&expense.id, Some(250.0), None, None).unwrap().unwrap();
        assert_eq!(db.get_project(&p.id).unwrap().unwrap().total_expenses, 250.0);

        assert!(db.delete_expense(&expense.id).unwrap());
        assert_eq!(db.get_project(&p.id).unwrap().unwrap().total_expenses, 0.0);
        assert!(db.list_expenses(&p.id).unwrap().is_empty());

        let err = db.record_expense("nope", 10.0, "x", None).unwrap_err();
        assert!(matches!(err.downcast_ref::<TambunError>(), Some(TambunError::NotFound(_))));
    }

    #[test]
    fn test_update_state_if_is_conditional() {
        let db = db();
        let key = ConversationKey::new("U1", "G1");
        db.set_state(&state(&key, Phase::WaitingSlip { project_id: "p1".into() })).unwrap();

        let advance = |db: &LedgerDb| {
            db.update_state_if(
                &key,
                |cur| matches!(cur, Some(s) if s.phase.pending_project() == Some("p1")
                    && !s.phase.is_waiting_confirmation_for("p1")),
                |cur| {
                    let mut next = cur.unwrap();
                    next.phase = Phase::WaitingConfirmation { project_id: "p1".into() };
                    next
                },
            )
            .unwrap()
        };

        assert!(advance(&db).is_some());
        assert!(advance(&db).is_none());
        assert_eq!(
            db.get_state(&key).unwrap().unwrap().phase,
            Phase::WaitingConfirmation { project_id: "p1".into() }
        );
    }

    #[test]
    fn test_none_phase_removes_row() {
        let db = db();
        let key = ConversationKey::new("U1", "U1");
        db.set_state(&state(&key, Phase::WaitingSlip { project_id: "p".into() })).unwrap();
        db.set_state(&state(&key, Phase::None)).unwrap();
        assert!(db.get_state(&key).unwrap().is_none());
        assert!(!db.clear_state(&key).unwrap());
    }

    #[test]
    fn test_latest_donation_filter() {
        let db = db();
        let key = ConversationKey::new("U1", "U1");
        let first = pending(&db, &key, "p1");
        std::thread::sleep(std::time::Duration::from_millis(2));
        let second = pending(&db, &key, "p1");
        pending(&db, &ConversationKey::new("U2", "U2"), "p1");

        let filter = DonationFilter::for_key(&key, "p1")
            .with_statuses(&[DonationStatus::WaitingConfirmation]);
        assert_eq!(db.latest_donation(&filter).unwrap().unwrap().id, second.id);

        db.confirm_donation(&second.id, 10.0, None).unwrap();
        assert_eq!(db.latest_donation(&filter).unwrap().unwrap().id, first.id);
    }

    #[test]
    fn test_update_donation_leaves_ledger_fields() {
        let db = db();
        let record = pending(&db, &ConversationKey::new("U1", "U1"), "p1");
        let updated = db
            .update_donation(&record.id, |d| {
                *d.slip_image_path = Some("/tmp/slip.jpg".into());
            })
            .unwrap()
            .unwrap();
        assert_eq!(updated.slip_image_path.as_deref(), Some("/tmp/slip.jpg"));
        assert_eq!(updated.status, DonationStatus::WaitingConfirmation);
        assert!(db.update_donation("missing", |_| {}).unwrap().is_none());
    }

    #[test]
    fn test_keywords_case_insensitive_and_active_only() {
        let db = db();
        db.upsert_keyword("Donate", KeywordAction::ShowProjects, true).unwrap();
        db.upsert_keyword("summary", KeywordAction::ShowSummary, false).unwrap();

        assert_eq!(db.find_keyword("DONATE").unwrap(), Some(KeywordAction::ShowProjects));
        assert_eq!(db.find_keyword("  donate ").unwrap(), Some(KeywordAction::ShowProjects));
        assert_eq!(db.find_keyword("donate now").unwrap(), None);
        assert_eq!(db.find_keyword("summary").unwrap(), None);
        assert_eq!(db.list_keywords().unwrap().len(), 2);
    }

    #[test]
    fn test_settings_and_stats() {
        let db = db();
        assert!(db.get_setting("thank_you_message").unwrap().is_none());
        db.put_setting("thank_you_message", "Anumodana").unwrap();
        assert_eq!(db.get_setting("thank_you_message").unwrap().as_deref(), Some("Anumodana"));
        assert_eq!(db.list_settings().unwrap().len(), 1);

        let p = project(&db, "A", 100.0);
        let record = pending(&db, &ConversationKey::new("U1", "U1"), &p.id);
        db.confirm_donation(&record.id, 42.0, None).unwrap();
        pending(&db, &ConversationKey::new("U2", "U2"), &p.id);

        let stats = db.stats().unwrap();
        assert_eq!(stats.total_projects, 1);
        assert_eq!(stats.total_donations, 2);
        assert_eq!(stats.donation_counts.get("confirmed"), Some(&1));
        assert_eq!(stats.confirmed_amount, 42.0);
    }
}
