//! ============================================================================
//! Database Types - Query filters and statistics for the ledger store
//! ============================================================================

use serde::{Deserialize, Serialize};
use std::collections::HashMap;

use crate::types::{ConversationKey, ConversationType, DonationRecord, DonationStatus};

/// Filter for donation scans. Unset fields match everything.
#[derive(Debug, Clone, Default)]
pub struct DonationFilter {
    pub project_id: Option<String>,
    /// Restrict to one donor in one conversation
    pub key: Option<ConversationKey>,
    /// Restrict to one conversation (any donor)
    pub conversation: Option<(ConversationType, String)>,
    pub statuses: Option<Vec<DonationStatus>>,
    /// Only records created at or after this unix-millis instant
    pub created_since: Option<i64>,
}

impl DonationFilter {
    pub fn for_key(key: &ConversationKey, project_id: &str) -> Self {
        Self {
            project_id: Some(project_id.to_string()),
            key: Some(key.clone()),
            ..Default::default()
        }
    }

    pub fn with_statuses(mut self, statuses: &[DonationStatus]) -> Self {
        self.statuses = Some(statuses.to_vec());
        self
    }

    pub fn since(mut self, millis: i64) -> Self {
        self.created_since = Some(millis);
        self
    }

    pub fn matches(&self, record: &DonationRecord) -> bool {
        if let Some(project_id) = &self.project_id {
            if &record.project_id != project_id {
                return false;
            }
        }
        if let Some(key) = &self.key {
            if record.user_id != key.user_id || record.conversation_id != key.conversation_id {
                return false;
            }
        }
        if let Some((conversation_type, conversation_id)) = &self.conversation {
            if record.conversation_type != *conversation_type
                || &record.conversation_id != conversation_id
            {
                return false;
            }
        }
        if let Some(statuses) = &self.statuses {
            if !statuses.contains(&record.status) {
                return false;
            }
        }
        if let Some(since) = self.created_since {
            if record.created_at < since {
                return false;
            }
        }
        true
    }
}

/// Counts shown by `tambun stats`
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DbStats {
    pub total_projects: usize,
    pub active_projects: usize,
    pub total_donations: usize,
    pub donation_counts: HashMap<String, usize>,
    pub confirmed_amount: f64,
    pub open_conversations: usize,
    pub total_expenses: usize,
}
