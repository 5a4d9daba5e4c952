//! ============================================================================
//! Core Types for Tambun
//! ============================================================================
//! Shared domain types: conversations, donation records, projects, expenses,
//! keyword routing and the error taxonomy.
//! ============================================================================

use serde::{Deserialize, Serialize};
use std::fmt;

/// Display name used when no profile name is known for a donor
pub const DEFAULT_DISPLAY_NAME: &str = "ผู้บริจาค";

/// Current time as unix milliseconds (record timestamp resolution)
pub fn now_millis() -> i64 {
    chrono::Utc::now().timestamp_millis()
}

// ============================================================================
// Conversations
// ============================================================================

/// Where an event came from: a one-to-one chat or a group chat
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ConversationType {
    Direct,
    Group,
}

impl ConversationType {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Direct => "direct",
            Self::Group => "group",
        }
    }
}

/// Identity of one donor inside one conversation.
/// A user chatting in two groups has two independent flows.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct ConversationKey {
    pub user_id: String,
    pub conversation_id: String,
}

impl ConversationKey {
    pub fn new(user_id: impl Into<String>, conversation_id: impl Into<String>) -> Self {
        Self {
            user_id: user_id.into(),
            conversation_id: conversation_id.into(),
        }
    }

    /// Storage key. Ids from the platform never contain a newline.
    pub fn storage_key(&self) -> String {
        format!("{}\n{}", self.user_id, self.conversation_id)
    }
}

impl fmt::Display for ConversationKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}@{}", self.user_id, self.conversation_id)
    }
}

/// Step of the donation flow a conversation is in.
/// The pending project lives inside the variant, so a phase other than
/// `None` always names one.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum Phase {
    None,
    WaitingSlip { project_id: String },
    WaitingConfirmation { project_id: String },
}

impl Phase {
    pub fn pending_project(&self) -> Option<&str> {
        match self {
            Phase::None => None,
            Phase::WaitingSlip { project_id } | Phase::WaitingConfirmation { project_id } => {
                Some(project_id)
            }
        }
    }

    pub fn is_waiting_confirmation_for(&self, project: &str) -> bool {
        matches!(self, Phase::WaitingConfirmation { project_id } if project_id == project)
    }
}

/// Per-(user, conversation) flow state. Absent rows read as `Phase::None`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ConversationState {
    pub key: ConversationKey,
    pub conversation_type: ConversationType,
    pub phase: Phase,
    pub created_at: i64,
    pub updated_at: i64,
}

// ============================================================================
// Donations
// ============================================================================

/// Ledger status of a donation record. Transitions only move forward;
/// `Rejected` is kept for records an operator voids by hand.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum DonationStatus {
    WaitingSlip,
    WaitingConfirmation,
    Confirmed,
    Rejected,
}

impl DonationStatus {
    pub fn from_str(s: &str) -> Option<Self> {
        match s.to_lowercase().replace('-', "_").as_str() {
            "waiting_slip" => Some(Self::WaitingSlip),
            "waiting_confirmation" => Some(Self::WaitingConfirmation),
            "confirmed" => Some(Self::Confirmed),
            "rejected" => Some(Self::Rejected),
            _ => None,
        }
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            Self::WaitingSlip => "waiting_slip",
            Self::WaitingConfirmation => "waiting_confirmation",
            Self::Confirmed => "confirmed",
            Self::Rejected => "rejected",
        }
    }
}

/// One donation attempt. Never physically deleted.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DonationRecord {
    pub id: String,
    pub project_id: String,
    pub user_id: String,
    pub conversation_id: String,
    pub conversation_type: ConversationType,
    pub display_name: String,
    /// Amount read off the slip image, when recognition ran
    pub ocr_amount: Option<f64>,
    /// Authoritative only once `status` is `Confirmed`
    pub final_amount: f64,
    pub slip_image_path: Option<String>,
    pub status: DonationStatus,
    pub is_anonymous: bool,
    /// Recipient label typed on the edit-amount page
    pub recipient_label: Option<String>,
    pub created_at: i64,
    /// Set iff `status` is `Confirmed`
    pub confirmed_at: Option<i64>,
}

impl DonationRecord {
    pub fn key(&self) -> ConversationKey {
        ConversationKey::new(&self.user_id, &self.conversation_id)
    }

    pub fn is_confirmed(&self) -> bool {
        self.status == DonationStatus::Confirmed
    }
}

/// Input for a fresh ledger record
#[derive(Debug, Clone)]
pub struct NewDonation {
    pub project_id: String,
    pub key: ConversationKey,
    pub conversation_type: ConversationType,
    pub display_name: String,
    pub status: DonationStatus,
}

// ============================================================================
// Projects & Expenses
// ============================================================================

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ProjectStatus {
    Active,
    Completed,
    Archived,
}

impl ProjectStatus {
    pub fn from_str(s: &str) -> Option<Self> {
        match s.to_lowercase().as_str() {
            "active" => Some(Self::Active),
            "completed" => Some(Self::Completed),
            "archived" => Some(Self::Archived),
            _ => None,
        }
    }
}

/// A fundraising project with cached running totals
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Project {
    pub id: String,
    pub name: String,
    pub description: Option<String>,
    /// Who receives the money (shown on the thank-you card)
    pub destination: Option<String>,
    pub promptpay_qr_url: Option<String>,
    pub goal_amount: Option<f64>,
    /// Sum of confirmed donations
    pub current_amount: f64,
    pub total_expenses: f64,
    pub status: ProjectStatus,
    pub created_at: i64,
    pub updated_at: i64,
}

impl Project {
    pub fn balance(&self) -> f64 {
        self.current_amount - self.total_expenses
    }
}

/// Input for a new project
#[derive(Debug, Clone, Default)]
pub struct NewProject {
    pub name: String,
    pub description: Option<String>,
    pub destination: Option<String>,
    pub promptpay_qr_url: Option<String>,
    pub goal_amount: Option<f64>,
}

/// Money spent out of a project
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Expense {
    pub id: String,
    pub project_id: String,
    pub amount: f64,
    pub description: String,
    pub receipt_url: Option<String>,
    pub created_at: i64,
}

// ============================================================================
// Keywords & Settings
// ============================================================================

/// What a matched chat keyword does
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum KeywordAction {
    ShowProjects,
    ShowSummary,
}

impl KeywordAction {
    pub fn from_str(s: &str) -> Option<Self> {
        match s.trim().to_lowercase().replace('-', "_").as_str() {
            "show_projects" => Some(Self::ShowProjects),
            "show_summary" => Some(Self::ShowSummary),
            _ => None,
        }
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            Self::ShowProjects => "show_projects",
            Self::ShowSummary => "show_summary",
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Keyword {
    pub keyword: String,
    pub action: KeywordAction,
    pub is_active: bool,
    pub created_at: i64,
}

/// Setting keys read by the bot
pub mod settings {
    pub const THANK_YOU_MESSAGE: &str = "thank_you_message";
    pub const SUMMARY_TIME: &str = "summary_time";
    pub const SUMMARY_GROUP_ID: &str = "summary_group_id";

    pub const DEFAULT_THANK_YOU: &str = "ขอบคุณสำหรับการบริจาค";
    pub const DEFAULT_SUMMARY_TIME: &str = "19:00";
}

// ============================================================================
// Errors
// ============================================================================

/// Domain failures callers need to tell apart
#[derive(Debug, thiserror::Error)]
pub enum TambunError {
    #[error("Not found: {0}")]
    NotFound(String),

    #[error("Donation already confirmed: {0}")]
    AlreadyConfirmed(String),

    #[error("Invalid amount: {0}")]
    InvalidAmount(String),

    #[error("Missing required field: {0}")]
    MissingField(&'static str),

    #[error(transparent)]
    Internal(#[from] anyhow::Error),
}

impl TambunError {
    /// Lift a storage error, keeping domain variants raised below intact
    pub fn from_anyhow(err: anyhow::Error) -> Self {
        match err.downcast::<TambunError>() {
            Ok(domain) => domain,
            Err(other) => TambunError::Internal(other),
        }
    }
}

/// Parse a typed amount: thousands separators allowed, must be finite and > 0
pub fn parse_amount(text: &str) -> Option<f64> {
    let cleaned: String = text.trim().chars().filter(|c| *c != ',').collect();
    if cleaned.is_empty() {
        return None;
    }
    match cleaned.parse::<f64>() {
        Ok(v) if v.is_finite() && v > 0.0 => Some(v),
        _ => None,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_amount() {
        assert_eq!(parse_amount("1,500"), Some(1500.0));
        assert_eq!(parse_amount(" 100 "), Some(100.0));
        assert_eq!(parse_amount("99.50"), Some(99.5));
        assert_eq!(parse_amount("0"), None);
        assert_eq!(parse_amount("-20"), None);
        assert_eq!(parse_amount("abc"), None);
        assert_eq!(parse_amount(""), None);
        assert_eq!(parse_amount("inf"), None);
        assert_eq!(parse_amount("NaN"), None);
    }

    #[test]
    fn test_phase_pending_project() {
        assert_eq!(Phase::None.pending_project(), None);
        let slip = Phase::WaitingSlip { project_id: "p1".into() };
        assert_eq!(slip.pending_project(), Some("p1"));
        assert!(!slip.is_waiting_confirmation_for("p1"));

        let confirm = Phase::WaitingConfirmation { project_id: "p1".into() };
        assert!(confirm.is_waiting_confirmation_for("p1"));
        assert!(!confirm.is_waiting_confirmation_for("p2"));
    }

    #[test]
    fn test_status_round_trip_names() {
        for status in [
            DonationStatus::WaitingSlip,
            DonationStatus::WaitingConfirmation,
            DonationStatus::Confirmed,
            DonationStatus::Rejected,
        ] {
            assert_eq!(DonationStatus::from_str(status.as_str()), Some(status));
        }
        assert_eq!(DonationStatus::from_str("waiting-confirmation"), Some(DonationStatus::WaitingConfirmation));
        assert_eq!(DonationStatus::from_str("ocr_ready"), None);
    }

    #[test]
    fn test_keyword_action_names() {
        assert_eq!(KeywordAction::from_str("show-projects"), Some(KeywordAction::ShowProjects));
        assert_eq!(KeywordAction::from_str(" SHOW_SUMMARY "), Some(KeywordAction::ShowSummary));
        assert_eq!(KeywordAction::from_str("dance"), None);
        for action in [KeywordAction::ShowProjects, KeywordAction::ShowSummary] {
            assert_eq!(KeywordAction::from_str(action.as_str()), Some(action));
        }
    }

    #[test]
    fn test_domain_error_survives_anyhow() {
        let err: anyhow::Error = TambunError::AlreadyConfirmed("d1".into()).into();
        assert!(matches!(
            TambunError::from_anyhow(err),
            TambunError::AlreadyConfirmed(id) if id == "d1"
        ));

        let other = anyhow::anyhow!("disk on fire");
        assert!(matches!(TambunError::from_anyhow(other), TambunError::Internal(_)));
    }

    #[test]
    fn test_project_balance() {
        let project = Project {
            id: "p".into(),
            name: "Temple roof".into(),
            description: None,
            destination: None,
            promptpay_qr_url: None,
            goal_amount: Some(1000.0),
            current_amount: 1000.0,
            total_expenses: 200.0,
            status: ProjectStatus::Active,
            created_at: 0,
            updated_at: 0,
        };
        assert_eq!(project.balance(), 800.0);
    }
}
