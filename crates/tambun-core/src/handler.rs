//! ============================================================================
//! Event Handler - Conversation state machine
//! ============================================================================
//! Consumes inbound events and drives each (user, conversation) through
//!
//!   NONE -> WAITING_SLIP -> WAITING_CONFIRMATION -> NONE
//!
//! Side effects per event:
//! - keyword text: list projects / today's summary, state untouched
//! - project postback: state := WAITING_SLIP (overwrites)
//! - image: confirmation lock, one pending record, amount prompt,
//!   slip download in the background
//! - amount text while waiting: confirm latest pending record, clear state
//! - confirm postback / edit-amount page: confirm by id, clear state
//!
//! Replies are fire-and-forget. Each event has its own error boundary so one
//! failure never stops its siblings in the same batch.
//! ============================================================================

use anyhow::Result;
use futures_util::future::join_all;
use std::path::PathBuf;
use std::sync::Arc;
use tokio::sync::Mutex;
use tokio::task::JoinSet;
use tracing::{debug, error, info, warn};

use crate::composer::{self, notice};
use crate::config::BotConfig;
use crate::db::LedgerDb;
use crate::dedup::{DedupGuard, RecentIds};
use crate::events::{EventKind, EventSource, InboundEvent, PostbackAction};
use crate::ledger::DonationLedger;
use crate::locking::{ConfirmationLock, LockOutcome};
use crate::messaging::{MessagingClient, OutboundMessage};
use crate::types::{
    now_millis, parse_amount, ConversationState, DonationRecord, KeywordAction, Phase,
    ProjectStatus, TambunError, DEFAULT_DISPLAY_NAME,
};

/// The platform accepts at most this many messages per reply
const MAX_REPLY_MESSAGES: usize = 5;

pub struct EventHandler {
    ledger: DonationLedger,
    lock: ConfirmationLock,
    messenger: Arc<dyn MessagingClient>,
    envelope_ids: Box<dyn DedupGuard>,
    message_ids: Box<dyn DedupGuard>,
    uploads_dir: PathBuf,
    background: Mutex<JoinSet<()>>,
}

impl EventHandler {
    pub fn new(db: Arc<LedgerDb>, messenger: Arc<dyn MessagingClient>, config: &BotConfig) -> Self {
        let ledger = DonationLedger::new(db);
        Self {
            lock: ConfirmationLock::with_window(ledger.clone(), config.duplicate_window()),
            ledger,
            messenger,
            envelope_ids: Box::new(RecentIds::new(config.dedup_capacity)),
            message_ids: Box::new(RecentIds::new(config.dedup_capacity)),
            uploads_dir: config.uploads_dir.clone(),
            background: Mutex::new(JoinSet::new()),
        }
    }

    pub fn ledger(&self) -> &DonationLedger {
        &self.ledger
    }

    /// Handle one webhook delivery. Events run concurrently and are awaited
    /// together; this never fails.
    pub async fn handle_events(&self, events: Vec<InboundEvent>) {
        debug!("Handling {} event(s)", events.len());
        join_all(events.into_iter().map(|event| self.handle_event(event))).await;
    }

    async fn handle_event(&self, event: InboundEvent) {
        let event_id = event.event_id.clone().unwrap_or_else(|| "-".to_string());
        if let Err(e) = self.dispatch(event).await {
            error!("Error handling event {}: {:#}", event_id, e);
        }
    }

    async fn dispatch(&self, event: InboundEvent) -> Result<()> {
        if let Some(id) = &event.event_id {
            if self.envelope_ids.seen(id).await {
                info!("Skipping already handled event {} (redelivery: {})", id, event.is_redelivery);
                return Ok(());
            }
        }

        let reply_token = event.reply_token.as_deref();
        let source = &event.source;
        match &event.kind {
            EventKind::Text { text, .. } => self.on_text(reply_token, source, text).await,
            EventKind::Image { message_id } => self.on_image(reply_token, source, message_id).await,
            EventKind::Postback(PostbackAction::SelectProject { project_id }) => {
                self.on_select_project(reply_token, source, project_id.as_deref()).await
            }
            EventKind::Postback(PostbackAction::ConfirmDonation { donation_id }) => {
                self.on_confirm_postback(reply_token, donation_id.as_deref()).await
            }
            EventKind::Postback(PostbackAction::Unknown(data)) => {
                debug!("Ignoring postback: {}", data);
                Ok(())
            }
            EventKind::Unsupported(kind) => {
                debug!("Ignoring {} event", kind);
                Ok(())
            }
        }
    }

    // ========================================================================
    // Text
    // ========================================================================

    async fn on_text(&self, reply_token: Option<&str>, source: &EventSource, text: &str) -> Result<()> {
        if let Some(action) = self.ledger.db().find_keyword(text)? {
            return match action {
                KeywordAction::ShowProjects => self.show_projects(reply_token).await,
                KeywordAction::ShowSummary => self.show_summary(reply_token, source).await,
            };
        }

        let key = source.key();
        let awaiting = self.ledger.db().get_state(&key)?.and_then(|state| match state.phase {
            Phase::WaitingConfirmation { project_id } => Some(project_id),
            _ => None,
        });
        // Ordinary chatter outside the flow gets no answer
        let Some(project_id) = awaiting else {
            return Ok(());
        };

        let Some(amount) = parse_amount(text) else {
            self.reply(reply_token, &notice(composer::AMOUNT_PROMPT)).await;
            return Ok(());
        };

        let Some(record) = self.ledger.latest_awaiting(&key, &project_id)? else {
            self.reply(reply_token, &notice(composer::PENDING_NOT_FOUND)).await;
            return Ok(());
        };

        let confirmed = match self.ledger.confirm(&record.id, amount, None) {
            Ok(confirmed) => confirmed,
            Err(TambunError::AlreadyConfirmed(id)) => {
                debug!("Donation {} confirmed concurrently", id);
                return Ok(());
            }
            Err(e) => {
                self.reply(reply_token, &notice(composer::CONFIRM_FAILED)).await;
                return Err(e.into());
            }
        };

        self.ledger.db().clear_state(&key)?;
        let thanks = self.thank_donor(&confirmed).await;
        self.reply(reply_token, &[thanks]).await;
        Ok(())
    }

    async fn show_projects(&self, reply_token: Option<&str>) -> Result<()> {
        let projects = self.ledger.db().list_projects(Some(ProjectStatus::Active))?;
        self.reply(reply_token, &composer::project_list(&projects)).await;
        Ok(())
    }

    async fn show_summary(&self, reply_token: Option<&str>, source: &EventSource) -> Result<()> {
        let totals = self
            .ledger
            .today_summary(source.conversation_type, &source.conversation_id)?;
        if totals.is_empty() {
            self.reply(reply_token, &notice(composer::NO_DONATIONS_TODAY)).await;
            return Ok(());
        }

        let cards: Vec<OutboundMessage> = totals
            .iter()
            .take(MAX_REPLY_MESSAGES)
            .map(|t| composer::daily_summary(&t.project_name, t.total_amount, t.donation_count, &t.recent))
            .collect();
        self.reply(reply_token, &cards).await;
        Ok(())
    }

    // ========================================================================
    // Images
    // ========================================================================

    async fn on_image(&self, reply_token: Option<&str>, source: &EventSource, message_id: &str) -> Result<()> {
        if self.message_ids.seen(message_id).await {
            debug!("Skipping already processed message: {}", message_id);
            return Ok(());
        }

        let key = source.key();
        let pending = self
            .ledger
            .db()
            .get_state(&key)?
            .and_then(|state| state.phase.pending_project().map(String::from));
        let Some(project_id) = pending else {
            self.reply(reply_token, &notice(composer::SELECT_PROJECT_FIRST)).await;
            return Ok(());
        };

        if let Err(e) = self.open_donation(reply_token, source, &project_id, message_id).await {
            error!("Error processing image {}: {:#}", message_id, e);
            self.reply(reply_token, &notice(composer::IMAGE_ERROR)).await;
        }
        Ok(())
    }

    async fn open_donation(
        &self,
        reply_token: Option<&str>,
        source: &EventSource,
        project_id: &str,
        message_id: &str,
    ) -> Result<()> {
        let key = source.key();
        match self.lock.acquire(&key, source.conversation_type, project_id)? {
            LockOutcome::Acquired(_) => {}
            LockOutcome::RecentDuplicate | LockOutcome::LostRace => return Ok(()),
        }

        // The flow is ours now; without a record it must be handed back
        let record = match self.open_record(source, project_id).await {
            Ok(record) => record,
            Err(e) => {
                if let Err(release_err) = self.lock.release(&key, source.conversation_type, project_id) {
                    warn!("Failed to release confirmation flow for {}: {}", key, release_err);
                }
                return Err(e);
            }
        };
        info!("Opened donation {} for {} on project {}", record.id, key, project_id);

        self.reply(reply_token, &notice(composer::AMOUNT_PROMPT)).await;
        self.spawn_slip_download(record.id, message_id.to_string()).await;
        Ok(())
    }

    async fn open_record(&self, source: &EventSource, project_id: &str) -> Result<DonationRecord> {
        if self.ledger.db().get_project(project_id)?.is_none() {
            return Err(TambunError::NotFound(format!("project {}", project_id)).into());
        }

        let display_name = match self.messenger.get_profile(&source.user_id).await {
            Ok(name) if !name.trim().is_empty() => name,
            Ok(_) => DEFAULT_DISPLAY_NAME.to_string(),
            Err(e) => {
                warn!("Profile lookup failed for {}: {}", source.user_id, e);
                DEFAULT_DISPLAY_NAME.to_string()
            }
        };

        self.ledger
            .create_pending(&source.key(), source.conversation_type, project_id, &display_name)
    }

    /// Fetch the slip and attach it to the record, off the reply path
    async fn spawn_slip_download(&self, donation_id: String, message_id: String) {
        let messenger = Arc::clone(&self.messenger);
        let ledger = self.ledger.clone();
        let dir = self.uploads_dir.clone();

        let mut background = self.background.lock().await;
        while let Some(finished) = background.try_join_next() {
            if let Err(e) = finished {
                warn!("Slip download task failed: {}", e);
            }
        }
        background.spawn(async move {
            match messenger.download_media(&message_id, &dir).await {
                Ok(path) => {
                    if let Err(e) = ledger.attach_slip(&donation_id, &path.to_string_lossy()) {
                        warn!("Failed to attach slip to donation {}: {}", donation_id, e);
                    }
                }
                Err(e) => warn!("Error downloading slip image {}: {}", message_id, e),
            }
        });
    }

    /// Wait for outstanding slip downloads (shutdown, tests)
    pub async fn drain_background(&self) {
        let mut pending = {
            let mut background = self.background.lock().await;
            std::mem::replace(&mut *background, JoinSet::new())
        };
        while let Some(finished) = pending.join_next().await {
            if let Err(e) = finished {
                warn!("Slip download task failed: {}", e);
            }
        }
    }

    // ========================================================================
    // Postbacks
    // ========================================================================

    async fn on_select_project(
        &self,
        reply_token: Option<&str>,
        source: &EventSource,
        project_id: Option<&str>,
    ) -> Result<()> {
        let Some(project_id) = project_id else {
            self.reply(reply_token, &notice(composer::GENERIC_ERROR)).await;
            return Ok(());
        };
        let Some(project) = self.ledger.db().get_project(project_id)? else {
            self.reply(reply_token, &notice(composer::PROJECT_NOT_FOUND)).await;
            return Ok(());
        };

        let now = now_millis();
        self.ledger.db().set_state(&ConversationState {
            key: source.key(),
            conversation_type: source.conversation_type,
            phase: Phase::WaitingSlip {
                project_id: project.id.clone(),
            },
            created_at: now,
            updated_at: now,
        })?;
        info!("{} selected project {}", source.key(), project.name);

        self.reply(reply_token, &composer::project_selected(&project)).await;
        Ok(())
    }

    async fn on_confirm_postback(&self, reply_token: Option<&str>, donation_id: Option<&str>) -> Result<()> {
        let Some(donation_id) = donation_id else {
            self.reply(reply_token, &notice(composer::GENERIC_ERROR)).await;
            return Ok(());
        };
        let Some(record) = self.ledger.db().get_donation(donation_id)? else {
            self.reply(reply_token, &notice(composer::DONATION_NOT_FOUND)).await;
            return Ok(());
        };
        if record.is_confirmed() {
            self.reply(reply_token, &notice(composer::ALREADY_CONFIRMED)).await;
            return Ok(());
        }

        // The button confirms whatever amount is already on the record
        let amount = if record.final_amount > 0.0 {
            record.final_amount
        } else {
            record.ocr_amount.unwrap_or(0.0)
        };

        let confirmed = match self.ledger.confirm(donation_id, amount, None) {
            Ok(confirmed) => confirmed,
            Err(TambunError::AlreadyConfirmed(_)) => {
                self.reply(reply_token, &notice(composer::ALREADY_CONFIRMED)).await;
                return Ok(());
            }
            Err(TambunError::InvalidAmount(_)) => {
                self.reply(reply_token, &notice(composer::AMOUNT_PROMPT)).await;
                return Ok(());
            }
            Err(TambunError::NotFound(_)) => {
                self.reply(reply_token, &notice(composer::DONATION_NOT_FOUND)).await;
                return Ok(());
            }
            Err(e) => {
                self.reply(reply_token, &notice(composer::CONFIRM_FAILED)).await;
                return Err(e.into());
            }
        };

        self.ledger.db().clear_state(&confirmed.key())?;
        let thanks = self.thank_donor(&confirmed).await;
        self.reply(reply_token, &[thanks]).await;
        Ok(())
    }

    // ========================================================================
    // Edit-amount entry point
    // ========================================================================

    /// Confirm a record by id with an amount typed on the edit-amount page,
    /// then push the thank-you card to the donor.
    pub async fn confirm_by_amount(
        &self,
        record_id: &str,
        amount: f64,
        recipient_label: Option<&str>,
    ) -> std::result::Result<DonationRecord, TambunError> {
        if !(amount.is_finite() && amount > 0.0) {
            return Err(TambunError::InvalidAmount(amount.to_string()));
        }
        let recipient_label = recipient_label.map(str::trim).filter(|l| !l.is_empty());

        let confirmed = self.ledger.confirm(record_id, amount, recipient_label)?;
        if let Err(e) = self.ledger.db().clear_state(&confirmed.key()) {
            warn!("Failed to clear state for {}: {}", confirmed.key(), e);
        }

        let thanks = self.thank_donor(&confirmed).await;
        if let Err(e) = self.messenger.push(&confirmed.user_id, &[thanks]).await {
            warn!("Failed to send confirmation message: {}", e);
        }
        Ok(confirmed)
    }

    // ========================================================================
    // Helpers
    // ========================================================================

    /// Thank-you card for a confirmed record. Refreshes the stored display
    /// name from the profile when it changed.
    async fn thank_donor(&self, record: &DonationRecord) -> OutboundMessage {
        let stored = Some(record.display_name.as_str()).filter(|n| !n.trim().is_empty());
        let display_name = match self.messenger.get_profile(&record.user_id).await {
            Ok(name) if !name.trim().is_empty() => name,
            Ok(_) => stored.unwrap_or(DEFAULT_DISPLAY_NAME).to_string(),
            Err(e) => {
                warn!("Profile lookup failed for {}: {}", record.user_id, e);
                stored.unwrap_or(DEFAULT_DISPLAY_NAME).to_string()
            }
        };

        if display_name != record.display_name {
            let renamed = display_name.clone();
            if let Err(e) = self
                .ledger
                .db()
                .update_donation(&record.id, |d| *d.display_name = renamed)
            {
                warn!("Failed to update display name on {}: {}", record.id, e);
            }
        }

        let project = match self.ledger.db().get_project(&record.project_id) {
            Ok(project) => project,
            Err(e) => {
                warn!("Failed to load project {}: {}", record.project_id, e);
                None
            }
        };

        composer::thank_you(
            &display_name,
            record.final_amount,
            project.as_ref(),
            &self.ledger.thank_you_message(),
        )
    }

    async fn reply(&self, reply_token: Option<&str>, messages: &[OutboundMessage]) {
        let Some(token) = reply_token else {
            warn!("Missing reply token, cannot send reply");
            return;
        };
        if let Err(e) = self.messenger.reply(token, messages).await {
            warn!("Reply failed: {}", e);
        }
    }
}
