//! ============================================================================
//! Confirmation Lock - One confirmation flow per pending donation
//! ============================================================================
//! Several slip photos for the same pending project can arrive at once, on
//! one process or many. Exclusion comes from the storage layer's
//! compare-and-swap on the conversation state, never from an in-process lock.
//! ============================================================================

use anyhow::Result;
use std::time::Duration;
use tracing::debug;

use crate::ledger::DonationLedger;
use crate::types::{now_millis, ConversationKey, ConversationState, ConversationType, Phase};

/// Default duplicate-suppression window in seconds
pub const DEFAULT_DUPLICATE_WINDOW_SECS: u64 = 60;

/// Result of trying to enter the confirmation flow
#[derive(Debug, Clone, PartialEq)]
pub enum LockOutcome {
    /// This caller owns the flow; the state now waits for confirmation
    Acquired(ConversationState),
    /// A record for this project was opened or confirmed moments ago
    RecentDuplicate,
    /// Another event advanced the state first
    LostRace,
}

pub struct ConfirmationLock {
    ledger: DonationLedger,
    window: Duration,
}

impl ConfirmationLock {
    pub fn new(ledger: DonationLedger) -> Self {
        Self::with_window(ledger, Duration::from_secs(DEFAULT_DUPLICATE_WINDOW_SECS))
    }

    pub fn with_window(ledger: DonationLedger, window: Duration) -> Self {
        Self { ledger, window }
    }

    /// Try to move `key` into `WaitingConfirmation` for `project_id`
    pub fn acquire(
        &self,
        key: &ConversationKey,
        conversation_type: ConversationType,
        project_id: &str,
    ) -> Result<LockOutcome> {
        let since = now_millis() - self.window.as_millis() as i64;
        if let Some(existing) = self.ledger.recent_open_or_confirmed(key, project_id, since)? {
            debug!(
                "Suppressing image for {}: donation {} is {:?}",
                key, existing.id, existing.status
            );
            return Ok(LockOutcome::RecentDuplicate);
        }

        let advanced = self.ledger.db().update_state_if(
            key,
            |current| match current {
                Some(state) => {
                    state.phase.pending_project() == Some(project_id)
                        && !state.phase.is_waiting_confirmation_for(project_id)
                }
                None => false,
            },
            |current| {
                let now = now_millis();
                ConversationState {
                    key: key.clone(),
                    conversation_type,
                    phase: Phase::WaitingConfirmation {
                        project_id: project_id.to_string(),
                    },
                    created_at: current.map(|s| s.created_at).unwrap_or(now),
                    updated_at: now,
                }
            },
        )?;

        match advanced {
            Some(state) => Ok(LockOutcome::Acquired(state)),
            None => {
                debug!("Lost confirmation race for {} on project {}", key, project_id);
                Ok(LockOutcome::LostRace)
            }
        }
    }

    /// Hand an acquired flow back to `WaitingSlip` when its record could not
    /// be opened. Returns false when the state already moved on.
    pub fn release(
        &self,
        key: &ConversationKey,
        conversation_type: ConversationType,
        project_id: &str,
    ) -> Result<bool> {
        let reverted = self.ledger.db().update_state_if(
            key,
            |current| current.is_some_and(|state| state.phase.is_waiting_confirmation_for(project_id)),
            |current| {
                let now = now_millis();
                ConversationState {
                    key: key.clone(),
                    conversation_type,
                    phase: Phase::WaitingSlip {
                        project_id: project_id.to_string(),
                    },
                    created_at: current.map(|s| s.created_at).unwrap_or(now),
                    updated_at: now,
                }
            },
        )?;

        if reverted.is_some() {
            debug!("Released confirmation flow for {} on project {}", key, project_id);
        }
        Ok(reverted.is_some())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::db::LedgerDb;
    use std::sync::Arc;

    fn setup() -> (ConfirmationLock, ConversationKey) {
        let ledger = DonationLedger::new(Arc::new(LedgerDb::open_in_memory().unwrap()));
        let key = ConversationKey::new("U1", "G1");
        ledger
            .db()
            .set_state(&ConversationState {
                key: key.clone(),
                conversation_type: ConversationType::Group,
                phase: Phase::WaitingSlip { project_id: "p1".into() },
                created_at: 1,
                updated_at: 1,
            })
            .unwrap();
        (ConfirmationLock::new(ledger), key)
    }

    #[test]
    fn test_acquire_once_then_lose() {
        let (lock, key) = setup();
        let LockOutcome::Acquired(state) = lock.acquire(&key, ConversationType::Group, "p1").unwrap() else {
            panic!("first caller should acquire");
        };
        assert!(state.phase.is_waiting_confirmation_for("p1"));
        assert_eq!(state.created_at, 1);

        assert_eq!(
            lock.acquire(&key, ConversationType::Group, "p1").unwrap(),
            LockOutcome::LostRace
        );
    }

    #[test]
    fn test_release_returns_to_waiting_slip() {
        let (lock, key) = setup();
        assert!(matches!(
            lock.acquire(&key, ConversationType::Group, "p1").unwrap(),
            LockOutcome::Acquired(_)
        ));

        assert!(lock.release(&key, ConversationType::Group, "p1").unwrap());
        let state = lock.ledger.db().get_state(&key).unwrap().unwrap();
        assert_eq!(state.phase, Phase::WaitingSlip { project_id: "p1".into() });
        assert_eq!(state.created_at, 1);

        // nothing left to release, and the flow can be acquired again
        assert!(!lock.release(&key, ConversationType::Group, "p1").unwrap());
        assert!(matches!(
            lock.acquire(&key, ConversationType::Group, "p1").unwrap(),
            LockOutcome::Acquired(_)
        ));
    }

    #[test]
    fn test_other_project_or_no_state_is_rejected() {
        let (lock, key) = setup();
        assert_eq!(
            lock.acquire(&key, ConversationType::Group, "p2").unwrap(),
            LockOutcome::LostRace
        );
        let stranger = ConversationKey::new("U9", "G1");
        assert_eq!(
            lock.acquire(&stranger, ConversationType::Group, "p1").unwrap(),
            LockOutcome::LostRace
        );
    }

    #[test]
    fn test_recent_record_suppresses() {
        let (lock, key) = setup();
        lock.ledger
            .create_pending(&key, ConversationType::Group, "p1", "x")
            .unwrap();
        assert_eq!(
            lock.acquire(&key, ConversationType::Group, "p1").unwrap(),
            LockOutcome::RecentDuplicate
        );
        // state untouched
        assert_eq!(
            lock.ledger.db().get_state(&key).unwrap().unwrap().phase,
            Phase::WaitingSlip { project_id: "p1".into() }
        );
    }

    #[test]
    fn test_zero_window_ignores_old_records() {
        let (lock, key) = setup();
        lock.ledger
            .create_pending(&key, ConversationType::Group, "p1", "x")
            .unwrap();
        std::thread::sleep(Duration::from_millis(5));
        let lock = ConfirmationLock::with_window(lock.ledger, Duration::from_millis(1));
        assert!(matches!(
            lock.acquire(&key, ConversationType::Group, "p1").unwrap(),
            LockOutcome::Acquired(_)
        ));
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 4)]
    async fn test_concurrent_acquire_has_one_winner() {
        let (lock, key) = setup();
        let lock = Arc::new(lock);
        let mut handles = Vec::new();
        for _ in 0..12 {
            let lock = Arc::clone(&lock);
            let key = key.clone();
            handles.push(tokio::task::spawn_blocking(move || {
                lock.acquire(&key, ConversationType::Group, "p1").unwrap()
            }));
        }

        let mut winners = 0;
        for handle in handles {
            if matches!(handle.await.unwrap(), LockOutcome::Acquired(_)) {
                winners += 1;
            }
        }
        assert_eq!(winners, 1);
    }
}
