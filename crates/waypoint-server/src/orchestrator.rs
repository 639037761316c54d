//! Per-conversation turn orchestration. One turn may run per conversation
//! at a time; a second request while one is active is rejected so the
//! caller can surface 409.

use std::sync::Arc;

use dashmap::DashMap;
use tokio_util::sync::CancellationToken;
use tracing::debug;

use waypoint_core::ids::ConversationId;

/// Tracks conversations with a turn in flight.
pub struct ChatOrchestrator {
    active_turns: Arc<DashMap<ConversationId, CancellationToken>>,
}

impl ChatOrchestrator {
    pub fn new() -> Self {
        Self {
            active_turns: Arc::new(DashMap::new()),
        }
    }

    /// Claim the conversation's turn slot. `None` when a turn is already
    /// running. The returned guard cancels the turn and frees the slot on
    /// drop, which is how a dropped SSE connection aborts its turn.
    pub fn try_start(&self, conversation_id: &ConversationId) -> Option<TurnGuard> {
        let token = CancellationToken::new();
        let entry = self.active_turns.entry(conversation_id.clone());
        match entry {
            dashmap::mapref::entry::Entry::Occupied(_) => None,
            dashmap::mapref::entry::Entry::Vacant(vacant) => {
                vacant.insert(token.clone());
                Some(TurnGuard {
                    conversation_id: conversation_id.clone(),
                    token,
                    active_turns: Arc::clone(&self.active_turns),
                })
            }
        }
    }

    /// Cancel a conversation's active turn, if any.
    pub fn abort(&self, conversation_id: &ConversationId) -> bool {
        match self.active_turns.get(conversation_id) {
            Some(entry) => {
                entry.value().cancel();
                true
            }
            None => false,
        }
    }

    pub fn is_active(&self, conversation_id: &ConversationId) -> bool {
        self.active_turns.contains_key(conversation_id)
    }

    pub fn active_count(&self) -> usize {
        self.active_turns.len()
    }
}

impl Default for ChatOrchestrator {
    fn default() -> Self {
        Self::new()
    }
}

/// RAII claim on a conversation's turn slot.
pub struct TurnGuard {
    conversation_id: ConversationId,
    token: CancellationToken,
    active_turns: Arc<DashMap<ConversationId, CancellationToken>>,
}

impl TurnGuard {
    pub fn token(&self) -> CancellationToken {
        self.token.clone()
    }
}

impl Drop for TurnGuard {
    fn drop(&mut self) {
        debug!(conversation_id = %self.conversation_id, "releasing turn slot");
        self.token.cancel();
        self.active_turns.remove(&self.conversation_id);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn one_turn_per_conversation() {
        let orchestrator = ChatOrchestrator::new();
        let cid = ConversationId::new();

        let guard = orchestrator.try_start(&cid).expect("first claim");
        assert!(orchestrator.is_active(&cid));
        assert!(orchestrator.try_start(&cid).is_none());

        drop(guard);
        assert!(!orchestrator.is_active(&cid));
        assert!(orchestrator.try_start(&cid).is_some());
    }

    #[test]
    fn independent_conversations_run_in_parallel() {
        let orchestrator = ChatOrchestrator::new();
        let a = orchestrator.try_start(&ConversationId::new()).unwrap();
        let b = orchestrator.try_start(&ConversationId::new()).unwrap();
        assert_eq!(orchestrator.active_count(), 2);
        drop((a, b));
        assert_eq!(orchestrator.active_count(), 0);
    }

    #[test]
    fn drop_cancels_the_token() {
        let orchestrator = ChatOrchestrator::new();
        let cid = ConversationId::new();
        let guard = orchestrator.try_start(&cid).unwrap();
        let token = guard.token();
        assert!(!token.is_cancelled());
        drop(guard);
        assert!(token.is_cancelled());
    }

    #[test]
    fn abort_cancels_active_turn() {
        let orchestrator = ChatOrchestrator::new();
        let cid = ConversationId::new();
        let guard = orchestrator.try_start(&cid).unwrap();
        let token = guard.token();

        assert!(orchestrator.abort(&cid));
        assert!(token.is_cancelled());
        assert!(!orchestrator.abort(&ConversationId::new()));
    }
}
