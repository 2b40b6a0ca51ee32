//! Caller-side handle of one send.

use tokio::sync::watch;

use crate::domain::{ConversationKey, DeliveryState, LocalId};

/// Returned by `send`; follows the delivery state of one local id, across
/// the automatic retry and any manual retry.
#[derive(Debug, Clone)]
pub struct SendHandle {
    local_id: LocalId,
    conversation: ConversationKey,
    state: watch::Receiver<DeliveryState>,
}

impl SendHandle {
    pub(crate) fn new(
        local_id: LocalId,
        conversation: ConversationKey,
        state: watch::Receiver<DeliveryState>,
    ) -> Self {
        Self {
            local_id,
            conversation,
            state,
        }
    }

    pub fn local_id(&self) -> &LocalId {
        &self.local_id
    }

    pub fn conversation(&self) -> &ConversationKey {
        &self.conversation
    }

    pub fn state(&self) -> DeliveryState {
        *self.state.borrow()
    }

    /// Wait until the send is SENT or FAILED.
    pub async fn settled(&mut self) -> DeliveryState {
        let settled = self
            .state
            .wait_for(|state| *state != DeliveryState::Pending)
            .await
            .map(|state| *state);
        match settled {
            Ok(state) => state,
            // Sender gone: report the last value it published.
            Err(_) => *self.state.borrow(),
        }
    }
}
