//! Connection lifecycle states and their legal transitions.

use serde::Serialize;

/// State of the shared socket, owned by the connection manager.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum ConnectionState {
    #[default]
    Disconnected,
    Connecting,
    Connected,
    Reconnecting,
}

impl ConnectionState {
    /// Whether `self -> next` is a legal transition.
    ///
    /// `Reconnecting -> Reconnecting` is legal: each backoff attempt re-enters it.
    pub fn can_transition_to(self, next: ConnectionState) -> bool {
        use ConnectionState::*;

        matches!(
            (self, next),
            (Disconnected, Connecting)
                | (Connecting, Connected)
                | (Connecting, Disconnected)
                | (Connecting, Reconnecting)
                | (Connected, Reconnecting)
                | (Connected, Disconnected)
                | (Reconnecting, Reconnecting)
                | (Reconnecting, Connected)
                | (Reconnecting, Disconnected)
        )
    }

    pub fn is_connected(self) -> bool {
        self == ConnectionState::Connected
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_lifecycle_transitions_are_legal() {
        // テスト項目: 接続 → 切断 → 再接続 → 接続の遷移が許可される
        // given (前提条件):
        use ConnectionState::*;
        let path = [Disconnected, Connecting, Connected, Reconnecting, Reconnecting, Connected, Disconnected];

        // when (操作):
        let all_legal = path.windows(2).all(|w| w[0].can_transition_to(w[1]));

        // then (期待する結果):
        assert!(all_legal);
    }

    #[test]
    fn test_disconnected_cannot_jump_to_connected() {
        // テスト項目: Disconnected から Connected への直接遷移は禁止される
        // given (前提条件):
        let state = ConnectionState::Disconnected;

        // when (操作):
        let result = state.can_transition_to(ConnectionState::Connected);

        // then (期待する結果):
        assert!(!result);
    }

    #[test]
    fn test_connected_cannot_reenter_connecting() {
        // テスト項目: Connected から Connecting への遷移は禁止される
        // given (前提条件):
        let state = ConnectionState::Connected;

        // when (操作):
        let result = state.can_transition_to(ConnectionState::Connecting);

        // then (期待する結果):
        assert!(!result);
    }
}
