/// Errors produced by the sync core and its backends.
///
/// None of these are fatal to a session. Network failures become retryable message state,
/// persistence failures are logged and swallowed, and subscription failures are shown per chat.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum SyncError {
    #[error("network error: {0}")]
    TransientNetwork(String),
    #[error("storage error: {0}")]
    Persistence(String),
    #[error("disconnect hook registration failed: {0}")]
    PresenceHook(String),
    #[error("subscription error: {0}")]
    Subscription(String),
    #[error("message not found: {0}")]
    MessageNotFound(String),
    #[error("message {0} is not waiting for a retry")]
    NotRetryable(String),
}

impl SyncError {
    /// Whether the same operation may succeed if attempted again later.
    pub fn is_transient(&self) -> bool {
        matches!(self, Self::TransientNetwork(_) | Self::Subscription(_))
    }
}

impl From<rusqlite::Error> for SyncError {
    fn from(e: rusqlite::Error) -> Self {
        Self::Persistence(e.to_string())
    }
}

impl From<serde_json::Error> for SyncError {
    fn from(e: serde_json::Error) -> Self {
        Self::Persistence(e.to_string())
    }
}

#[cfg(test)]
mod tests {
    use super::SyncError;

    #[test]
    fn display_includes_detail() {
        let err = SyncError::TransientNetwork("connection reset".into());
        assert_eq!(err.to_string(), "network error: connection reset");
        let err = SyncError::NotRetryable("temp-1".into());
        assert_eq!(err.to_string(), "message temp-1 is not waiting for a retry");
    }

    #[test]
    fn only_network_and_subscription_errors_are_transient() {
        assert!(SyncError::TransientNetwork("x".into()).is_transient());
        assert!(SyncError::Subscription("x".into()).is_transient());
        assert!(!SyncError::Persistence("x".into()).is_transient());
        assert!(!SyncError::MessageNotFound("x".into()).is_transient());
    }

    #[test]
    fn sqlite_errors_map_to_persistence() {
        let err: SyncError = rusqlite::Error::InvalidQuery.into();
        assert!(matches!(err, SyncError::Persistence(_)));
    }
}
