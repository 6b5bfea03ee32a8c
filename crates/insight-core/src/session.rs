use async_trait::async_trait;

use crate::errors::SessionError;
use crate::ids::{SessionId, UserId};

/// Conversation session store sitting in front of the chat boundary.
#[async_trait]
pub trait SessionGate: Send + Sync {
    /// Fails with `NotFound` when the session does not exist.
    async fn get(&self, session_id: &SessionId, user_id: &UserId) -> Result<(), SessionError>;

    /// Fails with `AlreadyExists` when another request created it first.
    async fn create(&self, session_id: &SessionId, user_id: &UserId) -> Result<(), SessionError>;
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum EnsureOutcome {
    Existing,
    Created,
    /// Lost a create race; the session exists either way.
    Raced,
}

/// Get-or-create. An "already exists" failure on create counts as success.
pub async fn ensure_session(
    gate: &dyn SessionGate,
    session_id: &SessionId,
    user_id: &UserId,
) -> Result<EnsureOutcome, SessionError> {
    match gate.get(session_id, user_id).await {
        Ok(()) => return Ok(EnsureOutcome::Existing),
        Err(SessionError::NotFound(_)) => {}
        Err(e) => return Err(e),
    }
    match gate.create(session_id, user_id).await {
        Ok(()) => {
            tracing::info!(session_id = %session_id, user_id = %user_id, "created session");
            Ok(EnsureOutcome::Created)
        }
        Err(SessionError::AlreadyExists(_)) => {
            tracing::debug!(session_id = %session_id, "session created concurrently");
            Ok(EnsureOutcome::Raced)
        }
        Err(e) => Err(e),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};

    struct ScriptedGate {
        get: fn() -> Result<(), SessionError>,
        create: fn() -> Result<(), SessionError>,
        creates: AtomicUsize,
    }

    impl ScriptedGate {
        fn new(get: fn() -> Result<(), SessionError>, create: fn() -> Result<(), SessionError>) -> Self {
            Self {
                get,
                create,
                creates: AtomicUsize::new(0),
            }
        }
    }

    #[async_trait]
    impl SessionGate for ScriptedGate {
        async fn get(&self, _: &SessionId, _: &UserId) -> Result<(), SessionError> {
            (self.get)()
        }

        async fn create(&self, _: &SessionId, _: &UserId) -> Result<(), SessionError> {
            self.creates.fetch_add(1, Ordering::Relaxed);
            (self.create)()
        }
    }

    fn ids() -> (SessionId, UserId) {
        (SessionId::from_raw("default_session"), UserId::from_raw("web_user"))
    }

    #[tokio::test]
    async fn existing_session_is_not_recreated() {
        let gate = ScriptedGate::new(|| Ok(()), || Ok(()));
        let (s, u) = ids();
        assert_eq!(ensure_session(&gate, &s, &u).await.unwrap(), EnsureOutcome::Existing);
        assert_eq!(gate.creates.load(Ordering::Relaxed), 0);
    }

    #[tokio::test]
    async fn missing_session_is_created() {
        let gate = ScriptedGate::new(|| Err(SessionError::NotFound("s".into())), || Ok(()));
        let (s, u) = ids();
        assert_eq!(ensure_session(&gate, &s, &u).await.unwrap(), EnsureOutcome::Created);
    }

    #[tokio::test]
    async fn already_exists_is_tolerated() {
        let gate = ScriptedGate::new(
            || Err(SessionError::NotFound("s".into())),
            || Err(SessionError::AlreadyExists("s".into())),
        );
        let (s, u) = ids();
        assert_eq!(ensure_session(&gate, &s, &u).await.unwrap(), EnsureOutcome::Raced);
    }

    #[tokio::test]
    async fn backend_errors_propagate() {
        let gate = ScriptedGate::new(|| Err(SessionError::Backend("down".into())), || Ok(()));
        let (s, u) = ids();
        assert!(matches!(
            ensure_session(&gate, &s, &u).await,
            Err(SessionError::Backend(_))
        ));

        let gate = ScriptedGate::new(
            || Err(SessionError::NotFound("s".into())),
            || Err(SessionError::Backend("quota".into())),
        );
        assert!(ensure_session(&gate, &s, &u).await.is_err());
    }
}
