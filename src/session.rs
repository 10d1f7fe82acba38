use std::collections::HashMap;
use std::sync::RwLock;

use log::debug;

use crate::auth::SessionId;
use crate::time::Timestamp;

/// The identity a resolved session vouches for. Handed into every store
/// operation explicitly; nothing downstream reads request state.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SessionUser {
    pub id: i64,
    pub username: String,
}

struct Session {
    user: SessionUser,
    last_seen: Timestamp,
}

/// In-memory session table. Single-instance by design; the process owns
/// every live session.
pub struct SessionStore {
    idle_secs: i64,
    sessions: RwLock<HashMap<SessionId, Session>>,
}

impl SessionStore {
    pub fn new(idle_secs: i64) -> Self {
        Self {
            idle_secs,
            sessions: RwLock::new(HashMap::new()),
        }
    }

    pub fn open(&self, user: SessionUser, now: Timestamp) -> SessionId {
        let id = SessionId::new();

        self.sessions
            .write()
            .expect("session table poisoned")
            .insert(
                id,
                Session {
                    user,
                    last_seen: now,
                },
            );

        id
    }

    /// A hit refreshes the idle clock; an entry idle past the limit is
    /// dropped here rather than by a background sweeper.
    pub fn resolve(&self, id: SessionId, now: Timestamp) -> Option<SessionUser> {
        let mut sessions = self.sessions.write().expect("session table poisoned");

        let session = sessions.get_mut(&id)?;

        if session.last_seen.plus_secs(self.idle_secs) < now {
            debug!("session {id} idle past limit, dropping");
            sessions.remove(&id);
            return None;
        }

        session.last_seen = now;
        Some(session.user.clone())
    }

    pub fn close(&self, id: SessionId) -> bool {
        self.sessions
            .write()
            .expect("session table poisoned")
            .remove(&id)
            .is_some()
    }
}
