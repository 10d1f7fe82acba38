use std::{result, sync::Arc};

use log::{debug, error, info, trace};
use warp::http;

use crate::auth::{Credentials, SessionId};
use crate::backend::{Backend, FindError, InsertError};
use crate::note::{Note, NoteDraft};
use crate::session::{SessionStore, SessionUser};
use crate::time::Timestamp;
use crate::user::UserSummary;

pub struct NoteKeep {
    backend: Backend,
    sessions: SessionStore,
}

/// Proof of a resolved session. Every note operation hangs off this, so
/// nothing can reach the store without having passed the gate.
pub struct NoteKeepAuthed {
    keep: Arc<NoteKeep>,
    session_id: SessionId,
    user: SessionUser,
}

impl std::fmt::Debug for NoteKeepAuthed {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("NoteKeepAuthed")
            .field("session_id", &self.session_id)
            .field("user", &self.user)
            .finish_non_exhaustive()
    }
}

#[derive(Copy, Clone, Debug, PartialEq, Eq)]
pub enum Error {
    NotAuthenticated,
    NotAuthorized,
    NotFound,
    BadRequest,
    Internal,
}

pub type Result<T> = result::Result<T, Error>;

impl From<Error> for http::StatusCode {
    fn from(e: Error) -> Self {
        match e {
            // a non-owner must not learn the note exists
            Error::NotAuthorized | Error::NotFound => http::StatusCode::NOT_FOUND,
            Error::NotAuthenticated => http::StatusCode::UNAUTHORIZED,
            Error::BadRequest => http::StatusCode::BAD_REQUEST,
            Error::Internal => http::StatusCode::INTERNAL_SERVER_ERROR,
        }
    }
}

impl Error {
    /// Client-facing text; field and store detail stays in the server log.
    pub fn message(self) -> &'static str {
        match self {
            Self::NotAuthorized | Self::NotFound => "not found",
            Self::NotAuthenticated => "authentication failed",
            Self::BadRequest => "invalid request",
            Self::Internal => "internal error",
        }
    }
}

impl NoteKeep {
    pub fn new(backend: Backend, sessions: SessionStore) -> Self {
        Self { backend, sessions }
    }

    pub async fn register(&self, creds: Credentials) -> Result<i64> {
        if !creds.is_wellformed() {
            return Err(Error::BadRequest);
        }

        let username = creds.username.as_str();

        match self.backend.create_user(username, &creds.pwhash()).await {
            Ok(id) => {
                info!("{username} registered");
                Ok(id)
            }
            Err(InsertError::Duplicate) => {
                info!("{username} register: name already taken");
                Err(Error::BadRequest)
            }
            Err(InsertError::Internal) => Err(Error::Internal),
        }
    }

    pub async fn login(self: &Arc<Self>, creds: Credentials) -> Result<NoteKeepAuthed> {
        if !creds.is_wellformed() {
            return Err(Error::BadRequest);
        }

        let username = creds.username.as_str();

        let user = self.backend.find_user(username).await.map_err(|e| {
            if matches!(e, FindError::NotFound) {
                error!("rejecting non-existant user {username}");
                Error::NotAuthenticated
            } else {
                error!("couldn't authenticate user {username}: {e:?}");
                Error::Internal
            }
        })?;

        if !creds.matches(&user.pwhash) {
            error!("wrong password for user {username}");
            return Err(Error::NotAuthenticated);
        }

        let identity = SessionUser {
            id: user.id,
            username: user.username,
        };
        let session_id = self.sessions.open(identity.clone(), now()?);

        info!("{username} login: new session created");

        Ok(NoteKeepAuthed {
            keep: Arc::clone(self),
            session_id,
            user: identity,
        })
    }

    pub async fn authenticate(self: &Arc<Self>, session_id: SessionId) -> Result<NoteKeepAuthed> {
        let Some(user) = self.sessions.resolve(session_id, now()?) else {
            debug!("no live session {session_id}");
            return Err(Error::NotAuthenticated);
        };

        Ok(NoteKeepAuthed {
            keep: Arc::clone(self),
            session_id,
            user,
        })
    }
}

impl NoteKeepAuthed {
    pub fn username(&self) -> &str {
        &self.user.username
    }

    pub fn session_id(&self) -> &SessionId {
        &self.session_id
    }

    pub fn logout(&self) {
        let username = self.username();

        if self.keep.sessions.close(self.session_id) {
            info!("{username} logout");
        } else {
            debug!("{username} logout: session already gone");
        }
    }

    pub async fn notes(&self) -> Result<Vec<Note>> {
        let username = self.username();
        trace!("{username} listing notes");

        self.keep
            .backend
            .notes_for_user(self.user.id)
            .await
            .map(|notes| {
                info!("{username}, {} notes", notes.len());
                notes
            })
            .map_err(|()| Error::Internal)
    }

    pub async fn create_note(&self, draft: NoteDraft) -> Result<i64> {
        let username = self.username();

        if draft.title.is_empty() {
            info!("{username} create: empty title");
            return Err(Error::BadRequest);
        }

        let id = self
            .keep
            .backend
            .create_note(self.user.id, &draft, now()?)
            .await
            .map_err(|()| Error::Internal)?;

        info!("{username} created note {id}");
        Ok(id)
    }

    pub async fn note(&self, note_id: i64) -> Result<Note> {
        let note = self.keep.backend.find_note(note_id).await.map_err(|e| {
            if matches!(e, FindError::NotFound) {
                Error::NotFound
            } else {
                Error::Internal
            }
        })?;

        self.owned(note)
    }

    fn owned(&self, note: Note) -> Result<Note> {
        if note.user_id == self.user.id {
            Ok(note)
        } else {
            info!(
                "{} denied note {}: owned by user {}",
                self.username(),
                note.id,
                note.user_id,
            );
            Err(Error::NotAuthorized)
        }
    }

    pub async fn update_note(&self, note_id: i64, draft: NoteDraft) -> Result<()> {
        let username = self.username();

        if draft.title.is_empty() {
            info!("{username} update {note_id}: empty title");
            return Err(Error::BadRequest);
        }

        self.note(note_id).await?;

        let updated = self
            .keep
            .backend
            .update_note(note_id, self.user.id, &draft, now()?)
            .await
            .map_err(|()| Error::Internal)?;

        if !updated {
            // raced with a delete
            return Err(Error::NotFound);
        }

        info!("{username} updated note {note_id}");
        Ok(())
    }

    pub async fn delete_note(&self, note_id: i64) -> Result<()> {
        let username = self.username();

        self.note(note_id).await?;

        let deleted = self
            .keep
            .backend
            .delete_note(note_id, self.user.id)
            .await
            .map_err(|()| Error::Internal)?;

        if !deleted {
            return Err(Error::NotFound);
        }

        info!("{username} deleted note {note_id}");
        Ok(())
    }

    pub async fn users(&self) -> Result<Vec<UserSummary>> {
        let username = self.username();
        trace!("{username} listing users");

        self.keep.backend.users().await.map_err(|()| Error::Internal)
    }
}

fn now() -> Result<Timestamp> {
    Timestamp::now().map_err(|()| Error::Internal)
}
