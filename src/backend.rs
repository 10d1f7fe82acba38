use std::path::{Path, PathBuf};

use sqlx::{migrate::MigrateDatabase, query, query_as, Pool, Sqlite, SqlitePool};

use log::{error, info};

use crate::note::{Note, NoteDraft};
use crate::time::Timestamp;
use crate::user::{User, UserSummary};

type Result<T> = std::result::Result<T, ()>;

#[derive(Debug)]
pub enum FindError {
    NotFound,
    Internal,
}

#[derive(Debug)]
pub enum InsertError {
    Duplicate,
    Internal,
}

pub struct Backend(pub Pool<Sqlite>);

fn into_db(path: &Path) -> PathBuf {
    path.join("notes.db")
}

pub async fn init(data_dir: &Path) {
    let final_path = format!(
        "sqlite://{}",
        into_db(data_dir).to_str().expect("non utf-8 data")
    );
    match Sqlite::create_database(&final_path).await {
        Ok(()) => {
            info!("Using {}", &final_path);
        }
        Err(e) => {
            let sqlx::Error::Database(db_err) = e else {
                panic!("error creating database: {e}");
            };

            panic!("sql db error: {db_err:?}");
        }
    }
}

impl Backend {
    pub async fn new(data_dir: &Path) -> Self {
        let db_pathbuf = into_db(data_dir);
        let db_path = db_pathbuf.to_str().expect("non utf-8 data");
        let pool = match SqlitePool::connect(db_path).await {
            Ok(pool) => pool,
            Err(_err) => {
                init(data_dir).await;
                SqlitePool::connect(db_path).await.expect("db connection")
            }
        };

        sqlx::migrate!("./migrations")
            .run(&pool)
            .await
            .expect("migration");

        Self(pool)
    }
}

impl Backend {
    pub async fn find_user(&self, username: &str) -> std::result::Result<User, FindError> {
        query_as::<_, User>(
            "
            SELECT id, username, pwhash
            FROM users
            WHERE username = ?
            ",
        )
        .bind(username)
        .fetch_one(&self.0)
        .await
        .map_err(|e| {
            if matches!(e, sqlx::Error::RowNotFound) {
                FindError::NotFound
            } else {
                error!("error selecting user: {e:?}");
                FindError::Internal
            }
        })
    }

    pub async fn create_user(
        &self,
        username: &str,
        pwhash: &str,
    ) -> std::result::Result<i64, InsertError> {
        query(
            "
            INSERT INTO users
            (username, pwhash)
            VALUES
            (?, ?)
            ",
        )
        .bind(username)
        .bind(pwhash)
        .execute(&self.0)
        .await
        .map(|done| done.last_insert_rowid())
        .map_err(|e| {
            if e.to_string().contains("UNIQUE constraint failed") {
                InsertError::Duplicate
            } else {
                error!("error inserting user: {e:?}");
                InsertError::Internal
            }
        })
    }

    pub async fn users(&self) -> Result<Vec<UserSummary>> {
        query_as::<_, UserSummary>(
            "
            SELECT id, username
            FROM users
            ORDER BY username
            ",
        )
        .fetch_all(&self.0)
        .await
        .map_err(|e| {
            error!("error selecting users: {e:?}");
        })
    }
}

impl Backend {
    pub async fn notes_for_user(&self, user_id: i64) -> Result<Vec<Note>> {
        query_as::<_, Note>(
            "
            SELECT id, user_id, title, content, created, modified
            FROM notes
            WHERE user_id = ?
            ORDER BY modified DESC, id DESC
            ",
        )
        .bind(user_id)
        .fetch_all(&self.0)
        .await
        .map_err(|e| {
            error!("error selecting notes: {e:?}");
        })
    }

    pub async fn find_note(&self, note_id: i64) -> std::result::Result<Note, FindError> {
        query_as::<_, Note>(
            "
            SELECT id, user_id, title, content, created, modified
            FROM notes
            WHERE id = ?
            ",
        )
        .bind(note_id)
        .fetch_one(&self.0)
        .await
        .map_err(|e| {
            if matches!(e, sqlx::Error::RowNotFound) {
                FindError::NotFound
            } else {
                error!("error selecting note {note_id}: {e:?}");
                FindError::Internal
            }
        })
    }

    pub async fn create_note(
        &self,
        user_id: i64,
        draft: &NoteDraft,
        now: Timestamp,
    ) -> Result<i64> {
        query(
            "
            INSERT INTO notes
            (user_id, title, content, created, modified)
            VALUES
            (?, ?, ?, ?, ?)
            ",
        )
        .bind(user_id)
        .bind(&draft.title)
        .bind(&draft.content)
        .bind(now)
        .bind(now)
        .execute(&self.0)
        .await
        .map(|done| done.last_insert_rowid())
        .map_err(|e| {
            error!("error inserting note: {e:?}");
        })
    }

    /// Keyed on (id, owner) so a stale id can never touch another user's row.
    pub async fn update_note(
        &self,
        note_id: i64,
        user_id: i64,
        draft: &NoteDraft,
        now: Timestamp,
    ) -> Result<bool> {
        query(
            "
            UPDATE notes
            SET title = ?, content = ?, modified = ?
            WHERE id = ? AND user_id = ?
            ",
        )
        .bind(&draft.title)
        .bind(&draft.content)
        .bind(now)
        .bind(note_id)
        .bind(user_id)
        .execute(&self.0)
        .await
        .map(|done| done.rows_affected() > 0)
        .map_err(|e| {
            error!("error updating note {note_id}: {e:?}");
        })
    }

    pub async fn delete_note(&self, note_id: i64, user_id: i64) -> Result<bool> {
        query(
            "
            DELETE FROM notes
            WHERE id = ? AND user_id = ?
            ",
        )
        .bind(note_id)
        .bind(user_id)
        .execute(&self.0)
        .await
        .map(|done| done.rows_affected() > 0)
        .map_err(|e| {
            error!("error deleting note {note_id}: {e:?}");
        })
    }
}
