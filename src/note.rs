use serde::{Deserialize, Serialize};

use crate::time::Timestamp;

#[derive(Debug, Serialize, sqlx::FromRow)]
pub struct Note {
    pub id: i64,
    #[serde(skip)]
    pub user_id: i64,
    pub title: String,
    pub content: String,
    pub created: Timestamp,
    pub modified: Timestamp,
}

/// Create/update body. The listing page's create form posts the body under
/// `note`, the edit form and API clients under `content`.
#[derive(Debug, Deserialize)]
pub struct NoteDraft {
    pub title: String,
    #[serde(alias = "note")]
    pub content: String,
}
