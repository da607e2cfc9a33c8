use thiserror::Error;

pub type StoreResult<T> = Result<T, StoreError>;

#[derive(Debug, Error)]
pub enum StoreError {
    #[error("{kind} '{key}' not found")]
    NotFound { kind: &'static str, key: String },

    #[error("{0}")]
    Conflict(String),

    #[error("{0}")]
    BadRequest(String),

    #[error("{0}")]
    Forbidden(String),

    #[error("database error: {0}")]
    Sqlite(#[from] rusqlite::Error),

    #[error("database lock poisoned")]
    Poisoned,

    #[error("corrupt row: {0}")]
    Corrupt(String),
}

impl StoreError {
    pub fn room_not_found(room_id: &str) -> Self {
        Self::NotFound {
            kind: "room",
            key: room_id.to_string(),
        }
    }

    pub fn user_not_found(email: &str) -> Self {
        Self::NotFound {
            kind: "user",
            key: email.to_string(),
        }
    }
}
