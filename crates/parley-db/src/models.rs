//! Database row types. These map directly to SQLite rows and stay
//! distinct from parley-types models to keep the DB layer independent.
use chrono::{DateTime, Utc};
use parley_types::models::{Identity, Message};

use crate::error::{StoreError, StoreResult};

pub struct UserRow {
    pub id: String,
    pub name: String,
    pub email: String,
    pub password: String,
    pub active: bool,
    pub email_verified: bool,
    pub email_otp: Option<String>,
    pub otp_generated_at: Option<String>,
    /// Set by a successful OTP check; allows one password reset.
    pub otp_verified_at: Option<String>,
    pub created_at: String,
}

pub struct RoomRow {
    pub id: String,
    pub room_id: String,
    pub created_at: String,
}

pub struct MessageRow {
    pub seq: i64,
    pub sender: String,
    pub content: String,
    pub created_at: String,
}

impl MessageRow {
    pub fn into_message(self) -> StoreResult<Message> {
        let timestamp = parse_timestamp(&self.created_at)
            .ok_or_else(|| StoreError::Corrupt(format!("message #{} timestamp '{}'", self.seq, self.created_at)))?;
        Ok(Message {
            sender: Identity::new(self.sender),
            content: self.content,
            timestamp,
        })
    }
}

pub fn format_timestamp(ts: &DateTime<Utc>) -> String {
    ts.to_rfc3339()
}

pub fn parse_timestamp(raw: &str) -> Option<DateTime<Utc>> {
    DateTime::parse_from_rfc3339(raw)
        .map(|ts| ts.with_timezone(&Utc))
        .ok()
}
