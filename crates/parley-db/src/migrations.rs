use anyhow::Result;
use rusqlite::Connection;
use tracing::info;

pub fn run(conn: &Connection) -> Result<()> {
    conn.execute_batch(
        "
        CREATE TABLE IF NOT EXISTS users (
            id                  TEXT PRIMARY KEY,
            name                TEXT NOT NULL,
            email               TEXT NOT NULL UNIQUE,
            password            TEXT NOT NULL,
            active              INTEGER NOT NULL DEFAULT 1,
            email_verified      INTEGER NOT NULL DEFAULT 0,
            email_otp           TEXT,
            otp_generated_at    TEXT,
            otp_verified_at     TEXT,
            created_at          TEXT NOT NULL,
            updated_at          TEXT NOT NULL
        );

        CREATE TABLE IF NOT EXISTS rooms (
            id          TEXT PRIMARY KEY,
            room_id     TEXT NOT NULL UNIQUE,
            created_at  TEXT NOT NULL
        );

        -- Identities are not foreign keys: rooms may name accounts that
        -- were never registered here.
        CREATE TABLE IF NOT EXISTS participants (
            room_pk     TEXT NOT NULL REFERENCES rooms(id),
            identity    TEXT NOT NULL,
            role        TEXT NOT NULL,
            PRIMARY KEY (room_pk, identity)
        );

        -- seq is the log order; created_at is informational only.
        CREATE TABLE IF NOT EXISTS messages (
            seq         INTEGER PRIMARY KEY AUTOINCREMENT,
            room_pk     TEXT NOT NULL REFERENCES rooms(id),
            sender      TEXT NOT NULL,
            content     TEXT NOT NULL,
            created_at  TEXT NOT NULL
        );

        CREATE INDEX IF NOT EXISTS idx_messages_room
            ON messages(room_pk, seq);
        ",
    )?;

    info!("Database migrations complete");
    Ok(())
}
