use std::collections::BTreeMap;
use std::sync::Arc;

use chrono::Utc;
use rusqlite::Connection;
use tracing::debug;
use uuid::Uuid;

use parley_types::models::{Identity, Message, Role, Room};
use parley_types::policy::{RolePolicy, RoomOperation};

use crate::Database;
use crate::error::{StoreError, StoreResult};
use crate::models::{MessageRow, RoomRow, format_timestamp, parse_timestamp};
use crate::queries::OptionalExt;

/// Persisted room state: participants with roles and the append-only log.
///
/// Membership mutations take the acting identity and consult the injected
/// [`RolePolicy`] inside the same connection lock that performs the write,
/// so a check can never observe roles that changed before its write lands.
pub struct RoomStore {
    db: Arc<Database>,
    policy: Arc<dyn RolePolicy>,
}

impl RoomStore {
    pub fn new(db: Arc<Database>, policy: Arc<dyn RolePolicy>) -> Self {
        Self { db, policy }
    }

    pub fn database(&self) -> &Database {
        &self.db
    }

    /// Creates `room_id` with an empty log and `creator` as SUPER_ADMIN.
    pub fn create_room(&self, room_id: &str, creator: &Identity) -> StoreResult<Room> {
        if room_id.trim().is_empty() {
            return Err(StoreError::BadRequest("roomId must not be empty".into()));
        }

        self.db.with_conn(|conn| {
            if find_room(conn, room_id)?.is_some() {
                return Err(StoreError::Conflict(format!("room '{}' already exists", room_id)));
            }

            let row = RoomRow {
                id: Uuid::new_v4().to_string(),
                room_id: room_id.to_string(),
                created_at: format_timestamp(&Utc::now()),
            };

            let tx = conn.unchecked_transaction()?;
            tx.execute(
                "INSERT INTO rooms (id, room_id, created_at) VALUES (?1, ?2, ?3)",
                (&row.id, &row.room_id, &row.created_at),
            )?;
            upsert_role(&tx, &row.id, creator, Role::SuperAdmin)?;
            tx.commit()?;

            debug!("Room {} created by {}", room_id, creator);
            load_room(conn, row)
        })
    }

    pub fn get_room(&self, room_id: &str) -> StoreResult<Room> {
        self.db.with_conn(|conn| {
            let row = require_room(conn, room_id)?;
            load_room(conn, row)
        })
    }

    pub fn list_rooms(&self) -> StoreResult<Vec<Room>> {
        self.db.with_conn(|conn| {
            let mut stmt = conn.prepare("SELECT id, room_id, created_at FROM rooms")?;
            let rows = stmt
                .query_map([], |row| {
                    Ok(RoomRow {
                        id: row.get(0)?,
                        room_id: row.get(1)?,
                        created_at: row.get(2)?,
                    })
                })?
                .collect::<std::result::Result<Vec<_>, _>>()?;

            rows.into_iter().map(|row| load_room(conn, row)).collect()
        })
    }

    /// Inserts or overwrites `identity`'s role. Joining as MEMBER on one's
    /// own behalf is always allowed and never changes an existing role;
    /// anything else goes through the policy.
    pub fn add_participant(
        &self,
        room_id: &str,
        actor: &Identity,
        identity: &Identity,
        role: Role,
    ) -> StoreResult<Room> {
        self.db.with_conn(|conn| {
            let room = require_room(conn, room_id)?;
            let target_role = role_in(conn, &room.id, identity)?;

            if actor == identity && role == Role::Member {
                // Re-entering a room keeps whatever role is already held.
                if target_role.is_some() {
                    return load_room(conn, room);
                }
            } else {
                self.authorize(conn, &room, actor, target_role, RoomOperation::Join)?;
            }

            upsert_role(conn, &room.id, identity, role)?;
            load_room(conn, room)
        })
    }

    /// Removes `identity` if present. Leaving on one's own behalf is always allowed.
    pub fn remove_participant(&self, room_id: &str, actor: &Identity, identity: &Identity) -> StoreResult<Room> {
        self.db.with_conn(|conn| {
            let room = require_room(conn, room_id)?;

            if actor != identity {
                let target_role = role_in(conn, &room.id, identity)?;
                self.authorize(conn, &room, actor, target_role, RoomOperation::Leave)?;
            }

            conn.execute(
                "DELETE FROM participants WHERE room_pk = ?1 AND identity = ?2",
                (&room.id, identity.as_str()),
            )?;
            load_room(conn, room)
        })
    }

    /// Promote/demote. Raising the rank is checked as a promotion, anything
    /// else as a demotion, so re-applying the same role is idempotent.
    pub fn set_role(&self, room_id: &str, actor: &Identity, identity: &Identity, role: Role) -> StoreResult<Room> {
        self.db.with_conn(|conn| {
            let room = require_room(conn, room_id)?;
            let target_role = role_in(conn, &room.id, identity)?;

            let op = if role.rank() > target_role.map_or(0, Role::rank) {
                RoomOperation::Promote
            } else {
                RoomOperation::Demote
            };
            self.authorize(conn, &room, actor, target_role, op)?;

            upsert_role(conn, &room.id, identity, role)?;
            load_room(conn, room)
        })
    }

    /// Appends to the end of the room's log. Fails without writing anything
    /// when the room does not exist.
    pub fn append_message(&self, room_id: &str, message: Message) -> StoreResult<Message> {
        self.db.with_conn(|conn| {
            let room = require_room(conn, room_id)?;
            conn.execute(
                "INSERT INTO messages (room_pk, sender, content, created_at) VALUES (?1, ?2, ?3, ?4)",
                (
                    &room.id,
                    message.sender.as_str(),
                    &message.content,
                    format_timestamp(&message.timestamp),
                ),
            )?;
            Ok(message)
        })
    }

    /// The whole log in append order.
    pub fn messages(&self, room_id: &str) -> StoreResult<Vec<Message>> {
        self.db.with_conn(|conn| {
            let room = require_room(conn, room_id)?;
            query_messages(conn, &room.id, i64::MAX, 0)
        })
    }

    fn authorize(
        &self,
        conn: &Connection,
        room: &RoomRow,
        actor: &Identity,
        target_role: Option<Role>,
        op: RoomOperation,
    ) -> StoreResult<()> {
        let actor_role = role_in(conn, &room.id, actor)?;
        if self.policy.can_mutate(actor_role, target_role, op) {
            return Ok(());
        }

        Err(StoreError::Forbidden(format!(
            "{} ({}) may not {:?} in room '{}'",
            actor,
            actor_role.map_or("non-participant", Role::as_str),
            op,
            room.room_id
        )))
    }
}

pub(crate) fn find_room(conn: &Connection, room_id: &str) -> StoreResult<Option<RoomRow>> {
    conn.query_row(
        "SELECT id, room_id, created_at FROM rooms WHERE room_id = ?1",
        [room_id],
        |row| {
            Ok(RoomRow {
                id: row.get(0)?,
                room_id: row.get(1)?,
                created_at: row.get(2)?,
            })
        },
    )
    .optional()
}

pub(crate) fn require_room(conn: &Connection, room_id: &str) -> StoreResult<RoomRow> {
    find_room(conn, room_id)?.ok_or_else(|| StoreError::room_not_found(room_id))
}

fn role_in(conn: &Connection, room_pk: &str, identity: &Identity) -> StoreResult<Option<Role>> {
    let raw: Option<String> = conn
        .query_row(
            "SELECT role FROM participants WHERE room_pk = ?1 AND identity = ?2",
            (room_pk, identity.as_str()),
            |row| row.get(0),
        )
        .optional()?;

    raw.map(|r| r.parse::<Role>().map_err(StoreError::Corrupt)).transpose()
}

fn upsert_role(conn: &Connection, room_pk: &str, identity: &Identity, role: Role) -> StoreResult<()> {
    conn.execute(
        "INSERT INTO participants (room_pk, identity, role) VALUES (?1, ?2, ?3)
         ON CONFLICT(room_pk, identity) DO UPDATE SET role = excluded.role",
        (room_pk, identity.as_str(), role.as_str()),
    )?;
    Ok(())
}

pub(crate) fn count_messages(conn: &Connection, room_pk: &str) -> StoreResult<u64> {
    let count: i64 = conn.query_row("SELECT COUNT(*) FROM messages WHERE room_pk = ?1", [room_pk], |row| {
        row.get(0)
    })?;
    Ok(count as u64)
}

/// `limit` rows starting `offset` entries into the log, in log order.
pub(crate) fn query_messages(conn: &Connection, room_pk: &str, limit: i64, offset: i64) -> StoreResult<Vec<Message>> {
    let mut stmt = conn.prepare(
        "SELECT seq, sender, content, created_at
         FROM messages
         WHERE room_pk = ?1
         ORDER BY seq ASC
         LIMIT ?2 OFFSET ?3",
    )?;

    let rows = stmt
        .query_map(rusqlite::params![room_pk, limit, offset], |row| {
            Ok(MessageRow {
                seq: row.get(0)?,
                sender: row.get(1)?,
                content: row.get(2)?,
                created_at: row.get(3)?,
            })
        })?
        .collect::<std::result::Result<Vec<_>, _>>()?;

    rows.into_iter().map(MessageRow::into_message).collect()
}

fn load_room(conn: &Connection, row: RoomRow) -> StoreResult<Room> {
    let mut stmt = conn.prepare("SELECT identity, role FROM participants WHERE room_pk = ?1")?;
    let pairs = stmt
        .query_map([&row.id], |r| Ok((r.get::<_, String>(0)?, r.get::<_, String>(1)?)))?
        .collect::<std::result::Result<Vec<_>, _>>()?;

    let mut participants = BTreeMap::new();
    for (identity, role) in pairs {
        let role = role.parse::<Role>().map_err(StoreError::Corrupt)?;
        participants.insert(Identity::new(identity), role);
    }

    let id = row
        .id
        .parse::<Uuid>()
        .map_err(|e| StoreError::Corrupt(format!("room id '{}': {}", row.id, e)))?;
    let created_at = parse_timestamp(&row.created_at)
        .ok_or_else(|| StoreError::Corrupt(format!("room '{}' created_at '{}'", row.room_id, row.created_at)))?;

    Ok(Room {
        id,
        message_count: count_messages(conn, &row.id)?,
        room_id: row.room_id,
        participants,
        created_at,
    })
}
