use std::ops::Range;

use parley_types::models::Message;

use crate::error::{StoreError, StoreResult};
use crate::rooms::{RoomStore, count_messages, query_messages, require_room};

pub const DEFAULT_PAGE: i64 = 0;
pub const DEFAULT_PAGE_SIZE: i64 = 20;

/// Window of a log of `total` entries covered by `page`, counting pages
/// backwards from the newest entry.
///
/// Page 0 is the newest `size` entries, page 1 the `size` before those, and
/// so on. The window shrinks at the start of the log and is empty past it,
/// so walking pages never yields an entry twice.
pub fn page_bounds(total: usize, page: i64, size: i64) -> StoreResult<Range<usize>> {
    if page < 0 {
        return Err(StoreError::BadRequest(format!("page must be >= 0, got {}", page)));
    }
    if size < 1 {
        return Err(StoreError::BadRequest(format!("size must be >= 1, got {}", size)));
    }

    let total = total as u64;
    let (page, size) = (page as u64, size as u64);

    let end = total.saturating_sub(page.saturating_mul(size));
    let start = total.saturating_sub(page.saturating_add(1).saturating_mul(size));

    Ok(start as usize..end as usize)
}

impl RoomStore {
    /// One page of a room's history in chronological order. Read-only.
    pub fn get_page(&self, room_id: &str, page: i64, size: i64) -> StoreResult<Vec<Message>> {
        self.database().with_conn(|conn| {
            let room = require_room(conn, room_id)?;
            let total = count_messages(conn, &room.id)? as usize;
            let window = page_bounds(total, page, size)?;

            if window.is_empty() {
                return Ok(Vec::new());
            }

            query_messages(conn, &room.id, window.len() as i64, window.start as i64)
        })
    }
}
