use crate::Database;
use crate::models::{
    CallRow, ConversationRow, MessageRow, ParticipantRow, ReactionRow, ReadReceiptRow,
    TransactionRow,
};
use anyhow::Result;
use chrono::{DateTime, SecondsFormat, Utc};
use rusqlite::Connection;

/// Canonical timestamp encoding for every column this crate writes.
/// Millisecond precision keeps lexicographic order equal to chronological
/// order and stays parseable by SQLite's date functions.
pub fn fmt_ts(ts: DateTime<Utc>) -> String {
    ts.to_rfc3339_opts(SecondsFormat::Millis, true)
}

impl Database {
    // -- Conversations --

    /// Find the direct conversation between two addresses, if any.
    pub fn find_direct_conversation(&self, a: &str, b: &str) -> Result<Option<String>> {
        self.with_conn(|conn| query_direct_conversation(conn, a, b))
    }

    /// Create a direct conversation between two addresses, or return the
    /// existing one. Creating the same pair twice is idempotent.
    /// Returns (conversation_id, created).
    pub fn create_direct_conversation(
        &self,
        id: &str,
        a: &str,
        b: &str,
        now: &str,
    ) -> Result<(String, bool)> {
        self.with_conn(|conn| {
            if let Some(existing) = query_direct_conversation(conn, a, b)? {
                return Ok((existing, false));
            }

            conn.execute(
                "INSERT INTO conversations (id, kind, created_at, updated_at) VALUES (?1, 'direct', ?2, ?2)",
                (id, now),
            )?;
            conn.execute(
                "INSERT INTO participants (conversation_id, address) VALUES (?1, ?2)",
                (id, a),
            )?;
            conn.execute(
                "INSERT INTO participants (conversation_id, address) VALUES (?1, ?2)",
                (id, b),
            )?;

            Ok((id.to_string(), true))
        })
    }

    pub fn conversations_for(&self, address: &str) -> Result<Vec<ConversationRow>> {
        self.with_conn(|conn| {
            let mut stmt = conn.prepare(
                "SELECT c.id, c.kind, c.created_at, c.updated_at
                 FROM conversations c
                 JOIN participants p ON p.conversation_id = c.id
                 WHERE p.address = ?1
                 ORDER BY c.updated_at DESC",
            )?;

            let rows = stmt
                .query_map([address], |row| {
                    Ok(ConversationRow {
                        id: row.get(0)?,
                        kind: row.get(1)?,
                        created_at: row.get(2)?,
                        updated_at: row.get(3)?,
                    })
                })?
                .collect::<std::result::Result<Vec<_>, _>>()?;

            Ok(rows)
        })
    }

    pub fn participants_for(&self, conversation_id: &str) -> Result<Vec<ParticipantRow>> {
        self.with_conn(|conn| {
            let mut stmt = conn.prepare(
                "SELECT conversation_id, address, role FROM participants WHERE conversation_id = ?1",
            )?;

            let rows = stmt
                .query_map([conversation_id], |row| {
                    Ok(ParticipantRow {
                        conversation_id: row.get(0)?,
                        address: row.get(1)?,
                        role: row.get(2)?,
                    })
                })?
                .collect::<std::result::Result<Vec<_>, _>>()?;

            Ok(rows)
        })
    }

    pub fn is_participant(&self, conversation_id: &str, address: &str) -> Result<bool> {
        self.with_conn(|conn| {
            let count: i64 = conn.query_row(
                "SELECT COUNT(*) FROM participants WHERE conversation_id = ?1 AND address = ?2",
                (conversation_id, address),
                |row| row.get(0),
            )?;
            Ok(count > 0)
        })
    }

    pub fn touch_conversation(&self, conversation_id: &str, now: &str) -> Result<()> {
        self.with_conn(|conn| {
            conn.execute(
                "UPDATE conversations SET updated_at = ?2 WHERE id = ?1",
                (conversation_id, now),
            )?;
            Ok(())
        })
    }

    // -- Messages --

    #[allow(clippy::too_many_arguments)]
    pub fn insert_message(
        &self,
        id: &str,
        conversation_id: &str,
        sender: &str,
        content: &str,
        kind: &str,
        tx_ref: Option<&str>,
        on_chain: bool,
        reply_to: Option<&str>,
        now: &str,
    ) -> Result<()> {
        self.with_conn(|conn| {
            conn.execute(
                "INSERT INTO messages (id, conversation_id, sender, content, kind, tx_ref, on_chain, reply_to, created_at)
                 VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9)",
                rusqlite::params![
                    id,
                    conversation_id,
                    sender,
                    content,
                    kind,
                    tx_ref,
                    on_chain,
                    reply_to,
                    now
                ],
            )?;
            Ok(())
        })
    }

    /// Attach a confirmed transaction to a message. Only succeeds while the
    /// message has no transaction yet; a transaction anchors exactly one
    /// message and is attached at most once.
    pub fn attach_message_tx_ref(&self, message_id: &str, tx_ref: &str) -> Result<bool> {
        self.with_conn(|conn| {
            let affected = conn.execute(
                "UPDATE messages SET tx_ref = ?2, on_chain = 1 WHERE id = ?1 AND tx_ref IS NULL",
                (message_id, tx_ref),
            )?;
            Ok(affected == 1)
        })
    }

    pub fn get_message(&self, id: &str) -> Result<Option<MessageRow>> {
        self.with_conn(|conn| {
            let mut stmt = conn.prepare(
                "SELECT id, conversation_id, sender, content, kind, tx_ref, on_chain, reply_to, created_at
                 FROM messages WHERE id = ?1 AND deleted = 0",
            )?;
            let row = stmt.query_row([id], map_message_row).optional()?;
            Ok(row)
        })
    }

    /// Cursor-paginated history, newest first. `before` is the `created_at`
    /// of the oldest message from the previous page.
    pub fn get_messages(
        &self,
        conversation_id: &str,
        limit: u32,
        before: Option<&str>,
    ) -> Result<Vec<MessageRow>> {
        self.with_conn(|conn| {
            let mut rows = Vec::new();

            match before {
                Some(cursor) => {
                    let mut stmt = conn.prepare(
                        "SELECT id, conversation_id, sender, content, kind, tx_ref, on_chain, reply_to, created_at
                         FROM messages
                         WHERE conversation_id = ?1 AND deleted = 0 AND created_at < ?2
                         ORDER BY created_at DESC
                         LIMIT ?3",
                    )?;
                    let mapped =
                        stmt.query_map(rusqlite::params![conversation_id, cursor, limit], map_message_row)?;
                    for row in mapped {
                        rows.push(row?);
                    }
                }
                None => {
                    let mut stmt = conn.prepare(
                        "SELECT id, conversation_id, sender, content, kind, tx_ref, on_chain, reply_to, created_at
                         FROM messages
                         WHERE conversation_id = ?1 AND deleted = 0
                         ORDER BY created_at DESC
                         LIMIT ?2",
                    )?;
                    let mapped =
                        stmt.query_map(rusqlite::params![conversation_id, limit], map_message_row)?;
                    for row in mapped {
                        rows.push(row?);
                    }
                }
            }

            Ok(rows)
        })
    }

    // -- Read receipts --

    /// Record that `reader` has displayed `message_id`. Upsert semantics: at
    /// most one receipt per (message, reader); repeating is a no-op.
    /// Returns true if a new receipt was inserted.
    pub fn mark_read(&self, message_id: &str, reader: &str, now: &str) -> Result<bool> {
        self.with_conn(|conn| {
            let affected = conn.execute(
                "INSERT INTO read_receipts (message_id, reader, read_at) VALUES (?1, ?2, ?3)
                 ON CONFLICT(message_id, reader) DO NOTHING",
                (message_id, reader, now),
            )?;
            Ok(affected == 1)
        })
    }

    /// Batch-fetch read receipts for a set of message IDs.
    pub fn get_receipts_for_messages(&self, message_ids: &[String]) -> Result<Vec<ReadReceiptRow>> {
        if message_ids.is_empty() {
            return Ok(vec![]);
        }

        self.with_conn(|conn| {
            let placeholders: Vec<String> =
                (1..=message_ids.len()).map(|i| format!("?{}", i)).collect();
            let sql = format!(
                "SELECT message_id, reader, read_at FROM read_receipts WHERE message_id IN ({})",
                placeholders.join(", ")
            );

            let mut stmt = conn.prepare(&sql)?;
            let params: Vec<&dyn rusqlite::types::ToSql> = message_ids
                .iter()
                .map(|id| id as &dyn rusqlite::types::ToSql)
                .collect();

            let rows = stmt
                .query_map(params.as_slice(), |row| {
                    Ok(ReadReceiptRow {
                        message_id: row.get(0)?,
                        reader: row.get(1)?,
                        read_at: row.get(2)?,
                    })
                })?
                .collect::<std::result::Result<Vec<_>, _>>()?;

            Ok(rows)
        })
    }

    // -- Reactions --

    /// Toggle a reaction: removes if exists, inserts if not.
    /// Returns true if inserted, false if removed.
    pub fn toggle_reaction(
        &self,
        id: &str,
        message_id: &str,
        address: &str,
        emoji: &str,
    ) -> Result<bool> {
        self.with_conn(|conn| {
            let existing: Option<String> = conn
                .query_row(
                    "SELECT id FROM reactions WHERE message_id = ?1 AND address = ?2 AND emoji = ?3",
                    rusqlite::params![message_id, address, emoji],
                    |row| row.get(0),
                )
                .optional()?;

            if let Some(existing_id) = existing {
                conn.execute("DELETE FROM reactions WHERE id = ?1", [&existing_id])?;
                Ok(false)
            } else {
                conn.execute(
                    "INSERT INTO reactions (id, message_id, address, emoji) VALUES (?1, ?2, ?3, ?4)",
                    rusqlite::params![id, message_id, address, emoji],
                )?;
                Ok(true)
            }
        })
    }

    /// Batch-fetch reactions for a set of message IDs.
    pub fn get_reactions_for_messages(&self, message_ids: &[String]) -> Result<Vec<ReactionRow>> {
        if message_ids.is_empty() {
            return Ok(vec![]);
        }

        self.with_conn(|conn| {
            let placeholders: Vec<String> =
                (1..=message_ids.len()).map(|i| format!("?{}", i)).collect();
            let sql = format!(
                "SELECT id, message_id, address, emoji, created_at FROM reactions WHERE message_id IN ({})",
                placeholders.join(", ")
            );

            let mut stmt = conn.prepare(&sql)?;
            let params: Vec<&dyn rusqlite::types::ToSql> = message_ids
                .iter()
                .map(|id| id as &dyn rusqlite::types::ToSql)
                .collect();

            let rows = stmt
                .query_map(params.as_slice(), |row| {
                    Ok(ReactionRow {
                        id: row.get(0)?,
                        message_id: row.get(1)?,
                        address: row.get(2)?,
                        emoji: row.get(3)?,
                        created_at: row.get(4)?,
                    })
                })?
                .collect::<std::result::Result<Vec<_>, _>>()?;

            Ok(rows)
        })
    }

    // -- Calls --

    #[allow(clippy::too_many_arguments)]
    pub fn insert_call(
        &self,
        id: &str,
        conversation_id: &str,
        caller: &str,
        receiver: &str,
        kind: &str,
        tx_ref: Option<&str>,
        now: &str,
    ) -> Result<()> {
        self.with_conn(|conn| {
            conn.execute(
                "INSERT INTO calls (id, conversation_id, caller, receiver, kind, status, tx_ref, created_at)
                 VALUES (?1, ?2, ?3, ?4, ?5, 'initiated', ?6, ?7)",
                rusqlite::params![id, conversation_id, caller, receiver, kind, tx_ref, now],
            )?;
            Ok(())
        })
    }

    pub fn get_call(&self, id: &str) -> Result<Option<CallRow>> {
        self.with_conn(|conn| {
            let mut stmt = conn.prepare(
                "SELECT id, conversation_id, caller, receiver, kind, status, tx_ref, started_at, ended_at, duration_secs, created_at
                 FROM calls WHERE id = ?1",
            )?;
            let row = stmt.query_row([id], map_call_row).optional()?;
            Ok(row)
        })
    }

    pub fn calls_for_conversation(&self, conversation_id: &str) -> Result<Vec<CallRow>> {
        self.with_conn(|conn| {
            let mut stmt = conn.prepare(
                "SELECT id, conversation_id, caller, receiver, kind, status, tx_ref, started_at, ended_at, duration_secs, created_at
                 FROM calls WHERE conversation_id = ?1
                 ORDER BY created_at DESC",
            )?;
            let rows = stmt
                .query_map([conversation_id], map_call_row)?
                .collect::<std::result::Result<Vec<_>, _>>()?;
            Ok(rows)
        })
    }

    pub fn attach_call_tx_ref(&self, call_id: &str, tx_ref: &str) -> Result<bool> {
        self.with_conn(|conn| {
            let affected = conn.execute(
                "UPDATE calls SET tx_ref = ?2 WHERE id = ?1 AND tx_ref IS NULL",
                (call_id, tx_ref),
            )?;
            Ok(affected == 1)
        })
    }

    // Call status transitions are compare-and-swap on the current status:
    // the update only lands if the row is still in the expected pre-state.
    // A losing concurrent writer sees zero affected rows and must re-read.

    /// initiated -> ringing (receiver's device acknowledged the call event).
    pub fn mark_call_ringing(&self, call_id: &str) -> Result<bool> {
        self.with_conn(|conn| {
            let affected = conn.execute(
                "UPDATE calls SET status = 'ringing' WHERE id = ?1 AND status = 'initiated'",
                [call_id],
            )?;
            Ok(affected == 1)
        })
    }

    /// initiated/ringing -> answered; stamps started_at.
    pub fn answer_call(&self, call_id: &str, now: &str) -> Result<bool> {
        self.with_conn(|conn| {
            let affected = conn.execute(
                "UPDATE calls SET status = 'answered', started_at = ?2
                 WHERE id = ?1 AND status IN ('initiated', 'ringing')",
                (call_id, now),
            )?;
            Ok(affected == 1)
        })
    }

    /// initiated/ringing -> declined | missed | cancelled; stamps ended_at.
    pub fn terminate_pending_call(&self, call_id: &str, status: &str, now: &str) -> Result<bool> {
        debug_assert!(matches!(status, "declined" | "missed" | "cancelled"));
        self.with_conn(|conn| {
            let affected = conn.execute(
                "UPDATE calls SET status = ?2, ended_at = ?3
                 WHERE id = ?1 AND status IN ('initiated', 'ringing')",
                (call_id, status, now),
            )?;
            Ok(affected == 1)
        })
    }

    /// answered -> completed; stamps ended_at and duration.
    pub fn complete_call(&self, call_id: &str, now: &str) -> Result<bool> {
        self.with_conn(|conn| {
            let affected = conn.execute(
                "UPDATE calls SET status = 'completed', ended_at = ?2,
                        duration_secs = CAST(ROUND((julianday(?2) - julianday(started_at)) * 86400) AS INTEGER)
                 WHERE id = ?1 AND status = 'answered'",
                (call_id, now),
            )?;
            Ok(affected == 1)
        })
    }

    // -- Transactions --

    /// Record a ledger transaction. Hash is globally unique; re-recording an
    /// existing hash is a no-op. Returns true if a new row was inserted.
    pub fn insert_transaction(
        &self,
        hash: &str,
        purpose: &str,
        sender: &str,
        now: &str,
    ) -> Result<bool> {
        self.with_conn(|conn| {
            let affected = conn.execute(
                "INSERT INTO transactions (hash, purpose, sender, created_at) VALUES (?1, ?2, ?3, ?4)
                 ON CONFLICT(hash) DO NOTHING",
                (hash, purpose, sender, now),
            )?;
            Ok(affected == 1)
        })
    }

    /// Flip a record to verified. Happens exactly once; a verified record
    /// never reverses. Returns true on the first (and only) flip.
    pub fn mark_transaction_verified(&self, hash: &str, now: &str) -> Result<bool> {
        self.with_conn(|conn| {
            let affected = conn.execute(
                "UPDATE transactions SET verified = 1, verified_at = ?2
                 WHERE hash = ?1 AND verified = 0",
                (hash, now),
            )?;
            Ok(affected == 1)
        })
    }

    pub fn get_transaction(&self, hash: &str) -> Result<Option<TransactionRow>> {
        self.with_conn(|conn| {
            let mut stmt = conn.prepare(
                "SELECT hash, purpose, sender, verified, verified_at, created_at
                 FROM transactions WHERE hash = ?1",
            )?;
            let row = stmt
                .query_row([hash], |row| {
                    Ok(TransactionRow {
                        hash: row.get(0)?,
                        purpose: row.get(1)?,
                        sender: row.get(2)?,
                        verified: row.get(3)?,
                        verified_at: row.get(4)?,
                        created_at: row.get(5)?,
                    })
                })
                .optional()?;
            Ok(row)
        })
    }
}

fn query_direct_conversation(conn: &Connection, a: &str, b: &str) -> Result<Option<String>> {
    let mut stmt = conn.prepare(
        "SELECT c.id FROM conversations c
         WHERE c.kind = 'direct'
           AND EXISTS (SELECT 1 FROM participants WHERE conversation_id = c.id AND address = ?1)
           AND EXISTS (SELECT 1 FROM participants WHERE conversation_id = c.id AND address = ?2)",
    )?;

    let row = stmt.query_row([a, b], |row| row.get(0)).optional()?;
    Ok(row)
}

fn map_message_row(row: &rusqlite::Row<'_>) -> std::result::Result<MessageRow, rusqlite::Error> {
    Ok(MessageRow {
        id: row.get(0)?,
        conversation_id: row.get(1)?,
        sender: row.get(2)?,
        content: row.get(3)?,
        kind: row.get(4)?,
        tx_ref: row.get(5)?,
        on_chain: row.get(6)?,
        reply_to: row.get(7)?,
        created_at: row.get(8)?,
    })
}

fn map_call_row(row: &rusqlite::Row<'_>) -> std::result::Result<CallRow, rusqlite::Error> {
    Ok(CallRow {
        id: row.get(0)?,
        conversation_id: row.get(1)?,
        caller: row.get(2)?,
        receiver: row.get(3)?,
        kind: row.get(4)?,
        status: row.get(5)?,
        tx_ref: row.get(6)?,
        started_at: row.get(7)?,
        ended_at: row.get(8)?,
        duration_secs: row.get(9)?,
        created_at: row.get(10)?,
    })
}

/// Extension trait for optional query results
trait OptionalExt<T> {
    fn optional(self) -> Result<Option<T>>;
}

impl<T> OptionalExt<T> for std::result::Result<T, rusqlite::Error> {
    fn optional(self) -> Result<Option<T>> {
        match self {
            Ok(val) => Ok(Some(val)),
            Err(rusqlite::Error::QueryReturnedNoRows) => Ok(None),
            Err(e) => Err(e.into()),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::Utc;

    const ALICE: &str = "0xaaa1111111111111111111111111111111111111";
    const BOB: &str = "0xbbb2222222222222222222222222222222222222";

    fn now() -> String {
        fmt_ts(Utc::now())
    }

    fn db_with_conversation() -> (Database, String) {
        let db = Database::open_in_memory().unwrap();
        let (cid, created) = db
            .create_direct_conversation("conv-1", ALICE, BOB, &now())
            .unwrap();
        assert!(created);
        (db, cid)
    }

    #[test]
    fn direct_conversation_create_is_idempotent() {
        let (db, cid) = db_with_conversation();

        // Same pair, either order, returns the existing row.
        let (again, created) = db
            .create_direct_conversation("conv-2", BOB, ALICE, &now())
            .unwrap();
        assert_eq!(again, cid);
        assert!(!created);

        assert_eq!(db.participants_for(&cid).unwrap().len(), 2);
        assert!(db.is_participant(&cid, ALICE).unwrap());
        assert!(!db.is_participant(&cid, "0xother").unwrap());
    }

    #[test]
    fn mark_read_twice_is_noop() {
        let (db, cid) = db_with_conversation();
        db.insert_message("m1", &cid, ALICE, "hi", "text", None, false, None, &now())
            .unwrap();

        assert!(db.mark_read("m1", BOB, &now()).unwrap());
        assert!(!db.mark_read("m1", BOB, &now()).unwrap());

        let receipts = db.get_receipts_for_messages(&["m1".into()]).unwrap();
        assert_eq!(receipts.len(), 1);
        assert_eq!(receipts[0].reader, BOB);
    }

    #[test]
    fn reaction_toggle_cycles() {
        let (db, cid) = db_with_conversation();
        db.insert_message("m1", &cid, ALICE, "hi", "text", None, false, None, &now())
            .unwrap();

        assert!(db.toggle_reaction("r1", "m1", BOB, "👍").unwrap());
        // Same triple toggles off; a different emoji is independent.
        assert!(!db.toggle_reaction("r2", "m1", BOB, "👍").unwrap());
        assert!(db.toggle_reaction("r3", "m1", BOB, "🔥").unwrap());

        let rows = db.get_reactions_for_messages(&["m1".into()]).unwrap();
        assert_eq!(rows.len(), 1);
        assert_eq!(rows[0].emoji, "🔥");
    }

    #[test]
    fn message_tx_ref_attaches_once() {
        let (db, cid) = db_with_conversation();
        db.insert_message("m1", &cid, ALICE, "hi", "text", None, false, None, &now())
            .unwrap();

        assert!(db.attach_message_tx_ref("m1", "0xhash1").unwrap());
        assert!(!db.attach_message_tx_ref("m1", "0xhash2").unwrap());

        let row = db.get_message("m1").unwrap().unwrap();
        assert!(row.on_chain);
        assert_eq!(row.tx_ref.as_deref(), Some("0xhash1"));
    }

    #[test]
    fn transaction_record_verifies_once() {
        let db = Database::open_in_memory().unwrap();

        assert!(db.insert_transaction("0xh", "message", ALICE, &now()).unwrap());
        assert!(!db.insert_transaction("0xh", "message", ALICE, &now()).unwrap());

        assert!(db.mark_transaction_verified("0xh", &now()).unwrap());
        assert!(!db.mark_transaction_verified("0xh", &now()).unwrap());

        let row = db.get_transaction("0xh").unwrap().unwrap();
        assert!(row.verified);
        assert!(row.verified_at.is_some());
    }

    #[test]
    fn call_transitions_are_compare_and_swap() {
        let (db, cid) = db_with_conversation();
        db.insert_call("c1", &cid, ALICE, BOB, "audio", None, &now())
            .unwrap();

        assert!(db.mark_call_ringing("c1").unwrap());
        // Already ringing; the ack CAS loses.
        assert!(!db.mark_call_ringing("c1").unwrap());

        assert!(db.answer_call("c1", &now()).unwrap());
        // A racing decline observes zero affected rows.
        assert!(!db.terminate_pending_call("c1", "declined", &now()).unwrap());

        assert!(db.complete_call("c1", &now()).unwrap());
        assert!(!db.complete_call("c1", &now()).unwrap());

        let row = db.get_call("c1").unwrap().unwrap();
        assert_eq!(row.status, "completed");
        assert!(row.started_at.is_some());
        assert!(row.ended_at.is_some());
        assert!(row.duration_secs.is_some());
    }

    #[test]
    fn declined_call_stamps_ended_at_only() {
        let (db, cid) = db_with_conversation();
        db.insert_call("c1", &cid, ALICE, BOB, "video", None, &now())
            .unwrap();

        assert!(db.terminate_pending_call("c1", "declined", &now()).unwrap());
        // Terminal: neither answer nor a second terminate may land.
        assert!(!db.answer_call("c1", &now()).unwrap());
        assert!(!db.terminate_pending_call("c1", "missed", &now()).unwrap());

        let row = db.get_call("c1").unwrap().unwrap();
        assert_eq!(row.status, "declined");
        assert!(row.started_at.is_none());
        assert!(row.ended_at.is_some());
        assert!(row.duration_secs.is_none());
    }

    #[test]
    fn message_pagination_uses_created_at_cursor() {
        let (db, cid) = db_with_conversation();
        for i in 0..5 {
            let ts = format!("2026-01-01T00:00:0{}.000Z", i);
            db.insert_message(
                &format!("m{}", i),
                &cid,
                ALICE,
                "hi",
                "text",
                None,
                false,
                None,
                &ts,
            )
            .unwrap();
        }

        let page1 = db.get_messages(&cid, 2, None).unwrap();
        assert_eq!(page1.len(), 2);
        assert_eq!(page1[0].id, "m4");

        let cursor = page1.last().unwrap().created_at.clone();
        let page2 = db.get_messages(&cid, 2, Some(&cursor)).unwrap();
        assert_eq!(page2[0].id, "m2");
        assert_eq!(page2[1].id, "m1");
    }
}
