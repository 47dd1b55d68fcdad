use anyhow::Result;
use rusqlite::Connection;
use tracing::info;

pub fn run(conn: &Connection) -> Result<()> {
    conn.execute_batch(
        "
        CREATE TABLE IF NOT EXISTS conversations (
            id          TEXT PRIMARY KEY,
            kind        TEXT NOT NULL,
            created_at  TEXT NOT NULL DEFAULT (datetime('now')),
            updated_at  TEXT NOT NULL DEFAULT (datetime('now'))
        );

        CREATE TABLE IF NOT EXISTS participants (
            conversation_id TEXT NOT NULL REFERENCES conversations(id),
            address         TEXT NOT NULL,
            role            TEXT NOT NULL DEFAULT 'member',
            UNIQUE(conversation_id, address)
        );

        CREATE INDEX IF NOT EXISTS idx_participants_address
            ON participants(address);

        CREATE TABLE IF NOT EXISTS messages (
            id              TEXT PRIMARY KEY,
            conversation_id TEXT NOT NULL REFERENCES conversations(id),
            sender          TEXT NOT NULL,
            content         TEXT NOT NULL,
            kind            TEXT NOT NULL DEFAULT 'text',
            tx_ref          TEXT UNIQUE,
            on_chain        INTEGER NOT NULL DEFAULT 0,
            reply_to        TEXT REFERENCES messages(id),
            deleted         INTEGER NOT NULL DEFAULT 0,
            created_at      TEXT NOT NULL DEFAULT (datetime('now'))
        );

        CREATE INDEX IF NOT EXISTS idx_messages_conversation
            ON messages(conversation_id, created_at);

        CREATE TABLE IF NOT EXISTS read_receipts (
            message_id  TEXT NOT NULL REFERENCES messages(id),
            reader      TEXT NOT NULL,
            read_at     TEXT NOT NULL DEFAULT (datetime('now')),
            PRIMARY KEY (message_id, reader)
        );

        CREATE TABLE IF NOT EXISTS reactions (
            id          TEXT PRIMARY KEY,
            message_id  TEXT NOT NULL REFERENCES messages(id),
            address     TEXT NOT NULL,
            emoji       TEXT NOT NULL,
            created_at  TEXT NOT NULL DEFAULT (datetime('now')),
            UNIQUE(message_id, address, emoji)
        );

        CREATE INDEX IF NOT EXISTS idx_reactions_message
            ON reactions(message_id);

        CREATE TABLE IF NOT EXISTS calls (
            id              TEXT PRIMARY KEY,
            conversation_id TEXT NOT NULL REFERENCES conversations(id),
            caller          TEXT NOT NULL,
            receiver        TEXT NOT NULL,
            kind            TEXT NOT NULL,
            status          TEXT NOT NULL DEFAULT 'initiated',
            tx_ref          TEXT,
            started_at      TEXT,
            ended_at        TEXT,
            duration_secs   INTEGER,
            created_at      TEXT NOT NULL DEFAULT (datetime('now'))
        );

        CREATE INDEX IF NOT EXISTS idx_calls_conversation
            ON calls(conversation_id, created_at);

        CREATE TABLE IF NOT EXISTS transactions (
            hash        TEXT PRIMARY KEY,
            purpose     TEXT NOT NULL,
            sender      TEXT NOT NULL,
            verified    INTEGER NOT NULL DEFAULT 0,
            verified_at TEXT,
            created_at  TEXT NOT NULL DEFAULT (datetime('now'))
        );
        ",
    )?;

    info!("Database migrations complete");
    Ok(())
}
