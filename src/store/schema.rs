//! Embedded SQLite migrations for every logical table in spec §6.
//!
//! Dates are stored as millisecond-precision `INTEGER` epoch timestamps
//! (§4.1); booleans as `INTEGER` 0/1, since SQLite has no native bool.
//! `messages_fts` is an FTS5 external-content table over `messages`,
//! configured with the `unicode61` tokenizer and `tokenchars '_'` so
//! identifier-shaped tokens like `refresh_tokens` stay a single token
//! (§4.1's "preserve as one token" requirement) instead of splitting on the
//! underscore.

use rusqlite_migration::{Migrations, M};
use std::sync::OnceLock;

pub fn migrations() -> &'static Migrations<'static> {
    static MIGRATIONS: OnceLock<Migrations<'static>> = OnceLock::new();
    MIGRATIONS.get_or_init(|| {
        Migrations::new(vec![M::up(
            r#"
            CREATE TABLE threads (
                id TEXT PRIMARY KEY,
                resource_id TEXT,
                title TEXT,
                metadata TEXT NOT NULL DEFAULT '{}',
                created_at INTEGER NOT NULL,
                updated_at INTEGER NOT NULL
            );
            CREATE INDEX idx_threads_resource_id ON threads(resource_id);

            CREATE TABLE messages (
                id TEXT PRIMARY KEY,
                thread_id TEXT NOT NULL REFERENCES threads(id) ON DELETE CASCADE,
                resource_id TEXT,
                role TEXT NOT NULL,
                raw_content TEXT NOT NULL,
                search_text TEXT NOT NULL,
                injection_text TEXT NOT NULL,
                task_id TEXT,
                summary TEXT,
                compaction_level INTEGER,
                created_at INTEGER NOT NULL,
                message_index INTEGER NOT NULL,
                token_count INTEGER,
                UNIQUE(thread_id, message_index)
            );
            CREATE INDEX idx_messages_thread_id ON messages(thread_id, message_index);
            CREATE INDEX idx_messages_resource_id ON messages(resource_id);
            CREATE INDEX idx_messages_task_id ON messages(task_id);

            CREATE VIRTUAL TABLE messages_fts USING fts5(
                search_text,
                content='messages',
                content_rowid='rowid',
                tokenize='unicode61 tokenchars ''_'''
            );

            CREATE TRIGGER messages_ai AFTER INSERT ON messages BEGIN
                INSERT INTO messages_fts(rowid, search_text) VALUES (new.rowid, new.search_text);
            END;
            CREATE TRIGGER messages_ad AFTER DELETE ON messages BEGIN
                INSERT INTO messages_fts(messages_fts, rowid, search_text) VALUES ('delete', old.rowid, old.search_text);
            END;
            CREATE TRIGGER messages_au AFTER UPDATE ON messages BEGIN
                INSERT INTO messages_fts(messages_fts, rowid, search_text) VALUES ('delete', old.rowid, old.search_text);
                INSERT INTO messages_fts(rowid, search_text) VALUES (new.rowid, new.search_text);
            END;

            CREATE TABLE tasks (
                id TEXT PRIMARY KEY,
                title TEXT NOT NULL,
                description TEXT NOT NULL DEFAULT '',
                status TEXT NOT NULL,
                priority TEXT,
                type TEXT,
                assignee TEXT,
                session_id TEXT,
                created_at INTEGER NOT NULL,
                updated_at INTEGER NOT NULL,
                closed_at INTEGER,
                close_reason TEXT,
                summary TEXT,
                metadata TEXT NOT NULL DEFAULT '{}'
            );
            CREATE INDEX idx_tasks_status ON tasks(status);
            CREATE INDEX idx_tasks_session_id ON tasks(session_id);

            CREATE VIRTUAL TABLE tasks_fts USING fts5(
                title,
                description,
                content='tasks',
                content_rowid='rowid',
                tokenize='unicode61 tokenchars ''_'''
            );
            CREATE TRIGGER tasks_ai AFTER INSERT ON tasks BEGIN
                INSERT INTO tasks_fts(rowid, title, description) VALUES (new.rowid, new.title, new.description);
            END;
            CREATE TRIGGER tasks_ad AFTER DELETE ON tasks BEGIN
                INSERT INTO tasks_fts(tasks_fts, rowid, title, description) VALUES ('delete', old.rowid, old.title, old.description);
            END;
            CREATE TRIGGER tasks_au AFTER UPDATE ON tasks BEGIN
                INSERT INTO tasks_fts(tasks_fts, rowid, title, description) VALUES ('delete', old.rowid, old.title, old.description);
                INSERT INTO tasks_fts(rowid, title, description) VALUES (new.rowid, new.title, new.description);
            END;

            CREATE TABLE task_dependencies (
                task_id TEXT NOT NULL REFERENCES tasks(id) ON DELETE CASCADE,
                depends_on_id TEXT NOT NULL REFERENCES tasks(id) ON DELETE CASCADE,
                type TEXT NOT NULL DEFAULT 'blocks',
                created_at INTEGER NOT NULL,
                UNIQUE(task_id, depends_on_id, type)
            );
            CREATE INDEX idx_task_deps_task_id ON task_dependencies(task_id);
            CREATE INDEX idx_task_deps_depends_on_id ON task_dependencies(depends_on_id);

            CREATE TABLE task_messages (
                task_id TEXT NOT NULL REFERENCES tasks(id) ON DELETE CASCADE,
                message_id TEXT NOT NULL REFERENCES messages(id) ON DELETE CASCADE,
                relation_type TEXT NOT NULL,
                created_at INTEGER NOT NULL,
                UNIQUE(task_id, message_id, relation_type)
            );
            CREATE INDEX idx_task_messages_task_id ON task_messages(task_id);
            CREATE INDEX idx_task_messages_message_id ON task_messages(message_id);

            CREATE TABLE working_memory (
                id TEXT PRIMARY KEY,
                resource_id TEXT NOT NULL,
                scope TEXT NOT NULL,
                content TEXT NOT NULL DEFAULT '',
                content_hash TEXT NOT NULL DEFAULT '',
                created_at INTEGER NOT NULL,
                updated_at INTEGER NOT NULL,
                UNIQUE(resource_id, scope)
            );

            CREATE TABLE observational_memory (
                id TEXT PRIMARY KEY,
                thread_id TEXT,
                resource_id TEXT,
                scope TEXT NOT NULL,
                lookup_key TEXT NOT NULL UNIQUE,
                config TEXT NOT NULL,
                active_observations TEXT NOT NULL DEFAULT '',
                buffered_observation_chunks TEXT NOT NULL DEFAULT '[]',
                observed_message_ids TEXT NOT NULL DEFAULT '[]',
                is_observing INTEGER NOT NULL DEFAULT 0,
                is_reflecting INTEGER NOT NULL DEFAULT 0,
                is_buffering_observation INTEGER NOT NULL DEFAULT 0,
                is_buffering_reflection INTEGER NOT NULL DEFAULT 0,
                lock_owner_id TEXT,
                lock_expires_at INTEGER,
                lock_operation_id TEXT,
                last_heartbeat_at INTEGER,
                last_buffered_at_tokens INTEGER,
                last_buffered_at_time INTEGER,
                last_observed_at INTEGER,
                generation_count INTEGER NOT NULL DEFAULT 0,
                created_at INTEGER NOT NULL,
                updated_at INTEGER NOT NULL
            );

            CREATE TABLE reflections (
                id TEXT PRIMARY KEY,
                thread_id TEXT REFERENCES threads(id) ON DELETE CASCADE,
                resource_id TEXT,
                content TEXT NOT NULL,
                merged_from TEXT NOT NULL DEFAULT '[]',
                origin_type TEXT NOT NULL DEFAULT 'reflection',
                generation_count INTEGER NOT NULL,
                token_count INTEGER,
                created_at INTEGER NOT NULL,
                updated_at INTEGER NOT NULL
            );
            CREATE INDEX idx_reflections_thread_id ON reflections(thread_id, generation_count);
            "#,
        )])
    })
}
