//! Persistent memory context for steps

use super::schema::init_schema;
use anyhow::{Context, Result};
use rusqlite::Connection;
use std::path::Path;

/// One remembered step output
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct MemoryEntry {
    pub workflow: String,
    pub step: String,
    pub content: String,
    pub created_at: String,
}

/// SQLite-backed store of step outputs, scoped per workflow
pub struct MemoryStore {
    conn: Connection,
}

impl MemoryStore {
    /// Open or create the memory database
    pub fn open(path: &Path) -> Result<Self> {
        if let Some(parent) = path.parent()
            && !parent.as_os_str().is_empty()
        {
            std::fs::create_dir_all(parent)
                .with_context(|| format!("creating {}", parent.display()))?;
        }
        let conn = Connection::open(path)
            .with_context(|| format!("Failed to open memory database at {}", path.display()))?;
        init_schema(&conn)?;
        Ok(Self { conn })
    }

    /// In-memory store, used when persistence is not wanted
    pub fn open_in_memory() -> Result<Self> {
        let conn = Connection::open_in_memory()?;
        init_schema(&conn)?;
        Ok(Self { conn })
    }

    /// Append a step output
    pub fn append(&mut self, workflow: &str, step: &str, content: &str) -> Result<i64> {
        let now = chrono::Utc::now().to_rfc3339();
        self.conn.execute(
            "INSERT INTO memory_entries (workflow, step, content, created_at)
             VALUES (?1, ?2, ?3, ?4)",
            (workflow, step, content, &now),
        )?;
        Ok(self.conn.last_insert_rowid())
    }

    /// Most recent entries for a workflow, oldest first
    pub fn recent(&self, workflow: &str, limit: usize) -> Result<Vec<MemoryEntry>> {
        let mut stmt = self.conn.prepare(
            "SELECT workflow, step, content, created_at
             FROM memory_entries
             WHERE workflow = ?1
             ORDER BY id DESC
             LIMIT ?2",
        )?;

        let mut entries = stmt
            .query_map((workflow, limit as i64), |row| {
                Ok(MemoryEntry {
                    workflow: row.get(0)?,
                    step: row.get(1)?,
                    content: row.get(2)?,
                    created_at: row.get(3)?,
                })
            })?
            .collect::<Result<Vec<_>, _>>()?;

        entries.reverse();
        Ok(entries)
    }

    /// Delete every entry for a workflow
    pub fn clear(&mut self, workflow: &str) -> Result<usize> {
        let removed = self
            .conn
            .execute("DELETE FROM memory_entries WHERE workflow = ?1", [workflow])?;
        Ok(removed)
    }
}

/// Render entries as a prompt preamble
pub fn format_memory_context(entries: &[MemoryEntry]) -> String {
    let mut out = String::from("Previous context:\n");
    for entry in entries {
        out.push_str(&format!("[{}] {}\n", entry.step, entry.content.trim()));
    }
    out
}
