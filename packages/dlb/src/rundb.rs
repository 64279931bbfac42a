//! The run-database: persistent evidence of past redos.
//!
//! One SQLite file per working tree and schema version. A schema change
//! bumps [`SCHEMA_VERSION`] and thereby the file name; there are no
//! migrations, an old file is simply left behind.
//!
//! Input paths are stored in an encoded textual form with the property
//! that the encoding of a directory is a prefix of the encoding of every
//! path below it, so a SQL `LIKE` can invalidate a whole subtree at once.

use std::collections::BTreeMap;
use std::path::Path;

use sqlx::sqlite::{SqliteConnectOptions, SqliteConnection};
use sqlx::{Connection, Row};
use tracing::{debug, instrument};

use crate::error::DatabaseError;
use crate::fs::path::{PathError, RelativePath, Restriction, Root};

/// Bumped on every change of the table layout below.
pub const SCHEMA_VERSION: u32 = 1;

/// The run-database file name for the current schema.
pub fn database_file_name() -> String {
    format!("runs-{SCHEMA_VERSION}.sqlite")
}

/// Encodes a normalized relative path: every component followed by `/`,
/// the relative root as the empty string.
pub fn encode_path<R: Restriction>(path: &crate::fs::Path<R>) -> Result<String, PathError> {
    if path.is_absolute() {
        return Err(PathError::Invalid {
            reason: format!("cannot encode absolute path: {path:?}"),
        });
    }
    if !path.is_normalized() {
        return Err(PathError::Invalid {
            reason: format!("cannot encode non-normalized path: {path:?}"),
        });
    }
    let mut encoded = String::new();
    for component in path.components() {
        encoded.push_str(component);
        encoded.push('/');
    }
    Ok(encoded)
}

/// True iff `text` is the encoding of some relative normalized path.
pub fn is_encoded_path(text: &str) -> bool {
    text.is_empty()
        || (text.ends_with('/')
            && text
                .split_terminator('/')
                .all(|c| !c.is_empty() && c != "." && c != ".."))
}

/// Decodes [`encode_path`] output; the directory flag is not part of the
/// encoding and must be supplied (the relative root is always a
/// directory).
pub fn decode_path(encoded: &str, is_dir: bool) -> Result<RelativePath, PathError> {
    if !is_encoded_path(encoded) {
        return Err(PathError::Invalid {
            reason: format!("not an encoded path: {encoded:?}"),
        });
    }
    if encoded.is_empty() {
        return RelativePath::new(".");
    }
    RelativePath::from_components(Root::Relative, encoded.split_terminator('/'), is_dir)
}

/// Explicitness and encoded memo of one recorded input.
pub type InputInfo = (bool, Option<Vec<u8>>);

/// Evidence store for a working tree, exclusive to the root context that
/// holds the working tree lock.
pub struct RunDatabase {
    conn: SqliteConnection,
}

impl RunDatabase {
    /// Opens or creates the database file.
    #[instrument(name = "RunDatabase::open", skip_all, fields(path = %path.as_ref().display()))]
    pub async fn open(path: impl AsRef<Path>) -> Result<Self, DatabaseError> {
        let options = SqliteConnectOptions::new()
            .filename(path.as_ref())
            .create_if_missing(true)
            .foreign_keys(true);
        let mut conn = SqliteConnection::connect_with(&options).await?;
        sqlx::raw_sql(
            "CREATE TABLE IF NOT EXISTS tool_instance (
                 id INTEGER PRIMARY KEY,
                 tool_id BLOB NOT NULL,
                 fingerprint BLOB NOT NULL,
                 last_redo_returned INTEGER,
                 last_redo_at INTEGER,
                 UNIQUE (tool_id, fingerprint));
             CREATE TABLE IF NOT EXISTS fsobject_input (
                 tool_instance_id INTEGER NOT NULL
                     REFERENCES tool_instance (id) ON DELETE CASCADE,
                 encoded_path TEXT NOT NULL,
                 is_explicit INTEGER NOT NULL,
                 memo BLOB,
                 PRIMARY KEY (tool_instance_id, encoded_path));",
        )
        .execute(&mut conn)
        .await?;
        Ok(Self { conn })
    }

    /// Registers a tool instance by its identity pair, returning the stable
    /// row id; idempotent.
    pub async fn register_tool_instance(
        &mut self,
        tool_id: &[u8],
        fingerprint: &[u8],
    ) -> Result<i64, DatabaseError> {
        let mut tx = self.conn.begin().await?;
        sqlx::query("INSERT OR IGNORE INTO tool_instance (tool_id, fingerprint) VALUES (?1, ?2)")
            .bind(tool_id)
            .bind(fingerprint)
            .execute(&mut *tx)
            .await?;
        let row =
            sqlx::query("SELECT id FROM tool_instance WHERE tool_id = ?1 AND fingerprint = ?2")
                .bind(tool_id)
                .bind(fingerprint)
                .fetch_one(&mut *tx)
                .await?;
        tx.commit().await?;
        Ok(row.get(0))
    }

    pub async fn tool_instance_count(&mut self) -> Result<i64, DatabaseError> {
        let row = sqlx::query("SELECT COUNT(*) FROM tool_instance")
            .fetch_one(&mut self.conn)
            .await?;
        Ok(row.get(0))
    }

    /// The recorded inputs of a tool instance, optionally filtered by
    /// explicitness.
    pub async fn get_fsobject_inputs(
        &mut self,
        tool_instance_id: i64,
        is_explicit: Option<bool>,
    ) -> Result<BTreeMap<String, InputInfo>, DatabaseError> {
        let rows = match is_explicit {
            None => {
                sqlx::query(
                    "SELECT encoded_path, is_explicit, memo FROM fsobject_input
                     WHERE tool_instance_id = ?1",
                )
                .bind(tool_instance_id)
                .fetch_all(&mut self.conn)
                .await?
            }
            Some(explicit) => {
                sqlx::query(
                    "SELECT encoded_path, is_explicit, memo FROM fsobject_input
                     WHERE tool_instance_id = ?1 AND is_explicit = ?2",
                )
                .bind(tool_instance_id)
                .bind(explicit)
                .fetch_all(&mut self.conn)
                .await?
            }
        };
        Ok(rows
            .into_iter()
            .map(|row| (row.get(0), (row.get(1), row.get(2))))
            .collect())
    }

    /// Upserts a single input row.
    pub async fn update_fsobject_input(
        &mut self,
        tool_instance_id: i64,
        encoded_path: &str,
        is_explicit: bool,
        memo: Option<&[u8]>,
    ) -> Result<(), DatabaseError> {
        if !is_encoded_path(encoded_path) {
            return Err(DatabaseError::new(format!(
                "not an encoded path: {encoded_path:?}"
            )));
        }
        sqlx::query(
            "INSERT OR REPLACE INTO fsobject_input
                 (tool_instance_id, encoded_path, is_explicit, memo)
             VALUES (?1, ?2, ?3, ?4)",
        )
        .bind(tool_instance_id)
        .bind(encoded_path)
        .bind(is_explicit)
        .bind(memo)
        .execute(&mut self.conn)
        .await?;
        Ok(())
    }

    /// Replaces the whole recorded input set of a tool instance; on any
    /// failure nothing changes.
    pub async fn replace_fsobject_inputs(
        &mut self,
        tool_instance_id: i64,
        inputs: &BTreeMap<String, InputInfo>,
    ) -> Result<(), DatabaseError> {
        if let Some(bad) = inputs.keys().find(|k| !is_encoded_path(k)) {
            return Err(DatabaseError::new(format!("not an encoded path: {bad:?}")));
        }
        let mut tx = self.conn.begin().await?;
        sqlx::query("DELETE FROM fsobject_input WHERE tool_instance_id = ?1")
            .bind(tool_instance_id)
            .execute(&mut *tx)
            .await?;
        for (encoded_path, (is_explicit, memo)) in inputs {
            sqlx::query(
                "INSERT INTO fsobject_input
                     (tool_instance_id, encoded_path, is_explicit, memo)
                 VALUES (?1, ?2, ?3, ?4)",
            )
            .bind(tool_instance_id)
            .bind(encoded_path)
            .bind(is_explicit)
            .bind(memo.as_deref())
            .execute(&mut *tx)
            .await?;
        }
        tx.commit().await?;
        Ok(())
    }

    /// Invalidates the memo of every input row whose path equals
    /// `encoded_path` or lies below it, across all tool instances. The
    /// cleared memo is sticky until a later successful redo records a
    /// fresh one.
    #[instrument(name = "RunDatabase::declare_modified", skip(self))]
    pub async fn declare_fsobject_input_as_modified(
        &mut self,
        encoded_path: &str,
    ) -> Result<(), DatabaseError> {
        if !is_encoded_path(encoded_path) {
            return Err(DatabaseError::new(format!(
                "not an encoded path: {encoded_path:?}"
            )));
        }
        let mut pattern = String::with_capacity(encoded_path.len() + 1);
        for c in encoded_path.chars() {
            if matches!(c, '%' | '_' | '\\') {
                pattern.push('\\');
            }
            pattern.push(c);
        }
        pattern.push('%');
        let result = sqlx::query(
            r"UPDATE fsobject_input SET memo = NULL
              WHERE memo IS NOT NULL AND encoded_path LIKE ?1 ESCAPE '\'",
        )
        .bind(&pattern)
        .execute(&mut self.conn)
        .await?;
        debug!(rows = result.rows_affected(), "invalidated input memos");
        Ok(())
    }

    /// The redo evidence of a tool instance: `(returned, at)` of the last
    /// successful redo, or `None` if it never completed one.
    pub async fn get_redo_state(
        &mut self,
        tool_instance_id: i64,
    ) -> Result<Option<(bool, i64)>, DatabaseError> {
        let row = sqlx::query(
            "SELECT last_redo_returned, last_redo_at FROM tool_instance WHERE id = ?1",
        )
        .bind(tool_instance_id)
        .fetch_one(&mut self.conn)
        .await?;
        let returned: Option<bool> = row.get(0);
        let at: Option<i64> = row.get(1);
        Ok(match (returned, at) {
            (Some(returned), Some(at)) => Some((returned, at)),
            _ => None,
        })
    }

    pub async fn set_redo_state(
        &mut self,
        tool_instance_id: i64,
        returned: bool,
        at: i64,
    ) -> Result<(), DatabaseError> {
        sqlx::query(
            "UPDATE tool_instance SET last_redo_returned = ?2, last_redo_at = ?3 WHERE id = ?1",
        )
        .bind(tool_instance_id)
        .bind(returned)
        .bind(at)
        .execute(&mut self.conn)
        .await?;
        Ok(())
    }

    /// Garbage-collects tool instances without recorded inputs.
    #[instrument(name = "RunDatabase::cleanup", skip_all)]
    pub async fn cleanup(&mut self) -> Result<(), DatabaseError> {
        let result = sqlx::query(
            "DELETE FROM tool_instance WHERE id NOT IN
                 (SELECT DISTINCT tool_instance_id FROM fsobject_input)",
        )
        .execute(&mut self.conn)
        .await?;
        debug!(rows = result.rows_affected(), "dropped unused tool instances");
        Ok(())
    }

    pub async fn close(self) -> Result<(), DatabaseError> {
        self.conn.close().await?;
        Ok(())
    }
}
