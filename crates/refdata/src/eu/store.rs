//! Read-only query handle onto one built EU substance database file.

use super::is_cas;
use crate::provider::ProviderStore;
use crate::{text, Error};
use rusqlite::{params, Connection, OpenFlags, OptionalExtension};
use std::collections::BTreeMap;
use std::path::{Path, PathBuf};
use std::sync::Mutex;

pub struct Store {
    path: PathBuf,
    conn: Mutex<Connection>,
}

#[derive(Debug, serde::Serialize)]
pub struct SearchResults {
    pub total: i64,
    pub limit: i64,
    pub offset: i64,
    pub results: Vec<serde_json::Value>,
}

/// Render a full `SELECT *` row as a JSON object keyed by column name,
/// so the ~45 pass-through columns keep their upstream spelling.
fn row_to_json(row: &rusqlite::Row) -> rusqlite::Result<serde_json::Value> {
    use rusqlite::types::ValueRef;

    let mut map = serde_json::Map::new();
    for i in 0..row.as_ref().column_count() {
        let name = row.as_ref().column_name(i)?.to_string();
        let value = match row.get_ref(i)? {
            ValueRef::Null => serde_json::Value::Null,
            ValueRef::Integer(n) => n.into(),
            ValueRef::Real(f) => serde_json::json!(f),
            ValueRef::Text(t) => String::from_utf8_lossy(t).into_owned().into(),
            ValueRef::Blob(_) => serde_json::Value::Null,
        };
        map.insert(name, value);
    }
    Ok(map.into())
}

impl ProviderStore for Store {
    fn open(path: &Path) -> Result<Self, Error> {
        let conn = Connection::open_with_flags(path, OpenFlags::SQLITE_OPEN_READ_ONLY)?;

        let built_at: Option<String> = conn
            .query_row("SELECT value FROM meta WHERE key = 'builtAt';", [], |r| {
                r.get(0)
            })
            .optional()?;
        if built_at.is_none() {
            return Err(Error::Build(format!(
                "{} was not built to completion",
                path.display()
            )));
        }

        Ok(Store {
            path: path.to_owned(),
            conn: Mutex::new(conn),
        })
    }

    fn path(&self) -> &Path {
        &self.path
    }

    fn meta(&self) -> Result<BTreeMap<String, String>, Error> {
        let conn = self.conn.lock().unwrap();
        let mut stmt = conn.prepare_cached("SELECT key, value FROM meta;")?;
        let mut rows = stmt.query([])?;
        let mut meta = BTreeMap::new();
        while let Some(row) = rows.next()? {
            meta.insert(row.get(0)?, row.get(1)?);
        }
        Ok(meta)
    }

    fn stats(&self) -> Result<serde_json::Value, Error> {
        let conn = self.conn.lock().unwrap();
        let substances: i64 =
            conn.query_row("SELECT COUNT(*) FROM substances;", [], |r| r.get(0))?;
        Ok(serde_json::json!({ "substances": substances }))
    }
}

impl Store {
    pub fn get_substance(&self, id: i64) -> Result<serde_json::Value, Error> {
        let conn = self.conn.lock().unwrap();
        let result = conn
            .prepare_cached("SELECT * FROM substances WHERE substance_id = ?;")?
            .query_row(params![id], row_to_json)
            .optional()?
            .ok_or(Error::NotFound);
        result
    }

    /// CAS lookup. Values that fail the canonical format silently yield
    /// not-found without touching the database.
    pub fn get_by_cas(&self, cas: &str) -> Result<serde_json::Value, Error> {
        if !is_cas(cas) {
            return Err(Error::NotFound);
        }
        let conn = self.conn.lock().unwrap();
        let result = conn
            .prepare_cached("SELECT * FROM substances WHERE as_cas_number = ? LIMIT 1;")?
            .query_row(params![cas], row_to_json)
            .optional()?
            .ok_or(Error::NotFound);
        result
    }

    /// Prefix search over folded substance names. `status` filters
    /// exactly; `category` filters by two-letter prefix and by default is
    /// widened to also admit the `OT` (Other) category unless the caller
    /// disables that.
    pub fn search(
        &self,
        q: &str,
        status: Option<&str>,
        category: Option<&str>,
        include_other: bool,
        limit: i64,
        offset: i64,
    ) -> Result<SearchResults, Error> {
        let conn = self.conn.lock().unwrap();

        let mut filters = String::new();
        let mut filter_params: Vec<rusqlite::types::Value> = Vec::new();
        if let Some(status) = status {
            filters.push_str(" AND s.substance_status = ?");
            filter_params.push(status.to_string().into());
        }
        if let Some(category) = category {
            if include_other {
                filters.push_str(" AND (s.substance_category LIKE ? OR s.substance_category LIKE 'OT%')");
            } else {
                filters.push_str(" AND s.substance_category LIKE ?");
            }
            filter_params.push(format!("{}%", category.to_uppercase()).into());
        }

        let (results, total) = match text::fts_prefix_query(q) {
            Some(match_query) => {
                let sql = format!(
                    "SELECT s.* FROM substances_fts \
                     JOIN substances s ON s.substance_id = substances_fts.rowid \
                     WHERE substances_fts MATCH ?{filters} \
                     ORDER BY bm25(substances_fts), s.substance_name \
                     LIMIT ? OFFSET ?;"
                );
                let count_sql = format!(
                    "SELECT COUNT(*) FROM substances_fts \
                     JOIN substances s ON s.substance_id = substances_fts.rowid \
                     WHERE substances_fts MATCH ?{filters};"
                );

                let mut params: Vec<rusqlite::types::Value> = vec![match_query.into()];
                params.extend(filter_params.iter().cloned());

                let total: i64 = conn
                    .prepare_cached(&count_sql)?
                    .query_row(rusqlite::params_from_iter(params.iter()), |r| r.get(0))?;

                params.push(limit.into());
                params.push(offset.into());
                let mut stmt = conn.prepare_cached(&sql)?;
                let results = stmt
                    .query_map(rusqlite::params_from_iter(params.iter()), row_to_json)?
                    .collect::<rusqlite::Result<Vec<_>>>()?;
                (results, total)
            }
            // No token survived folding (e.g. a bare `*`): match-all.
            None => {
                let sql = format!(
                    "SELECT s.* FROM substances s WHERE 1 = 1{filters} \
                     ORDER BY s.substance_name LIMIT ? OFFSET ?;"
                );
                let count_sql =
                    format!("SELECT COUNT(*) FROM substances s WHERE 1 = 1{filters};");

                let total: i64 = conn
                    .prepare_cached(&count_sql)?
                    .query_row(rusqlite::params_from_iter(filter_params.iter()), |r| {
                        r.get(0)
                    })?;

                let mut params = filter_params.clone();
                params.push(limit.into());
                params.push(offset.into());
                let mut stmt = conn.prepare_cached(&sql)?;
                let results = stmt
                    .query_map(rusqlite::params_from_iter(params.iter()), row_to_json)?
                    .collect::<rusqlite::Result<Vec<_>>>()?;
                (results, total)
            }
        };

        Ok(SearchResults {
            total,
            limit,
            offset,
            results,
        })
    }
}
