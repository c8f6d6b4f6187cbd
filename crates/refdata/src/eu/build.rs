//! Builds one EU substance database file from one raw JSON export.

use super::fields;
use super::{find_cas, is_cas};
use crate::{text, Error};
use rusqlite::{params, Connection};
use std::path::Path;

/// Rows per insert transaction.
const BATCH: usize = 1_000;

const INDEXES: &str = "
    CREATE INDEX idx_substances_name ON substances (substance_name);
    CREATE INDEX idx_substances_cas ON substances (as_cas_number);
    CREATE INDEX idx_substances_status ON substances (substance_status);
    CREATE INDEX idx_substances_category ON substances (substance_category);
    CREATE VIRTUAL TABLE substances_fts USING fts5 (
        substance_name_norm,
        as_cas_number UNINDEXED,
        substance_category UNINDEXED
    );
";

pub fn build(raw: &Path, db_path: &Path) -> Result<(), Error> {
    let result = try_build(raw, db_path);
    if result.is_err() {
        let _ = std::fs::remove_file(db_path);
    }
    // Parse and transaction failures all share one caller-facing kind.
    result.map_err(|err| match err {
        err @ Error::Build(_) => err,
        err => Error::Build(err.to_string()),
    })
}

fn try_build(raw: &Path, db_path: &Path) -> Result<(), Error> {
    let db = Connection::open(db_path)?;
    db.execute_batch("PRAGMA journal_mode = OFF; PRAGMA synchronous = OFF;")?;
    db.execute_batch("CREATE TABLE meta (key TEXT PRIMARY KEY, value TEXT);")?;
    db.execute_batch(&fields::substances_ddl())?;

    let body = std::fs::read_to_string(raw)?;
    let records = parse_records(&body)?;
    insert_records(&db, &records)?;

    db.execute_batch(INDEXES)?;
    populate_fts(&db)?;

    let count: i64 = db.query_row("SELECT COUNT(*) FROM substances;", [], |r| r.get(0))?;
    let mut insert = db.prepare("INSERT INTO meta (key, value) VALUES (?, ?);")?;
    insert.execute(params![
        "builtAt",
        chrono::Utc::now().to_rfc3339_opts(chrono::SecondsFormat::Secs, true)
    ])?;
    insert.execute(params!["recordCount", count.to_string()])?;
    Ok(())
}

/// Parse the export body: a JSON array, a single object (wrapped as a
/// one-element list), or line-delimited JSON with one object per
/// non-blank line.
fn parse_records(body: &str) -> Result<Vec<serde_json::Value>, Error> {
    match serde_json::from_str::<serde_json::Value>(body) {
        Ok(serde_json::Value::Array(items)) => Ok(items),
        Ok(object @ serde_json::Value::Object(_)) => Ok(vec![object]),
        Ok(other) => Err(Error::Build(format!(
            "unexpected JSON root of type {}",
            match other {
                serde_json::Value::String(_) => "string",
                serde_json::Value::Number(_) => "number",
                serde_json::Value::Bool(_) => "bool",
                _ => "null",
            }
        ))),
        Err(_) => body
            .lines()
            .filter(|line| !line.trim().is_empty())
            .map(|line| {
                serde_json::from_str(line)
                    .map_err(|err| Error::Build(format!("failed to parse JSON line: {err}")))
            })
            .collect(),
    }
}

fn insert_records(db: &Connection, records: &[serde_json::Value]) -> Result<(), Error> {
    let sql = fields::insert_sql();
    let result = (|| -> Result<(), Error> {
        db.execute_batch("BEGIN;")?;
        for (i, record) in records.iter().enumerate() {
            insert_record(db, &sql, record)?;
            if (i + 1) % BATCH == 0 {
                db.execute_batch("COMMIT; BEGIN;")?;
            }
        }
        db.execute_batch("COMMIT;")?;
        Ok(())
    })();
    if result.is_err() {
        let _ = db.execute_batch("ROLLBACK;");
    }
    result
}

fn insert_record(db: &Connection, sql: &str, record: &serde_json::Value) -> Result<(), Error> {
    let Some(object) = record.as_object() else {
        return Err(Error::Build("substance record is not a JSON object".to_string()));
    };

    let id = match object.get("substance_id") {
        Some(serde_json::Value::Number(n)) => n.as_i64(),
        Some(serde_json::Value::String(s)) => s.trim().parse::<i64>().ok(),
        _ => None,
    };
    let Some(id) = id else {
        tracing::warn!("skipping substance record without a numeric substance_id");
        return Ok(());
    };
    let Some(name) = fields::to_text(object.get("substance_name")) else {
        tracing::warn!(substance_id = id, "skipping substance record without a name");
        return Ok(());
    };

    let remark = fields::to_text(object.get("remark"));
    let cas = rescue_cas(
        fields::to_text(object.get("as_cas_number")),
        remark.as_deref(),
    );

    let mut values: Vec<rusqlite::types::Value> = vec![
        id.into(),
        name.into(),
        cas.into(),
        fields::to_text(object.get("substance_status")).into(),
        fields::to_text(object.get("substance_category")).into(),
        remark.into(),
    ];
    for column in fields::OPAQUE_COLUMNS {
        let value = match *column {
            // Known upstream typo: the ArfD source field is sometimes
            // delivered as tox_source_earfd. Stored under the canonical
            // name either way.
            "tox_source_arfd" => object
                .get("tox_source_earfd")
                .or_else(|| object.get("tox_source_arfd")),
            column => object.get(column),
        };
        values.push(fields::to_text(value).into());
    }

    db.prepare_cached(sql)?
        .execute(rusqlite::params_from_iter(values.iter()))?;
    Ok(())
}

/// A structured CAS number that matches the canonical format wins; an
/// empty or malformed one is opportunistically replaced by the first
/// CAS-shaped token of the remark text.
fn rescue_cas(structured: Option<String>, remark: Option<&str>) -> Option<String> {
    match structured {
        Some(cas) if is_cas(&cas) => Some(cas),
        _ => remark.and_then(find_cas).map(str::to_string),
    }
}

fn populate_fts(db: &Connection) -> Result<(), Error> {
    db.execute_batch("BEGIN;")?;
    {
        let mut read = db.prepare(
            "SELECT substance_id, substance_name, as_cas_number, substance_category \
             FROM substances;",
        )?;
        let mut write = db.prepare(
            "INSERT INTO substances_fts (rowid, substance_name_norm, as_cas_number, substance_category) \
             VALUES (?, ?, ?, ?);",
        )?;

        let mut rows = read.query([])?;
        while let Some(row) = rows.next()? {
            let id: i64 = row.get(0)?;
            let name: String = row.get(1)?;
            let cas: Option<String> = row.get(2)?;
            let category: Option<String> = row.get(3)?;
            write.execute(params![id, text::fold(&name), cas, category])?;
        }
    }
    db.execute_batch("COMMIT;")?;
    Ok(())
}
