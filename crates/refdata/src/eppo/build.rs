//! Builds one EPPO database file from one raw XML export. The output is
//! all-or-nothing: either a complete, indexed file or no file at all.

use super::xml;
use crate::{text, Error};
use rusqlite::{params, Connection};
use std::collections::HashSet;
use std::io::BufRead;
use std::path::Path;

/// Codes per insert transaction while streaming the export.
const BATCH: usize = 5_000;

const SCHEMA: &str = "
    CREATE TABLE meta (key TEXT PRIMARY KEY, value TEXT);
    CREATE TABLE codes (
        id INTEGER PRIMARY KEY,
        eppocode TEXT UNIQUE NOT NULL,
        type TEXT NOT NULL,
        creation TEXT,
        modification TEXT
    );
    CREATE TABLE names (
        id INTEGER PRIMARY KEY,
        code_id INTEGER NOT NULL,
        eppocode TEXT NOT NULL,
        fullname TEXT NOT NULL,
        lang TEXT NOT NULL,
        langcountry TEXT,
        authority TEXT,
        ispreferred INTEGER NOT NULL,
        isactive INTEGER NOT NULL,
        creation TEXT,
        modification TEXT
    );
";

const INDEXES: &str = "
    CREATE INDEX idx_codes_eppo ON codes (eppocode);
    CREATE INDEX idx_names_eppo ON names (eppocode);
    CREATE INDEX idx_names_code_id ON names (code_id);
    CREATE INDEX idx_names_lang ON names (eppocode, lang);
    CREATE INDEX idx_names_lang_country ON names (eppocode, lang, langcountry);
    CREATE VIRTUAL TABLE names_fts USING fts5 (fullname_norm, eppocode UNINDEXED);
";

/// Build a database at `db_path` from the export at `raw`, admitting only
/// active codes whose type is in `types`.
pub fn build(raw: &Path, db_path: &Path, types: &[String]) -> Result<(), Error> {
    let result = try_build(raw, db_path, types);
    if result.is_err() {
        // Crash-discard output: never leave a partial file behind.
        let _ = std::fs::remove_file(db_path);
    }
    // Parse and transaction failures all share one caller-facing kind.
    result.map_err(|err| match err {
        err @ Error::Build(_) => err,
        err => Error::Build(err.to_string()),
    })
}

fn try_build(raw: &Path, db_path: &Path, types: &[String]) -> Result<(), Error> {
    let db = Connection::open(db_path)?;
    // Write-once file: journaling and fsync buy nothing here.
    db.execute_batch("PRAGMA journal_mode = OFF; PRAGMA synchronous = OFF;")?;
    db.execute_batch(SCHEMA)?;

    let allow: HashSet<String> = types.iter().map(|t| t.to_uppercase()).collect();
    let file = std::io::BufReader::new(std::fs::File::open(raw)?);
    let dataset = stream_codes(&db, file, &allow)?;

    db.execute_batch(INDEXES)?;
    populate_fts(&db)?;
    write_meta(&db, &dataset, types)?;

    Ok(())
}

fn stream_codes<R: BufRead>(
    db: &Connection,
    reader: R,
    allow: &HashSet<String>,
) -> Result<xml::Dataset, Error> {
    let mut pending = 0usize;

    db.execute_batch("BEGIN;")?;
    let dataset = xml::parse(reader, allow, |code| {
        insert_code(db, &code)?;
        pending += 1;
        if pending == BATCH {
            db.execute_batch("COMMIT; BEGIN;")?;
            pending = 0;
        }
        Ok(())
    });
    match dataset {
        Ok(dataset) => {
            // Flush the final partial batch.
            db.execute_batch("COMMIT;")?;
            Ok(dataset)
        }
        Err(err) => {
            let _ = db.execute_batch("ROLLBACK;");
            Err(err)
        }
    }
}

fn insert_code(db: &Connection, code: &xml::Code) -> Result<(), Error> {
    db.prepare_cached(
        "INSERT INTO codes (eppocode, type, creation, modification) VALUES (?, ?, ?, ?);",
    )?
    .execute(params![
        code.eppocode,
        code.typ,
        code.creation,
        code.modification
    ])?;
    let code_id = db.last_insert_rowid();

    let mut insert = db.prepare_cached(
        "INSERT INTO names (
            code_id, eppocode, fullname, lang, langcountry,
            authority, ispreferred, isactive, creation, modification
        ) VALUES (?, ?, ?, ?, ?, ?, ?, ?, ?, ?);",
    )?;
    for name in &code.names {
        insert.execute(params![
            code_id,
            code.eppocode,
            name.fullname,
            name.lang,
            name.langcountry,
            name.authority,
            name.ispreferred,
            name.isactive,
            name.creation,
            name.modification,
        ])?;
    }
    Ok(())
}

/// Populate the full-text index from the rows just written. Only active
/// names are indexed; the indexed text is folded with the same pipeline
/// applied to queries.
fn populate_fts(db: &Connection) -> Result<(), Error> {
    db.execute_batch("BEGIN;")?;
    {
        let mut read = db.prepare("SELECT id, fullname, eppocode FROM names WHERE isactive = 1;")?;
        let mut write = db.prepare(
            "INSERT INTO names_fts (rowid, fullname_norm, eppocode) VALUES (?, ?, ?);",
        )?;

        let mut rows = read.query([])?;
        while let Some(row) = rows.next()? {
            let id: i64 = row.get(0)?;
            let fullname: String = row.get(1)?;
            let eppocode: String = row.get(2)?;
            write.execute(params![id, text::fold(&fullname), eppocode])?;
        }
    }
    db.execute_batch("COMMIT;")?;
    Ok(())
}

fn write_meta(db: &Connection, dataset: &xml::Dataset, types: &[String]) -> Result<(), Error> {
    let codes: i64 = db.query_row("SELECT COUNT(*) FROM codes;", [], |r| r.get(0))?;
    let names: i64 = db.query_row("SELECT COUNT(*) FROM names;", [], |r| r.get(0))?;

    let mut insert = db.prepare("INSERT INTO meta (key, value) VALUES (?, ?);")?;
    if let Some(dateexport) = &dataset.dateexport {
        insert.execute(params!["dateexport", dateexport])?;
    }
    if let Some(version) = &dataset.version {
        insert.execute(params!["version", version])?;
    }
    insert.execute(params![
        "builtAt",
        chrono::Utc::now().to_rfc3339_opts(chrono::SecondsFormat::Secs, true)
    ])?;
    insert.execute(params!["types", types.join(",")])?;
    insert.execute(params!["codes", codes.to_string()])?;
    insert.execute(params!["names", names.to_string()])?;
    Ok(())
}

#[cfg(test)]
mod test {
    use super::*;

    const SAMPLE: &str = r#"<codes dateexport="2026-07-19" version="2026.07">
  <code isactive="true" type="PFL">
    <eppocode>LYPES</eppocode>
    <name ispreferred="true" isactive="true"><fullname>Solanum lycopersicum</fullname><lang>la</lang></name>
    <name ispreferred="false" isactive="true"><fullname>Tomato</fullname><lang>en</lang></name>
    <name ispreferred="false" isactive="false"><fullname>Love apple</fullname><lang>en</lang></name>
  </code>
  <code isactive="true" type="ANI">
    <eppocode>APHIGO</eppocode>
    <name ispreferred="true" isactive="true"><fullname>Aphis gossypii</fullname><lang>la</lang></name>
  </code>
</codes>"#;

    fn build_sample(types: &[&str]) -> (tempfile::TempDir, std::path::PathBuf) {
        let dir = tempfile::tempdir().unwrap();
        let raw = dir.path().join("codes.xml");
        std::fs::write(&raw, SAMPLE).unwrap();

        let db = dir.path().join("eppo_1.db");
        let types: Vec<String> = types.iter().map(|t| t.to_string()).collect();
        build(&raw, &db, &types).unwrap();
        (dir, db)
    }

    #[test]
    fn built_database_matches_the_admitted_source_subset() {
        let (_dir, db) = build_sample(&["PFL"]);
        let db = Connection::open(&db).unwrap();

        let codes: i64 = db.query_row("SELECT COUNT(*) FROM codes;", [], |r| r.get(0)).unwrap();
        let names: i64 = db.query_row("SELECT COUNT(*) FROM names;", [], |r| r.get(0)).unwrap();
        assert_eq!(codes, 1);
        assert_eq!(names, 3);

        // The FTS index carries active names only, folded.
        let indexed: i64 = db
            .query_row("SELECT COUNT(*) FROM names_fts;", [], |r| r.get(0))
            .unwrap();
        assert_eq!(indexed, 2);
    }

    #[test]
    fn meta_records_the_dataset_and_the_allow_list() {
        let (_dir, db) = build_sample(&["PFL", "ANI"]);
        let db = Connection::open(&db).unwrap();

        let get = |key: &str| -> String {
            db.query_row("SELECT value FROM meta WHERE key = ?;", [key], |r| r.get(0))
                .unwrap()
        };
        assert_eq!(get("dateexport"), "2026-07-19");
        assert_eq!(get("version"), "2026.07");
        assert_eq!(get("types"), "PFL,ANI");
        assert_eq!(get("codes"), "2");
        assert!(!get("builtAt").is_empty());
    }

    #[test]
    fn failed_builds_surface_as_build_errors_and_leave_no_file() {
        let dir = tempfile::tempdir().unwrap();
        let raw = dir.path().join("codes.xml");
        std::fs::write(&raw, "<codes><code></mismatch></codes>").unwrap();

        let db = dir.path().join("eppo_1.db");
        assert!(matches!(
            build(&raw, &db, &["PFL".to_string()]),
            Err(Error::Build(_))
        ));
        assert!(!db.exists());
    }
}
