//! Read-only query handle onto one built EPPO database file.

use crate::provider::ProviderStore;
use crate::{text, Error};
use rusqlite::{params, Connection, OpenFlags, OptionalExtension};
use std::collections::BTreeMap;
use std::path::{Path, PathBuf};
use std::sync::Mutex;

const NAME_COLUMNS: &str = "id, eppocode, fullname, lang, langcountry, authority, \
     ispreferred, isactive, creation, modification";

pub struct Store {
    path: PathBuf,
    conn: Mutex<Connection>,
}

#[derive(Debug, Clone, serde::Serialize)]
pub struct Name {
    pub id: i64,
    pub eppocode: String,
    pub fullname: String,
    pub lang: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub langcountry: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub authority: Option<String>,
    pub ispreferred: bool,
    pub isactive: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub creation: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub modification: Option<String>,
}

#[derive(Debug, serde::Serialize)]
pub struct Code {
    pub id: i64,
    pub eppocode: String,
    #[serde(rename = "type")]
    pub typ: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub creation: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub modification: Option<String>,
    pub preferred: Option<Name>,
    /// Serialised separately by the HTTP layer as a sibling of the code.
    #[serde(skip_serializing)]
    pub names: Vec<Name>,
}

#[derive(Debug, serde::Serialize)]
pub struct SearchHit {
    pub eppocode: String,
    pub fullname: String,
    pub lang: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub langcountry: Option<String>,
    #[serde(rename = "type")]
    pub typ: String,
    pub preferred: Option<Name>,
}

#[derive(Debug, serde::Serialize)]
pub struct SearchResults {
    pub total: i64,
    pub limit: i64,
    pub offset: i64,
    pub results: Vec<SearchHit>,
}

fn name_from_row(row: &rusqlite::Row) -> rusqlite::Result<Name> {
    Ok(Name {
        id: row.get(0)?,
        eppocode: row.get(1)?,
        fullname: row.get(2)?,
        lang: row.get(3)?,
        langcountry: row.get(4)?,
        authority: row.get(5)?,
        ispreferred: row.get(6)?,
        isactive: row.get(7)?,
        creation: row.get(8)?,
        modification: row.get(9)?,
    })
}

impl ProviderStore for Store {
    fn open(path: &Path) -> Result<Self, Error> {
        let conn = Connection::open_with_flags(path, OpenFlags::SQLITE_OPEN_READ_ONLY)?;

        // Sentinel: the meta marker is written last, so its presence means
        // the build ran to completion.
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
        let count = |sql: &str| -> Result<i64, rusqlite::Error> {
            conn.query_row(sql, [], |r| r.get(0))
        };
        Ok(serde_json::json!({
            "codes": count("SELECT COUNT(*) FROM codes;")?,
            "names": count("SELECT COUNT(*) FROM names;")?,
            "namesActive": count("SELECT COUNT(*) FROM names WHERE isactive = 1;")?,
        }))
    }
}

impl Store {
    /// Point lookup of one code with its preferred name and active names,
    /// optionally filtered to one language. Eppocodes are normalised to
    /// uppercase before lookup.
    pub fn get_code(&self, eppocode: &str, lang: Option<&str>) -> Result<Code, Error> {
        let eppocode = eppocode.to_uppercase();
        let conn = self.conn.lock().unwrap();

        let head = conn
            .prepare_cached(
                "SELECT id, eppocode, type, creation, modification FROM codes WHERE eppocode = ?;",
            )?
            .query_row(params![eppocode], |row| {
                Ok((
                    row.get::<_, i64>(0)?,
                    row.get::<_, String>(1)?,
                    row.get::<_, String>(2)?,
                    row.get::<_, Option<String>>(3)?,
                    row.get::<_, Option<String>>(4)?,
                ))
            })
            .optional()?;
        let Some((id, eppocode, typ, creation, modification)) = head else {
            return Err(Error::NotFound);
        };

        let names = match lang {
            Some(lang) => conn
                .prepare_cached(&format!(
                    "SELECT {NAME_COLUMNS} FROM names \
                     WHERE eppocode = ? AND isactive = 1 AND lang = ? \
                     ORDER BY ispreferred DESC, lang, id;"
                ))?
                .query_map(params![eppocode, lang], name_from_row)?
                .collect::<rusqlite::Result<Vec<_>>>()?,
            None => conn
                .prepare_cached(&format!(
                    "SELECT {NAME_COLUMNS} FROM names \
                     WHERE eppocode = ? AND isactive = 1 \
                     ORDER BY ispreferred DESC, lang, id;"
                ))?
                .query_map(params![eppocode], name_from_row)?
                .collect::<rusqlite::Result<Vec<_>>>()?,
        };

        let preferred = preferred_name(&conn, &eppocode)?;

        Ok(Code {
            id,
            eppocode,
            typ,
            creation,
            modification,
            preferred,
            names,
        })
    }

    /// Single-name lookup with a stable fallback chain: exact
    /// (lang, country), then (lang, no country), then any row of the
    /// language. Within each tier a preferred name wins.
    pub fn get_name(
        &self,
        eppocode: &str,
        lang: &str,
        country: Option<&str>,
    ) -> Result<Name, Error> {
        let eppocode = eppocode.to_uppercase();
        let country = country.map(str::to_uppercase);
        let conn = self.conn.lock().unwrap();

        if let Some(country) = &country {
            let hit = conn
                .prepare_cached(&format!(
                    "SELECT {NAME_COLUMNS} FROM names \
                     WHERE eppocode = ? AND lang = ? AND langcountry = ? \
                     ORDER BY ispreferred DESC, id LIMIT 1;"
                ))?
                .query_row(params![eppocode, lang, country], name_from_row)
                .optional()?;
            if let Some(name) = hit {
                return Ok(name);
            }
        }

        let hit = conn
            .prepare_cached(&format!(
                "SELECT {NAME_COLUMNS} FROM names \
                 WHERE eppocode = ? AND lang = ? AND langcountry IS NULL \
                 ORDER BY ispreferred DESC, id LIMIT 1;"
            ))?
            .query_row(params![eppocode, lang], name_from_row)
            .optional()?;
        if let Some(name) = hit {
            return Ok(name);
        }

        let result = conn
            .prepare_cached(&format!(
                "SELECT {NAME_COLUMNS} FROM names \
                 WHERE eppocode = ? AND lang = ? \
                 ORDER BY ispreferred DESC, id LIMIT 1;"
            ))?
            .query_row(params![eppocode, lang], name_from_row)
            .optional()?
            .ok_or(Error::NotFound);
        result
    }

    /// Diacritic-insensitive prefix search over active names, ordered by
    /// index relevance. Duplicate (eppocode, fullname, lang) rows are
    /// suppressed and the distinct total is returned alongside the page.
    pub fn search(
        &self,
        q: &str,
        lang: Option<&str>,
        country: Option<&str>,
        limit: i64,
        offset: i64,
    ) -> Result<SearchResults, Error> {
        let conn = self.conn.lock().unwrap();

        let mut filters = String::new();
        let mut filter_params: Vec<rusqlite::types::Value> = Vec::new();
        if let Some(lang) = lang {
            filters.push_str(" AND n.lang = ?");
            filter_params.push(lang.to_string().into());
        }
        if let Some(country) = country {
            filters.push_str(" AND n.langcountry = ?");
            filter_params.push(country.to_uppercase().into());
        }

        let (mut rows, total) = match text::fts_prefix_query(q) {
            Some(match_query) => {
                let sql = format!(
                    "SELECT n.eppocode, n.fullname, n.lang, n.langcountry, c.type \
                     FROM names_fts \
                     JOIN names n ON n.id = names_fts.rowid \
                     JOIN codes c ON c.id = n.code_id \
                     WHERE names_fts MATCH ?{filters} \
                     GROUP BY n.eppocode, n.fullname, n.lang \
                     ORDER BY MIN(bm25(names_fts)), n.eppocode \
                     LIMIT ? OFFSET ?;"
                );
                let count_sql = format!(
                    "SELECT COUNT(*) FROM ( \
                       SELECT 1 FROM names_fts \
                       JOIN names n ON n.id = names_fts.rowid \
                       WHERE names_fts MATCH ?{filters} \
                       GROUP BY n.eppocode, n.fullname, n.lang \
                     );"
                );

                let mut params: Vec<rusqlite::types::Value> = vec![match_query.into()];
                params.extend(filter_params.iter().cloned());

                let total: i64 = conn
                    .prepare_cached(&count_sql)?
                    .query_row(rusqlite::params_from_iter(params.iter()), |r| r.get(0))?;

                params.push(limit.into());
                params.push(offset.into());
                let rows = query_hits(&conn, &sql, &params)?;
                (rows, total)
            }
            // No token survived folding (e.g. a bare `*`): match-all.
            None => {
                let sql = format!(
                    "SELECT n.eppocode, n.fullname, n.lang, n.langcountry, c.type \
                     FROM names n \
                     JOIN codes c ON c.id = n.code_id \
                     WHERE n.isactive = 1{filters} \
                     GROUP BY n.eppocode, n.fullname, n.lang \
                     ORDER BY n.fullname, n.eppocode \
                     LIMIT ? OFFSET ?;"
                );
                let count_sql = format!(
                    "SELECT COUNT(*) FROM ( \
                       SELECT 1 FROM names n WHERE n.isactive = 1{filters} \
                       GROUP BY n.eppocode, n.fullname, n.lang \
                     );"
                );

                let total: i64 = conn
                    .prepare_cached(&count_sql)?
                    .query_row(rusqlite::params_from_iter(filter_params.iter()), |r| {
                        r.get(0)
                    })?;

                let mut params = filter_params.clone();
                params.push(limit.into());
                params.push(offset.into());
                let rows = query_hits(&conn, &sql, &params)?;
                (rows, total)
            }
        };

        for hit in rows.iter_mut() {
            hit.preferred = preferred_name(&conn, &hit.eppocode)?;
        }

        Ok(SearchResults {
            total,
            limit,
            offset,
            results: rows,
        })
    }
}

fn query_hits(
    conn: &Connection,
    sql: &str,
    params: &[rusqlite::types::Value],
) -> Result<Vec<SearchHit>, Error> {
    let mut stmt = conn.prepare_cached(sql)?;
    let rows = stmt
        .query_map(rusqlite::params_from_iter(params.iter()), |row| {
            Ok(SearchHit {
                eppocode: row.get(0)?,
                fullname: row.get(1)?,
                lang: row.get(2)?,
                langcountry: row.get(3)?,
                typ: row.get(4)?,
                preferred: None,
            })
        })?
        .collect::<rusqlite::Result<Vec<_>>>()?;
    Ok(rows)
}

fn preferred_name(conn: &Connection, eppocode: &str) -> Result<Option<Name>, Error> {
    Ok(conn
        .prepare_cached(&format!(
            "SELECT {NAME_COLUMNS} FROM names \
             WHERE eppocode = ? AND ispreferred = 1 LIMIT 1;"
        ))?
        .query_row(params![eppocode], name_from_row)
        .optional()?)
}

#[cfg(test)]
mod test {
    use super::*;
    use crate::eppo::build;

    const SAMPLE: &str = r#"<codes dateexport="2026-07-19" version="2026.07">
  <code isactive="true" type="PFL">
    <eppocode>LYPES</eppocode>
    <name ispreferred="true" isactive="true"><fullname>Solanum lycopersicum</fullname><lang>la</lang></name>
    <name ispreferred="false" isactive="true"><fullname>Tomato</fullname><lang>en</lang></name>
    <name ispreferred="false" isactive="true"><fullname>Tomato (US)</fullname><lang>en</lang><langcountry>US</langcountry></name>
    <name ispreferred="false" isactive="false"><fullname>Love apple</fullname><lang>en</lang></name>
  </code>
  <code isactive="true" type="PFL">
    <eppocode>CIDLI</eppocode>
    <name ispreferred="true" isactive="true"><fullname>café limon</fullname><lang>es</lang></name>
    <name ispreferred="false" isactive="true"><fullname>λεμόνι</fullname><lang>el</lang></name>
  </code>
  <code isactive="true" type="PFL">
    <eppocode>DUPDU</eppocode>
    <name ispreferred="false" isactive="true"><fullname>Tomatillo</fullname><lang>en</lang><authority>A</authority></name>
    <name ispreferred="false" isactive="true"><fullname>Tomatillo</fullname><lang>en</lang><authority>B</authority></name>
  </code>
</codes>"#;

    fn sample_store() -> (tempfile::TempDir, Store) {
        let dir = tempfile::tempdir().unwrap();
        let raw = dir.path().join("codes.xml");
        std::fs::write(&raw, SAMPLE).unwrap();

        let db = dir.path().join("eppo_1.db");
        build::build(&raw, &db, &["PFL".to_string()]).unwrap();
        let store = Store::open(&db).unwrap();
        (dir, store)
    }

    #[test]
    fn get_code_normalises_case_and_lists_active_names() {
        let (_dir, store) = sample_store();

        let code = store.get_code("lypes", None).unwrap();
        assert_eq!(code.eppocode, "LYPES");
        assert_eq!(code.typ, "PFL");
        assert_eq!(code.names.len(), 3); // the inactive name is excluded
        assert_eq!(
            code.preferred.as_ref().unwrap().fullname,
            "Solanum lycopersicum"
        );

        let english = store.get_code("LYPES", Some("en")).unwrap();
        assert_eq!(english.names.len(), 2);
        assert!(english.names.iter().all(|n| n.lang == "en"));
        // The preferred name is attached even when filtered to another lang.
        assert!(english.preferred.is_some());

        assert!(matches!(
            store.get_code("NOPE", None),
            Err(Error::NotFound)
        ));
    }

    #[test]
    fn get_name_walks_the_fallback_chain() {
        let (_dir, store) = sample_store();

        let us = store.get_name("LYPES", "en", Some("us")).unwrap();
        assert_eq!(us.fullname, "Tomato (US)");

        // No Canadian variant: fall back to the country-less row.
        let ca = store.get_name("LYPES", "en", Some("CA")).unwrap();
        assert_eq!(ca.fullname, "Tomato");

        // Preferred wins within its tier.
        let la = store.get_name("LYPES", "la", None).unwrap();
        assert!(la.ispreferred);

        assert!(matches!(
            store.get_name("LYPES", "de", None),
            Err(Error::NotFound)
        ));
    }

    #[test]
    fn search_is_diacritic_insensitive_both_ways() {
        let (_dir, store) = sample_store();

        let folded = store.search("cafe", None, None, 100, 0).unwrap();
        assert_eq!(folded.total, 1);
        assert_eq!(folded.results[0].fullname, "café limon");

        let accented = store.search("café", None, None, 100, 0).unwrap();
        assert_eq!(
            accented.results.iter().map(|h| &h.fullname).collect::<Vec<_>>(),
            folded.results.iter().map(|h| &h.fullname).collect::<Vec<_>>()
        );

        let greek = store.search("λεμον", None, None, 100, 0).unwrap();
        assert_eq!(greek.results[0].fullname, "λεμόνι");
    }

    #[test]
    fn search_filters_and_paginates() {
        let (_dir, store) = sample_store();

        let all = store.search("tom", None, None, 100, 0).unwrap();
        assert_eq!(all.total, 3); // Tomato, Tomato (US), Tomatillo

        let page = store.search("tom", None, None, 2, 0).unwrap();
        assert_eq!(page.results.len(), 2);
        assert_eq!(page.total, 3);
        let rest = store.search("tom", None, None, 2, 2).unwrap();
        assert_eq!(rest.results.len(), 1);

        let us_only = store.search("tom", Some("en"), Some("US"), 100, 0).unwrap();
        assert_eq!(us_only.total, 1);
        assert_eq!(us_only.results[0].fullname, "Tomato (US)");

        // Hits carry the code's preferred name.
        assert_eq!(
            all.results
                .iter()
                .find(|h| h.eppocode == "LYPES")
                .unwrap()
                .preferred
                .as_ref()
                .unwrap()
                .fullname,
            "Solanum lycopersicum"
        );
    }

    #[test]
    fn duplicate_authority_variants_are_suppressed() {
        let (_dir, store) = sample_store();
        let hits = store.search("tomatillo", None, None, 100, 0).unwrap();
        assert_eq!(hits.total, 1);
        assert_eq!(hits.results.len(), 1);
    }

    #[test]
    fn match_all_lists_active_names() {
        let (_dir, store) = sample_store();
        let all = store.search("*", None, None, 100, 0).unwrap();
        // 6 distinct active (eppocode, fullname, lang) rows.
        assert_eq!(all.total, 6);
    }

    #[test]
    fn sentinel_rejects_incomplete_databases() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("eppo_1.db");
        let conn = Connection::open(&path).unwrap();
        conn.execute_batch("CREATE TABLE meta (key TEXT PRIMARY KEY, value TEXT);")
            .unwrap();
        drop(conn);

        assert!(Store::open(&path).is_err());
    }
}
