//! Streaming pull-parser for the EPPO full-codes XML export. The dataset
//! is hundreds of megabytes, so the document is never materialised; the
//! element state machine is shallow (root -> code -> name) and admitted
//! codes are handed to a callback one at a time.

use crate::Error;
use quick_xml::events::{BytesStart, Event};
use quick_xml::Reader;
use std::collections::HashSet;
use std::io::BufRead;

/// Root-level attributes of the export, recorded as dataset metadata.
#[derive(Debug, Default, Clone)]
pub struct Dataset {
    pub dateexport: Option<String>,
    pub version: Option<String>,
}

#[derive(Debug, Default, Clone)]
pub struct Code {
    pub eppocode: String,
    pub typ: String,
    pub isactive: bool,
    pub creation: Option<String>,
    pub modification: Option<String>,
    pub names: Vec<Name>,
}

#[derive(Debug, Default, Clone)]
pub struct Name {
    pub fullname: String,
    pub lang: String,
    pub langcountry: Option<String>,
    pub authority: Option<String>,
    pub ispreferred: bool,
    pub isactive: bool,
    pub creation: Option<String>,
    pub modification: Option<String>,
}

#[derive(Debug, Clone, Copy)]
enum Field {
    Eppocode,
    Fullname,
    Lang,
    LangCountry,
    Authority,
}

#[derive(Default)]
struct PendingCode {
    eppocode: Option<String>,
    typ: Option<String>,
    isactive: bool,
    creation: Option<String>,
    modification: Option<String>,
    names: Vec<Name>,
}

#[derive(Default)]
struct PendingName {
    fullname: Option<String>,
    lang: Option<String>,
    langcountry: Option<String>,
    authority: Option<String>,
    ispreferred: bool,
    isactive: bool,
    creation: Option<String>,
    modification: Option<String>,
}

/// Parse the export, invoking `admit` for every code whose type is in the
/// allow-list and whose `isactive` attribute is `"true"`. Names of an
/// admitted code are captured irrespective of their own `isactive` flag.
pub fn parse<R, F>(reader: R, allow: &HashSet<String>, mut admit: F) -> Result<Dataset, Error>
where
    R: BufRead,
    F: FnMut(Code) -> Result<(), Error>,
{
    let mut reader = Reader::from_reader(reader);
    reader.config_mut().trim_text(true);

    let mut dataset = Dataset::default();
    let mut code: Option<PendingCode> = None;
    let mut name: Option<PendingName> = None;
    let mut field: Option<Field> = None;

    let mut buf = Vec::new();
    loop {
        match reader.read_event_into(&mut buf)? {
            Event::Start(e) => match e.name().as_ref() {
                b"codes" => {
                    dataset.dateexport = attr(&e, b"dateexport")?;
                    dataset.version = attr(&e, b"version")?;
                }
                b"code" => {
                    code = Some(PendingCode {
                        typ: attr(&e, b"type")?,
                        isactive: is_true(attr(&e, b"isactive")?),
                        creation: attr(&e, b"creation")?,
                        modification: attr(&e, b"modification")?,
                        ..Default::default()
                    });
                }
                b"name" if code.is_some() => {
                    name = Some(PendingName {
                        ispreferred: is_true(attr(&e, b"ispreferred")?),
                        isactive: is_true(attr(&e, b"isactive")?),
                        creation: attr(&e, b"creation")?,
                        modification: attr(&e, b"modification")?,
                        ..Default::default()
                    });
                }
                b"eppocode" => field = Some(Field::Eppocode),
                b"fullname" => field = Some(Field::Fullname),
                b"lang" => field = Some(Field::Lang),
                b"langcountry" => field = Some(Field::LangCountry),
                b"authority" => field = Some(Field::Authority),
                _ => (),
            },
            Event::Text(t) => {
                let text = t.unescape()?.trim().to_string();
                if text.is_empty() {
                    field = None;
                    continue;
                }
                match (field, &mut name, &mut code) {
                    (Some(Field::Eppocode), _, Some(code)) => code.eppocode = Some(text),
                    (Some(Field::Fullname), Some(name), _) => name.fullname = Some(text),
                    (Some(Field::Lang), Some(name), _) => name.lang = Some(text),
                    (Some(Field::LangCountry), Some(name), _) => {
                        name.langcountry = Some(text.to_uppercase())
                    }
                    (Some(Field::Authority), Some(name), _) => name.authority = Some(text),
                    _ => (),
                }
                field = None;
            }
            Event::End(e) => match e.name().as_ref() {
                b"name" => {
                    if let (Some(pending), Some(code)) = (name.take(), code.as_mut()) {
                        match (pending.fullname, pending.lang) {
                            (Some(fullname), Some(lang)) => code.names.push(Name {
                                fullname,
                                lang,
                                langcountry: pending.langcountry,
                                authority: pending.authority,
                                ispreferred: pending.ispreferred,
                                isactive: pending.isactive,
                                creation: pending.creation,
                                modification: pending.modification,
                            }),
                            _ => tracing::debug!("skipping name without fullname or lang"),
                        }
                    }
                }
                b"code" => {
                    let Some(pending) = code.take() else { continue };
                    let (Some(eppocode), Some(typ)) = (pending.eppocode, pending.typ) else {
                        tracing::debug!("skipping code without eppocode or type");
                        continue;
                    };
                    if !pending.isactive || !allow.contains(&typ.to_uppercase()) {
                        continue;
                    }
                    admit(Code {
                        eppocode: eppocode.to_uppercase(),
                        typ,
                        isactive: pending.isactive,
                        creation: pending.creation,
                        modification: pending.modification,
                        names: pending.names,
                    })?;
                }
                _ => field = None,
            },
            Event::Eof => break,
            _ => (),
        }
        buf.clear();
    }

    Ok(dataset)
}

fn attr(e: &BytesStart, key: &[u8]) -> Result<Option<String>, Error> {
    for a in e.attributes() {
        let a = a.map_err(quick_xml::Error::from)?;
        if a.key.as_ref() == key {
            let value = a.unescape_value()?.trim().to_string();
            return Ok(if value.is_empty() { None } else { Some(value) });
        }
    }
    Ok(None)
}

fn is_true(value: Option<String>) -> bool {
    value.as_deref() == Some("true")
}
