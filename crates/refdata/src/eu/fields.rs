//! Column layout of the substances table. A handful of columns get
//! dedicated handling (key, name, CAS, status, category, remark);
//! everything else is opaque text passed through from the upstream JSON
//! under its original field name.

/// Columns stored verbatim as text. `tox_source_arfd` is special-cased in
/// the builder: the upstream sometimes delivers it as `tox_source_earfd`.
pub const OPAQUE_COLUMNS: &[&str] = &[
    "as_ec_number",
    "as_cipac_number",
    "substance_approve_date",
    "substance_expire_date",
    "substance_legislation",
    "substance_review_report",
    "substance_rms",
    "substance_co_rms",
    "substance_cfs",
    "substance_low_risk",
    "substance_basic",
    "substance_organism_name",
    "substance_organism_strain",
    "substance_type",
    "substance_function",
    "substance_authorised",
    "substance_authorisation_in_progress",
    "tox_value_adi",
    "tox_source_adi",
    "tox_value_arfd",
    "tox_source_arfd",
    "tox_value_aoel",
    "tox_source_aoel",
    "tox_value_aaoel",
    "tox_source_aaoel",
    "mrl_regulation",
    "mrl_in_progress",
    "mrl_footnote",
    "residue_definition",
    "assessment_status",
    "assessment_date",
    "application_number",
    "application_date",
    "rapporteur_assessment_url",
    "review_report_url",
    "legislation_url",
    "candidate_substitution_criteria",
    "endocrine_disruptor_criteria",
    "protection_goal",
];

pub fn substances_ddl() -> String {
    let opaque: Vec<String> = OPAQUE_COLUMNS
        .iter()
        .map(|col| format!("{col} TEXT"))
        .collect();
    format!(
        "CREATE TABLE substances (
            substance_id INTEGER PRIMARY KEY,
            substance_name TEXT NOT NULL,
            as_cas_number TEXT,
            substance_status TEXT,
            substance_category TEXT,
            remark TEXT,
            {}
        );",
        opaque.join(",\n            ")
    )
}

pub fn insert_sql() -> String {
    let columns: Vec<&str> = [
        "substance_id",
        "substance_name",
        "as_cas_number",
        "substance_status",
        "substance_category",
        "remark",
    ]
    .into_iter()
    .chain(OPAQUE_COLUMNS.iter().copied())
    .collect();
    let placeholders = vec!["?"; columns.len()].join(", ");
    format!(
        "INSERT INTO substances ({}) VALUES ({});",
        columns.join(", "),
        placeholders
    )
}

/// Render one upstream JSON value as pass-through text.
pub fn to_text(value: Option<&serde_json::Value>) -> Option<String> {
    match value? {
        serde_json::Value::Null => None,
        serde_json::Value::String(s) => {
            let s = s.trim();
            if s.is_empty() {
                None
            } else {
                Some(s.to_string())
            }
        }
        other => Some(other.to_string()),
    }
}
