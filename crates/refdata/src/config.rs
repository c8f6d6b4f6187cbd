use url::Url;

/// Validated configuration of the EPPO code provider. The binary is
/// responsible for loading and validating environment variables; the
/// library only ever sees a complete record.
#[derive(Debug, Clone)]
pub struct EppoConfig {
    /// URL of the upstream dataset-list endpoint.
    pub api_url: Url,
    /// API key sent as a request header on every upstream call.
    pub api_key: String,
    /// Allow-list of code types admitted into the database.
    pub types: Vec<String>,
}

/// Validated configuration of the EU active-substance provider.
#[derive(Debug, Clone)]
pub struct EuConfig {
    /// URL of the upstream substance export.
    pub url: Url,
}

/// Parse a comma-separated allow-list of code types, dropping blanks and
/// normalising to uppercase.
pub fn parse_types(types: &str) -> Vec<String> {
    types
        .split(',')
        .map(|t| t.trim().to_uppercase())
        .filter(|t| !t.is_empty())
        .collect()
}
