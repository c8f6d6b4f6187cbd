//! EU active-substance provider: pesticide active-substance records,
//! ingested from the upstream JSON export.

pub mod build;
pub mod fetch;
pub mod fields;
pub mod store;

pub use store::{SearchResults, Store};

use crate::provider::{BuildOptions, Provider};
use crate::{Error, EuConfig};
use regex::Regex;
use std::future::Future;
use std::path::{Path, PathBuf};

lazy_static::lazy_static! {
    /// Upstream-documented CAS number format.
    static ref CAS: Regex = Regex::new(r"\d{2,7}-\d{2}-\d").unwrap();
    static ref CAS_EXACT: Regex = Regex::new(r"^\d{2,7}-\d{2}-\d$").unwrap();
}

/// Whether `s` is exactly one canonical CAS number.
pub fn is_cas(s: &str) -> bool {
    CAS_EXACT.is_match(s)
}

/// First CAS-shaped token within free text, if any.
pub fn find_cas(s: &str) -> Option<&str> {
    CAS.find(s).map(|m| m.as_str())
}

pub struct Source {
    client: reqwest::Client,
    config: EuConfig,
}

impl Source {
    pub fn new(config: EuConfig) -> Source {
        Source {
            client: reqwest::Client::new(),
            config,
        }
    }
}

impl Provider for Source {
    type Store = Store;

    fn name(&self) -> &'static str {
        "eu"
    }

    fn refresh_schedule(&self) -> &'static str {
        "0 0 3 * * Sun"
    }

    fn find_raw(&self, dir: &Path) -> Option<PathBuf> {
        let path = dir.join(fetch::RAW_NAME);
        path.is_file().then_some(path)
    }

    fn fetch<'a>(
        &'a self,
        dir: &'a Path,
    ) -> impl Future<Output = Result<PathBuf, Error>> + Send + 'a {
        fetch::fetch(&self.client, &self.config, dir)
    }

    fn build(&self, raw: &Path, db: &Path, _options: &BuildOptions) -> Result<(), Error> {
        build::build(raw, db)
    }
}
