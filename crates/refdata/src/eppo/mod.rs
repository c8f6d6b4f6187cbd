//! EPPO code provider: plant/organism codes with multilingual names,
//! ingested from the upstream "XML Full" export.

pub mod build;
pub mod fetch;
pub mod store;
pub mod xml;

pub use store::{Code, Name, SearchHit, SearchResults, Store};

use crate::provider::{BuildOptions, Provider};
use crate::{EppoConfig, Error};
use std::future::Future;
use std::path::{Path, PathBuf};
use std::sync::Mutex;

pub struct Source {
    client: reqwest::Client,
    config: EppoConfig,
    /// Allow-list of the most recent build; a rebuild may replace it.
    types: Mutex<Vec<String>>,
}

impl Source {
    pub fn new(config: EppoConfig) -> Source {
        Source {
            client: reqwest::Client::new(),
            types: Mutex::new(config.types.clone()),
            config,
        }
    }

    pub fn types(&self) -> Vec<String> {
        self.types.lock().unwrap().clone()
    }
}

impl Provider for Source {
    type Store = Store;

    fn name(&self) -> &'static str {
        "eppo"
    }

    fn refresh_schedule(&self) -> &'static str {
        "0 0 2 * * Sun"
    }

    fn find_raw(&self, dir: &Path) -> Option<PathBuf> {
        let mut candidates: Vec<PathBuf> = std::fs::read_dir(dir)
            .into_iter()
            .flatten()
            .flatten()
            .map(|entry| entry.path())
            .filter(|path| {
                path.extension()
                    .and_then(|e| e.to_str())
                    .map_or(false, |e| e.eq_ignore_ascii_case("xml"))
            })
            .collect();
        candidates.sort();
        candidates.into_iter().next()
    }

    fn fetch<'a>(
        &'a self,
        dir: &'a Path,
    ) -> impl Future<Output = Result<PathBuf, Error>> + Send + 'a {
        fetch::fetch(&self.client, &self.config, dir)
    }

    fn build(&self, raw: &Path, db: &Path, options: &BuildOptions) -> Result<(), Error> {
        if let Some(types) = &options.types {
            *self.types.lock().unwrap() = types.clone();
        }
        let types = self.types();
        build::build(raw, db, &types)
    }
}
