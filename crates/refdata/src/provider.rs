use crate::Error;
use std::collections::BTreeMap;
use std::future::Future;
use std::path::{Path, PathBuf};

/// Options accepted by a rebuild. Absent options retain whatever the
/// provider used for its previous build.
#[derive(Debug, Clone, Default)]
pub struct BuildOptions {
    /// EPPO: replace the allow-list of admitted code types.
    pub types: Option<Vec<String>>,
}

/// A read-only handle onto one built database file. Immutable after
/// construction; closed when the last reference drops.
pub trait ProviderStore: Sized + Send + Sync + 'static {
    /// Open a database file read-only, verifying it was built to completion.
    fn open(path: &Path) -> Result<Self, Error>;

    /// Path of the underlying database file.
    fn path(&self) -> &Path;

    /// Dataset metadata recorded by the build (dateexport, version,
    /// builtAt, counts).
    fn meta(&self) -> Result<BTreeMap<String, String>, Error>;

    /// Row counts reported by the health endpoint.
    fn stats(&self) -> Result<serde_json::Value, Error>;
}

/// One upstream reference-data source: how to fetch its raw artifact and
/// how to build a database file from it. The coordinator drives these and
/// owns all mutable state.
pub trait Provider: Send + Sync + 'static {
    type Store: ProviderStore;

    /// Short name: the database file prefix, lock directory tenant, and
    /// HTTP mount point.
    fn name(&self) -> &'static str;

    /// Cron expression of the weekly refresh, evaluated in local time.
    fn refresh_schedule(&self) -> &'static str;

    /// Locate an existing raw artifact within the data directory.
    fn find_raw(&self, dir: &Path) -> Option<PathBuf>;

    /// Download the upstream artifact into the data directory, returning
    /// the path of the raw artifact written.
    fn fetch<'a>(
        &'a self,
        dir: &'a Path,
    ) -> impl Future<Output = Result<PathBuf, Error>> + Send + 'a;

    /// Build a fresh database file at `db` from the raw artifact at `raw`.
    /// Must be all-or-nothing: on error no file remains at `db`.
    fn build(&self, raw: &Path, db: &Path, options: &BuildOptions) -> Result<(), Error>;
}
