use crate::lock::LockFile;
use crate::provider::{BuildOptions, Provider, ProviderStore};
use crate::Error;
use chrono::Utc;
use std::collections::BTreeMap;
use std::path::PathBuf;
use std::sync::{Arc, Mutex, RwLock};

/// Grace period between a swap and the garbage-collection pass which
/// deletes superseded database files. Readers are short-lived HTTP
/// handlers, so one second is ample drain time.
const GC_GRACE: std::time::Duration = std::time::Duration::from_secs(1);

/// Per-provider lifecycle owner. The coordinator is the only component
/// that publishes a store or sets the fetching/building flags; queries
/// take a snapshot `Arc` of the live store and never block on an
/// in-flight fetch or build.
///
/// Cheap to clone; clones share one provider state.
pub struct Coordinator<P: Provider>(Arc<Inner<P>>);

impl<P: Provider> Clone for Coordinator<P> {
    fn clone(&self) -> Self {
        Coordinator(self.0.clone())
    }
}

struct Inner<P: Provider> {
    provider: P,
    dir: PathBuf,
    schedule: cron::Schedule,
    state: Mutex<Flags>,
    store: RwLock<Option<Arc<P::Store>>>,
}

#[derive(Debug, Default)]
struct Flags {
    fetching: bool,
    building: bool,
    last_fetch: Option<chrono::DateTime<Utc>>,
    current_raw: Option<PathBuf>,
}

impl<P: Provider> Coordinator<P> {
    pub fn new(provider: P, dir: PathBuf) -> Result<Self, Error> {
        let schedule = provider
            .refresh_schedule()
            .parse::<cron::Schedule>()
            .map_err(|err| Error::Internal(format!("invalid refresh schedule: {err}")))?;

        Ok(Coordinator(Arc::new(Inner {
            provider,
            dir,
            schedule,
            state: Mutex::new(Flags::default()),
            store: RwLock::new(None),
        })))
    }

    pub fn provider(&self) -> &P {
        &self.0.provider
    }

    /// Snapshot of the live store, or NotReady with the current flags.
    pub fn store(&self) -> Result<Arc<P::Store>, Error> {
        match self.0.store.read().unwrap().as_ref() {
            Some(store) => Ok(store.clone()),
            None => {
                let st = self.0.state.lock().unwrap();
                Err(Error::NotReady {
                    fetching: st.fetching,
                    building: st.building,
                })
            }
        }
    }

    /// (fetching, building) process-local flags.
    pub fn flags(&self) -> (bool, bool) {
        let st = self.0.state.lock().unwrap();
        (st.fetching, st.building)
    }

    pub fn last_fetch(&self) -> Option<chrono::DateTime<Utc>> {
        self.0.state.lock().unwrap().last_fetch
    }

    /// Bring the provider into service: adopt the newest database file if
    /// one opens cleanly, else build from an existing raw artifact, else
    /// fetch and build. Failures of the latter two leave the provider
    /// serviceable with no store; queries answer NotReady until a build
    /// succeeds.
    pub async fn initialise(&self) -> Result<(), Error> {
        if let Some(path) = self.database_files().pop() {
            let adopt = {
                let path = path.clone();
                tokio::task::spawn_blocking(move || P::Store::open(&path))
                    .await
                    .map_err(|err| Error::Internal(format!("open task panicked: {err}")))?
            };
            match adopt {
                Ok(store) => {
                    tracing::info!(
                        provider = self.0.provider.name(),
                        path = %path.display(),
                        "adopted existing database"
                    );
                    let mut st = self.0.state.lock().unwrap();
                    st.current_raw = self.0.provider.find_raw(&self.0.dir);
                    drop(st);
                    *self.0.store.write().unwrap() = Some(Arc::new(store));
                    return Ok(());
                }
                Err(err) => {
                    tracing::warn!(
                        provider = self.0.provider.name(),
                        path = %path.display(),
                        %err,
                        "existing database failed to open; rebuilding"
                    );
                }
            }
        }

        let result = if self.0.provider.find_raw(&self.0.dir).is_some() {
            self.rebuild(BuildOptions::default()).await.map(|_| ())
        } else {
            self.fetch().await.map(|_| ())
        };

        if let Err(err) = result {
            tracing::warn!(
                provider = self.0.provider.name(),
                %err,
                "initialisation could not produce a database; serving NotReady"
            );
        }
        Ok(())
    }

    /// Download the upstream artifact, then build from it. Returns the
    /// dataset metadata of the database that entered service. Idempotent
    /// under concurrent callers: a second caller observes AlreadyFetching,
    /// and a peer node's fetch observes LockedByPeer.
    pub async fn fetch(&self) -> Result<BTreeMap<String, String>, Error> {
        {
            let mut st = self.0.state.lock().unwrap();
            if st.fetching {
                return Err(Error::AlreadyFetching);
            }
            st.fetching = true;
        }

        let result = self.fetch_inner().await;
        self.0.state.lock().unwrap().fetching = false;
        result?;

        // A successful fetch transitions directly into build.
        self.rebuild(BuildOptions::default()).await
    }

    async fn fetch_inner(&self) -> Result<PathBuf, Error> {
        let _lock = LockFile::acquire(&self.0.dir, "fetch")?;

        let raw = self.0.provider.fetch(&self.0.dir).await?;
        tracing::info!(
            provider = self.0.provider.name(),
            raw = %raw.display(),
            "fetched upstream artifact"
        );

        let mut st = self.0.state.lock().unwrap();
        st.last_fetch = Some(Utc::now());
        st.current_raw = Some(raw.clone());
        Ok(raw)
    }

    /// Build a fresh database from the current raw artifact and swap it
    /// into service. Returns the new store's dataset metadata.
    pub async fn rebuild(&self, options: BuildOptions) -> Result<BTreeMap<String, String>, Error> {
        {
            let mut st = self.0.state.lock().unwrap();
            if st.building {
                return Err(Error::AlreadyRebuilding);
            }
            st.building = true;
        }

        let result = self.rebuild_inner(options).await;
        self.0.state.lock().unwrap().building = false;
        result
    }

    async fn rebuild_inner(
        &self,
        options: BuildOptions,
    ) -> Result<BTreeMap<String, String>, Error> {
        let _lock = LockFile::acquire(&self.0.dir, "rebuild")?;

        let raw = {
            let st = self.0.state.lock().unwrap();
            st.current_raw.clone()
        };
        let raw = match raw.or_else(|| self.0.provider.find_raw(&self.0.dir)) {
            Some(raw) => raw,
            None => return Err(Error::Build("no raw artifact to build from".to_string())),
        };

        let db_path = self.next_database_path();
        let (store, meta) = {
            let this = self.clone();
            let (raw, db_path) = (raw.clone(), db_path.clone());
            tokio::task::spawn_blocking(move || -> Result<_, Error> {
                this.0.provider.build(&raw, &db_path, &options)?;
                let store = P::Store::open(&db_path)?;
                let meta = store.meta()?;
                Ok((store, meta))
            })
            .await
            .map_err(|err| Error::Internal(format!("build task panicked: {err}")))??
        };

        tracing::info!(
            provider = self.0.provider.name(),
            db = %db_path.display(),
            "built database; swapping into service"
        );

        // Swap is a plain pointer assignment. In-flight queries hold their
        // own Arc of the previous store and drain safely; the replaced
        // handle closes when the last reference drops.
        *self.0.store.write().unwrap() = Some(Arc::new(store));

        {
            let mut st = self.0.state.lock().unwrap();
            st.current_raw = Some(raw);
        }
        self.spawn_gc();
        Ok(meta)
    }

    /// Database file naming: `<provider>_<epoch-millis>.db`, so the
    /// lexicographically greatest name is also the newest build.
    fn next_database_path(&self) -> PathBuf {
        let mut millis = Utc::now().timestamp_millis();
        loop {
            let path = self
                .0
                .dir
                .join(format!("{}_{}.db", self.0.provider.name(), millis));
            if !path.exists() {
                return path;
            }
            millis += 1;
        }
    }

    /// All `<provider>_<millis>.db` files in the data directory, sorted
    /// ascending by name (and so by build time).
    fn database_files(&self) -> Vec<PathBuf> {
        let prefix = format!("{}_", self.0.provider.name());
        let mut files: Vec<PathBuf> = std::fs::read_dir(&self.0.dir)
            .into_iter()
            .flatten()
            .flatten()
            .map(|entry| entry.path())
            .filter(|path| {
                let Some(name) = path.file_name().and_then(|n| n.to_str()) else {
                    return false;
                };
                name.strip_prefix(&prefix)
                    .and_then(|rest| rest.strip_suffix(".db"))
                    .map_or(false, |ts| {
                        !ts.is_empty() && ts.bytes().all(|b| b.is_ascii_digit())
                    })
            })
            .collect();
        files.sort();
        files
    }

    fn spawn_gc(&self) {
        let this = self.clone();
        tokio::spawn(async move {
            tokio::time::sleep(GC_GRACE).await;
            this.collect_garbage();
        });
    }

    /// Delete every provider database file except the live one. Files held
    /// open elsewhere are skipped silently and retried on the next swap.
    /// Returns the number of files removed.
    pub fn collect_garbage(&self) -> usize {
        let live = match self.store() {
            Ok(store) => store.path().to_owned(),
            Err(_) => return 0,
        };

        let mut removed = 0;
        for path in self.database_files() {
            if path == live {
                continue;
            }
            match std::fs::remove_file(&path) {
                Ok(()) => {
                    tracing::debug!(path = %path.display(), "removed superseded database");
                    removed += 1;
                }
                Err(_) => (),
            }
        }
        removed
    }

    /// Spawn the weekly refresh loop. Each tick is computed from the
    /// current wall clock, so ticks missed while the process was down are
    /// not replayed.
    pub fn spawn_refresh(&self) -> tokio::task::JoinHandle<()> {
        let this = self.clone();
        tokio::spawn(async move {
            loop {
                let Some(next) = this.0.schedule.upcoming(chrono::Local).next() else {
                    return;
                };
                let wait = (next - chrono::Local::now()).to_std().unwrap_or_default();
                tokio::time::sleep(wait).await;

                tracing::info!(provider = this.0.provider.name(), "weekly refresh tick");
                match this.fetch().await {
                    Ok(meta) => {
                        tracing::info!(provider = this.0.provider.name(), ?meta, "refresh complete")
                    }
                    Err(err) if err.is_sentinel() => {
                        tracing::info!(provider = this.0.provider.name(), %err, "refresh skipped")
                    }
                    Err(err) => {
                        tracing::warn!(provider = this.0.provider.name(), %err, "refresh failed")
                    }
                }
            }
        })
    }

    /// Health report: always available, regardless of store state.
    pub fn health(&self) -> serde_json::Value {
        let (fetching, building) = self.flags();
        let mut body = serde_json::json!({
            "provider": self.0.provider.name(),
            "fetching": fetching,
            "rebuilding": building,
        });
        let map = body.as_object_mut().unwrap();

        match self.store().and_then(|store| {
            let stats = store.stats()?;
            let meta = store.meta()?;
            Ok((stats, meta))
        }) {
            Ok((stats, meta)) => {
                map.insert("ok".to_string(), true.into());
                map.insert("stats".to_string(), stats);
                map.insert(
                    "meta".to_string(),
                    serde_json::to_value(meta).unwrap_or_default(),
                );
            }
            Err(err) => {
                map.insert("ok".to_string(), false.into());
                map.insert("error".to_string(), err.to_string().into());
            }
        }

        let mut files = serde_json::Map::new();
        for entry in std::fs::read_dir(&self.0.dir)
            .into_iter()
            .flatten()
            .flatten()
        {
            if let (Some(name), Ok(meta)) = (entry.file_name().to_str(), entry.metadata()) {
                if meta.is_file() {
                    files.insert(name.to_string(), meta.len().into());
                }
            }
        }
        map.insert("files".to_string(), files.into());

        if let Some(last_fetch) = self.last_fetch() {
            map.insert(
                "lastFetch".to_string(),
                last_fetch
                    .to_rfc3339_opts(chrono::SecondsFormat::Secs, true)
                    .into(),
            );
        }
        body
    }

    #[cfg(test)]
    pub(crate) fn force_building(&self, building: bool) {
        self.0.state.lock().unwrap().building = building;
    }

    #[cfg(test)]
    pub(crate) fn force_fetching(&self, fetching: bool) {
        self.0.state.lock().unwrap().fetching = fetching;
    }
}
