//! Route tables loaded from a directory of `<service>.json` files.
//!
//! Each file is decoded and validated outside the lock and then swapped in
//! under a short write lock. Readers clone an `Arc` under a read lock, so a
//! lookup returns either the old table or the new one and never a mix.
//!
//! Watching uses one non-recursive watch per directory. Directory membership
//! is diffed as directories appear and disappear, so a change never triggers
//! a full tree rescan. Events are drained in delivery order by a single task.
use std::{
    collections::{HashMap, HashSet},
    fs,
    path::{Path, PathBuf},
    sync::{
        Arc, Mutex, PoisonError, RwLock,
        atomic::{AtomicU8, Ordering},
    },
};

use notify::{
    Event, EventKind, RecommendedWatcher, RecursiveMode, Watcher,
    event::{ModifyKind, RenameMode},
};
use tokio::{runtime::Handle, sync::mpsc, task::JoinHandle};
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};
use walkdir::WalkDir;

use crate::{
    config::{models::RouteTable, validation::GatewayConfigValidator},
    ports::route_store::{ConfigError, RouteStore},
};

const TABLE_EXTENSION: &str = "json";

/// Phase of the background reload task.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum WatchState {
    /// Waiting for the next filesystem event
    Idle,
    /// Applying an event to the table map
    Reloading,
}

#[derive(Debug, Clone)]
struct LoadedTable {
    table: Arc<RouteTable>,
    source: PathBuf,
}

struct StoreInner {
    root: PathBuf,
    tables: RwLock<HashMap<String, LoadedTable>>,
    state: AtomicU8,
}

struct WatchHandle {
    stop: CancellationToken,
    _task: JoinHandle<()>,
}

/// File-backed [`RouteStore`].
pub struct FileRouteStore {
    inner: Arc<StoreInner>,
    watch: Mutex<Option<WatchHandle>>,
}

impl FileRouteStore {
    /// Create a store rooted at `root` and load every table found there.
    ///
    /// A missing directory yields an empty store; it is created by
    /// [`RouteStore::watch`].
    pub fn new(root: impl Into<PathBuf>) -> Self {
        let root = normalize_root(root.into());
        let store = Self {
            inner: Arc::new(StoreInner {
                root,
                tables: RwLock::new(HashMap::new()),
                state: AtomicU8::new(WatchState::Idle as u8),
            }),
            watch: Mutex::new(None),
        };
        store.reload_all();
        store
    }

    pub fn root(&self) -> &Path {
        &self.inner.root
    }

    /// Rescan the whole directory. Tables whose file disappeared are dropped.
    /// Returns the number of tables loaded.
    pub fn reload_all(&self) -> usize {
        self.inner.reload_all()
    }

    /// Decode and validate every table file under `root` without loading
    /// anything. Returns each file with its service name or the fault.
    pub fn check_dir(root: &Path) -> Vec<(PathBuf, Result<String, ConfigError>)> {
        table_files(root)
            .into_iter()
            .filter_map(|path| {
                let service = service_name(&path)?;
                let result = read_table(&service, &path).map(|_| service);
                Some((path, result))
            })
            .collect()
    }

    pub fn watch_state(&self) -> WatchState {
        self.inner.state()
    }

    pub fn is_watching(&self) -> bool {
        self.watch
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .is_some()
    }
}

impl RouteStore for FileRouteStore {
    fn get(&self, service: &str) -> Option<Arc<RouteTable>> {
        self.inner
            .read_tables()
            .get(service)
            .map(|loaded| Arc::clone(&loaded.table))
    }

    fn get_all(&self) -> Vec<(String, Arc<RouteTable>)> {
        self.inner
            .read_tables()
            .iter()
            .map(|(service, loaded)| (service.clone(), Arc::clone(&loaded.table)))
            .collect()
    }

    fn watch(&self) -> Result<(), ConfigError> {
        let mut guard = self.watch.lock().unwrap_or_else(PoisonError::into_inner);
        if guard.is_some() {
            return Ok(());
        }

        let root = self.inner.root.clone();
        fs::create_dir_all(&root).map_err(|source| ConfigError::CreateDir {
            path: root.clone(),
            source,
        })?;
        let runtime = Handle::try_current().map_err(|_| ConfigError::NoRuntime)?;

        let (tx, rx) = mpsc::unbounded_channel();
        let watcher = notify::recommended_watcher(move |res: notify::Result<Event>| {
            // Receiver gone means the loop has stopped.
            let _ = tx.send(res);
        })?;
        let mut dirs = WatchedDirs::new(watcher);
        dirs.add_tree(&root)?;

        // Pick up anything written between construction and now.
        self.inner.reload_all();

        let stop = CancellationToken::new();
        let task = runtime.spawn(watch_loop(
            Arc::clone(&self.inner),
            dirs,
            rx,
            stop.clone(),
        ));
        info!(root = %root.display(), "Watching route directory");

        *guard = Some(WatchHandle { stop, _task: task });
        Ok(())
    }

    fn stop_watch(&self) {
        let handle = self
            .watch
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .take();
        if let Some(handle) = handle {
            handle.stop.cancel();
            info!(root = %self.inner.root.display(), "Stopped watching route directory");
        }
    }
}

impl Drop for FileRouteStore {
    fn drop(&mut self) {
        self.stop_watch();
    }
}

impl StoreInner {
    fn read_tables(&self) -> std::sync::RwLockReadGuard<'_, HashMap<String, LoadedTable>> {
        self.tables.read().unwrap_or_else(PoisonError::into_inner)
    }

    fn write_tables(&self) -> std::sync::RwLockWriteGuard<'_, HashMap<String, LoadedTable>> {
        self.tables.write().unwrap_or_else(PoisonError::into_inner)
    }

    fn state(&self) -> WatchState {
        match self.state.load(Ordering::Acquire) {
            s if s == WatchState::Reloading as u8 => WatchState::Reloading,
            _ => WatchState::Idle,
        }
    }

    fn set_state(&self, state: WatchState) {
        self.state.store(state as u8, Ordering::Release);
    }

    fn reload_all(&self) -> usize {
        if !self.root.is_dir() {
            warn!(root = %self.root.display(), "Route directory does not exist");
            return 0;
        }

        let mut seen = HashSet::new();
        for path in table_files(&self.root) {
            if self.reload_file(&path) {
                seen.insert(path);
            }
        }

        // Keep tables that failed to reload but whose file still exists.
        let mut tables = self.write_tables();
        tables.retain(|service, loaded| {
            let keep = seen.contains(&loaded.source) || loaded.source.is_file();
            if !keep {
                info!(service = %service, "Dropped route table for removed file");
            }
            keep
        });
        seen.len()
    }

    /// Load every table file under `dir`.
    fn reload_dir(&self, dir: &Path) {
        for path in table_files(dir) {
            self.reload_file(&path);
        }
    }

    /// Decode and swap in one table. On failure the previous table stays.
    fn reload_file(&self, path: &Path) -> bool {
        let Some(service) = service_name(path) else {
            return false;
        };

        match read_table(&service, path) {
            Ok(table) => {
                let routes = table.routes.len();
                self.write_tables().insert(
                    service.clone(),
                    LoadedTable {
                        table: Arc::new(table),
                        source: path.to_path_buf(),
                    },
                );
                info!(service = %service, path = %path.display(), routes, "Loaded route table");
                true
            }
            Err(e) => {
                error!(service = %service, error = %e, "Keeping previous route table");
                false
            }
        }
    }

    /// Drop every table whose file is `path` or lives under it.
    fn remove_path(&self, path: &Path) {
        let mut tables = self.write_tables();
        tables.retain(|service, loaded| {
            let removed = loaded.source.starts_with(path);
            if removed {
                info!(service = %service, path = %loaded.source.display(), "Removed route table");
            }
            !removed
        });
    }

    fn on_created(&self, dirs: &mut WatchedDirs, path: &Path) {
        if path.is_dir() {
            if let Err(e) = dirs.add_tree(path) {
                warn!(path = %path.display(), error = %e, "Failed to watch new directory");
            }
            self.reload_dir(path);
        } else {
            self.reload_file(path);
        }
    }

    fn on_removed(&self, dirs: &mut WatchedDirs, path: &Path) {
        dirs.forget_tree(path);
        self.remove_path(path);
    }

    fn apply_event(&self, dirs: &mut WatchedDirs, event: Event) {
        debug!(kind = ?event.kind, paths = ?event.paths, "Route directory event");
        match event.kind {
            EventKind::Create(_) => {
                for path in &event.paths {
                    self.on_created(dirs, path);
                }
            }
            EventKind::Modify(ModifyKind::Metadata(_)) => {}
            EventKind::Modify(ModifyKind::Name(RenameMode::From)) => {
                for path in &event.paths {
                    self.on_removed(dirs, path);
                }
            }
            EventKind::Modify(ModifyKind::Name(RenameMode::Both)) => {
                if let [from, to] = event.paths.as_slice() {
                    self.on_removed(dirs, from);
                    self.on_created(dirs, to);
                }
            }
            EventKind::Modify(ModifyKind::Name(_)) => {
                for path in &event.paths {
                    if path.exists() {
                        self.on_created(dirs, path);
                    } else {
                        self.on_removed(dirs, path);
                    }
                }
            }
            EventKind::Modify(_) => {
                for path in &event.paths {
                    if path.is_file() {
                        self.reload_file(path);
                    }
                }
            }
            EventKind::Remove(_) => {
                for path in &event.paths {
                    self.on_removed(dirs, path);
                }
            }
            EventKind::Access(_) | EventKind::Any | EventKind::Other => {}
        }
    }
}

async fn watch_loop(
    inner: Arc<StoreInner>,
    mut dirs: WatchedDirs,
    mut events: mpsc::UnboundedReceiver<notify::Result<Event>>,
    stop: CancellationToken,
) {
    loop {
        let event = tokio::select! {
            biased;
            _ = stop.cancelled() => break,
            event = events.recv() => match event {
                Some(event) => event,
                None => break,
            },
        };

        match event {
            Ok(event) => {
                inner.set_state(WatchState::Reloading);
                inner.apply_event(&mut dirs, event);
                inner.set_state(WatchState::Idle);
            }
            Err(e) => error!(error = %e, "Route directory watch error"),
        }
    }
    debug!(root = %inner.root.display(), "Route watch loop exited");
}

/// The set of directories currently registered with the watcher.
struct WatchedDirs {
    watcher: RecommendedWatcher,
    dirs: HashSet<PathBuf>,
}

impl WatchedDirs {
    fn new(watcher: RecommendedWatcher) -> Self {
        Self {
            watcher,
            dirs: HashSet::new(),
        }
    }

    /// Watch `root` and every directory below it not yet watched.
    fn add_tree(&mut self, root: &Path) -> notify::Result<()> {
        for entry in WalkDir::new(root).into_iter().filter_map(Result::ok) {
            if !entry.file_type().is_dir() || self.dirs.contains(entry.path()) {
                continue;
            }
            self.watcher
                .watch(entry.path(), RecursiveMode::NonRecursive)?;
            debug!(dir = %entry.path().display(), "Watching directory");
            self.dirs.insert(entry.into_path());
        }
        Ok(())
    }

    /// Forget `root` and everything below it.
    fn forget_tree(&mut self, root: &Path) {
        let gone: Vec<PathBuf> = self
            .dirs
            .iter()
            .filter(|dir| dir.starts_with(root))
            .cloned()
            .collect();
        for dir in gone {
            // The directory is usually already gone along with its watch.
            let _ = self.watcher.unwatch(&dir);
            self.dirs.remove(&dir);
        }
    }
}

fn normalize_root(root: PathBuf) -> PathBuf {
    root.canonicalize()
        .or_else(|_| std::path::absolute(&root))
        .unwrap_or(root)
}

/// Service name for a table file: the stem of a `*.json` file.
fn service_name(path: &Path) -> Option<String> {
    if path.extension().and_then(|ext| ext.to_str()) != Some(TABLE_EXTENSION) {
        return None;
    }
    path.file_stem()
        .and_then(|stem| stem.to_str())
        .filter(|stem| !stem.is_empty() && !stem.starts_with('.'))
        .map(str::to_string)
}

fn table_files(dir: &Path) -> Vec<PathBuf> {
    WalkDir::new(dir)
        .into_iter()
        .filter_map(Result::ok)
        .filter(|entry| entry.file_type().is_file() && service_name(entry.path()).is_some())
        .map(walkdir::DirEntry::into_path)
        .collect()
}

fn read_table(service: &str, path: &Path) -> Result<RouteTable, ConfigError> {
    let bytes = fs::read(path).map_err(|source| ConfigError::Io {
        path: path.to_path_buf(),
        source,
    })?;
    let table = RouteTable::from_json(&bytes).map_err(|source| ConfigError::Decode {
        path: path.to_path_buf(),
        source,
    })?;
    GatewayConfigValidator::validate_route_table(service, &table).map_err(|e| {
        ConfigError::Invalid {
            path: path.to_path_buf(),
            message: e.to_string(),
        }
    })?;
    Ok(table)
}

#[cfg(test)]
mod tests {
    use tempfile::tempdir;

    use super::*;

    const TABLE: &str = r#"{"proxy": ["http://127.0.0.1:9000"], "routes": [{"match": "^/api/"}]}"#;

    #[test]
    fn test_loads_json_tables_by_stem() {
        let dir = tempdir().unwrap();
        fs::write(dir.path().join("orders.json"), TABLE).unwrap();
        fs::create_dir(dir.path().join("nested")).unwrap();
        fs::write(dir.path().join("nested/billing.json"), TABLE).unwrap();
        fs::write(dir.path().join("notes.txt"), "ignored").unwrap();

        let store = FileRouteStore::new(dir.path());

        assert!(store.get("orders").is_some());
        assert!(store.get("billing").is_some());
        assert!(store.get("notes").is_none());
        assert_eq!(store.get_all().len(), 2);
    }

    #[test]
    fn test_bad_file_keeps_previous_table() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("orders.json");
        fs::write(&path, TABLE).unwrap();
        let store = FileRouteStore::new(dir.path());
        let before = store.get("orders").unwrap();

        fs::write(&path, r#"{"routes": [{"match": "^/api/(", "proxy": ["http://a:1"]}]}"#)
            .unwrap();
        assert_eq!(store.reload_all(), 0);

        let after = store.get("orders").unwrap();
        assert!(Arc::ptr_eq(&before, &after));
    }

    #[test]
    fn test_invalid_table_is_not_loaded() {
        let dir = tempdir().unwrap();
        fs::write(dir.path().join("orders.json"), r#"{"routes": [{"match": "^/"}]}"#).unwrap();

        let store = FileRouteStore::new(dir.path());
        assert!(store.get("orders").is_none());
    }

    #[test]
    fn test_reload_all_drops_removed_files() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("orders.json");
        fs::write(&path, TABLE).unwrap();
        let store = FileRouteStore::new(dir.path());

        fs::remove_file(&path).unwrap();
        store.reload_all();
        assert!(store.get("orders").is_none());
    }

    #[test]
    fn test_missing_root_is_empty() {
        let dir = tempdir().unwrap();
        let store = FileRouteStore::new(dir.path().join("absent"));
        assert!(store.get_all().is_empty());
        assert_eq!(store.watch_state(), WatchState::Idle);
    }

    #[test]
    fn test_watch_requires_runtime() {
        let dir = tempdir().unwrap();
        let store = FileRouteStore::new(dir.path());
        assert!(matches!(store.watch(), Err(ConfigError::NoRuntime)));
        assert!(!store.is_watching());
    }

    #[tokio::test]
    async fn test_watch_creates_root_and_stop_is_idempotent() {
        let dir = tempdir().unwrap();
        let root = dir.path().join("routes");
        let store = FileRouteStore::new(&root);

        store.watch().unwrap();
        assert!(root.is_dir());
        assert!(store.is_watching());
        // Second start is a no-op.
        store.watch().unwrap();

        store.stop_watch();
        store.stop_watch();
        assert!(!store.is_watching());
    }

    #[test]
    fn test_watch_fails_when_root_cannot_be_created() {
        let dir = tempdir().unwrap();
        let blocker = dir.path().join("file");
        fs::write(&blocker, "x").unwrap();

        let store = FileRouteStore::new(blocker.join("routes"));
        assert!(matches!(store.watch(), Err(ConfigError::CreateDir { .. })));
    }

    #[test]
    fn test_check_dir_reports_each_file() {
        let dir = tempdir().unwrap();
        fs::write(dir.path().join("orders.json"), TABLE).unwrap();
        fs::write(dir.path().join("billing.json"), "{ broken").unwrap();

        let mut report = FileRouteStore::check_dir(dir.path());
        report.sort_by(|a, b| a.0.cmp(&b.0));

        assert_eq!(report.len(), 2);
        assert!(matches!(report[0].1, Err(ConfigError::Decode { .. })));
        assert_eq!(report[1].1.as_deref().ok(), Some("orders"));
    }

    #[test]
    fn test_service_name() {
        assert_eq!(
            service_name(Path::new("/r/orders.json")),
            Some("orders".to_string())
        );
        assert_eq!(service_name(Path::new("/r/orders.yaml")), None);
        assert_eq!(service_name(Path::new("/r/.json")), None);
        assert_eq!(service_name(Path::new("/r/orders")), None);
    }
}
