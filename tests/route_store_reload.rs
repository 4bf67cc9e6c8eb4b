// Hot reload of the route directory through the file watcher.
#[cfg(test)]
mod test {
    use std::{
        fs,
        path::Path,
        sync::{
            Arc,
            atomic::{AtomicBool, Ordering},
        },
        time::Duration,
    };

    use routegate::{FileRouteStore, RouteStore, config::RouteTable};
    use tempfile::tempdir;

    const WAIT: Duration = Duration::from_secs(5);

    fn table(upstream: &str) -> String {
        format!(r#"{{"proxy": ["{upstream}"], "routes": [{{"match": "^/api/"}}]}}"#)
    }

    fn pool(table: &RouteTable) -> Vec<String> {
        table.proxy.clone()
    }

    /// Poll until `check` holds or the wait runs out.
    async fn eventually(mut check: impl FnMut() -> bool) -> bool {
        let deadline = tokio::time::Instant::now() + WAIT;
        while tokio::time::Instant::now() < deadline {
            if check() {
                return true;
            }
            tokio::time::sleep(Duration::from_millis(25)).await;
        }
        check()
    }

    fn write(path: &Path, contents: &str) {
        fs::write(path, contents).unwrap();
    }

    #[tokio::test(flavor = "multi_thread")]
    async fn test_create_modify_remove_are_picked_up() {
        let dir = tempdir().unwrap();
        let store = FileRouteStore::new(dir.path());
        store.watch().unwrap();

        let path = dir.path().join("orders.json");
        write(&path, &table("http://10.0.0.1:80"));
        assert!(
            eventually(|| store.get("orders").is_some()).await,
            "new file was not loaded"
        );

        write(&path, &table("http://10.0.0.2:80"));
        assert!(
            eventually(|| store
                .get("orders")
                .is_some_and(|t| pool(&t) == ["http://10.0.0.2:80"]))
            .await,
            "modified file was not reloaded"
        );

        fs::remove_file(&path).unwrap();
        assert!(
            eventually(|| store.get("orders").is_none()).await,
            "removed file is still served"
        );

        store.stop_watch();
    }

    #[tokio::test(flavor = "multi_thread")]
    async fn test_new_subdirectory_is_watched() {
        let dir = tempdir().unwrap();
        let store = FileRouteStore::new(dir.path());
        store.watch().unwrap();

        let nested = dir.path().join("team").join("billing");
        fs::create_dir_all(&nested).unwrap();
        // Give the watcher a chance to register the new directories.
        tokio::time::sleep(Duration::from_millis(200)).await;
        write(&nested.join("billing.json"), &table("http://10.0.0.3:80"));

        assert!(
            eventually(|| store.get("billing").is_some()).await,
            "table in a new subdirectory was not loaded"
        );

        fs::remove_dir_all(dir.path().join("team")).unwrap();
        assert!(
            eventually(|| store.get("billing").is_none()).await,
            "table under a removed directory is still served"
        );
        store.stop_watch();
    }

    #[tokio::test(flavor = "multi_thread")]
    async fn test_broken_edit_keeps_serving_previous_table() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("orders.json");
        write(&path, &table("http://10.0.0.1:80"));
        let store = FileRouteStore::new(dir.path());
        store.watch().unwrap();

        write(&path, "{ not json");
        // A later valid edit proves the watcher has processed the broken one.
        write(&dir.path().join("marker.json"), &table("http://10.0.0.9:80"));
        assert!(eventually(|| store.get("marker").is_some()).await);

        let current = store.get("orders").unwrap();
        assert_eq!(pool(&current), ["http://10.0.0.1:80"]);
        store.stop_watch();
    }

    #[tokio::test(flavor = "multi_thread")]
    async fn test_stopped_store_ignores_changes() {
        let dir = tempdir().unwrap();
        let store = FileRouteStore::new(dir.path());
        store.watch().unwrap();
        store.stop_watch();
        store.stop_watch();

        write(&dir.path().join("orders.json"), &table("http://10.0.0.1:80"));
        tokio::time::sleep(Duration::from_millis(300)).await;
        assert!(store.get("orders").is_none());
    }

    #[test]
    fn test_reload_is_idempotent() {
        let dir = tempdir().unwrap();
        write(&dir.path().join("orders.json"), &table("http://10.0.0.1:80"));
        let store = FileRouteStore::new(dir.path());

        let before = serde_json::to_vec(store.get("orders").unwrap().as_ref()).unwrap();
        assert_eq!(store.reload_all(), 1);
        assert_eq!(store.reload_all(), 1);
        let after = serde_json::to_vec(store.get("orders").unwrap().as_ref()).unwrap();
        assert_eq!(before, after);
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 4)]
    async fn test_readers_see_whole_tables_during_swaps() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("orders.json");
        write(&path, &table("http://10.0.0.1:80"));
        let store = Arc::new(FileRouteStore::new(dir.path()));
        let done = Arc::new(AtomicBool::new(false));

        let readers: Vec<_> = (0..4)
            .map(|_| {
                let store = store.clone();
                let done = done.clone();
                tokio::spawn(async move {
                    let mut reads = 0usize;
                    while !done.load(Ordering::Relaxed) {
                        let table = store.get("orders").expect("table vanished during swap");
                        assert_eq!(table.routes.len(), 1);
                        assert_eq!(table.proxy.len(), 1);
                        let upstream = &table.proxy[0];
                        assert!(
                            upstream == "http://10.0.0.1:80" || upstream == "http://10.0.0.2:80",
                            "unexpected upstream {upstream}"
                        );
                        reads += 1;
                        tokio::task::yield_now().await;
                    }
                    reads
                })
            })
            .collect();

        for i in 0..50 {
            let upstream = if i % 2 == 0 {
                "http://10.0.0.2:80"
            } else {
                "http://10.0.0.1:80"
            };
            // Write then rename so the store never reads a half-written file.
            let staging = dir.path().join("orders.tmp");
            write(&staging, &table(upstream));
            fs::rename(&staging, &path).unwrap();
            store.reload_all();
            tokio::task::yield_now().await;
        }
        done.store(true, Ordering::Relaxed);

        for reader in readers {
            assert!(reader.await.unwrap() > 0);
        }
    }
}
