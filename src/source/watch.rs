//! Change notifications.
//!
//! Both watchers turn outside changes into [`Change`] values on one channel
//! read by the reconciler.

use super::Change;
use crate::error::WatchError;
use base64::{Engine as _, engine::general_purpose::STANDARD};
use notify::{Event, EventKind, RecommendedWatcher, RecursiveMode, Watcher as _};
use serde::Deserialize;
use std::{
    collections::HashSet,
    ffi::OsString,
    path::{Path, PathBuf},
    time::Duration,
};
use tokio::{sync::mpsc, task::JoinHandle};
use tracing::{debug, info, warn};
use url::Url;

/// Quiet time after a filesystem event before a reload is requested.
pub const DEBOUNCE: Duration = Duration::from_secs(1);

/// Pause after a failed KV request.
pub const KV_BACKOFF: Duration = Duration::from_secs(5);

/// Server-side wait of one KV long poll.
pub const KV_WAIT: &str = "5m";

const KV_CLIENT_TIMEOUT: Duration = Duration::from_secs(6 * 60);

/// Watches the directories holding the configuration files.
///
/// Parent directories are watched rather than the files so that atomic
/// replaces and symlink swaps (Kubernetes `ConfigMap` updates) are seen.
pub struct FileWatcher {
    _watcher: RecommendedWatcher,
    debounce: JoinHandle<()>,
}

impl FileWatcher {
    /// Start watching `files`, sending [`Change::Reload`] on `changes`.
    ///
    /// # Errors
    ///
    /// Returns [`WatchError::Notify`] if a directory cannot be watched.
    pub fn spawn(files: &[PathBuf], changes: mpsc::Sender<Change>) -> Result<Self, WatchError> {
        let names: HashSet<OsString> = files
            .iter()
            .filter_map(|f| f.file_name().map(ToOwned::to_owned))
            .collect();

        let (raw_tx, raw_rx) = mpsc::unbounded_channel();

        let mut watcher = notify::recommended_watcher(move |res: notify::Result<Event>| match res {
            Ok(event) if is_relevant(&event, &names) => {
                let _ = raw_tx.send(());
            }
            Ok(_) => {}
            Err(e) => warn!(error = %e, "file watch error"),
        })?;

        let dirs: HashSet<&Path> = files.iter().map(|f| parent_dir(f)).collect();
        for dir in dirs {
            watcher.watch(dir, RecursiveMode::NonRecursive)?;
            info!(dir = %dir.display(), "watching for configuration changes");
        }

        Ok(Self {
            _watcher: watcher,
            debounce: tokio::spawn(debounce(raw_rx, changes)),
        })
    }
}

impl Drop for FileWatcher {
    fn drop(&mut self) {
        self.debounce.abort();
    }
}

fn parent_dir(file: &Path) -> &Path {
    match file.parent() {
        Some(dir) if !dir.as_os_str().is_empty() => dir,
        _ => Path::new("."),
    }
}

fn is_relevant(event: &Event, names: &HashSet<OsString>) -> bool {
    if matches!(event.kind, EventKind::Access(_)) {
        return false;
    }

    event.paths.iter().any(|path| {
        path.file_name().is_some_and(|name| {
            names.contains(name) || name.to_string_lossy().starts_with("..")
        })
    })
}

/// Collapse bursts of raw events into one reload.
async fn debounce(mut raw: mpsc::UnboundedReceiver<()>, changes: mpsc::Sender<Change>) {
    while raw.recv().await.is_some() {
        tokio::time::sleep(DEBOUNCE).await;
        while raw.try_recv().is_ok() {}

        debug!("configuration files changed");
        if changes.send(Change::Reload).await.is_err() {
            break;
        }
    }
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "PascalCase")]
struct KvEntry {
    value: Option<String>,
}

/// Long-polls a Consul-compatible KV key holding the query catalogue.
#[derive(Clone, Debug)]
pub struct ConsulWatcher {
    client: reqwest::Client,
    url: Url,
    index: u64,
    /// Whether the last response carried `X-Consul-Index`. Without it the
    /// server does not block and the value is compared instead.
    indexed: bool,
    last: Option<String>,
}

impl ConsulWatcher {
    /// # Errors
    ///
    /// Returns an error if the address is not a valid URL or the HTTP client
    /// cannot be built.
    pub fn new(addr: &str, key: &str) -> Result<Self, WatchError> {
        let url = Url::parse(addr)?.join(&format!("v1/kv/{}", key.trim_start_matches('/')))?;

        Ok(Self {
            client: reqwest::Client::builder()
                .timeout(KV_CLIENT_TIMEOUT)
                .build()?,
            url,
            index: 0,
            indexed: true,
            last: None,
        })
    }

    #[must_use]
    pub const fn index(&self) -> u64 {
        self.index
    }

    /// One blocking read. Returns the decoded value when the key changed.
    ///
    /// # Errors
    ///
    /// Returns a [`WatchError`] on transport failure, an unexpected status or
    /// an undecodable value.
    pub async fn poll(&mut self) -> Result<Option<String>, WatchError> {
        let mut url = self.url.clone();
        url.query_pairs_mut()
            .append_pair("index", &self.index.to_string())
            .append_pair("wait", KV_WAIT);

        let response = self.client.get(url).send().await?;

        let index = response
            .headers()
            .get("X-Consul-Index")
            .and_then(|v| v.to_str().ok())
            .and_then(|v| v.parse::<u64>().ok());
        self.indexed = index.is_some();

        let status = response.status();
        if status == reqwest::StatusCode::NOT_FOUND {
            debug!(key = %self.url, "kv key does not exist");
            if let Some(index) = index {
                self.advance(index);
            }
            return Ok(None);
        }
        if !status.is_success() {
            return Err(WatchError::Status(status.as_u16()));
        }

        let entries: Vec<KvEntry> = response.json().await?;

        match index {
            Some(index) if index == self.index => return Ok(None),
            Some(index) if index < self.index => {
                info!(previous = self.index, index, "kv index went backwards, resetting");
                self.index = 0;
                return Ok(None);
            }
            Some(index) => self.index = index,
            None => {}
        }

        let value = decode(entries.into_iter().next().and_then(|e| e.value))?;
        if index.is_none() && self.last.as_ref() == Some(&value) {
            return Ok(None);
        }
        self.last = Some(value.clone());

        Ok(Some(value))
    }

    /// Pause before the next poll: after a failure, or when the server did
    /// not block because it sent no index.
    const fn backoff(&self, failed: bool) -> Option<Duration> {
        if failed || !self.indexed {
            Some(KV_BACKOFF)
        } else {
            None
        }
    }

    fn advance(&mut self, index: u64) {
        self.index = if index < self.index { 0 } else { index };
    }

    /// Poll until `changes` closes, sending every new value.
    pub async fn run(mut self, changes: mpsc::Sender<Change>) {
        loop {
            let polled = tokio::select! {
                () = changes.closed() => break,
                polled = self.poll() => polled,
            };

            match &polled {
                Ok(Some(value)) => {
                    debug!(index = self.index, "kv value changed");
                    if changes.send(Change::Catalogue(value.clone())).await.is_err() {
                        break;
                    }
                }
                Ok(None) => {}
                Err(e) => warn!(error = %e, backoff = ?KV_BACKOFF, "kv watch failed"),
            }

            if let Some(pause) = self.backoff(polled.is_err()) {
                tokio::time::sleep(pause).await;
            }
        }

        debug!("kv watch stopped");
    }
}

fn decode(value: Option<String>) -> Result<String, WatchError> {
    let Some(value) = value else {
        return Ok(String::new());
    };
    Ok(String::from_utf8(STANDARD.decode(value.trim())?)?)
}

#[cfg(test)]
mod tests {
    use super::*;
    use notify::event::{CreateKind, ModifyKind};

    fn names(list: &[&str]) -> HashSet<OsString> {
        list.iter().map(OsString::from).collect()
    }

    #[test]
    fn test_is_relevant() {
        let names = names(&["config.yaml"]);

        let event = Event::new(EventKind::Modify(ModifyKind::Any))
            .add_path(PathBuf::from("/etc/exporter/config.yaml"));
        assert!(is_relevant(&event, &names));

        let event = Event::new(EventKind::Create(CreateKind::Any))
            .add_path(PathBuf::from("/etc/exporter/..data"));
        assert!(is_relevant(&event, &names));

        let event = Event::new(EventKind::Modify(ModifyKind::Any))
            .add_path(PathBuf::from("/etc/exporter/other.yaml"));
        assert!(!is_relevant(&event, &names));

        let event = Event::new(EventKind::Access(notify::event::AccessKind::Any))
            .add_path(PathBuf::from("/etc/exporter/config.yaml"));
        assert!(!is_relevant(&event, &names));
    }

    #[test]
    fn test_parent_dir() {
        assert_eq!(parent_dir(Path::new("config.yaml")), Path::new("."));
        assert_eq!(parent_dir(Path::new("/etc/x/config.yaml")), Path::new("/etc/x"));
    }

    #[test]
    fn test_decode() {
        assert_eq!(decode(Some("LSBpZDogZGIxCg==".to_string())).expect("decode"), "- id: db1\n");
        assert_eq!(decode(None).expect("decode"), "");
        assert!(matches!(decode(Some("%%%".to_string())), Err(WatchError::Decode(_))));
    }

    #[test]
    fn test_consul_url() {
        let watcher = ConsulWatcher::new("http://127.0.0.1:8500", "/query_exporter/config")
            .expect("watcher");
        assert_eq!(
            watcher.url.as_str(),
            "http://127.0.0.1:8500/v1/kv/query_exporter/config"
        );
        assert_eq!(watcher.index(), 0);
    }

    #[test]
    fn test_advance_resets_on_backwards_index() {
        let mut watcher = ConsulWatcher::new("http://127.0.0.1:8500", "k").expect("watcher");
        watcher.advance(10);
        assert_eq!(watcher.index(), 10);
        watcher.advance(4);
        assert_eq!(watcher.index(), 0);
    }

    /// KV endpoint answering every read with one fixed entry.
    async fn serve_kv(index: Option<&'static str>) -> String {
        let app = axum::Router::new().route(
            "/v1/kv/cfg",
            axum::routing::get(move || async move {
                let mut headers = axum::http::HeaderMap::new();
                if let Some(index) = index {
                    headers.insert("X-Consul-Index", axum::http::HeaderValue::from_static(index));
                }
                (
                    headers,
                    axum::Json(serde_json::json!([{ "Value": "LSBpZDogZGIxCg==" }])),
                )
            }),
        );

        let listener = tokio::net::TcpListener::bind("127.0.0.1:0")
            .await
            .expect("bind");
        let addr = listener.local_addr().expect("local addr");
        tokio::spawn(async move { axum::serve(listener, app).await });

        format!("http://{addr}")
    }

    #[tokio::test]
    async fn test_poll_follows_index() {
        let addr = serve_kv(Some("7")).await;
        let mut watcher = ConsulWatcher::new(&addr, "cfg").expect("watcher");

        assert_eq!(watcher.poll().await.expect("poll").as_deref(), Some("- id: db1\n"));
        assert_eq!(watcher.index(), 7);
        assert_eq!(watcher.backoff(false), None);

        assert_eq!(watcher.poll().await.expect("poll"), None);
        assert_eq!(watcher.backoff(true), Some(KV_BACKOFF));
    }

    #[tokio::test]
    async fn test_poll_without_index_reports_once_and_backs_off() {
        let addr = serve_kv(None).await;
        let mut watcher = ConsulWatcher::new(&addr, "cfg").expect("watcher");

        assert_eq!(watcher.poll().await.expect("poll").as_deref(), Some("- id: db1\n"));
        assert_eq!(watcher.index(), 0);
        assert_eq!(watcher.backoff(false), Some(KV_BACKOFF));

        assert_eq!(watcher.poll().await.expect("poll"), None);
        assert_eq!(watcher.poll().await.expect("poll"), None);
        assert_eq!(watcher.backoff(false), Some(KV_BACKOFF));
    }

    #[tokio::test(start_paused = true)]
    async fn test_debounce_collapses_bursts() {
        let (raw_tx, raw_rx) = mpsc::unbounded_channel();
        let (tx, mut rx) = mpsc::channel(4);
        let task = tokio::spawn(debounce(raw_rx, tx));

        for _ in 0..5 {
            raw_tx.send(()).expect("send");
        }

        assert!(matches!(rx.recv().await, Some(Change::Reload)));
        assert!(rx.try_recv().is_err());

        drop(raw_tx);
        task.await.expect("debounce task");
    }
}
