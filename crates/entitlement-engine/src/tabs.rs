//! Access to externally controlled browser tabs.
//!
//! The engine never talks to a browser directly. A `TabHost` enumerates tabs
//! by URL pattern and returns a snapshot of a tab's local storage. The
//! bundled `SnapshotTabHost` serves snapshots held in memory or exported as
//! JSON files into a directory.

use async_trait::async_trait;
use serde::Deserialize;
use serde_json::Value;
use std::collections::HashMap;
use std::path::PathBuf;
use thiserror::Error;
use tracing::debug;

/// Opaque reference to one tab.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct TabHandle {
    pub id: String,
    pub url: String,
}

/// Local storage of one tab at one point in time. Values are the raw strings
/// the page stored.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct TabSnapshot {
    pub url: String,
    pub entries: HashMap<String, String>,
}

impl TabSnapshot {
    pub fn new(url: impl Into<String>) -> Self {
        Self {
            url: url.into(),
            entries: HashMap::new(),
        }
    }

    /// Builder-style insert.
    pub fn with_entry(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.entries.insert(key.into(), value.into());
        self
    }

    pub fn get(&self, key: &str) -> Option<&str> {
        self.entries.get(key).map(String::as_str)
    }

    /// Keys in a stable order.
    pub fn sorted_keys(&self) -> Vec<&str> {
        let mut keys: Vec<&str> = self.entries.keys().map(String::as_str).collect();
        keys.sort_unstable();
        keys
    }
}

/// Failure to read a tab.
#[derive(Error, Debug)]
pub enum TabError {
    #[error("Tab closed: {0}")]
    Closed(String),

    #[error("Access denied to tab {0}")]
    AccessDenied(String),

    #[error("Malformed tab export: {0}")]
    Malformed(String),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
}

/// Enumeration and storage access for browser tabs.
#[async_trait]
pub trait TabHost: Send + Sync {
    /// Tabs whose URL matches `pattern` (`*` wildcards), in host order.
    async fn query_tabs(&self, pattern: &str) -> Vec<TabHandle>;

    /// Read the local storage of a tab.
    async fn read_storage(&self, tab: &TabHandle) -> Result<TabSnapshot, TabError>;
}

/// Match `url` against a pattern where `*` matches any run of characters.
/// `<all_urls>` matches everything.
pub fn url_matches(pattern: &str, url: &str) -> bool {
    if pattern == "<all_urls>" {
        return true;
    }
    let pattern = pattern.as_bytes();
    let url = url.as_bytes();

    let (mut p, mut u) = (0, 0);
    let mut star: Option<usize> = None;
    let mut resume = 0;

    while u < url.len() {
        if p < pattern.len() && pattern[p] == b'*' {
            star = Some(p);
            p += 1;
            resume = u;
        } else if p < pattern.len() && pattern[p].eq_ignore_ascii_case(&url[u]) {
            p += 1;
            u += 1;
        } else if let Some(s) = star {
            p = s + 1;
            resume += 1;
            u = resume;
        } else {
            return false;
        }
    }
    pattern[p..].iter().all(|b| *b == b'*')
}

/// On-disk export format for one tab.
#[derive(Debug, Deserialize)]
struct TabExport {
    url: String,
    #[serde(default)]
    storage: HashMap<String, Value>,
}

impl From<TabExport> for TabSnapshot {
    fn from(export: TabExport) -> Self {
        let entries = export
            .storage
            .into_iter()
            .map(|(key, value)| {
                let raw = match value {
                    Value::String(s) => s,
                    other => other.to_string(),
                };
                (key, raw)
            })
            .collect();
        TabSnapshot {
            url: export.url,
            entries,
        }
    }
}

enum Source {
    Memory(Vec<(TabHandle, Option<TabSnapshot>)>),
    Directory(PathBuf),
}

/// `TabHost` backed by captured snapshots.
pub struct SnapshotTabHost {
    source: Source,
}

impl SnapshotTabHost {
    /// Serve the given snapshots, one tab each, in order.
    pub fn from_tabs(snapshots: Vec<TabSnapshot>) -> Self {
        snapshots
            .into_iter()
            .fold(Self::memory(), |host, snapshot| host.with_tab(snapshot))
    }

    fn memory() -> Self {
        Self {
            source: Source::Memory(Vec::new()),
        }
    }

    /// Add a readable tab after the existing ones.
    pub fn with_tab(self, snapshot: TabSnapshot) -> Self {
        let url = snapshot.url.clone();
        self.push_tab(url, Some(snapshot))
    }

    fn push_tab(mut self, url: String, snapshot: Option<TabSnapshot>) -> Self {
        if let Source::Memory(tabs) = &mut self.source {
            let handle = TabHandle {
                id: format!("tab-{}", tabs.len() + 1),
                url,
            };
            tabs.push((handle, snapshot));
        }
        self
    }

    /// No tabs at all.
    pub fn empty() -> Self {
        Self::from_tabs(Vec::new())
    }

    /// Add a tab that is listed but cannot be read.
    pub fn with_unreadable_tab(self, url: impl Into<String>) -> Self {
        self.push_tab(url.into(), None)
    }

    /// Serve `*.json` exports from `dir`. The directory is re-read on every
    /// query, so exports dropped in while running are picked up.
    pub fn from_dir(dir: impl Into<PathBuf>) -> Self {
        Self {
            source: Source::Directory(dir.into()),
        }
    }

    async fn read_export(path: &std::path::Path) -> Result<TabSnapshot, TabError> {
        let content = tokio::fs::read_to_string(path)
            .await
            .map_err(|e| export_read_error(path, e))?;
        let export: TabExport = serde_json::from_str(&content)
            .map_err(|e| TabError::Malformed(format!("{}: {}", path.display(), e)))?;
        Ok(export.into())
    }

    async fn list_exports(dir: &std::path::Path) -> Vec<PathBuf> {
        let mut files = Vec::new();
        let Ok(mut entries) = tokio::fs::read_dir(dir).await else {
            return files;
        };
        while let Ok(Some(entry)) = entries.next_entry().await {
            let path = entry.path();
            if path.extension().is_some_and(|ext| ext == "json") {
                files.push(path);
            }
        }
        files.sort();
        files
    }
}

/// A vanished export is a closed tab; an unreadable one is access denied.
fn export_read_error(path: &std::path::Path, e: std::io::Error) -> TabError {
    match e.kind() {
        std::io::ErrorKind::NotFound => TabError::Closed(path.display().to_string()),
        std::io::ErrorKind::PermissionDenied => TabError::AccessDenied(path.display().to_string()),
        _ => TabError::Io(e),
    }
}

#[async_trait]
impl TabHost for SnapshotTabHost {
    async fn query_tabs(&self, pattern: &str) -> Vec<TabHandle> {
        match &self.source {
            Source::Memory(tabs) => tabs
                .iter()
                .filter(|(handle, _)| url_matches(pattern, &handle.url))
                .map(|(handle, _)| handle.clone())
                .collect(),
            Source::Directory(dir) => {
                let mut handles = Vec::new();
                for path in Self::list_exports(dir).await {
                    match Self::read_export(&path).await {
                        Ok(snapshot) if url_matches(pattern, &snapshot.url) => {
                            handles.push(TabHandle {
                                id: path.to_string_lossy().into_owned(),
                                url: snapshot.url,
                            });
                        }
                        Ok(_) => {}
                        Err(e) => debug!(path = %path.display(), error = %e, "Skipping tab export"),
                    }
                }
                handles
            }
        }
    }

    async fn read_storage(&self, tab: &TabHandle) -> Result<TabSnapshot, TabError> {
        match &self.source {
            Source::Memory(tabs) => tabs
                .iter()
                .find(|(handle, _)| handle.id == tab.id)
                .and_then(|(_, snapshot)| snapshot.clone())
                .ok_or_else(|| TabError::Closed(tab.id.clone())),
            Source::Directory(_) => Self::read_export(std::path::Path::new(&tab.id)).await,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::tempdir;

    #[test]
    fn test_url_matches() {
        assert!(url_matches("https://app.example.com/*", "https://app.example.com/"));
        assert!(url_matches("https://app.example.com/*", "https://app.example.com/a/b?c=d"));
        assert!(url_matches("https://*.example.com/*", "https://www.example.com/x"));
        assert!(url_matches("https://app.example.com/billing*", "https://APP.example.com/billing/plans"));
        assert!(!url_matches("https://app.example.com/*", "https://evil.com/?https://app.example.com/"));
        assert!(!url_matches("https://app.example.com/billing*", "https://app.example.com/"));
        assert!(url_matches("<all_urls>", "about:blank"));
    }

    #[tokio::test]
    async fn test_memory_host_filters_and_reads() {
        let host = SnapshotTabHost::from_tabs(vec![
            TabSnapshot::new("https://app.example.com/home").with_entry("k", "v"),
            TabSnapshot::new("https://other.com/"),
        ])
        .with_unreadable_tab("https://app.example.com/closed");

        let tabs = host.query_tabs("https://app.example.com/*").await;
        assert_eq!(tabs.len(), 2);

        let snapshot = host.read_storage(&tabs[0]).await.unwrap();
        assert_eq!(snapshot.get("k"), Some("v"));
        assert!(matches!(host.read_storage(&tabs[1]).await, Err(TabError::Closed(_))));
    }

    #[tokio::test]
    async fn test_directory_host() {
        let dir = tempdir().unwrap();
        std::fs::write(
            dir.path().join("01.json"),
            r#"{"url":"https://app.example.com/","storage":{"session":{"access_token":"x"},"plain":"y"}}"#,
        )
        .unwrap();
        std::fs::write(dir.path().join("02.json"), "{not json").unwrap();
        std::fs::write(dir.path().join("notes.txt"), "ignored").unwrap();

        let host = SnapshotTabHost::from_dir(dir.path());
        let tabs = host.query_tabs("https://app.example.com/*").await;
        assert_eq!(tabs.len(), 1);

        let snapshot = host.read_storage(&tabs[0]).await.unwrap();
        assert_eq!(snapshot.get("plain"), Some("y"));
        // Object values are kept as their JSON text
        assert_eq!(snapshot.get("session"), Some(r#"{"access_token":"x"}"#));
    }

    #[tokio::test]
    async fn test_export_removed_after_query_reads_as_closed() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("01.json");
        std::fs::write(&path, r#"{"url":"https://app.example.com/","storage":{}}"#).unwrap();

        let host = SnapshotTabHost::from_dir(dir.path());
        let tabs = host.query_tabs("https://app.example.com/*").await;
        std::fs::remove_file(&path).unwrap();

        assert!(matches!(host.read_storage(&tabs[0]).await, Err(TabError::Closed(_))));
    }

    #[test]
    fn test_export_read_error_kinds() {
        let path = std::path::Path::new("/tabs/01.json");
        let denied = std::io::Error::from(std::io::ErrorKind::PermissionDenied);
        assert!(matches!(export_read_error(path, denied), TabError::AccessDenied(p) if p == "/tabs/01.json"));

        let other = std::io::Error::from(std::io::ErrorKind::InvalidData);
        assert!(matches!(export_read_error(path, other), TabError::Io(_)));
    }

    #[tokio::test]
    async fn test_missing_directory_has_no_tabs() {
        let host = SnapshotTabHost::from_dir("/nonexistent/entitlement-sync/tabs");
        assert!(host.query_tabs("<all_urls>").await.is_empty());
    }
}
