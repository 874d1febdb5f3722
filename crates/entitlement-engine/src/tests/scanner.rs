//! External session recovery across tabs.

use super::harness::*;
use crate::{SessionScanner, SnapshotTabHost, TabSnapshot};
use serde_json::json;
use std::sync::Arc;

const PATTERN: &str = "https://app.example.com/*";

fn session(access: &str) -> String {
    json!({"access_token": access, "refresh_token": "rt", "expires_in": 3600}).to_string()
}

fn scanner(host: SnapshotTabHost, max_tabs: usize) -> SessionScanner {
    SessionScanner::new(Arc::new(host), PATTERN, max_tabs, Some("proj".to_string()))
}

#[tokio::test]
async fn first_tab_with_a_session_wins() {
    let host = SnapshotTabHost::from_tabs(vec![
        TabSnapshot::new(WEB_APP_URL).with_entry("theme", "dark"),
        TabSnapshot::new(WEB_APP_URL).with_entry("sb-proj-auth-token", "not json"),
        TabSnapshot::new(WEB_APP_URL).with_entry("sb-proj-auth-token", session("third")),
    ]);

    let found = scanner(host, 5).scan().await.unwrap();
    assert_eq!(found.access_token, "third");
    assert_eq!(found.refresh_token.as_deref(), Some("rt"));
}

#[tokio::test]
async fn unreadable_tab_is_skipped() {
    let host = SnapshotTabHost::empty()
        .with_unreadable_tab(WEB_APP_URL)
        .with_tab(TabSnapshot::new(WEB_APP_URL).with_entry("sb-proj-auth-token", session("ok")));

    let found = scanner(host, 5).scan().await.unwrap();
    assert_eq!(found.access_token, "ok");
}

#[tokio::test]
async fn tabs_outside_the_web_app_are_ignored() {
    let host = SnapshotTabHost::from_tabs(vec![TabSnapshot::new("https://other.example.org/")
        .with_entry("sb-proj-auth-token", session("elsewhere"))]);
    assert!(scanner(host, 5).scan().await.is_none());
}

#[tokio::test]
async fn scan_stops_at_tab_limit() {
    let mut tabs: Vec<_> = (0..5)
        .map(|i| TabSnapshot::new(format!("https://app.example.com/page/{i}")))
        .collect();
    tabs.push(TabSnapshot::new(WEB_APP_URL).with_entry("sb-proj-auth-token", session("sixth")));

    assert!(scanner(SnapshotTabHost::from_tabs(tabs.clone()), 5)
        .scan()
        .await
        .is_none());
    assert_eq!(
        scanner(SnapshotTabHost::from_tabs(tabs), 6)
            .scan()
            .await
            .map(|r| r.access_token),
        Some("sixth".to_string())
    );
}

#[tokio::test]
async fn signed_out_context_recovers_session_from_tab() {
    let h = TestHarness::with_tabs(vec![
        TabSnapshot::new(WEB_APP_URL),
        TabSnapshot::new(WEB_APP_URL).with_entry("sb-proj-auth-token", session("from-tab")),
    ]);
    h.backend.accept("from-tab");

    let state = h.machine.check().await;
    assert!(state.is_authenticated());
    assert_eq!(
        h.vault.token_record().unwrap().map(|r| r.access_token),
        Some("from-tab".to_string())
    );
}

#[tokio::test]
async fn exported_tabs_are_read_from_disk() {
    let dir = tempfile::tempdir().unwrap();
    std::fs::write(
        dir.path().join("a.json"),
        json!({"url": WEB_APP_URL, "storage": {"theme": "dark"}}).to_string(),
    )
    .unwrap();
    std::fs::write(
        dir.path().join("b.json"),
        json!({
            "url": WEB_APP_URL,
            "storage": {"sb-proj-auth-token": {"access_token": "disk", "expires_in": 3600}}
        })
        .to_string(),
    )
    .unwrap();
    std::fs::write(dir.path().join("notes.txt"), "ignored").unwrap();

    let found = scanner(SnapshotTabHost::from_dir(dir.path()), 5)
        .scan()
        .await
        .unwrap();
    assert_eq!(found.access_token, "disk");
}
