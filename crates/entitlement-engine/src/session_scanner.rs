//! Best-effort recovery of a session from an external web app tab.
//!
//! When a process has no usable credential and is signed out, the scanner
//! looks at tabs of the web app and tries to lift the session the app keeps
//! in local storage. Several storage layouts have been used over time, so
//! each snapshot is tried against every known [`SessionLayout`] in priority
//! order. A layout that does not match is a `None`, never an error.

use crate::jwt::{expiry_after, expiry_from_jwt, looks_like_jwt};
use crate::tabs::{TabHost, TabSnapshot};
use chrono::{DateTime, Duration, Utc};
use engine_config_and_utils::Config;
use serde_json::{Map, Value};
use std::sync::Arc;
use token_storage::TokenRecord;
use tracing::{debug, info};

/// Lifetime assumed for a session that carries no expiry at all.
const ASSUMED_LIFETIME_SECS: i64 = 3600;

/// Storage key used by older releases of the web app.
const LEGACY_WRAPPED_KEY: &str = "supabase.auth.token";

/// Timestamps above this are milliseconds, not seconds.
const MILLIS_THRESHOLD: i64 = 100_000_000_000;

/// Inputs shared by every layout parser.
#[derive(Debug, Clone)]
pub struct ScanContext {
    pub project_ref: Option<String>,
    pub now: DateTime<Utc>,
}

impl ScanContext {
    pub fn new(project_ref: Option<String>) -> Self {
        Self {
            project_ref,
            now: Utc::now(),
        }
    }
}

/// Known local storage encodings of a session, highest priority first.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SessionLayout {
    /// `sb-<project_ref>-auth-token` holding the session object.
    ProjectKeyed,
    /// A session wrapped together with its user, under the legacy key or any
    /// `sb-*-auth-token` key.
    UserWrapped,
    /// Flat `access_token` / `refresh_token` / `expires_at` keys.
    LegacyGenericKeys,
    /// Any key mentioning auth, token or session holding a session or a JWT.
    Heuristic,
}

impl SessionLayout {
    /// All layouts in the order they are tried.
    pub const PRIORITY: [SessionLayout; 4] = [
        SessionLayout::ProjectKeyed,
        SessionLayout::UserWrapped,
        SessionLayout::LegacyGenericKeys,
        SessionLayout::Heuristic,
    ];

    pub fn as_str(&self) -> &'static str {
        match self {
            SessionLayout::ProjectKeyed => "project_keyed",
            SessionLayout::UserWrapped => "user_wrapped",
            SessionLayout::LegacyGenericKeys => "legacy_generic_keys",
            SessionLayout::Heuristic => "heuristic",
        }
    }

    /// Try to read a session from `snapshot` using this layout.
    pub fn parse(&self, snapshot: &TabSnapshot, ctx: &ScanContext) -> Option<TokenRecord> {
        match self {
            SessionLayout::ProjectKeyed => parse_project_keyed(snapshot, ctx),
            SessionLayout::UserWrapped => parse_user_wrapped(snapshot, ctx),
            SessionLayout::LegacyGenericKeys => parse_legacy_generic_keys(snapshot, ctx),
            SessionLayout::Heuristic => parse_heuristic(snapshot, ctx),
        }
    }
}

/// First session found in `snapshot`, with the layout that matched.
pub fn extract_session(
    snapshot: &TabSnapshot,
    ctx: &ScanContext,
) -> Option<(SessionLayout, TokenRecord)> {
    SessionLayout::PRIORITY
        .iter()
        .find_map(|layout| layout.parse(snapshot, ctx).map(|record| (*layout, record)))
}

// ==========================================
// Layout parsers
// ==========================================

fn parse_project_keyed(snapshot: &TabSnapshot, ctx: &ScanContext) -> Option<TokenRecord> {
    let project_ref = ctx.project_ref.as_deref()?;
    let raw = snapshot.get(&format!("sb-{project_ref}-auth-token"))?;
    let value: Value = serde_json::from_str(raw).ok()?;
    session_from_object(value.as_object()?, ctx.now)
}

fn parse_user_wrapped(snapshot: &TabSnapshot, ctx: &ScanContext) -> Option<TokenRecord> {
    let mut keys: Vec<&str> = snapshot
        .sorted_keys()
        .into_iter()
        .filter(|key| is_sb_auth_key(key))
        .collect();
    keys.insert(0, LEGACY_WRAPPED_KEY);

    keys.into_iter().find_map(|key| {
        let value: Value = serde_json::from_str(snapshot.get(key)?).ok()?;
        let wrapper = value.as_object()?;
        if let Some(session) = wrapper.get("currentSession").and_then(Value::as_object) {
            return session_from_object(session, ctx.now);
        }
        if wrapper.contains_key("user") {
            let session = wrapper.get("session").and_then(Value::as_object)?;
            return session_from_object(session, ctx.now);
        }
        None
    })
}

fn parse_legacy_generic_keys(snapshot: &TabSnapshot, ctx: &ScanContext) -> Option<TokenRecord> {
    let access_token = snapshot.get("access_token").and_then(unquote)?;
    if access_token.is_empty() {
        return None;
    }
    let refresh_token = snapshot.get("refresh_token").and_then(unquote);
    let expires_at = snapshot
        .get("expires_at")
        .and_then(|raw| parse_timestamp(&Value::String(unquote(raw)?)))
        .or_else(|| {
            let secs = unquote(snapshot.get("expires_in")?)?.parse::<i64>().ok()?;
            expiry_after(ctx.now, secs)
        });
    Some(finish_record(access_token, refresh_token, expires_at, ctx.now))
}

fn parse_heuristic(snapshot: &TabSnapshot, ctx: &ScanContext) -> Option<TokenRecord> {
    snapshot
        .sorted_keys()
        .into_iter()
        .filter(|key| {
            let key = key.to_ascii_lowercase();
            key.contains("auth") || key.contains("token") || key.contains("session")
        })
        .find_map(|key| {
            let raw = snapshot.get(key)?;
            match serde_json::from_str::<Value>(raw) {
                Ok(Value::Object(object)) => session_from_object(&object, ctx.now).or_else(|| {
                    object
                        .values()
                        .filter_map(Value::as_object)
                        .find_map(|nested| session_from_object(nested, ctx.now))
                }),
                Ok(Value::String(s)) if looks_like_jwt(&s) => {
                    Some(finish_record(s, None, None, ctx.now))
                }
                Ok(_) => None,
                Err(_) if looks_like_jwt(raw) => {
                    Some(finish_record(raw.trim().to_string(), None, None, ctx.now))
                }
                Err(_) => None,
            }
        })
}

// ==========================================
// Helpers
// ==========================================

fn is_sb_auth_key(key: &str) -> bool {
    key.starts_with("sb-") && key.ends_with("-auth-token") && key.len() > "sb--auth-token".len()
}

/// Read a session object in either snake_case or camelCase.
fn session_from_object(object: &Map<String, Value>, now: DateTime<Utc>) -> Option<TokenRecord> {
    let field = |snake: &str, camel: &str| object.get(snake).or_else(|| object.get(camel));

    let access_token = field("access_token", "accessToken")?.as_str()?.trim();
    if access_token.is_empty() {
        return None;
    }
    let refresh_token = field("refresh_token", "refreshToken")
        .and_then(Value::as_str)
        .map(str::to_string);
    let expires_at = field("expires_at", "expiresAt")
        .and_then(parse_timestamp)
        .or_else(|| {
            let secs = field("expires_in", "expiresIn")?.as_i64()?;
            expiry_after(now, secs)
        });
    Some(finish_record(
        access_token.to_string(),
        refresh_token,
        expires_at,
        now,
    ))
}

/// Fill in a missing expiry from the JWT claim, then from the assumed lifetime.
fn finish_record(
    access_token: String,
    refresh_token: Option<String>,
    expires_at: Option<DateTime<Utc>>,
    now: DateTime<Utc>,
) -> TokenRecord {
    let expires_at = expires_at
        .or_else(|| expiry_from_jwt(&access_token))
        .unwrap_or_else(|| now + Duration::seconds(ASSUMED_LIFETIME_SECS));
    TokenRecord::new(access_token, refresh_token, expires_at)
}

/// Seconds, milliseconds, numeric strings and RFC 3339 strings.
fn parse_timestamp(value: &Value) -> Option<DateTime<Utc>> {
    let from_number = |n: i64| {
        if n > MILLIS_THRESHOLD {
            DateTime::from_timestamp_millis(n)
        } else {
            DateTime::from_timestamp(n, 0)
        }
    };
    match value {
        Value::Number(n) => n
            .as_i64()
            .or_else(|| n.as_f64().map(|f| f as i64))
            .and_then(from_number),
        Value::String(s) => {
            let s = s.trim();
            s.parse::<i64>().ok().and_then(from_number).or_else(|| {
                DateTime::parse_from_rfc3339(s)
                    .ok()
                    .map(|dt| dt.with_timezone(&Utc))
            })
        }
        _ => None,
    }
}

/// Local storage values are sometimes JSON-encoded strings.
fn unquote(raw: &str) -> Option<String> {
    let raw = raw.trim();
    if raw.starts_with('"') {
        serde_json::from_str::<String>(raw).ok()
    } else {
        Some(raw.to_string())
    }
}

/// Scans web app tabs for an existing session.
pub struct SessionScanner {
    host: Arc<dyn TabHost>,
    url_pattern: String,
    max_tabs: usize,
    project_ref: Option<String>,
}

impl SessionScanner {
    pub fn new(
        host: Arc<dyn TabHost>,
        url_pattern: impl Into<String>,
        max_tabs: usize,
        project_ref: Option<String>,
    ) -> Self {
        Self {
            host,
            url_pattern: url_pattern.into(),
            max_tabs,
            project_ref,
        }
    }

    pub fn from_config(host: Arc<dyn TabHost>, config: &Config) -> Self {
        Self::new(
            host,
            config.bootstrap_url_pattern.clone(),
            config.max_scan_tabs,
            config.project_ref(),
        )
    }

    /// Look through at most `max_tabs` matching tabs and return the first
    /// session found. Unreadable tabs are skipped.
    pub async fn scan(&self) -> Option<TokenRecord> {
        let tabs = self.host.query_tabs(&self.url_pattern).await;
        let total = tabs.len();
        let ctx = ScanContext::new(self.project_ref.clone());

        for tab in tabs.into_iter().take(self.max_tabs) {
            let snapshot = match self.host.read_storage(&tab).await {
                Ok(snapshot) => snapshot,
                Err(e) => {
                    debug!(tab_id = %tab.id, error = %e, "Could not read tab storage");
                    continue;
                }
            };
            if let Some((layout, record)) = extract_session(&snapshot, &ctx) {
                info!(
                    tab_id = %tab.id,
                    layout = layout.as_str(),
                    expires_at = %record.expires_at,
                    "Recovered session from web app tab"
                );
                return Some(record);
            }
        }

        debug!(tabs = total, max_tabs = self.max_tabs, "No session found in web app tabs");
        None
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::jwt::encode_test_jwt;
    use serde_json::json;

    fn ctx() -> ScanContext {
        ScanContext::new(Some("proj".to_string()))
    }

    fn tab() -> TabSnapshot {
        TabSnapshot::new("https://app.example.com/")
    }

    #[test]
    fn test_project_keyed_layout() {
        let snapshot = tab().with_entry(
            "sb-proj-auth-token",
            json!({"access_token": "at", "refresh_token": "rt", "expires_at": 1_900_000_000})
                .to_string(),
        );
        let (layout, record) = extract_session(&snapshot, &ctx()).unwrap();
        assert_eq!(layout, SessionLayout::ProjectKeyed);
        assert_eq!(record.access_token, "at");
        assert_eq!(record.refresh_token.as_deref(), Some("rt"));
        assert_eq!(record.expires_at.timestamp(), 1_900_000_000);
    }

    #[test]
    fn test_project_keyed_needs_project_ref() {
        let snapshot = tab().with_entry(
            "sb-proj-auth-token",
            json!({"access_token": "at"}).to_string(),
        );
        let ctx = ScanContext::new(None);
        assert!(SessionLayout::ProjectKeyed.parse(&snapshot, &ctx).is_none());
    }

    #[test]
    fn test_user_wrapped_layouts() {
        let current = tab().with_entry(
            "supabase.auth.token",
            json!({"currentSession": {"access_token": "at1", "expires_in": 600}, "expiresAt": 1})
                .to_string(),
        );
        let record = SessionLayout::UserWrapped.parse(&current, &ctx()).unwrap();
        assert_eq!(record.access_token, "at1");

        let other_project = tab().with_entry(
            "sb-other-auth-token",
            json!({"session": {"accessToken": "at2"}, "user": {"id": "u"}}).to_string(),
        );
        let record = SessionLayout::UserWrapped.parse(&other_project, &ctx()).unwrap();
        assert_eq!(record.access_token, "at2");
    }

    #[test]
    fn test_legacy_generic_keys() {
        let snapshot = tab()
            .with_entry("access_token", "\"at\"")
            .with_entry("refresh_token", "rt")
            .with_entry("expires_at", "2030-01-01T00:00:00Z");
        let (layout, record) = extract_session(&snapshot, &ctx()).unwrap();
        assert_eq!(layout, SessionLayout::LegacyGenericKeys);
        assert_eq!(record.access_token, "at");
        assert_eq!(record.expires_at.to_rfc3339(), "2030-01-01T00:00:00+00:00");
    }

    #[test]
    fn test_heuristic_bare_jwt_uses_exp_claim() {
        let jwt = encode_test_jwt(1_950_000_000);
        let snapshot = tab().with_entry("myAppAuth", jwt.clone());
        let (layout, record) = extract_session(&snapshot, &ctx()).unwrap();
        assert_eq!(layout, SessionLayout::Heuristic);
        assert_eq!(record.access_token, jwt);
        assert_eq!(record.refresh_token, None);
        assert_eq!(record.expires_at.timestamp(), 1_950_000_000);
    }

    #[test]
    fn test_heuristic_nested_session() {
        let snapshot = tab().with_entry(
            "app-session-store",
            json!({"state": {"access_token": "nested", "expires_at": 1_900_000_000_000i64}})
                .to_string(),
        );
        let record = SessionLayout::Heuristic.parse(&snapshot, &ctx()).unwrap();
        assert_eq!(record.access_token, "nested");
        // Millisecond timestamps are recognized
        assert_eq!(record.expires_at.timestamp(), 1_900_000_000);
    }

    #[test]
    fn test_missing_expiry_assumes_one_hour() {
        let c = ctx();
        let snapshot = tab().with_entry(
            "sb-proj-auth-token",
            json!({"access_token": "opaque"}).to_string(),
        );
        let record = SessionLayout::ProjectKeyed.parse(&snapshot, &c).unwrap();
        assert_eq!(record.expires_at, c.now + Duration::hours(1));
    }

    #[test]
    fn test_out_of_range_expires_in_falls_back() {
        let c = ctx();
        let huge = tab().with_entry(
            "sb-proj-auth-token",
            json!({"access_token": "at", "expires_in": i64::MAX}).to_string(),
        );
        let (_, record) = extract_session(&huge, &c).unwrap();
        assert_eq!(record.expires_at, c.now + Duration::hours(1));

        let jwt = encode_test_jwt(1_950_000_000);
        let legacy = tab()
            .with_entry("access_token", jwt)
            .with_entry("expires_in", i64::MIN.to_string());
        let (layout, record) = extract_session(&legacy, &c).unwrap();
        assert_eq!(layout, SessionLayout::LegacyGenericKeys);
        assert_eq!(record.expires_at.timestamp(), 1_950_000_000);
    }

    #[test]
    fn test_malformed_values_are_not_sessions() {
        let snapshot = tab()
            .with_entry("sb-proj-auth-token", "{truncated")
            .with_entry("supabase.auth.token", "null")
            .with_entry("session", json!({"access_token": ""}).to_string())
            .with_entry("theme", "dark");
        assert!(extract_session(&snapshot, &ctx()).is_none());
    }

    #[test]
    fn test_priority_order() {
        let snapshot = tab()
            .with_entry("access_token", "legacy")
            .with_entry(
                "sb-proj-auth-token",
                json!({"access_token": "primary"}).to_string(),
            );
        let (layout, record) = extract_session(&snapshot, &ctx()).unwrap();
        assert_eq!(layout, SessionLayout::ProjectKeyed);
        assert_eq!(record.access_token, "primary");
    }
}
