//! One-shot commands.

use super::init::{build_runtime, open_store, open_vault};
use chrono::{DateTime, Duration, Utc};
use engine_config_and_utils::{Config, Paths};
use entitlement_engine::{expiry_from_jwt, ChannelMessenger, EntitlementRuntime};
use serde_json::json;
use std::sync::Arc;
use token_storage::{AuthState, TokenRecord};

/// Lifetime assumed for an imported token that carries no expiry.
const DEFAULT_TOKEN_LIFETIME_MINS: i64 = 60;

/// Print the persisted auth state and token metadata. Reads storage only.
pub fn status(paths: &Paths) -> anyhow::Result<()> {
    let vault = open_vault(paths);
    let state = vault
        .auth_state()?
        .unwrap_or_else(AuthState::unauthenticated);
    let token = vault.token_record()?.map(|record| {
        json!({
            "expiresAt": record.expires_at,
            "refreshable": record.can_refresh(),
        })
    });

    let report = json!({ "authState": state, "token": token });
    println!("{}", serde_json::to_string_pretty(&report)?);
    Ok(())
}

/// Run one check and print the resulting state.
pub async fn check(config: Config, paths: Paths) -> anyhow::Result<()> {
    let runtime = one_shot_runtime(&config, &paths).await?;
    let state = runtime.force_check().await;
    runtime.machine().shutdown();
    print_state(&state)
}

/// Persist a session handed over by the web app and check it.
pub async fn import(
    config: Config,
    paths: Paths,
    access_token: String,
    refresh_token: Option<String>,
    expires_at: Option<DateTime<Utc>>,
) -> anyhow::Result<()> {
    let expires_at = expires_at
        .or_else(|| expiry_from_jwt(&access_token))
        .unwrap_or_else(|| Utc::now() + Duration::minutes(DEFAULT_TOKEN_LIFETIME_MINS));
    let record = TokenRecord::new(access_token, refresh_token, expires_at);

    let runtime = one_shot_runtime(&config, &paths).await?;
    let state = runtime.import_session(record).await?;
    runtime.machine().shutdown();
    print_state(&state)
}

pub async fn logout(config: Config, paths: Paths) -> anyhow::Result<()> {
    let runtime = one_shot_runtime(&config, &paths).await?;
    runtime.logout().await?;
    println!("Logged out");
    Ok(())
}

pub fn init_config(config: &Config, paths: &Paths) -> anyhow::Result<()> {
    config.save(paths)?;
    println!("Wrote {}", paths.config_file().display());
    Ok(())
}

/// A runtime that is hydrated but never starts its event loop.
async fn one_shot_runtime(config: &Config, paths: &Paths) -> anyhow::Result<EntitlementRuntime> {
    paths.ensure_dirs()?;
    let runtime = build_runtime(
        config,
        paths,
        open_store(paths),
        Arc::new(ChannelMessenger::new(1)),
    )?;
    runtime.machine().hydrate().await;
    Ok(runtime)
}

fn print_state(state: &AuthState) -> anyhow::Result<()> {
    println!("{}", serde_json::to_string_pretty(state)?);
    Ok(())
}
