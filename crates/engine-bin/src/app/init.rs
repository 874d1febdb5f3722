//! Engine initialization and the long-lived run loop.

use anyhow::Context;
use engine_config_and_utils::{Config, Paths};
use entitlement_engine::{
    ChannelMessenger, EngineSettings, Envelope, EntitlementRuntime, ProcessMessenger,
    RuntimeRequest, SessionScanner, SnapshotTabHost, SupabaseAuthClient,
};
use std::sync::Arc;
use std::time::Duration;
use tokio::io::{AsyncBufReadExt, BufReader};
use tokio::sync::broadcast;
use token_storage::{FileKvStore, SessionVault};
use tracing::{debug, info, warn};

const MESSENGER_CAPACITY: usize = 64;

pub(crate) fn open_store(paths: &Paths) -> FileKvStore {
    FileKvStore::new(paths.store_file())
}

pub(crate) fn open_vault(paths: &Paths) -> SessionVault {
    SessionVault::new(Arc::new(open_store(paths)))
}

/// Wire a runtime to the file store, the tab export directory and Supabase.
pub(crate) fn build_runtime(
    config: &Config,
    paths: &Paths,
    store: FileKvStore,
    messenger: Arc<dyn ProcessMessenger>,
) -> anyhow::Result<EntitlementRuntime> {
    let backend =
        SupabaseAuthClient::from_config(config).context("Failed to create identity client")?;
    let tabs = SnapshotTabHost::from_dir(paths.tabs_dir());
    let scanner = SessionScanner::from_config(Arc::new(tabs), config);

    Ok(EntitlementRuntime::new(
        SessionVault::new(Arc::new(store)),
        Arc::new(backend),
        Some(scanner),
        messenger,
        EngineSettings::from_config(config),
    ))
}

/// Run a background context until Ctrl-C.
///
/// Published messages are printed to stdout as JSON lines. Lines read from
/// stdin queue requests: `check`, or a URL the user navigated to. The store
/// file is watched so `import` or `logout` run from another process are
/// picked up.
pub async fn run(config: Config, paths: Paths) -> anyhow::Result<()> {
    paths.ensure_dirs()?;
    info!(
        supabase_url = %config.supabase_url,
        base_dir = %paths.base_dir().display(),
        "Starting entitlement sync"
    );

    let messenger = ChannelMessenger::new(MESSENGER_CAPACITY);
    let printer = tokio::spawn(print_messages(messenger.subscribe()));
    let store = open_store(&paths);
    let watcher = store.watch(Duration::from_millis(config.store_watch_ms));
    let runtime = build_runtime(&config, &paths, store, Arc::new(messenger))?;
    runtime.start().await;

    let mut lines = BufReader::new(tokio::io::stdin()).lines();
    let mut stdin_open = true;
    loop {
        tokio::select! {
            result = tokio::signal::ctrl_c() => {
                if let Err(e) = result {
                    warn!(error = %e, "Could not listen for Ctrl-C");
                }
                break;
            }
            line = lines.next_line(), if stdin_open => match line {
                Ok(Some(line)) => handle_input(&runtime, line.trim()),
                Ok(None) => {
                    debug!("stdin closed");
                    stdin_open = false;
                }
                Err(e) => {
                    warn!(error = %e, "Could not read stdin");
                    stdin_open = false;
                }
            },
        }
    }

    info!("Shutting down");
    watcher.abort();
    runtime.shutdown().await;
    drop(runtime);
    let _ = printer.await;
    Ok(())
}

fn handle_input(runtime: &EntitlementRuntime, line: &str) {
    match line {
        "" => {}
        "check" => runtime.request(RuntimeRequest::Check),
        url if url.starts_with("http://") || url.starts_with("https://") => {
            runtime.request(RuntimeRequest::Navigation(url.to_string()))
        }
        other => warn!(input = %other, "Unknown input, expected `check` or a URL"),
    }
}

async fn print_messages(mut rx: broadcast::Receiver<Envelope>) {
    loop {
        match rx.recv().await {
            Ok(envelope) => match serde_json::to_string(&envelope) {
                Ok(line) => println!("{line}"),
                Err(e) => warn!(error = %e, "Could not encode message"),
            },
            Err(broadcast::error::RecvError::Lagged(missed)) => {
                warn!(missed, "Message printer fell behind");
            }
            Err(broadcast::error::RecvError::Closed) => break,
        }
    }
}
