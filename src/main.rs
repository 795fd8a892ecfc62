use std::fs::File;
use std::path::{Path, PathBuf};
use std::sync::Arc;

use tracing::{error, info, warn};
use tracing_subscriber::prelude::*;

use kupa::alert_log::AlertLogLayer;
use kupa::bot::{Dispatcher, DispatcherSettings};
use kupa::clock::SystemClock;
use kupa::config::Config;
use kupa::ledger::Ledger;
use kupa::ledger::sheets::{GoogleSheets, TokenSource};
use kupa::oracle::ExpenseOracle;
use kupa::oracle::openai::OpenAiClient;
use kupa::server::{self, AppState};
use kupa::store::{MemoryStore, SqliteStore, TtlStore};
use kupa::whatsapp::WhatsAppClient;

fn fail(what: &str, err: impl std::fmt::Display) -> ! {
    eprintln!("{what}: {err}");
    std::process::exit(1);
}

fn open_store(config: &Config, namespace: &str) -> Box<dyn TtlStore> {
    match &config.state_db {
        Some(path) => match SqliteStore::open(path, namespace) {
            Ok(store) => Box::new(store),
            Err(e) => fail(&format!("Failed to open state db {}", path.display()), e),
        },
        None => Box::new(MemoryStore::new()),
    }
}

/// `data_dir/logs/kupa.log`, opened for append; the directory is created
/// when missing.
fn open_log_file(data_dir: &Path) -> std::io::Result<File> {
    let log_dir = data_dir.join("logs");
    std::fs::create_dir_all(&log_dir)?;
    std::fs::OpenOptions::new().create(true).append(true).open(log_dir.join("kupa.log"))
}

#[tokio::main]
async fn main() {
    let config_path = std::env::args().nth(1).map(PathBuf::from);
    let config = match Config::load(config_path.as_deref()) {
        Ok(config) => config,
        Err(e) => fail("Invalid configuration", e),
    };

    let messenger = match WhatsAppClient::new(&config.meta_access_token, &config.meta_phone_number_id) {
        Ok(client) => Arc::new(client),
        Err(e) => fail("Failed to build WhatsApp client", e),
    };

    // Setup logging
    let log_file = match open_log_file(&config.data_dir) {
        Ok(file) => file,
        Err(e) => fail(&format!("Failed to open log file under {}", config.data_dir.display()), e),
    };
    let (non_blocking, _guard) = tracing_appender::non_blocking(log_file);

    let registry = tracing_subscriber::registry()
        .with(
            tracing_subscriber::fmt::layer().with_writer(std::io::stdout).with_filter(
                tracing_subscriber::EnvFilter::from_default_env().add_directive(tracing::Level::INFO.into()),
            ),
        )
        .with(
            tracing_subscriber::fmt::layer().with_writer(non_blocking).with_ansi(false).with_filter(
                tracing_subscriber::EnvFilter::from_default_env().add_directive(tracing::Level::INFO.into()),
            ),
        );

    if let Some(recipient) = config.alert_recipient.clone() {
        let alerts = AlertLogLayer::new(messenger.clone(), recipient);
        registry.with(alerts).init();
    } else {
        registry.init();
    }

    info!("🚀 Starting kupa...");
    match &config.config_path {
        Some(path) => info!("Loaded config from {}", path.display()),
        None => info!("Configuration taken from the environment"),
    }
    info!("Known users: {}", config.users.iter().map(|u| u.name.as_str()).collect::<Vec<_>>().join(", "));
    if config.sheets_access_token.is_none() {
        info!("Sheets tokens come from the metadata server");
    }

    let completion = match OpenAiClient::new(
        config.openai_api_key.clone(),
        config.openai_model.clone(),
        config.openai_base_url.clone(),
    ) {
        Ok(client) => client,
        Err(e) => fail("Failed to build OpenAI client", e),
    };
    let sheets = match GoogleSheets::new(
        config.budget_spreadsheet_id.clone(),
        config.tracker_spreadsheet_id.clone(),
        TokenSource::from_config(config.sheets_access_token.clone()),
    ) {
        Ok(sheets) => sheets,
        Err(e) => fail("Failed to build Sheets client", e),
    };

    let ledger = Ledger::new(sheets);
    match ledger.current_period().await {
        Ok(period) => info!("Working period: {}", period),
        Err(e) => warn!("Working period unreadable at startup: {}", e),
    }

    let dispatcher = Dispatcher::new(
        ExpenseOracle::new(completion, config.analysis_mode),
        ledger,
        open_store(&config, "dedup"),
        open_store(&config, "answers"),
        Arc::new(SystemClock),
        DispatcherSettings::from(&config),
    );

    let state = Arc::new(AppState {
        dispatcher,
        messenger,
        verify_token: config.meta_verify_token.clone(),
    });

    if let Err(e) = server::serve(state, config.listen_addr).await {
        error!("Server stopped: {}", e);
        std::process::exit(1);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_log_file_created_under_data_dir() {
        let dir = tempfile::tempdir().unwrap();
        open_log_file(dir.path()).unwrap();
        assert!(dir.path().join("logs").join("kupa.log").exists());
    }

    #[test]
    fn test_unusable_data_dir_is_an_error() {
        let dir = tempfile::tempdir().unwrap();
        let blocker = dir.path().join("not_a_dir");
        std::fs::write(&blocker, "x").unwrap();
        assert!(open_log_file(&blocker).is_err());
    }
}
