use anyhow::{Context, Result};
use std::sync::Arc;
use std::time::Duration;
use tokio::time::timeout;

use booking_session::auth::{LoginCredentials, SessionManager, SessionOptions, PROFILE_PATH};
use booking_session::broadcast::LocalBroadcastHub;
use booking_session::client::ApiClient;
use booking_session::config::{Command, Config};
use booking_session::dispatcher::RequestDispatcher;
use booking_session::store::LocalCredentialStore;
use booking_session::transport::HttpTransport;

/// How long `logout` waits for the best-effort server-side call
const REVOKE_WAIT: Duration = Duration::from_secs(5);

#[tokio::main]
async fn main() -> Result<()> {
    // Load configuration first (for log level)
    let config = Config::load()?;
    config.validate()?;

    // Initialize logging with a configured level
    let log_level = config.log_level.to_lowercase();
    let env_filter = tracing_subscriber::EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new(&log_level));

    tracing_subscriber::fmt()
        .with_env_filter(env_filter)
        .with_target(false)
        .with_thread_ids(false)
        .with_file(true)
        .with_line_number(true)
        .init();

    tracing::info!("Booking session client starting...");
    tracing::debug!("API: {}", config.api_base_url);
    tracing::debug!("Credential store: {}", config.store_file.display());

    let transport = HttpTransport::new(
        &config.api_base_url,
        config.http_max_connections,
        config.http_connect_timeout,
        config.http_request_timeout,
    )?;

    let store = LocalCredentialStore::open_file(&config.store_file).with_context(|| {
        format!(
            "Failed to open credential store: {}",
            config.store_file.display()
        )
    })?;
    let hub = LocalBroadcastHub::new();

    let session = SessionManager::with_options(
        Arc::new(store),
        Arc::new(hub.channel()),
        Arc::new(transport),
        SessionOptions {
            refresh_threshold: Duration::from_secs(config.token_refresh_threshold),
        },
    );
    let dispatcher = RequestDispatcher::new(config.dispatcher_config());
    let client = ApiClient::new(session.clone(), dispatcher);

    let result = run(&config, &client).await;
    session.dispose();
    result
}

async fn run(config: &Config, client: &ApiClient) -> Result<()> {
    let session = client.session();

    match &config.command {
        Command::Status => {
            let state = session.initialize().await;
            let snapshot = session.snapshot();
            match snapshot.user {
                Some(user) if snapshot.is_authenticated() => {
                    println!(
                        "{} as {}",
                        state,
                        user.display_name().unwrap_or(user.id.as_str())
                    );
                }
                _ => println!("{}", state),
            }
        }

        Command::Login { username } => {
            let password = read_password()?;
            let credentials = LoginCredentials::new(username.clone(), password);
            let user = session.login(&credentials).await?;
            println!(
                "Signed in as {}",
                user.display_name().unwrap_or(user.id.as_str())
            );
        }

        Command::Logout => {
            session.initialize().await;
            if let Some(revoke) = session.logout().await {
                // The runtime shuts down when we return; let the server-side call finish first
                if timeout(REVOKE_WAIT, revoke).await.is_err() {
                    tracing::debug!("Server-side logout still pending, giving up");
                }
            }
            println!("Signed out");
        }

        Command::Profile => {
            let state = session.initialize().await;
            if !session.snapshot().is_authenticated() {
                anyhow::bail!("Not signed in (state: {})", state);
            }
            let profile = client.get(PROFILE_PATH).await?;
            println!("{}", serde_json::to_string_pretty(&profile)?);
        }
    }

    Ok(())
}

/// Password from BOOKING_PASSWORD, otherwise prompted for
fn read_password() -> Result<String> {
    if let Ok(password) = std::env::var("BOOKING_PASSWORD") {
        return Ok(password);
    }

    dialoguer::Password::new()
        .with_prompt("Password")
        .interact()
        .context("Failed to read password")
}
