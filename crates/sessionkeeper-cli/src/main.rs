//! sessionkeeper - send authenticated API requests from the terminal.
//!
//! Tokens are kept in the configured credential backend and renewed
//! transparently when the server reports them expired.

use std::io::{self, Write};
use std::sync::Arc;

use anyhow::{bail, Context, Result};
use reqwest::Method;
use tracing::info;
use tracing_appender::non_blocking::WorkerGuard;
use tracing_subscriber::{fmt, prelude::*, EnvFilter};

use sessionkeeper_core::{ApiRequest, Config, CredentialStore, SessionClient, SessionStatus};

// ============================================================================
// Constants
// ============================================================================

/// Overrides `base_url` from the config file
const BASE_URL_ENV: &str = "SESSIONKEEPER_BASE_URL";

/// Password for `login`, skipping the interactive prompt
const PASSWORD_ENV: &str = "SESSIONKEEPER_PASSWORD";

/// Directory for a daily rolling log file, in addition to stderr
const LOG_DIR_ENV: &str = "SESSIONKEEPER_LOG_DIR";

const LOG_FILE_PREFIX: &str = "sessionkeeper.log";

const USAGE: &str = "\
Usage: sessionkeeper <command>

Commands:
  status                                 Show session state
  login <email>                          Log in and store the issued tokens
  logout                                 Forget stored tokens
  renew                                  Exchange the refresh token for a new access token
  request <METHOD> <target> [json-body]  Send a request with transparent renewal";

#[derive(Debug, PartialEq, Eq)]
enum Command {
    Status,
    Login { email: String },
    Logout,
    Renew,
    Request {
        method: Method,
        target: String,
        body: Option<String>,
    },
    Help,
}

fn parse_args(args: &[String]) -> Result<Command> {
    let Some(command) = args.first() else {
        return Ok(Command::Help);
    };

    match command.as_str() {
        "status" => Ok(Command::Status),
        "logout" => Ok(Command::Logout),
        "renew" => Ok(Command::Renew),
        "help" | "--help" | "-h" => Ok(Command::Help),
        "login" => {
            let email = args.get(1).context("login requires an email address")?;
            Ok(Command::Login {
                email: email.clone(),
            })
        }
        "request" => {
            let (Some(method), Some(target)) = (args.get(1), args.get(2)) else {
                bail!("request requires a method and a target");
            };
            let method = Method::from_bytes(method.to_ascii_uppercase().as_bytes())
                .with_context(|| format!("Invalid HTTP method: {}", method))?;
            Ok(Command::Request {
                method,
                target: target.clone(),
                body: args.get(3).cloned(),
            })
        }
        other => bail!("Unknown command: {}\n\n{}", other, USAGE),
    }
}

/// Initialize the tracing subscriber for logging.
/// The returned guard must live until exit so buffered file logs are flushed.
fn init_tracing() -> Option<WorkerGuard> {
    // Use RUST_LOG env var to control log level (e.g., RUST_LOG=debug)
    let filter = EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| EnvFilter::new("warn"));

    let (file_layer, guard) = match std::env::var(LOG_DIR_ENV) {
        Ok(dir) => {
            let appender = tracing_appender::rolling::daily(dir, LOG_FILE_PREFIX);
            let (writer, guard) = tracing_appender::non_blocking(appender);
            (
                Some(fmt::layer().with_writer(writer).with_ansi(false)),
                Some(guard),
            )
        }
        Err(_) => (None, None),
    };

    tracing_subscriber::registry()
        .with(fmt::layer().with_writer(io::stderr))
        .with(file_layer)
        .with(filter)
        .init();

    guard
}

fn load_config() -> Result<Config> {
    let mut config = Config::load()?;
    if let Ok(base_url) = std::env::var(BASE_URL_ENV) {
        config.base_url = base_url;
    }
    Ok(config)
}

fn print_status(store: &dyn CredentialStore) {
    let status = SessionStatus::capture(store);
    println!("state:   {}", status.state);
    println!("access:  {}", status.access_preview.as_deref().unwrap_or("-"));
    println!("refresh: {}", status.refresh_preview.as_deref().unwrap_or("-"));
}

async fn run(command: Command) -> Result<()> {
    let config = load_config()?;
    let store = config.open_credential_store()?;
    let client = SessionClient::from_config(&config, Arc::clone(&store))
        .context("Failed to create HTTP client")?;

    match command {
        Command::Help => println!("{}", USAGE),
        Command::Status => print_status(store.as_ref()),
        Command::Login { email } => {
            let password = match std::env::var(PASSWORD_ENV) {
                Ok(password) => password,
                Err(_) => rpassword::prompt_password("Password: ")?,
            };
            client.login(&email, &password).await?;
            eprintln!("Logged in as {}", email);
        }
        Command::Logout => {
            client.logout();
            eprintln!("Logged out");
        }
        Command::Renew => {
            let outcome = client.renew_outcome().await;
            println!("{}", outcome);
            if !outcome.is_renewed() {
                bail!("Token renewal failed");
            }
        }
        Command::Request {
            method,
            target,
            body,
        } => {
            let mut request = ApiRequest::new(method, target);
            if let Some(body) = body {
                let value: serde_json::Value =
                    serde_json::from_str(&body).context("Request body is not valid JSON")?;
                request = request.json(&value)?;
            }
            let response = client.send(request).await?;
            eprintln!("{}", response.status);
            io::stdout().write_all(&response.body)?;
            if !response.is_success() {
                bail!("Request failed with status {}", response.status);
            }
        }
    }
    Ok(())
}

#[tokio::main]
async fn main() -> Result<()> {
    // Load .env file if present (silently ignore if not found)
    let _ = dotenvy::dotenv();

    let _log_guard = init_tracing();

    let args: Vec<String> = std::env::args().skip(1).collect();
    let command = parse_args(&args)?;
    info!(?command, "sessionkeeper starting");

    run(command).await
}
