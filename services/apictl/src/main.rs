//! apictl
//!
//! Command-line host for the session engine:
//! 1. Loads the TOML config and opens the file-backed token storage
//! 2. Builds one `Session` against the configured API
//! 3. Runs a single command (login, logout, status, or a raw API call)
//!
//! The refresh token survives between invocations in the storage file, so
//! every call after `login` silently refreshes its access token.

mod config;

use anyhow::{Context, Result, bail};
use reqwest::Method;
use session_auth::FileStorage;
use session_client::{
    ApiResponse, Error as SessionError, Query, RequestBody, RequestOptions, Session,
};
use std::sync::Arc;
use std::time::Duration;
use tracing::info;
use tracing_subscriber::EnvFilter;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

use crate::config::Config;

const USAGE: &str =
    "usage: apictl [--config PATH] <login USER | logout | status | METHOD PATH [JSON]>";

#[derive(Debug, PartialEq)]
enum Command {
    Login { username: String },
    Logout,
    Status,
    Call {
        method: Method,
        path: String,
        body: Option<serde_json::Value>,
    },
}

/// Split argv (without the program name) into the optional `--config` value
/// and the command.
fn parse_args(args: &[String]) -> Result<(Option<&str>, Command)> {
    let mut config_path = None;
    let mut rest = Vec::new();
    let mut iter = args.iter();
    while let Some(arg) = iter.next() {
        if arg == "--config" {
            let path = iter.next().context("--config requires a path")?;
            config_path = Some(path.as_str());
        } else {
            rest.push(arg.as_str());
        }
    }

    let command = match rest.as_slice() {
        ["login", username] => Command::Login {
            username: (*username).to_owned(),
        },
        ["logout"] => Command::Logout,
        ["status"] => Command::Status,
        [method, path, body @ ..] if body.len() <= 1 => {
            let method = parse_method(method)?;
            if !path.starts_with('/') {
                bail!("path must start with '/', got {path}");
            }
            let body = body
                .first()
                .map(|raw| serde_json::from_str(raw))
                .transpose()
                .context("request body is not valid JSON")?;
            Command::Call {
                method,
                path: (*path).to_owned(),
                body,
            }
        }
        _ => bail!(USAGE),
    };
    Ok((config_path, command))
}

fn parse_method(raw: &str) -> Result<Method> {
    match raw.to_ascii_uppercase().as_str() {
        "GET" => Ok(Method::GET),
        "POST" => Ok(Method::POST),
        "PUT" => Ok(Method::PUT),
        "PATCH" => Ok(Method::PATCH),
        "DELETE" => Ok(Method::DELETE),
        _ => bail!("unsupported method {raw}\n{USAGE}"),
    }
}

#[tokio::main]
async fn main() -> Result<()> {
    // Initialize tracing with JSON output and LOG_LEVEL / RUST_LOG support
    tracing_subscriber::registry()
        .with(
            EnvFilter::try_from_env("LOG_LEVEL")
                .or_else(|_| EnvFilter::try_from_default_env())
                .unwrap_or_else(|_| EnvFilter::new("info")),
        )
        .with(tracing_subscriber::fmt::layer().json().with_writer(std::io::stderr))
        .init();

    let args: Vec<String> = std::env::args().skip(1).collect();
    let (cli_config_path, command) = parse_args(&args)?;

    let config_path = Config::resolve_path(cli_config_path);
    let config = Config::load(&config_path)
        .with_context(|| format!("failed to load config from {}", config_path.display()))?;
    info!(
        base_url = %config.api.base_url,
        storage = %config.storage.path.display(),
        "configuration loaded"
    );

    if let Some(dir) = config.storage.path.parent().filter(|d| !d.as_os_str().is_empty()) {
        tokio::fs::create_dir_all(dir)
            .await
            .with_context(|| format!("failed to create {}", dir.display()))?;
    }
    let storage = FileStorage::load(config.storage.path.clone())
        .await
        .with_context(|| {
            format!(
                "failed to open session storage {}",
                config.storage.path.display()
            )
        })?;
    let session = Session::builder()
        .base_url(&config.api.base_url)
        .timeout(Duration::from_secs(config.api.timeout_secs))
        .storage(Arc::new(storage))
        .build()
        .context("failed to create session")?;

    let _subscription = session.on_change(|authenticated| {
        info!(authenticated, "authentication state changed");
    });

    run(&session, &config, command).await
}

async fn run(session: &Session, config: &Config, command: Command) -> Result<()> {
    match command {
        Command::Login { username } => {
            let Some(password) = config.auth.password.as_ref() else {
                bail!("no password configured: set API_PASSWORD or [auth] password_file");
            };
            session
                .login(&username, password.expose())
                .await
                .context("login failed")?;
            println!("logged in as {username}");
        }
        Command::Logout => {
            session.logout().await.context("logout failed")?;
            println!("logged out");
        }
        Command::Status => {
            let authenticated = session.ensure_valid().await;
            let remaining = session.tokens().remaining().await;
            let status = serde_json::json!({
                "base_url": session.base_url(),
                "authenticated": authenticated,
                "expires_in_secs": remaining.map(|d| d.as_secs()),
            });
            println!("{}", serde_json::to_string_pretty(&status)?);
        }
        Command::Call { method, path, body } => {
            let body = body.map(RequestBody::Json);
            let response = session
                .execute(method, &path, &Query::new(), body.as_ref(), &RequestOptions::new())
                .await
                .map_err(|e| match e {
                    SessionError::AuthExpired(_) => {
                        anyhow::Error::new(e).context("session expired, run `apictl login`")
                    }
                    other => anyhow::Error::new(other),
                })?;
            match response {
                ApiResponse::Json(value) => println!("{}", serde_json::to_string_pretty(&value)?),
                ApiResponse::Empty | ApiResponse::Raw(_) => {}
            }
        }
    }
    Ok(())
}
