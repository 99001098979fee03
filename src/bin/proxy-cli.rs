use std::path::{Path, PathBuf};

use clap::{Parser, Subcommand};
use kf_header_proxy::config::{load_config, read_config, validate_config, ConfigError, FilterConfig};
use kf_header_proxy::HeaderPropagation;
use reqwest::header::{HeaderMap, HeaderValue, AUTHORIZATION, COOKIE};
use serde_json::{Map, Value};

#[derive(Parser)]
#[command(name = "proxy-cli")]
#[command(about = "Management CLI for the header propagation proxy", long_about = None)]
struct Cli {
    #[arg(short, long, default_value = "http://localhost:8081")]
    url: String,

    #[arg(short, long, env = "PROXY_ADMIN_KEY", default_value = "CHANGE_ME_IN_PRODUCTION")]
    key: String,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Check proxy system status
    Status,
    /// Show the active filter settings
    Filter,
    /// Show upstream health
    Upstream,
    /// Run the filter locally against a Cookie header and print the result
    Apply {
        /// Cookie header value, e.g. "_xsrf=abc; theme=dark"
        #[arg(long)]
        cookie: String,

        /// Identity to inject; defaults to the config file's, then user@example.com
        #[arg(long)]
        user_id: Option<String>,

        /// Read filter settings from this config file instead of defaults
        #[arg(long)]
        config: Option<PathBuf>,
    },
    /// Parse and validate a configuration file
    CheckConfig { path: PathBuf },
}

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    let cli = Cli::parse();

    match cli.command {
        Commands::Status => admin_get(&cli.url, &cli.key, "/admin/status").await?,
        Commands::Filter => admin_get(&cli.url, &cli.key, "/admin/filter").await?,
        Commands::Upstream => admin_get(&cli.url, &cli.key, "/admin/upstream").await?,
        Commands::Apply {
            cookie,
            user_id,
            config,
        } => {
            let settings = filter_settings(config.as_deref(), user_id)?;
            let filter = HeaderPropagation::from_config(&settings)?;

            let mut headers = HeaderMap::new();
            headers.insert(COOKIE, HeaderValue::from_str(&cookie)?);
            let outcome = filter.apply(&mut headers);

            let mut out = Map::new();
            for (name, value) in &headers {
                out.insert(
                    name.to_string(),
                    Value::String(String::from_utf8_lossy(value.as_bytes()).into_owned()),
                );
            }
            out.insert("token_propagated".into(), Value::Bool(outcome.token_propagated));
            println!("{}", serde_json::to_string_pretty(&Value::Object(out))?);
        }
        Commands::CheckConfig { path } => match load_config(&path) {
            Ok(config) => {
                println!(
                    "{}: ok (upstream {}, identity header {})",
                    path.display(),
                    config.upstream.address,
                    config.filter.user_id_header
                );
            }
            Err(e) => {
                eprintln!("{}: {}", path.display(), e);
                std::process::exit(1);
            }
        },
    }

    Ok(())
}

/// Filter settings from `config` (or defaults) with `user_id` layered on top.
fn filter_settings(config: Option<&Path>, user_id: Option<String>) -> Result<FilterConfig, ConfigError> {
    let mut config = match config {
        Some(path) => read_config(path)?,
        None => Default::default(),
    };
    if let Some(user_id) = user_id {
        config.filter.user_id = user_id;
    }
    validate_config(&config).map_err(ConfigError::Validation)?;
    Ok(config.filter)
}

async fn admin_get(url: &str, key: &str, path: &str) -> Result<(), Box<dyn std::error::Error>> {
    let mut headers = HeaderMap::new();
    headers.insert(AUTHORIZATION, HeaderValue::from_str(&format!("Bearer {key}"))?);

    let res = reqwest::Client::new()
        .get(format!("{url}{path}"))
        .headers(headers)
        .send()
        .await?;
    print_response(res).await
}

async fn print_response(res: reqwest::Response) -> Result<(), Box<dyn std::error::Error>> {
    let status = res.status();
    if !status.is_success() {
        eprintln!("Error: Admin API returned status {}", status);
        if let Ok(text) = res.text().await {
            eprintln!("Response: {}", text);
        }
        return Ok(());
    }

    let json: Value = res.json().await?;
    println!("{}", serde_json::to_string_pretty(&json)?);
    Ok(())
}
