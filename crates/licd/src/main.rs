use std::path::PathBuf;

use anyhow::{Context, Result};
use clap::{Parser, Subcommand};
use reqwest::Client;
use serde_json::{json, Value};
use tracing_subscriber::EnvFilter;

// ── CLI definition ─────────────────────────────────────────────────────────────

#[derive(Parser)]
#[command(name = "licd", about = "licd — license activation server and client", version)]
struct Cli {
    /// licd server URL (default: http://localhost:8080 or $LICD_SERVER)
    #[arg(long, env = "LICD_SERVER", default_value = "http://localhost:8080")]
    server: String,

    /// Admin bearer key for provisioning and audit commands ($LICD_ADMIN_KEY)
    #[arg(long, env = "LICD_ADMIN_KEY", hide_env_values = true)]
    admin_key: Option<String>,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Start the licd HTTP server
    Serve {
        /// Port to listen on (default: $LICD_PORT or 8080)
        #[arg(long, env = "LICD_PORT", default_value = "8080")]
        port: u16,
        /// Host to bind (default: $LICD_HOST or 0.0.0.0)
        #[arg(long, env = "LICD_HOST", default_value = "0.0.0.0")]
        host: String,
    },
    /// Bind a license to a hardware id and print the activation token
    Activate {
        license: String,
        hwid: String,
    },
    /// Release a license from a hardware id
    Deactivate {
        license: String,
        hwid: String,
    },
    /// Print the server's token verification key (PEM)
    PublicKey,
    /// Verify a token offline against a PEM public key and print its claims
    Verify {
        token: String,
        /// Path to the PEM public key
        #[arg(long)]
        public_key: PathBuf,
    },
    /// Provision and inspect licenses (admin)
    License {
        #[command(subcommand)]
        command: LicenseCommands,
    },
    /// Show recent audit events (admin)
    Audit {
        #[arg(long)]
        license: Option<String>,
        /// e.g. license.activate, license.deactivate, license.create
        #[arg(long)]
        action: Option<String>,
        #[arg(long, default_value = "50")]
        limit: usize,
    },
}

#[derive(Subcommand)]
enum LicenseCommands {
    /// Create an unbound license
    Add { license: String },
    /// Show one license record
    Show { license: String },
    /// List all licenses
    List,
}

// ── Entry point ───────────────────────────────────────────────────────────────

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();

    let default_level = if matches!(cli.command, Commands::Serve { .. }) {
        "info"
    } else {
        "warn"
    };
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_env("LICD_LOG_LEVEL")
                .unwrap_or_else(|_| EnvFilter::new(default_level)),
        )
        .init();

    let server = cli.server.trim_end_matches('/').to_owned();

    match cli.command {
        Commands::Serve { port, host } => {
            let cfg = licd_server::ServerConfig {
                host,
                port,
                ..Default::default()
            };
            licd_server::run(cfg).await
        }

        Commands::Activate { license, hwid } => cmd_activate(&server, &license, &hwid).await,

        Commands::Deactivate { license, hwid } => {
            let body = json!({"license": license, "hwid": hwid});
            let resp = Client::new()
                .post(format!("{server}/deactivate"))
                .json(&body)
                .send()
                .await
                .context("HTTP request failed")?;
            expect_success(resp).await?;
            println!("✓ released {license}");
            Ok(())
        }

        Commands::PublicKey => {
            let resp = Client::new()
                .get(format!("{server}/public-key"))
                .send()
                .await
                .context("HTTP request failed")?;
            let json = expect_success(resp).await?;
            print!("{}", json["public_key"].as_str().unwrap_or(""));
            Ok(())
        }

        Commands::Verify { token, public_key } => cmd_verify(&token, &public_key),

        Commands::License { command } => {
            let admin_key = require_admin_key(&cli.admin_key)?;
            cmd_license(&server, &admin_key, command).await
        }

        Commands::Audit {
            license,
            action,
            limit,
        } => {
            let admin_key = require_admin_key(&cli.admin_key)?;
            cmd_audit(&server, &admin_key, license, action, limit).await
        }
    }
}

// ── Command implementations ───────────────────────────────────────────────────

async fn cmd_activate(server: &str, license: &str, hwid: &str) -> Result<()> {
    let body = json!({"license": license, "hwid": hwid});
    let resp = Client::new()
        .post(format!("{server}/activate"))
        .json(&body)
        .send()
        .await
        .context("HTTP request failed")?;

    let json = expect_success(resp).await?;
    let token = json["token"]
        .as_str()
        .context("server response has no token")?;
    println!("{token}");
    Ok(())
}

fn cmd_verify(token: &str, public_key: &std::path::Path) -> Result<()> {
    let pem = std::fs::read(public_key)
        .with_context(|| format!("read public key: {}", public_key.display()))?;
    let claims = licd_server::verify_token(token.trim(), &pem).context("token rejected")?;
    println!("{}", serde_json::to_string_pretty(&claims)?);
    Ok(())
}

async fn cmd_license(server: &str, admin_key: &str, command: LicenseCommands) -> Result<()> {
    let client = Client::new();
    match command {
        LicenseCommands::Add { license } => {
            let resp = client
                .post(format!("{server}/licenses"))
                .bearer_auth(admin_key)
                .json(&json!({"license": license}))
                .send()
                .await
                .context("HTTP request failed")?;
            expect_success(resp).await?;
            println!("✓ created {license}");
        }
        LicenseCommands::Show { license } => {
            let resp = client
                .get(license_url(server, &license)?)
                .bearer_auth(admin_key)
                .send()
                .await
                .context("HTTP request failed")?;
            let record = expect_success(resp).await?;
            println!("{}", describe_license(&record));
        }
        LicenseCommands::List => {
            let resp = client
                .get(format!("{server}/licenses"))
                .bearer_auth(admin_key)
                .send()
                .await
                .context("HTTP request failed")?;
            let json = expect_success(resp).await?;
            let records = json["licenses"].as_array().cloned().unwrap_or_default();
            if records.is_empty() {
                println!("(no licenses)");
            }
            for record in &records {
                println!("  {}", describe_license(record));
            }
        }
    }
    Ok(())
}

async fn cmd_audit(
    server: &str,
    admin_key: &str,
    license: Option<String>,
    action: Option<String>,
    limit: usize,
) -> Result<()> {
    let mut query = vec![("limit", limit.to_string())];
    if let Some(license) = license {
        query.push(("license", license));
    }
    if let Some(action) = action {
        query.push(("action", action));
    }

    let resp = Client::new()
        .get(format!("{server}/audit"))
        .bearer_auth(admin_key)
        .query(&query)
        .send()
        .await
        .context("HTTP request failed")?;
    let json = expect_success(resp).await?;

    for event in json["events"].as_array().cloned().unwrap_or_default() {
        let mark = if event["success"].as_bool().unwrap_or(false) {
            "ok"
        } else {
            "FAIL"
        };
        println!(
            "{} {:<20} {:<4} license={} hwid={} ip={} {}",
            event["timestamp"],
            event["action"].as_str().unwrap_or(""),
            mark,
            event["license"].as_str().unwrap_or("-"),
            event["hwid"].as_str().unwrap_or("-"),
            event["source_ip"].as_str().unwrap_or("-"),
            event["detail"].as_str().unwrap_or(""),
        );
    }
    Ok(())
}

// ── Helpers ───────────────────────────────────────────────────────────────────

fn require_admin_key(key: &Option<String>) -> Result<String> {
    key.clone()
        .context("--admin-key / LICD_ADMIN_KEY is required for this command")
}

/// `{server}/licenses/{license}` with the id percent-encoded as one path segment.
fn license_url(server: &str, license: &str) -> Result<reqwest::Url> {
    let mut url =
        reqwest::Url::parse(server).with_context(|| format!("invalid server URL: {server}"))?;
    url.path_segments_mut()
        .map_err(|_| anyhow::anyhow!("server URL cannot carry a path: {server}"))?
        .pop_if_empty()
        .push("licenses")
        .push(license);
    Ok(url)
}

/// Parse the JSON body, turning non-2xx responses into errors carrying the server's message.
async fn expect_success(resp: reqwest::Response) -> Result<Value> {
    let status = resp.status();
    let json: Value = resp.json().await.unwrap_or_default();
    if !status.is_success() {
        anyhow::bail!(
            "server returned {status}: {}",
            json["error"].as_str().unwrap_or("")
        );
    }
    Ok(json)
}

fn describe_license(record: &Value) -> String {
    let id = record["license_id"].as_str().unwrap_or("?");
    if record["active"].as_bool().unwrap_or(false) {
        format!(
            "{id} — bound to {} (rev {})",
            record["hwid"].as_str().unwrap_or(""),
            record["revision"]
        )
    } else {
        format!("{id} — unbound (rev {})", record["revision"])
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn cli_definition_is_valid() {
        use clap::CommandFactory;
        Cli::command().debug_assert();
    }

    #[test]
    fn license_url_encodes_the_id() {
        let url = license_url("http://localhost:8080", "a/b?c#d").unwrap();
        assert_eq!(url.as_str(), "http://localhost:8080/licenses/a%2Fb%3Fc%23d");

        let url = license_url("https://lic.example.com/api", "ABC").unwrap();
        assert_eq!(url.as_str(), "https://lic.example.com/api/licenses/ABC");

        assert!(license_url("not a url", "ABC").is_err());
    }

    #[test]
    fn describe_bound_and_unbound() {
        let bound = json!({"license_id": "ABC", "active": true, "hwid": "dev1", "revision": 1});
        assert_eq!(describe_license(&bound), "ABC — bound to dev1 (rev 1)");
        let unbound = json!({"license_id": "ABC", "active": false, "hwid": "", "revision": 2});
        assert_eq!(describe_license(&unbound), "ABC — unbound (rev 2)");
    }
}
