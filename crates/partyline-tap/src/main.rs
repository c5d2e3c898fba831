//! partyline-tap - attach to a partyline stream and print envelopes
//!
//! Taps into the stream like a logging subscriber would: register for the
//! given message types, print each matching envelope as a JSON line.
//!
//! Usage:
//!   partyline-tap --url wss://host/ws --user u1 --token t1 UNREAD PRESENCE

use anyhow::{Context, Result};
use clap::Parser;
use partyline_core::{CallbackEntry, ConfigPatch, ConnectionMode, Facade, StartOptions};
use tracing::info;

#[derive(Parser, Debug)]
#[command(name = "partyline-tap")]
#[command(about = "Attach to a partyline stream and print envelopes")]
#[command(version)]
struct Args {
    /// Message types to print (e.g. UNREAD PRESENCE)
    #[arg(required = true)]
    types: Vec<String>,

    /// Base stream URL, e.g. wss://host/ws
    #[arg(short, long)]
    url: String,

    /// User id component of the stream identity
    #[arg(short = 'U', long)]
    user: String,

    /// Credential appended (encoded) to the stream URL
    #[arg(short, long)]
    token: String,

    /// Connection mode: auto | shared | visibility | direct
    #[arg(short, long, default_value = "auto")]
    mode: String,
}

fn log_filter() -> tracing_subscriber::EnvFilter {
    let level = if let Ok(v) = std::env::var("RUST_LOG") {
        v
    } else if let Ok(v) = std::env::var("PARTYLINE_LOG_LEVEL") {
        match v.as_str() {
            "silent" => "off".to_string(),
            other => other.to_string(),
        }
    } else {
        "warn".to_string()
    };

    tracing_subscriber::EnvFilter::try_new(level)
        .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("warn"))
}

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(log_filter())
        .with_writer(std::io::stderr)
        .init();

    let args = Args::parse();
    let mode = ConnectionMode::from_str(&args.mode)
        .with_context(|| format!("unknown connection mode: {}", args.mode))?;

    let facade = Facade::new();
    facade
        .set_config(ConfigPatch {
            url: Some(args.url.clone()),
            connection_mode: Some(mode),
            ..Default::default()
        })
        .await;

    for message_type in &args.types {
        facade
            .register_callback(CallbackEntry::new(message_type, |_data, envelope| {
                match serde_json::to_string(envelope) {
                    Ok(line) => println!("{}", line),
                    Err(e) => tracing::warn!(error = %e, "envelope did not serialize"),
                }
            }))
            .await?;
    }

    facade
        .start(StartOptions {
            user_id: args.user.clone(),
            credential: args.token.clone(),
        })
        .await?;

    let mode = facade
        .current_mode()
        .await
        .map(|m| m.as_str())
        .unwrap_or("none");
    eprintln!(
        "\x1b[90mAttached as {} in {} mode. Press Ctrl+C to detach.\x1b[0m",
        args.user, mode
    );

    tokio::signal::ctrl_c()
        .await
        .context("failed to listen for ctrl-c")?;
    info!("detaching");
    facade.stop().await;
    Ok(())
}
