use std::sync::Arc;

use anyhow::{bail, Context, Result};
use chrono::{Duration, Utc};
use clap::{ArgAction, Parser, Subcommand};
use serde::Serialize;
use stateset_cart::{
    config::{self, AppConfig},
    entities::commerce::CartAbandonmentModel,
    events::{Event, EventSender},
    handlers::AppServices,
    repositories::Storage,
    services::commerce::catalog::catalog_from_config,
};
use tokio::sync::mpsc;
use tracing::debug;
use uuid::Uuid;

/// Maintenance sweeps over the cart database
#[derive(Parser)]
#[command(name = "cart-sweeper", version)]
struct Cli {
    #[arg(
        long,
        global = true,
        action = ArgAction::SetTrue,
        help = "Render command output as pretty JSON"
    )]
    json: bool,
    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Mark Active guest carts past their expiry as Expired
    Expire,
    /// List abandonment rows not yet recovered
    Unrecovered {
        /// Only rows abandoned more than this many hours ago
        #[arg(long, default_value_t = 24)]
        older_than_hours: i64,
    },
    /// Move an Active cart to Abandoned
    Abandon {
        cart_id: Uuid,
    },
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();
    let config = config::load_config().context("failed to load application config")?;
    config::init_tracing(config.log_level(), config.log_json);

    let services = build_services(&config).await?;

    match cli.command {
        Commands::Expire => {
            let expired = services
                .carts
                .cleanup_expired_carts(Utc::now())
                .await
                .context("expiry sweep failed")?;
            if cli.json {
                print_json(&serde_json::json!({ "expired": expired }))?;
            } else {
                println!("Expired {} guest cart(s)", expired);
            }
        }
        Commands::Unrecovered { older_than_hours } => {
            if older_than_hours < 0 {
                bail!("--older-than-hours must not be negative");
            }
            let cutoff = Utc::now() - Duration::hours(older_than_hours);
            let rows = services
                .abandonment
                .get_unrecovered(cutoff)
                .await
                .context("failed to list unrecovered carts")?;
            if cli.json {
                print_json(&rows)?;
            } else {
                render_unrecovered(&rows);
            }
        }
        Commands::Abandon { cart_id } => {
            let cart = services
                .carts
                .abandon_cart(cart_id)
                .await
                .with_context(|| format!("failed to abandon cart {}", cart_id))?;
            if cli.json {
                print_json(&cart)?;
            } else {
                println!("Cart {} is now {}", cart_id, cart.cart.status.as_str());
            }
        }
    }

    Ok(())
}

async fn build_services(config: &AppConfig) -> Result<AppServices> {
    if !config.uses_database() {
        bail!("cart-sweeper needs storage_backend = \"database\" and a database_url");
    }
    let storage = Storage::from_config(config)
        .await
        .context("failed to connect to database")?;
    let catalog = catalog_from_config(config)?;

    let (event_tx, mut event_rx) = mpsc::channel::<Event>(32);
    let event_sender = Arc::new(EventSender::new(event_tx));

    tokio::spawn(async move {
        while let Some(event) = event_rx.recv().await {
            debug!(target: "cart_sweeper", event = ?event, "received async event");
        }
    });

    Ok(AppServices::new(
        config,
        storage.carts,
        storage.tracking,
        catalog,
        event_sender,
    ))
}

fn print_json<T: Serialize>(value: &T) -> Result<()> {
    println!("{}", serde_json::to_string_pretty(value)?);
    Ok(())
}

fn render_unrecovered(rows: &[CartAbandonmentModel]) {
    if rows.is_empty() {
        println!("No unrecovered carts");
        return;
    }
    for row in rows {
        println!(
            "- Cart {} • stage {} • value {} • abandoned {} • emails {} • clicks {}",
            row.cart_id,
            row.stage.as_str(),
            row.cart_value,
            row.abandoned_at.to_rfc3339(),
            row.emails_sent,
            row.clicks
        );
    }
}
