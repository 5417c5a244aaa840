//! Storefront Admin
//!
//! Command line admin for the catalog: tagging, likes, listings and owner
//! deletion over the generic association store.

use std::path::PathBuf;
use std::sync::Arc;

use anyhow::{Context, Result};
use clap::{Parser, Subcommand};
use serde::Serialize;
use tracing::info;
use tracing_subscriber::{EnvFilter, layer::SubscriberExt, util::SubscriberInitExt};

use assoc_store::Storage;
use assoc_types::ObjectId;
use storefront::config::{LogFormat, LoggingConfig};
use storefront::seed::seed_demo;
use storefront::{Listing, StorefrontConfig, TagOutcome};

/// Storefront catalog admin
#[derive(Parser, Debug)]
#[command(name = "storefront")]
#[command(about = "Catalog admin over generic tags and likes", long_about = None)]
struct Args {
    /// Path to the configuration file
    #[arg(short, long, default_value = "./storefront.toml")]
    config: PathBuf,

    /// Database file, overriding the configuration
    #[arg(long)]
    db: Option<PathBuf>,

    /// Print results as JSON
    #[arg(long)]
    json: bool,

    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand, Debug)]
enum Command {
    /// Create the database and register the catalog types
    Init,
    /// Insert demo data into an empty catalog
    Seed,
    /// Attach a tag to an object
    Tag {
        /// Kind name, e.g. "product" or "blog.article"
        kind: String,
        id: ObjectId,
        label: String,
    },
    /// Remove a tag from an object
    Untag {
        kind: String,
        id: ObjectId,
        label: String,
    },
    /// Record that a user likes an object
    Like {
        kind: String,
        id: ObjectId,
        user: ObjectId,
    },
    /// Show the tags and likes of an object
    Show { kind: String, id: ObjectId },
    /// List products with tags and like counts
    Products {
        #[arg(long, default_value = "0")]
        page: usize,
    },
    /// List collections with product counts
    Collections {
        #[arg(long, default_value = "0")]
        page: usize,
    },
    /// List customers with order counts and totals
    Customers {
        #[arg(long, default_value = "0")]
        page: usize,
    },
    /// First page of every listing
    Dashboard,
    /// Delete an object together with its associations
    Delete { kind: String, id: ObjectId },
    /// Search the tag vocabulary
    Tags {
        query: String,
        #[arg(long, default_value = "10")]
        limit: usize,
    },
}

#[tokio::main]
async fn main() -> Result<()> {
    let args = Args::parse();

    let loaded = StorefrontConfig::load_file(&args.config)
        .with_context(|| format!("loading {}", args.config.display()))?;
    let from_file = loaded.is_some();
    let mut config = loaded.unwrap_or_default();
    if let Some(db) = &args.db {
        config.storage.db_path = db.clone();
    }

    init_tracing(&config.logging);
    info!("Starting storefront v{}", env!("CARGO_PKG_VERSION"));
    if from_file {
        info!("Loaded configuration from {}", args.config.display());
    } else {
        info!("No configuration at {}, using defaults", args.config.display());
    }

    let storage = Storage::open(&config.storage.db_path)?;
    let listing = Arc::new(Listing::open(storage, config.listing.clone())?);

    run(listing, args.command, args.json).await
}

fn init_tracing(logging: &LoggingConfig) {
    let filter =
        EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(&logging.filter));

    let (pretty, json) = match logging.format {
        LogFormat::Pretty => (
            Some(tracing_subscriber::fmt::layer().with_writer(std::io::stderr)),
            None,
        ),
        LogFormat::Json => (
            None,
            Some(
                tracing_subscriber::fmt::layer()
                    .json()
                    .with_writer(std::io::stderr),
            ),
        ),
    };

    tracing_subscriber::registry()
        .with(filter)
        .with(pretty)
        .with(json)
        .init();
}

/// Run a listing call on the blocking pool
async fn blocking<T, F>(listing: &Arc<Listing>, f: F) -> Result<T>
where
    T: Send + 'static,
    F: FnOnce(&Listing) -> storefront::Result<T> + Send + 'static,
{
    let listing = listing.clone();
    let value = tokio::task::spawn_blocking(move || f(listing.as_ref())).await??;
    Ok(value)
}

fn emit<T: Serialize>(json: bool, value: &T, text: impl FnOnce(&T)) -> Result<()> {
    if json {
        println!("{}", serde_json::to_string_pretty(value)?);
    } else {
        text(value);
    }
    Ok(())
}

async fn run(listing: Arc<Listing>, command: Command, json: bool) -> Result<()> {
    match command {
        Command::Init => {
            let snapshot = listing.registry().snapshot();
            emit(json, &snapshot, |snapshot| {
                for desc in &snapshot.types {
                    println!("{:>4}  {}", desc.id.get(), desc.name);
                }
            })
        }
        Command::Seed => {
            let summary = blocking(&listing, seed_demo).await?;
            emit(json, &summary, |s| {
                if s.skipped {
                    println!("catalog already populated");
                } else {
                    println!(
                        "seeded {} collections, {} products, {} customers, {} orders, {} associations",
                        s.collections, s.products, s.customers, s.orders, s.associations
                    );
                }
            })
        }
        Command::Tag { kind, id, label } => {
            let outcome = blocking(&listing, move |l| l.tag(l.reference(&kind, id)?, &label)).await?;
            emit(json, &outcome, print_outcome)
        }
        Command::Untag { kind, id, label } => {
            let removed =
                blocking(&listing, move |l| l.untag(l.reference(&kind, id)?, &label)).await?;
            emit(json, &removed, |removed| {
                println!("{}", if *removed { "removed" } else { "not tagged" });
            })
        }
        Command::Like { kind, id, user } => {
            let outcome = blocking(&listing, move |l| l.like(l.reference(&kind, id)?, user)).await?;
            emit(json, &outcome, print_outcome)
        }
        Command::Show { kind, id } => {
            let payloads = blocking(&listing, move |l| l.show(l.reference(&kind, id)?)).await?;
            emit(json, &payloads, |payloads| {
                for entity in payloads {
                    println!("{}  {}", entity.payload_ref(), entity.label());
                }
            })
        }
        Command::Products { page } => {
            let rows = blocking(&listing, move |l| l.product_page(page)).await?;
            emit(json, &rows, |rows| {
                for row in rows {
                    println!(
                        "{:>4}  {:<24} {:>8.2}  likes {:>3}  [{}]",
                        row.product.id,
                        row.product.title,
                        row.product.unit_price,
                        row.likes,
                        row.tags.join(", ")
                    );
                }
            })
        }
        Command::Collections { page } => {
            let rows = blocking(&listing, move |l| l.collection_page(page)).await?;
            emit(json, &rows, |rows| {
                for row in rows {
                    println!(
                        "{:>4}  {:<24} products {:>3}  avg {:>8.2}",
                        row.collection.id, row.collection.title, row.products_count, row.average_price
                    );
                }
            })
        }
        Command::Customers { page } => {
            let rows = blocking(&listing, move |l| l.customer_page(page)).await?;
            emit(json, &rows, |rows| {
                for row in rows {
                    println!(
                        "{:>4}  {:<24} orders {:>3}  total {:>9.2}",
                        row.customer.id,
                        row.customer.full_name(),
                        row.orders_count,
                        row.orders_total
                    );
                }
            })
        }
        Command::Dashboard => {
            let dashboard = listing.clone().dashboard().await?;
            emit(json, &dashboard, |d| {
                println!(
                    "{} products, {} collections, {} customers on the first page",
                    d.products.len(),
                    d.collections.len(),
                    d.customers.len()
                );
            })
        }
        Command::Delete { kind, id } => {
            let outcome = blocking(&listing, move |l| l.delete_owner(l.reference(&kind, id)?)).await?;
            emit(json, &outcome, |o| {
                if o.owner_existed {
                    println!("deleted, {} associations removed", o.cascaded);
                } else {
                    println!("no such object, {} associations removed", o.cascaded);
                }
            })
        }
        Command::Tags { query, limit } => {
            let tags = blocking(&listing, move |l| Ok(l.catalog().tags.search(&query, limit)?)).await?;
            emit(json, &tags, |tags| {
                for tag in tags {
                    println!("{:>4}  {}", tag.id, tag.label);
                }
            })
        }
    }
}

fn print_outcome(outcome: &TagOutcome) {
    match outcome {
        TagOutcome::Created(id) => println!("created association {}", id),
        TagOutcome::AlreadyPresent(id) => println!("already present (association {})", id),
    }
}
