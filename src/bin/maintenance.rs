use std::env;

use anyhow::{Context, Result};
use diesel::prelude::*;
use tracing_subscriber::EnvFilter;
use uuid::Uuid;

use tourdesk::{
    config::AppConfig,
    db,
    participation::{ParticipationStore, PgParticipationStore},
    schema::tours,
};

const USAGE: &str = "Usage: maintenance recount-participants";

#[tokio::main]
async fn main() -> Result<()> {
    dotenv::dotenv().ok();
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));
    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_target(false)
        .compact()
        .init();

    let mut args = env::args().skip(1);
    match args.next().as_deref() {
        Some("recount-participants") => recount_participants().await?,
        Some(cmd) => {
            eprintln!("Unknown command: {cmd}\n{USAGE}");
            std::process::exit(1);
        }
        None => {
            eprintln!("{USAGE}");
            std::process::exit(1);
        }
    }

    Ok(())
}

/// Rewrites every tour's cached `participant_count` from its approved rows.
async fn recount_participants() -> Result<()> {
    let config = AppConfig::from_env()?;
    tracing::info!(
        component = "maintenance",
        database_url = %config.redacted_database_url(),
        pool_size = config.database_max_pool_size,
        "loaded tourdesk configuration"
    );
    let pool = db::init_pool_with_size(&config.database_url, config.database_max_pool_size)?;

    let listing_pool = pool.clone();
    let cached: Vec<(Uuid, i32)> = tokio::task::spawn_blocking(move || -> Result<_> {
        let mut conn = listing_pool
            .get()
            .context("failed to get database connection")?;
        tours::table
            .select((tours::id, tours::participant_count))
            .order(tours::start_date.asc())
            .load(&mut conn)
            .context("failed to load tours")
    })
    .await
    .context("tour listing task panicked")??;

    if cached.is_empty() {
        println!("No tours found.");
        return Ok(());
    }

    let store = PgParticipationStore::new(pool);
    let mut corrected = 0usize;
    for (tour_id, before) in &cached {
        let after = store
            .refresh_participant_count(*tour_id)
            .await
            .with_context(|| format!("failed to recount tour {tour_id}"))?;
        if after != *before {
            corrected += 1;
            println!("Tour {tour_id}: {before} -> {after}");
        }
    }

    println!(
        "Recounted {} tours, corrected {corrected}.",
        cached.len()
    );
    Ok(())
}
