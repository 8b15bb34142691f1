//! CLI subcommand implementations.

pub mod chart;
pub mod counter;
pub mod list;
pub mod show;
pub mod transfer;
pub mod util;

use std::io::Write;

use anyhow::{Context, Result};
use chrono::Utc;
use tally_db::Database;
use tally_store::StateStore;

use crate::{Commands, Config};

/// Opens the database named by `config`, creating its directory if needed, and
/// waits until every counter has its first summary.
pub async fn open_store(config: &Config) -> Result<StateStore> {
    if let Some(parent) = config.database_path.parent() {
        std::fs::create_dir_all(parent).context("failed to create database directory")?;
    }
    let db = Database::open(&config.database_path).context("failed to open database")?;
    let store = StateStore::open(db, config.store_config())
        .await
        .context("failed to load counters")?;
    store.wait_until_loaded().await;
    Ok(store)
}

/// Runs one subcommand against a freshly opened store, closing it afterwards
/// whether or not the command succeeded.
pub async fn run<W: Write>(command: &Commands, config: &Config, writer: &mut W) -> Result<()> {
    let store = open_store(config).await?;
    let result = dispatch(&store, command, config, writer).await;
    store.close().await;
    result
}

async fn dispatch<W: Write>(
    store: &StateStore,
    command: &Commands,
    config: &Config,
    writer: &mut W,
) -> Result<()> {
    let now = Utc::now();
    let calendar = config.calendar();
    match command {
        Commands::Add { name, settings } => {
            counter::add(store, writer, &config.store_config(), name, settings, now).await
        }
        Commands::Edit { name, settings } => {
            counter::edit(store, writer, name, settings, now).await
        }
        Commands::Inc { name, at } => {
            counter::increment(store, writer, name, at.as_deref(), now).await
        }
        Commands::Dec { name } => counter::decrement(store, writer, name, calendar).await,
        Commands::Undo { name, minutes } => {
            counter::undo(store, writer, name, *minutes, calendar).await
        }
        Commands::Rename { old, new } => counter::rename(store, writer, old, new).await,
        Commands::Delete { name } => counter::delete(store, writer, name).await,
        Commands::Reset { name } => counter::reset(store, writer, name).await,
        Commands::List {
            category,
            categories,
            json,
        } => list::run(store, writer, category.as_deref(), *categories, *json, now).await,
        Commands::Show { name, json } => {
            show::run(store, writer, name, *json, calendar, now).await
        }
        Commands::Chart {
            name,
            interval,
            last,
        } => chart::run(store, writer, name, *interval, *last, now).await,
        Commands::Export { output, extended } => {
            transfer::export(store, writer, output.as_deref(), *extended).await
        }
        Commands::Import { input } => transfer::import(store, writer, input.as_deref()).await,
        Commands::Order { names } => counter::order(store, writer, names).await,
    }
}
