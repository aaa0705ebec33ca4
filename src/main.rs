mod cache;
mod config;
mod images;
mod logging;
mod pokeapi;
mod sync;

use clap::{Parser, Subcommand};
use color_eyre::{eyre::eyre, Result};
use std::path::PathBuf;
use std::sync::Arc;
use tokio::sync::mpsc;
use tracing::{debug, info};

use crate::cache::{CacheStorage, NoopStorage, SqliteStorage};
use crate::images::ImageStore;
use crate::pokeapi::{PokeApiClient, Pokemon};
use crate::sync::{SyncController, SyncEvent};

#[derive(Parser, Debug)]
#[command(name = "pokesync")]
#[command(about = "Browse PokeAPI with an offline SQLite cache")]
#[command(version)]
struct Args {
  /// Path to config file (default: $XDG_CONFIG_HOME/pokesync/config.yaml)
  #[arg(short, long)]
  config: Option<PathBuf>,

  /// Override the configured page size
  #[arg(long)]
  page_size: Option<u32>,

  /// Mirror logs to stderr
  #[arg(short, long)]
  verbose: bool,

  #[command(subcommand)]
  command: Command,
}

#[derive(Subcommand, Debug)]
enum Command {
  /// Load pages of pokemon (cache first) and print them
  List {
    /// Number of pages to load
    #[arg(short, long, default_value_t = 1)]
    pages: u32,
  },
  /// Page through pokemon interactively (Enter: next page, r: reload,
  /// retry: refetch missing detail, q: quit)
  Browse,
  /// Show a cached pokemon and resolve its artwork file
  Show {
    name: String,
  },
  /// Print every cached row
  Cached,
}

#[tokio::main]
async fn main() -> Result<()> {
  color_eyre::install()?;

  let args = Args::parse();

  let _log_guard = logging::init(&config::data_dir()?, args.verbose)?;

  // Load configuration
  let config = config::Config::load(args.config.as_deref())?;

  // Override page size if specified on command line
  let config = if let Some(page_size) = args.page_size {
    config::Config { page_size, ..config }
  } else {
    config
  };
  config.validate()?;

  let storage: Arc<dyn CacheStorage> = if config.cache.enabled {
    Arc::new(SqliteStorage::open(&config.cache_path()?)?)
  } else {
    info!("Cache disabled, every page will be fetched remotely");
    Arc::new(NoopStorage)
  };

  let client = PokeApiClient::new(&config)?;
  let (events_tx, events_rx) = mpsc::unbounded_channel();
  let sync = SyncController::new(client, storage, config.page_size, events_tx);
  tokio::spawn(log_events(events_rx));

  match args.command {
    Command::List { pages } => list(&sync, pages).await,
    Command::Browse => browse(&sync).await,
    Command::Show { name } => show(&sync, &ImageStore::new(config.images_dir()?), &name).await,
    Command::Cached => cached(&sync),
  }
}

async fn log_events(mut rx: mpsc::UnboundedReceiver<SyncEvent>) {
  while let Some(event) = rx.recv().await {
    match event {
      SyncEvent::MapChanged(snapshot) => {
        debug!("Map v{}: {} pokemon", snapshot.version, snapshot.len())
      }
      SyncEvent::LoadFailed(msg) => tracing::error!("Load failed: {}", msg),
    }
  }
}

async fn list(sync: &SyncController<PokeApiClient>, pages: u32) -> Result<()> {
  for page in 0..pages {
    if !sync.has_more()? {
      break;
    }
    let load = sync.load_page(page == 0).await?;
    debug!("Page {} from {:?}: {} pokemon", page, load.source, load.keys.len());
  }
  sync.settle().await?;
  print_map(sync)
}

async fn browse(sync: &SyncController<PokeApiClient>) -> Result<()> {
  use tokio::io::{AsyncBufReadExt, BufReader};

  let mut lines = BufReader::new(tokio::io::stdin()).lines();
  // Some(reload) loads a page before printing; None only reprints
  let mut next: Option<bool> = Some(true);

  loop {
    match next {
      Some(reload) if reload || sync.has_more()? => {
        // A failed list load has already reset the cursor; the next Enter retries
        if let Err(e) = sync.load_page(reload).await {
          println!("Failed to load pokemon: {}", e);
        }
        sync.settle().await?;
      }
      Some(_) => println!("No more pokemon"),
      None => {}
    }
    print_map(sync)?;
    println!("[Enter] next page  [r] reload  [retry] missing detail  [q] quit");

    let Some(line) = lines
      .next_line()
      .await
      .map_err(|e| eyre!("Failed to read input: {}", e))?
    else {
      return Ok(());
    };

    next = match line.trim() {
      "q" | "quit" => return Ok(()),
      "r" | "reload" => Some(true),
      "retry" => {
        let snapshot = sync.snapshot()?;
        for pokemon in snapshot.entries.values().filter(|p| p.detail.is_none()) {
          sync.fetch_detail(&pokemon.name).await?;
        }
        None
      }
      _ => Some(false),
    };
  }
}

fn print_map(sync: &SyncController<PokeApiClient>) -> Result<()> {
  let snapshot = sync.snapshot()?;
  if snapshot.is_empty() {
    println!("No pokemon loaded, next offset {}", sync.offset()?);
    return Ok(());
  }
  println!(
    "{:>5}  {:<16} {:<18} {:>6} {:>6} {:>6}",
    "ID", "NAME", "TYPES", "EXP", "HEIGHT", "WEIGHT"
  );
  for pokemon in snapshot.sorted() {
    print_row(pokemon);
  }
  println!("{} pokemon, next offset {}", snapshot.len(), sync.offset()?);
  Ok(())
}

fn print_row(pokemon: &Pokemon) {
  match &pokemon.detail {
    Some(d) => println!(
      "{:>5}  {:<16} {:<18} {:>6} {:>6} {:>6}",
      d.id,
      pokemon.name,
      pokemon.types_label(),
      d.base_experience,
      d.height,
      d.weight
    ),
    None => println!("{:>5}  {:<16} (detail unavailable)", "-", pokemon.name),
  }
}

async fn show(sync: &SyncController<PokeApiClient>, images: &ImageStore, name: &str) -> Result<()> {
  let pokemon = sync
    .storage()
    .get_by_key(name)?
    .map(|row| row.into_pokemon())
    .ok_or_else(|| eyre!("{} is not cached yet; run `pokesync list` first", name))?;

  let detail = pokemon
    .detail
    .as_ref()
    .ok_or_else(|| eyre!("No detail loaded for {}", name))?;

  println!("{} (#{})", pokemon.name, detail.id);
  println!("  types:           {}", pokemon.types_label());
  println!("  base experience: {}", detail.base_experience);
  println!("  height:          {}", detail.height);
  println!("  weight:          {}", detail.weight);
  println!("  loaded from:     {:?}", detail.origin);

  debug!("Resolving image into {}", images.dir().display());
  match images.resolve(sync, &pokemon).await {
    Ok(path) => println!("  image:           {}", path.display()),
    Err(e) => println!("  image:           unavailable ({})", e),
  }
  Ok(())
}

fn cached(sync: &SyncController<PokeApiClient>) -> Result<()> {
  let rows = sync.storage().get_all()?;
  for row in &rows {
    let cached_at = row
      .cached_at
      .map(|t| t.format("%Y-%m-%d %H:%M").to_string())
      .unwrap_or_default();
    println!(
      "{:>5}  {:<16} {:<18} {:<16} {}",
      row.id,
      row.name,
      row.types_label(),
      cached_at,
      row.image_file
    );
  }
  println!("{} cached pokemon", rows.len());
  Ok(())
}
