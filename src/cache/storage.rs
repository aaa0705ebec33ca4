//! Cache storage trait and SQLite implementation.

use chrono::{DateTime, Utc};
use color_eyre::{eyre::eyre, Result};
use rusqlite::{params, Connection, OptionalExtension, Row};
use std::path::Path;
use std::sync::{Mutex, MutexGuard};

use super::row::PokemonRow;

/// Trait for cache storage backends.
pub trait CacheStorage: Send + Sync {
  /// Rows in `[offset, offset + limit)`, ordered by id.
  fn get_page(&self, offset: u32, limit: u32) -> Result<Vec<PokemonRow>>;

  /// A single row by name.
  fn get_by_key(&self, name: &str) -> Result<Option<PokemonRow>>;

  /// Insert or replace a single row.
  fn upsert(&self, row: &PokemonRow) -> Result<()>;

  /// Insert or replace several rows in one transaction.
  fn upsert_many(&self, rows: &[PokemonRow]) -> Result<()>;

  /// Every cached row, ordered by id.
  fn get_all(&self) -> Result<Vec<PokemonRow>>;
}

/// Storage implementation that doesn't cache anything.
/// Used when caching is disabled - all operations are no-ops.
pub struct NoopStorage;

impl CacheStorage for NoopStorage {
  fn get_page(&self, _offset: u32, _limit: u32) -> Result<Vec<PokemonRow>> {
    Ok(Vec::new()) // Always miss
  }

  fn get_by_key(&self, _name: &str) -> Result<Option<PokemonRow>> {
    Ok(None) // Always miss
  }

  fn upsert(&self, _row: &PokemonRow) -> Result<()> {
    Ok(()) // Discard
  }

  fn upsert_many(&self, _rows: &[PokemonRow]) -> Result<()> {
    Ok(()) // Discard
  }

  fn get_all(&self) -> Result<Vec<PokemonRow>> {
    Ok(Vec::new())
  }
}

/// SQLite-based cache storage implementation.
pub struct SqliteStorage {
  conn: Mutex<Connection>,
}

impl SqliteStorage {
  /// Open or create the database at `path`.
  pub fn open(path: &Path) -> Result<Self> {
    // Ensure parent directory exists
    if let Some(parent) = path.parent() {
      std::fs::create_dir_all(parent)
        .map_err(|e| eyre!("Failed to create cache directory: {}", e))?;
    }

    let conn = Connection::open(path)
      .map_err(|e| eyre!("Failed to open cache database at {}: {}", path.display(), e))?;

    Self::with_connection(conn)
  }

  /// Open a private in-memory database.
  #[cfg(test)]
  pub fn open_in_memory() -> Result<Self> {
    let conn = Connection::open_in_memory()
      .map_err(|e| eyre!("Failed to open in-memory database: {}", e))?;
    Self::with_connection(conn)
  }

  fn with_connection(conn: Connection) -> Result<Self> {
    let storage = Self {
      conn: Mutex::new(conn),
    };
    storage.run_migrations()?;
    Ok(storage)
  }

  fn lock(&self) -> Result<MutexGuard<'_, Connection>> {
    self
      .conn
      .lock()
      .map_err(|e| eyre!("Lock poisoned: {}", e))
  }

  /// Run database migrations for cache tables.
  fn run_migrations(&self) -> Result<()> {
    self
      .lock()?
      .execute_batch(CACHE_SCHEMA)
      .map_err(|e| eyre!("Failed to run cache migrations: {}", e))?;

    Ok(())
  }
}

/// Schema for cache tables.
const CACHE_SCHEMA: &str = r#"
CREATE TABLE IF NOT EXISTS pokemon (
    name TEXT PRIMARY KEY NOT NULL,
    url TEXT NOT NULL,
    id INTEGER NOT NULL,
    base_experience INTEGER NOT NULL,
    height INTEGER NOT NULL,
    weight INTEGER NOT NULL,
    types TEXT NOT NULL,
    image_url TEXT,
    image_file TEXT,
    cached_at TEXT NOT NULL DEFAULT (datetime('now'))
);

CREATE INDEX IF NOT EXISTS idx_pokemon_id ON pokemon(id);
"#;

const SELECT_COLUMNS: &str =
  "SELECT name, url, id, base_experience, height, weight, types, image_url, image_file, cached_at
   FROM pokemon";

const UPSERT: &str =
  "INSERT OR REPLACE INTO pokemon
   (name, url, id, base_experience, height, weight, types, image_url, image_file, cached_at)
   VALUES (?, ?, ?, ?, ?, ?, ?, ?, ?, datetime('now'))";

fn row_from_sql(row: &Row<'_>) -> rusqlite::Result<(PokemonRow, String)> {
  let image_url: Option<String> = row.get(7)?;
  let image_file: Option<String> = row.get(8)?;
  Ok((
    PokemonRow {
      name: row.get(0)?,
      url: row.get(1)?,
      id: row.get(2)?,
      base_experience: row.get(3)?,
      height: row.get(4)?,
      weight: row.get(5)?,
      types: row.get(6)?,
      image_url: image_url.unwrap_or_default(),
      image_file: image_file.unwrap_or_default(),
      cached_at: None,
    },
    row.get(9)?,
  ))
}

fn with_cached_at((mut row, cached_at): (PokemonRow, String)) -> Result<PokemonRow> {
  row.cached_at = Some(parse_datetime(&cached_at)?);
  Ok(row)
}

fn upsert_params(conn: &Connection, row: &PokemonRow) -> Result<()> {
  conn
    .execute(
      UPSERT,
      params![
        row.name,
        row.url,
        row.id,
        row.base_experience,
        row.height,
        row.weight,
        row.types,
        row.image_url,
        row.image_file
      ],
    )
    .map_err(|e| eyre!("Failed to store pokemon {}: {}", row.name, e))?;
  Ok(())
}

impl SqliteStorage {
  fn query_rows(&self, sql: &str, params: impl rusqlite::Params) -> Result<Vec<PokemonRow>> {
    let conn = self.lock()?;

    let mut stmt = conn
      .prepare(sql)
      .map_err(|e| eyre!("Failed to prepare query: {}", e))?;

    let rows = stmt
      .query_map(params, row_from_sql)
      .map_err(|e| eyre!("Failed to query pokemon: {}", e))?
      .collect::<rusqlite::Result<Vec<_>>>()
      .map_err(|e| eyre!("Failed to read pokemon row: {}", e))?;

    rows.into_iter().map(with_cached_at).collect()
  }
}

impl CacheStorage for SqliteStorage {
  fn get_page(&self, offset: u32, limit: u32) -> Result<Vec<PokemonRow>> {
    self.query_rows(
      &format!("{} ORDER BY id, name LIMIT ? OFFSET ?", SELECT_COLUMNS),
      params![limit, offset],
    )
  }

  fn get_by_key(&self, name: &str) -> Result<Option<PokemonRow>> {
    let conn = self.lock()?;

    let mut stmt = conn
      .prepare(&format!("{} WHERE name = ?", SELECT_COLUMNS))
      .map_err(|e| eyre!("Failed to prepare query: {}", e))?;

    let result = stmt
      .query_row(params![name], row_from_sql)
      .optional()
      .map_err(|e| eyre!("Failed to look up pokemon {}: {}", name, e))?;

    result.map(with_cached_at).transpose()
  }

  fn upsert(&self, row: &PokemonRow) -> Result<()> {
    let conn = self.lock()?;
    upsert_params(&conn, row)
  }

  fn upsert_many(&self, rows: &[PokemonRow]) -> Result<()> {
    let mut conn = self.lock()?;

    let tx = conn
      .transaction()
      .map_err(|e| eyre!("Failed to begin transaction: {}", e))?;

    for row in rows {
      upsert_params(&tx, row)?;
    }

    tx.commit()
      .map_err(|e| eyre!("Failed to commit transaction: {}", e))?;

    Ok(())
  }

  fn get_all(&self) -> Result<Vec<PokemonRow>> {
    self.query_rows(&format!("{} ORDER BY id, name", SELECT_COLUMNS), params![])
  }
}

/// Parse a datetime string from SQLite format.
fn parse_datetime(s: &str) -> Result<DateTime<Utc>> {
  // SQLite stores as "YYYY-MM-DD HH:MM:SS"
  chrono::NaiveDateTime::parse_from_str(s, "%Y-%m-%d %H:%M:%S")
    .map(|dt| dt.and_utc())
    .map_err(|e| eyre!("Failed to parse datetime '{}': {}", s, e))
}
