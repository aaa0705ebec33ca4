//! Pagination and cache reconciliation for the collected pokemon map.
//!
//! `SyncController` owns an offset cursor and a name -> pokemon map. Each
//! `load_page` call serves the next page from the local cache when it can and
//! falls back to the remote list otherwise. Remote summaries arrive without
//! detail; one detail fetch is spawned per summary still lacking detail, and
//! each completion is merged into the map and written through to the cache.
//!
//! The map is copy-on-write: every mutation bumps a version number and
//! publishes an immutable [`MapSnapshot`] on the event channel.

use color_eyre::{eyre::eyre, Result};
use std::collections::HashMap;
use std::path::Path;
use std::sync::{Arc, Mutex, MutexGuard};
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

use crate::cache::{CacheStorage, PokemonRow};
use crate::pokeapi::{Pokemon, PokemonDetail, PokemonSource, PokemonSummary};

/// Events published by the controller
#[derive(Debug, Clone)]
pub enum SyncEvent {
  /// The collected map changed
  MapChanged(MapSnapshot),
  /// The remote list could not be loaded; pagination was reset
  LoadFailed(String),
}

/// Immutable view of the collected map at one version
#[derive(Debug, Clone, Default)]
pub struct MapSnapshot {
  pub version: u64,
  pub entries: Arc<HashMap<String, Pokemon>>,
}

impl MapSnapshot {
  pub fn len(&self) -> usize {
    self.entries.len()
  }

  pub fn is_empty(&self) -> bool {
    self.entries.is_empty()
  }

  #[cfg(test)]
  pub fn get(&self, name: &str) -> Option<&Pokemon> {
    self.entries.get(name)
  }

  /// Entries ordered by id then name, with detail-less entries last.
  pub fn sorted(&self) -> Vec<&Pokemon> {
    let mut list: Vec<&Pokemon> = self.entries.values().collect();
    list.sort_by(|a, b| {
      a.detail
        .is_none()
        .cmp(&b.detail.is_none())
        .then(a.id().cmp(&b.id()))
        .then_with(|| a.name.cmp(&b.name))
    });
    list
  }
}

/// Where a page was served from
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PageSource {
  Cache,
  Remote,
}

/// Outcome of a successful `load_page`
#[derive(Debug, Clone)]
pub struct PageLoad {
  pub source: PageSource,
  /// Names merged by this page, in the order they were served
  pub keys: Vec<String>,
}

struct SyncState {
  offset: u32,
  /// Total reported by the remote list, once known
  total: Option<u32>,
  /// Bumped on every reload; detail fetches from older generations are dropped
  generation: u64,
  version: u64,
  entries: Arc<HashMap<String, Pokemon>>,
}

struct Inner<P> {
  source: P,
  storage: Arc<dyn CacheStorage>,
  page_size: u32,
  state: Mutex<SyncState>,
  pending: Mutex<Vec<JoinHandle<()>>>,
  events: mpsc::UnboundedSender<SyncEvent>,
}

/// Cache-first paginated loader.
///
/// Calls to `load_page` are expected from a single task at a time; detail
/// fetches run concurrently and only ever touch their own map entry.
pub struct SyncController<P: PokemonSource> {
  inner: Arc<Inner<P>>,
}

impl<P: PokemonSource> Clone for SyncController<P> {
  fn clone(&self) -> Self {
    Self {
      inner: Arc::clone(&self.inner),
    }
  }
}

impl<P: PokemonSource> SyncController<P> {
  pub fn new(
    source: P,
    storage: Arc<dyn CacheStorage>,
    page_size: u32,
    events: mpsc::UnboundedSender<SyncEvent>,
  ) -> Self {
    Self {
      inner: Arc::new(Inner {
        source,
        storage,
        page_size,
        state: Mutex::new(SyncState {
          offset: 0,
          total: None,
          generation: 0,
          version: 0,
          entries: Arc::new(HashMap::new()),
        }),
        pending: Mutex::new(Vec::new()),
        events,
      }),
    }
  }

  fn lock_state(&self) -> Result<MutexGuard<'_, SyncState>> {
    self
      .inner
      .state
      .lock()
      .map_err(|e| eyre!("Lock poisoned: {}", e))
  }

  /// Bump the version and publish the current map.
  fn publish(&self, state: &mut SyncState) {
    state.version += 1;
    let snapshot = MapSnapshot {
      version: state.version,
      entries: Arc::clone(&state.entries),
    };
    // Nobody listening is fine
    let _ = self.inner.events.send(SyncEvent::MapChanged(snapshot));
  }

  pub fn offset(&self) -> Result<u32> {
    Ok(self.lock_state()?.offset)
  }

  pub fn snapshot(&self) -> Result<MapSnapshot> {
    let state = self.lock_state()?;
    Ok(MapSnapshot {
      version: state.version,
      entries: Arc::clone(&state.entries),
    })
  }

  /// False once the cursor has passed the remote total.
  pub fn has_more(&self) -> Result<bool> {
    let state = self.lock_state()?;
    Ok(state.total.map_or(true, |total| state.offset < total))
  }

  /// Load the next page, from the cache if it has rows at the cursor,
  /// otherwise from the remote list.
  ///
  /// With `reload`, the cursor and map are reset first. A remote failure also
  /// resets them and publishes [`SyncEvent::LoadFailed`]; the caller retries
  /// with `load_page(true)`.
  pub async fn load_page(&self, reload: bool) -> Result<PageLoad> {
    let limit = self.inner.page_size;

    let (offset, generation) = {
      let mut state = self.lock_state()?;
      if reload {
        state.offset = 0;
        state.total = None;
        state.generation += 1;
        Arc::make_mut(&mut state.entries).clear();
        self.publish(&mut state);
      }
      (state.offset, state.generation)
    };
    let next_offset = offset
      .checked_add(limit)
      .ok_or_else(|| eyre!("Offset {} is at the end of the page range", offset))?;

    match self.inner.storage.get_page(offset, limit) {
      Ok(rows) if !rows.is_empty() => {
        let keys = self.merge_cached(rows, next_offset)?;
        info!("Loaded {} pokemon from cache at offset {}", keys.len(), offset);
        return Ok(PageLoad {
          source: PageSource::Cache,
          keys,
        });
      }
      Ok(_) => {}
      Err(e) => warn!("Cache read failed at offset {}: {}", offset, e),
    }

    match self.inner.source.fetch_page(offset, limit).await {
      Ok(page) => {
        let (keys, missing) = self.merge_summaries(page.results, page.count, next_offset)?;
        info!(
          "Loaded {} pokemon from remote at offset {} (total {})",
          keys.len(),
          offset,
          page.count
        );

        for key in missing {
          self.spawn_detail(key, generation)?;
        }

        Ok(PageLoad {
          source: PageSource::Remote,
          keys,
        })
      }
      Err(e) => {
        warn!("Failed to load pokemon list at offset {}: {}", offset, e);
        {
          let mut state = self.lock_state()?;
          state.offset = 0;
          state.total = None;
          Arc::make_mut(&mut state.entries).clear();
          self.publish(&mut state);
        }
        let _ = self.inner.events.send(SyncEvent::LoadFailed(e.to_string()));
        Err(e)
      }
    }
  }

  /// Merge a page of cache rows and move the cursor to `next_offset`.
  fn merge_cached(&self, rows: Vec<PokemonRow>, next_offset: u32) -> Result<Vec<String>> {
    let mut state = self.lock_state()?;
    let entries = Arc::make_mut(&mut state.entries);

    let keys: Vec<String> = rows
      .into_iter()
      .map(|row| {
        let pokemon = row.into_pokemon();
        let key = pokemon.name.clone();
        entries.insert(key.clone(), pokemon);
        key
      })
      .collect();

    state.offset = next_offset;
    self.publish(&mut state);
    Ok(keys)
  }

  /// Merge remote summaries and move the cursor to `next_offset`.
  ///
  /// A summary for a name already in the map only replaces its summary
  /// fields; existing detail is kept. Returns every merged name, and
  /// separately the names that still have no detail.
  fn merge_summaries(
    &self,
    summaries: Vec<PokemonSummary>,
    total: u32,
    next_offset: u32,
  ) -> Result<(Vec<String>, Vec<String>)> {
    let mut state = self.lock_state()?;
    let entries = Arc::make_mut(&mut state.entries);

    let mut keys = Vec::with_capacity(summaries.len());
    let mut missing = Vec::new();
    for summary in summaries {
      let merged = match entries.get(&summary.name) {
        Some(existing) => existing.with_summary(&summary),
        None => Pokemon::from_summary(summary),
      };
      let key = merged.name.clone();
      if merged.detail.is_none() {
        missing.push(key.clone());
      }
      entries.insert(key.clone(), merged);
      keys.push(key);
    }

    state.total = Some(total);
    state.offset = next_offset;
    self.publish(&mut state);
    Ok((keys, missing))
  }

  fn spawn_detail(&self, key: String, generation: u64) -> Result<()> {
    let this = self.clone();
    let handle = tokio::spawn(async move { this.fetch_detail_for(&key, generation).await });

    let mut pending = self
      .inner
      .pending
      .lock()
      .map_err(|e| eyre!("Lock poisoned: {}", e))?;
    pending.retain(|h| !h.is_finished());
    pending.push(handle);
    Ok(())
  }

  /// Fetch detail for `key` and merge it into the current map.
  pub async fn fetch_detail(&self, key: &str) -> Result<()> {
    let generation = self.lock_state()?.generation;
    self.fetch_detail_for(key, generation).await;
    Ok(())
  }

  async fn fetch_detail_for(&self, key: &str, generation: u64) {
    match self.inner.source.fetch_detail(key).await {
      Ok(detail) => {
        if let Err(e) = self.merge_detail(key, detail, generation) {
          warn!("Failed to store detail for {}: {}", key, e);
        }
      }
      Err(e) => warn!("Failed to fetch detail for {}: {}", key, e),
    }
  }

  /// Merge fetched detail onto the entry for `key` and write it through.
  ///
  /// An image file already recorded on the entry survives the merge. The
  /// cache write happens under the state lock so the store sees writes to a
  /// key in the same order as the map.
  fn merge_detail(&self, key: &str, mut detail: PokemonDetail, generation: u64) -> Result<()> {
    let mut state = self.lock_state()?;
    if state.generation != generation {
      debug!("Discarding detail for {} from a previous load", key);
      return Ok(());
    }
    let merged = match state.entries.get(key) {
      Some(current) => {
        if let Some(existing) = &current.detail {
          if detail.image_file.is_empty() && !existing.image_file.is_empty() {
            detail.image_file = existing.image_file.clone();
          }
        }
        current.with_detail(detail)
      }
      None => {
        debug!("Discarding detail for {}: no longer in the map", key);
        return Ok(());
      }
    };
    Arc::make_mut(&mut state.entries).insert(key.to_string(), merged.clone());
    self.publish(&mut state);

    self.inner.storage.upsert(&PokemonRow::from(&merged))
  }

  /// Record a downloaded image file on `pokemon` and persist it.
  ///
  /// The map entry is preferred over the passed value when present, so that
  /// detail merged since the caller's snapshot is not lost.
  pub fn record_image_file(&self, pokemon: &Pokemon, path: &Path) -> Result<Pokemon> {
    let image_file = path.to_string_lossy().into_owned();

    let mut state = self.lock_state()?;
    let base = state.entries.get(&pokemon.name).unwrap_or(pokemon);
    let detail = base
      .detail
      .clone()
      .ok_or_else(|| eyre!("Pokemon {} has no detail to attach an image to", pokemon.name))?;
    let updated = base.with_detail(PokemonDetail {
      image_file,
      ..detail
    });

    // Written under the state lock, so the store never lags the map
    self.inner.storage.upsert(&PokemonRow::from(&updated))?;
    if state.entries.contains_key(&pokemon.name) {
      Arc::make_mut(&mut state.entries).insert(pokemon.name.clone(), updated.clone());
      self.publish(&mut state);
    }
    Ok(updated)
  }

  /// Wait for every in-flight detail fetch to finish.
  pub async fn settle(&self) -> Result<()> {
    loop {
      let handles = {
        let mut pending = self
          .inner
          .pending
          .lock()
          .map_err(|e| eyre!("Lock poisoned: {}", e))?;
        std::mem::take(&mut *pending)
      };
      if handles.is_empty() {
        return Ok(());
      }

      for result in futures::future::join_all(handles).await {
        if let Err(e) = result {
          warn!("Detail task failed: {}", e);
        }
      }
    }
  }

  /// Read-through access to the cache store.
  pub fn storage(&self) -> &Arc<dyn CacheStorage> {
    &self.inner.storage
  }

  pub fn source(&self) -> &P {
    &self.inner.source
  }
}

#[cfg(test)]
mod tests {
  use super::*;
  use crate::cache::{NoopStorage, SqliteStorage};
  use crate::pokeapi::{Origin, RemotePage};
  use std::collections::HashSet;
  use std::sync::atomic::{AtomicBool, AtomicU32, Ordering};

  #[derive(Default)]
  struct FakeInner {
    total: u32,
    fail_list: AtomicBool,
    fail_all_details: AtomicBool,
    fail_details: Mutex<HashSet<String>>,
    list_calls: AtomicU32,
    detail_calls: AtomicU32,
  }

  #[derive(Clone, Default)]
  struct FakeSource {
    inner: Arc<FakeInner>,
  }

  impl FakeSource {
    fn with_total(total: u32) -> Self {
      Self {
        inner: Arc::new(FakeInner {
          total,
          ..Default::default()
        }),
      }
    }

    fn list_calls(&self) -> u32 {
      self.inner.list_calls.load(Ordering::SeqCst)
    }

    fn detail_calls(&self) -> u32 {
      self.inner.detail_calls.load(Ordering::SeqCst)
    }
  }

  fn name(index: u32) -> String {
    format!("p{:03}", index)
  }

  fn fake_detail(id: u32) -> PokemonDetail {
    PokemonDetail {
      id,
      base_experience: id * 3,
      height: 7,
      weight: 69,
      types: vec!["grass".to_string(), "poison".to_string()],
      image_url: format!("https://img/{}.png", id),
      image_file: String::new(),
      origin: Origin::Remote,
    }
  }

  impl PokemonSource for FakeSource {
    async fn fetch_page(&self, offset: u32, limit: u32) -> Result<RemotePage> {
      self.inner.list_calls.fetch_add(1, Ordering::SeqCst);
      if self.inner.fail_list.load(Ordering::SeqCst) {
        return Err(eyre!("HTTP status server error (500 Internal Server Error)"));
      }
      let end = offset.saturating_add(limit).min(self.inner.total);
      let results = (offset..end)
        .map(|i| PokemonSummary {
          name: name(i),
          url: format!("https://fake/pokemon/{}/", i + 1),
        })
        .collect();
      Ok(RemotePage {
        count: self.inner.total,
        results,
      })
    }

    async fn fetch_detail(&self, name: &str) -> Result<PokemonDetail> {
      self.inner.detail_calls.fetch_add(1, Ordering::SeqCst);
      if self.inner.fail_all_details.load(Ordering::SeqCst)
        || self.inner.fail_details.lock().unwrap().contains(name)
      {
        return Err(eyre!("HTTP status client error (404 Not Found)"));
      }
      let index: u32 = name[1..].parse().unwrap();
      Ok(fake_detail(index + 1))
    }

    async fn fetch_image(&self, _url: &str) -> Result<Vec<u8>> {
      Ok(Vec::new())
    }
  }

  fn cached_row(index: u32) -> PokemonRow {
    PokemonRow::from(&Pokemon {
      name: name(index),
      url: format!("https://fake/pokemon/{}/", index + 1),
      detail: Some(fake_detail(index + 1)),
    })
  }

  fn controller(
    source: &FakeSource,
    storage: Arc<dyn CacheStorage>,
  ) -> (
    SyncController<FakeSource>,
    mpsc::UnboundedReceiver<SyncEvent>,
  ) {
    let (tx, rx) = mpsc::unbounded_channel();
    (SyncController::new(source.clone(), storage, 10, tx), rx)
  }

  fn drain(rx: &mut mpsc::UnboundedReceiver<SyncEvent>) -> Vec<SyncEvent> {
    let mut events = Vec::new();
    while let Ok(event) = rx.try_recv() {
      events.push(event);
    }
    events
  }

  #[tokio::test]
  async fn test_cold_remote_page() {
    let source = FakeSource::with_total(120);
    let storage: Arc<dyn CacheStorage> = Arc::new(SqliteStorage::open_in_memory().unwrap());
    let (sync, _rx) = controller(&source, storage.clone());

    let load = sync.load_page(true).await.unwrap();
    assert_eq!(load.source, PageSource::Remote);
    assert_eq!(load.keys.len(), 10);
    assert_eq!(sync.offset().unwrap(), 10);

    // Detail tasks have not run yet on the current-thread runtime
    let snapshot = sync.snapshot().unwrap();
    assert_eq!(snapshot.len(), 10);
    assert!(snapshot.entries.values().all(|p| p.detail.is_none()));

    sync.settle().await.unwrap();
    assert_eq!(source.detail_calls(), 10);

    let snapshot = sync.snapshot().unwrap();
    assert!(snapshot.entries.values().all(|p| p.detail.is_some()));
    assert_eq!(storage.get_all().unwrap().len(), 10);

    let row = storage.get_by_key(&name(3)).unwrap().unwrap();
    assert_eq!(row.id, 4);
    assert_eq!(row.types, "grass, poison");
  }

  #[tokio::test]
  async fn test_second_page_served_from_cache() {
    let source = FakeSource::with_total(120);
    let storage: Arc<dyn CacheStorage> = Arc::new(SqliteStorage::open_in_memory().unwrap());
    let (sync, _rx) = controller(&source, storage.clone());

    sync.load_page(true).await.unwrap();
    sync.settle().await.unwrap();

    let rows: Vec<PokemonRow> = (10..20).map(cached_row).collect();
    storage.upsert_many(&rows).unwrap();

    let load = sync.load_page(false).await.unwrap();
    sync.settle().await.unwrap();

    assert_eq!(load.source, PageSource::Cache);
    assert_eq!(source.list_calls(), 1);
    assert_eq!(source.detail_calls(), 10);
    assert_eq!(sync.offset().unwrap(), 20);

    let snapshot = sync.snapshot().unwrap();
    assert_eq!(snapshot.len(), 20);
    for i in 10..20 {
      let pokemon = snapshot.get(&name(i)).unwrap();
      assert_eq!(pokemon.detail.as_ref().unwrap().origin, Origin::Cache);
    }
  }

  #[tokio::test]
  async fn test_remote_failure_resets_state() {
    let source = FakeSource::with_total(120);
    let (sync, mut rx) = controller(&source, Arc::new(NoopStorage));

    sync.load_page(true).await.unwrap();
    assert_eq!(sync.offset().unwrap(), 10);
    drain(&mut rx);

    source.inner.fail_list.store(true, Ordering::SeqCst);
    assert!(sync.load_page(false).await.is_err());

    assert_eq!(sync.offset().unwrap(), 0);
    assert!(sync.snapshot().unwrap().is_empty());
    assert!(drain(&mut rx)
      .iter()
      .any(|e| matches!(e, SyncEvent::LoadFailed(msg) if msg.contains("500"))));
  }

  #[tokio::test]
  async fn test_reload_clears_before_data_arrives() {
    let source = FakeSource::with_total(120);
    let (sync, mut rx) = controller(&source, Arc::new(NoopStorage));

    sync.load_page(true).await.unwrap();
    sync.load_page(false).await.unwrap();
    assert_eq!(sync.offset().unwrap(), 20);
    drain(&mut rx);

    sync.load_page(true).await.unwrap();
    assert_eq!(sync.offset().unwrap(), 10);

    match drain(&mut rx).first() {
      Some(SyncEvent::MapChanged(snapshot)) => assert!(snapshot.is_empty()),
      other => panic!("unexpected first event: {:?}", other),
    }
  }

  #[tokio::test]
  async fn test_detail_failure_keeps_entry() {
    let source = FakeSource::with_total(120);
    source.inner.fail_details.lock().unwrap().insert(name(2));
    let storage: Arc<dyn CacheStorage> = Arc::new(SqliteStorage::open_in_memory().unwrap());
    let (sync, _rx) = controller(&source, storage.clone());

    sync.load_page(true).await.unwrap();
    sync.settle().await.unwrap();

    let snapshot = sync.snapshot().unwrap();
    assert_eq!(snapshot.len(), 10);
    assert!(snapshot.get(&name(2)).unwrap().detail.is_none());
    assert!(storage.get_by_key(&name(2)).unwrap().is_none());
    assert_eq!(storage.get_all().unwrap().len(), 9);
  }

  #[tokio::test]
  async fn test_summary_merge_keeps_detail_and_key() {
    let source = FakeSource::with_total(120);
    let storage: Arc<dyn CacheStorage> = Arc::new(SqliteStorage::open_in_memory().unwrap());
    storage.upsert(&cached_row(0)).unwrap();
    let (sync, _rx) = controller(&source, storage);

    sync.load_page(true).await.unwrap();
    assert_eq!(sync.snapshot().unwrap().len(), 1);

    let (keys, missing) = sync
      .merge_summaries(
        vec![
          PokemonSummary {
            name: name(0),
            url: "https://elsewhere/".to_string(),
          },
          PokemonSummary {
            name: name(1),
            url: "https://fake/pokemon/2/".to_string(),
          },
        ],
        120,
        20,
      )
      .unwrap();
    assert_eq!(keys, vec![name(0), name(1)]);
    assert_eq!(missing, vec![name(1)]);

    let snapshot = sync.snapshot().unwrap();
    assert_eq!(snapshot.len(), 2);
    let pokemon = snapshot.get(&name(0)).unwrap();
    assert_eq!(pokemon.url, "https://elsewhere/");
    assert_eq!(pokemon.detail.as_ref().unwrap().id, 1);
  }

  #[tokio::test]
  async fn test_offset_advances_once_per_page() {
    let source = FakeSource::with_total(120);
    let storage: Arc<dyn CacheStorage> = Arc::new(SqliteStorage::open_in_memory().unwrap());
    storage
      .upsert_many(&(0..10).map(cached_row).collect::<Vec<_>>())
      .unwrap();
    let (sync, _rx) = controller(&source, storage);

    let first = sync.load_page(true).await.unwrap();
    assert_eq!(first.source, PageSource::Cache);
    assert_eq!(sync.offset().unwrap(), 10);

    let second = sync.load_page(false).await.unwrap();
    assert_eq!(second.source, PageSource::Remote);
    assert_eq!(sync.offset().unwrap(), 20);
  }

  #[tokio::test]
  async fn test_stale_detail_is_discarded() {
    let source = FakeSource::with_total(120);
    source.inner.fail_all_details.store(true, Ordering::SeqCst);
    let (sync, _rx) = controller(&source, Arc::new(NoopStorage));

    sync.load_page(true).await.unwrap();
    let old_generation = sync.lock_state().unwrap().generation;
    sync.load_page(true).await.unwrap();
    sync.settle().await.unwrap();

    sync
      .merge_detail(&name(0), fake_detail(1), old_generation)
      .unwrap();
    assert!(sync.snapshot().unwrap().get(&name(0)).unwrap().detail.is_none());

    sync
      .merge_detail(&name(0), fake_detail(1), old_generation + 1)
      .unwrap();
    assert!(sync.snapshot().unwrap().get(&name(0)).unwrap().detail.is_some());
  }

  #[tokio::test]
  async fn test_has_more_tracks_remote_total() {
    let source = FakeSource::with_total(15);
    let (sync, _rx) = controller(&source, Arc::new(NoopStorage));

    assert!(sync.has_more().unwrap());
    sync.load_page(true).await.unwrap();
    assert!(sync.has_more().unwrap());

    let last = sync.load_page(false).await.unwrap();
    assert_eq!(last.keys.len(), 5);
    assert!(!sync.has_more().unwrap());
  }

  #[tokio::test]
  async fn test_fetch_detail_for_single_key() {
    let source = FakeSource::with_total(120);
    source.inner.fail_all_details.store(true, Ordering::SeqCst);
    let (sync, _rx) = controller(&source, Arc::new(NoopStorage));

    sync.load_page(true).await.unwrap();
    sync.settle().await.unwrap();
    assert!(sync.snapshot().unwrap().get(&name(4)).unwrap().detail.is_none());

    source.inner.fail_all_details.store(false, Ordering::SeqCst);
    sync.fetch_detail(&name(4)).await.unwrap();
    let snapshot = sync.snapshot().unwrap();
    assert_eq!(snapshot.get(&name(4)).unwrap().id(), 5);
  }

  #[tokio::test]
  async fn test_record_image_file() {
    let source = FakeSource::with_total(120);
    let storage: Arc<dyn CacheStorage> = Arc::new(SqliteStorage::open_in_memory().unwrap());
    let (sync, _rx) = controller(&source, storage.clone());

    let pokemon = cached_row(7).into_pokemon();
    let updated = sync
      .record_image_file(&pokemon, Path::new("/tmp/p007.png"))
      .unwrap();
    assert_eq!(updated.detail.unwrap().image_file, "/tmp/p007.png");

    let row = storage.get_by_key(&name(7)).unwrap().unwrap();
    assert_eq!(row.image_file, "/tmp/p007.png");
    // Not in the map, so the map is untouched
    assert!(sync.snapshot().unwrap().is_empty());
  }

  #[tokio::test]
  async fn test_offset_at_end_of_range_is_an_error() {
    let source = FakeSource::with_total(120);
    let storage: Arc<dyn CacheStorage> = Arc::new(SqliteStorage::open_in_memory().unwrap());
    storage.upsert(&cached_row(0)).unwrap();
    let (tx, _rx) = mpsc::unbounded_channel();
    let sync = SyncController::new(source.clone(), storage, u32::MAX, tx);

    let first = sync.load_page(true).await.unwrap();
    assert_eq!(first.source, PageSource::Cache);
    assert_eq!(sync.offset().unwrap(), u32::MAX);

    assert!(sync.load_page(false).await.is_err());
    assert_eq!(source.list_calls(), 0);

    // State is still usable afterwards
    assert_eq!(sync.offset().unwrap(), u32::MAX);
    assert_eq!(sync.snapshot().unwrap().len(), 1);
    sync.load_page(true).await.unwrap();
    assert_eq!(sync.offset().unwrap(), u32::MAX);
  }

  /// Delegates to SQLite but fails every page read after the first.
  struct FlakyPages {
    inner: SqliteStorage,
    page_reads: AtomicU32,
  }

  impl CacheStorage for FlakyPages {
    fn get_page(&self, offset: u32, limit: u32) -> Result<Vec<PokemonRow>> {
      if self.page_reads.fetch_add(1, Ordering::SeqCst) > 0 {
        return Err(eyre!("database is locked"));
      }
      self.inner.get_page(offset, limit)
    }

    fn get_by_key(&self, name: &str) -> Result<Option<PokemonRow>> {
      self.inner.get_by_key(name)
    }

    fn upsert(&self, row: &PokemonRow) -> Result<()> {
      self.inner.upsert(row)
    }

    fn upsert_many(&self, rows: &[PokemonRow]) -> Result<()> {
      self.inner.upsert_many(rows)
    }

    fn get_all(&self) -> Result<Vec<PokemonRow>> {
      self.inner.get_all()
    }
  }

  #[tokio::test]
  async fn test_remote_page_skips_detail_for_cached_entries() {
    let source = FakeSource::with_total(120);
    let storage = Arc::new(FlakyPages {
      inner: SqliteStorage::open_in_memory().unwrap(),
      page_reads: AtomicU32::new(0),
    });
    let mut row = cached_row(10);
    row.image_file = "/img/p010.png".to_string();
    storage.upsert(&row).unwrap();
    let (sync, _rx) = controller(&source, storage.clone());

    let first = sync.load_page(true).await.unwrap();
    assert_eq!(first.source, PageSource::Cache);
    assert_eq!(first.keys, vec![name(10)]);

    // Cache read fails, so the page at offset 10 comes remotely and includes p010
    let second = sync.load_page(false).await.unwrap();
    assert_eq!(second.source, PageSource::Remote);
    assert!(second.keys.contains(&name(10)));
    sync.settle().await.unwrap();

    assert_eq!(source.detail_calls(), 9);
    let snapshot = sync.snapshot().unwrap();
    let cached = snapshot.get(&name(10)).unwrap().detail.as_ref().unwrap();
    assert_eq!(cached.origin, Origin::Cache);
    assert_eq!(cached.image_file, "/img/p010.png");

    // An explicit refetch keeps the recorded image file too
    sync.fetch_detail(&name(10)).await.unwrap();
    let snapshot = sync.snapshot().unwrap();
    let refreshed = snapshot.get(&name(10)).unwrap().detail.as_ref().unwrap();
    assert_eq!(refreshed.origin, Origin::Remote);
    assert_eq!(refreshed.image_file, "/img/p010.png");
    assert_eq!(
      storage.get_by_key(&name(10)).unwrap().unwrap().image_file,
      "/img/p010.png"
    );
  }

  #[test]
  fn test_concurrent_image_records_leave_cache_matching_map() {
    let source = FakeSource::with_total(120);
    let storage: Arc<dyn CacheStorage> = Arc::new(SqliteStorage::open_in_memory().unwrap());
    storage.upsert(&cached_row(0)).unwrap();
    let (sync, _rx) = controller(&source, storage.clone());
    sync.merge_cached(vec![cached_row(0)], 10).unwrap();

    let pokemon = sync.snapshot().unwrap().get(&name(0)).unwrap().clone();
    std::thread::scope(|scope| {
      for i in 0..8 {
        let sync = &sync;
        let pokemon = &pokemon;
        scope.spawn(move || {
          for j in 0..25 {
            let path = format!("/img/{}-{}.png", i, j);
            sync.record_image_file(pokemon, Path::new(&path)).unwrap();
          }
        });
      }
    });

    let in_map = sync
      .snapshot()
      .unwrap()
      .get(&name(0))
      .unwrap()
      .detail
      .as_ref()
      .unwrap()
      .image_file
      .clone();
    let in_cache = storage.get_by_key(&name(0)).unwrap().unwrap().image_file;
    assert_eq!(in_map, in_cache);
  }

  #[test]
  fn test_snapshot_sorted_puts_detail_less_last() {
    let mut entries = HashMap::new();
    entries.insert(
      "b".to_string(),
      Pokemon {
        name: "b".to_string(),
        url: String::new(),
        detail: None,
      },
    );
    for (n, id) in [("c", 2), ("a", 9)] {
      entries.insert(
        n.to_string(),
        Pokemon {
          name: n.to_string(),
          url: String::new(),
          detail: Some(fake_detail(id)),
        },
      );
    }
    let snapshot = MapSnapshot {
      version: 1,
      entries: Arc::new(entries),
    };

    let names: Vec<&str> = snapshot.sorted().iter().map(|p| p.name.as_str()).collect();
    assert_eq!(names, vec!["c", "a", "b"]);
  }
}
