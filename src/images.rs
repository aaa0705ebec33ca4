//! Local artwork files.

use color_eyre::{eyre::eyre, Result};
use std::path::{Path, PathBuf};
use tracing::{debug, info};

use crate::pokeapi::{Pokemon, PokemonSource};
use crate::sync::SyncController;

/// Resolves a pokemon's artwork to a file on disk, downloading it on first use.
pub struct ImageStore {
  dir: PathBuf,
}

impl ImageStore {
  pub fn new(dir: impl Into<PathBuf>) -> Self {
    Self { dir: dir.into() }
  }

  pub fn dir(&self) -> &Path {
    &self.dir
  }

  fn file_for(&self, name: &str) -> PathBuf {
    self.dir.join(format!("{}.png", name))
  }

  /// Return the artwork file for `pokemon`.
  ///
  /// A previously recorded file is reused if it still exists. Otherwise the
  /// image URL is downloaded, written to `<dir>/<name>.png`, and the path is
  /// recorded on the pokemon through the controller (map and cache).
  pub async fn resolve<P: PokemonSource>(
    &self,
    sync: &SyncController<P>,
    pokemon: &Pokemon,
  ) -> Result<PathBuf> {
    let detail = pokemon
      .detail
      .as_ref()
      .ok_or_else(|| eyre!("No detail loaded for {}", pokemon.name))?;

    if !detail.image_file.is_empty() {
      let existing = PathBuf::from(&detail.image_file);
      if existing.is_file() {
        debug!("Using cached image {}", existing.display());
        return Ok(existing);
      }
      debug!("Recorded image {} is missing, downloading again", existing.display());
    }

    if detail.image_url.is_empty() {
      return Err(eyre!("{} has no image URL", pokemon.name));
    }

    let bytes = sync.source().fetch_image(&detail.image_url).await?;

    tokio::fs::create_dir_all(&self.dir)
      .await
      .map_err(|e| eyre!("Failed to create image directory {}: {}", self.dir.display(), e))?;

    let path = self.file_for(&pokemon.name);
    tokio::fs::write(&path, &bytes)
      .await
      .map_err(|e| eyre!("Failed to write image {}: {}", path.display(), e))?;
    info!("Saved image for {} to {}", pokemon.name, path.display());

    sync.record_image_file(pokemon, &path)?;
    Ok(path)
  }
}
