//! Cache row type and its conversions to and from the domain model.

use chrono::{DateTime, Utc};

use crate::pokeapi::types::{types_from_string, types_to_string};
use crate::pokeapi::{Origin, Pokemon, PokemonDetail};

/// A row of the `pokemon` table.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PokemonRow {
  pub name: String,
  pub url: String,
  pub id: u32,
  pub base_experience: u32,
  pub height: u32,
  pub weight: u32,
  /// Comma-joined labels, or the "No type" sentinel
  pub types: String,
  pub image_url: String,
  pub image_file: String,
  /// Assigned by the store on write; ignored on upsert
  pub cached_at: Option<DateTime<Utc>>,
}

impl From<&Pokemon> for PokemonRow {
  fn from(pokemon: &Pokemon) -> Self {
    let detail = pokemon.detail.as_ref();
    Self {
      name: pokemon.name.clone(),
      url: pokemon.url.clone(),
      id: detail.map(|d| d.id).unwrap_or(0),
      base_experience: detail.map(|d| d.base_experience).unwrap_or(0),
      height: detail.map(|d| d.height).unwrap_or(0),
      weight: detail.map(|d| d.weight).unwrap_or(0),
      types: pokemon.types_label(),
      image_url: detail.map(|d| d.image_url.clone()).unwrap_or_default(),
      image_file: detail.map(|d| d.image_file.clone()).unwrap_or_default(),
      cached_at: None,
    }
  }
}

impl PokemonRow {
  /// Rebuild the domain value. Cached rows always carry detail.
  pub fn into_pokemon(self) -> Pokemon {
    Pokemon {
      name: self.name,
      url: self.url,
      detail: Some(PokemonDetail {
        id: self.id,
        base_experience: self.base_experience,
        height: self.height,
        weight: self.weight,
        types: types_from_string(&self.types),
        image_url: self.image_url,
        image_file: self.image_file,
        origin: Origin::Cache,
      }),
    }
  }

  /// Labels as the UI shows them (re-encoded so stray spacing is normalized)
  pub fn types_label(&self) -> String {
    types_to_string(&types_from_string(&self.types))
  }
}
