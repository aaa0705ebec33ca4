//! Serde-deserializable types matching PokeAPI responses.
//!
//! These types are separate from domain types so that every optional field in
//! the wire format can be defaulted in one place during conversion.

use serde::Deserialize;

use super::types::{Origin, PokemonDetail, PokemonSummary};

// ============================================================================
// List endpoint: GET /pokemon/?offset=&limit=
// ============================================================================

#[derive(Debug, Deserialize)]
pub struct ApiPokemonRef {
  pub name: String,
  #[serde(default)]
  pub url: String,
}

#[derive(Debug, Deserialize)]
pub struct ApiPokemonList {
  #[serde(default)]
  pub count: u32,
  #[serde(default)]
  pub results: Vec<ApiPokemonRef>,
}

impl From<ApiPokemonRef> for PokemonSummary {
  fn from(r: ApiPokemonRef) -> Self {
    Self {
      name: r.name,
      url: r.url,
    }
  }
}

// ============================================================================
// Detail endpoint: GET /pokemon/{name}
// ============================================================================

#[derive(Debug, Deserialize)]
pub struct ApiTypeName {
  pub name: Option<String>,
}

#[derive(Debug, Deserialize)]
pub struct ApiTypeSlot {
  #[serde(rename = "type")]
  pub type_ref: Option<ApiTypeName>,
}

#[derive(Debug, Deserialize)]
pub struct ApiArtwork {
  pub front_default: Option<String>,
}

#[derive(Debug, Deserialize)]
pub struct ApiOtherSprites {
  #[serde(rename = "official-artwork")]
  pub official_artwork: Option<ApiArtwork>,
}

#[derive(Debug, Deserialize)]
pub struct ApiSprites {
  pub other: Option<ApiOtherSprites>,
}

#[derive(Debug, Default, Deserialize)]
pub struct ApiPokemonData {
  pub id: Option<u32>,
  pub base_experience: Option<u32>,
  pub height: Option<u32>,
  pub weight: Option<u32>,
  pub types: Option<Vec<ApiTypeSlot>>,
  pub sprites: Option<ApiSprites>,
}

impl ApiPokemonData {
  /// Convert to a domain detail, defaulting anything the API left out.
  pub fn into_detail(self) -> PokemonDetail {
    let types = self
      .types
      .unwrap_or_default()
      .into_iter()
      .take(2)
      .filter_map(|slot| slot.type_ref.and_then(|t| t.name))
      .collect();

    let image_url = self
      .sprites
      .and_then(|s| s.other)
      .and_then(|o| o.official_artwork)
      .and_then(|a| a.front_default)
      .unwrap_or_default();

    PokemonDetail {
      id: self.id.unwrap_or(0),
      base_experience: self.base_experience.unwrap_or(0),
      height: self.height.unwrap_or(0),
      weight: self.weight.unwrap_or(0),
      types,
      image_url,
      image_file: String::new(),
      origin: Origin::Remote,
    }
  }
}
