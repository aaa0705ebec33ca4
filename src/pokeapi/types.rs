/// Label stored in place of an empty type list
pub const NO_TYPE: &str = "No type";

/// Separator used when joining type labels into a single column
const TYPE_SEPARATOR: &str = ", ";

/// Entry from the paginated list endpoint
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PokemonSummary {
  pub name: String,
  pub url: String,
}

/// Where a detail record was last loaded from
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Origin {
  Cache,
  Remote,
}

/// Extended attributes fetched per pokemon
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PokemonDetail {
  pub id: u32,
  pub base_experience: u32,
  pub height: u32,
  pub weight: u32,
  pub types: Vec<String>, // At most two labels
  pub image_url: String,
  pub image_file: String,
  pub origin: Origin,
}

/// A pokemon as held in the collected map.
///
/// Values are never mutated in place once published; each merge produces a
/// new `Pokemon` that replaces the previous entry.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Pokemon {
  pub name: String,
  pub url: String,
  pub detail: Option<PokemonDetail>,
}

impl Pokemon {
  pub fn from_summary(summary: PokemonSummary) -> Self {
    Self {
      name: summary.name,
      url: summary.url,
      detail: None,
    }
  }

  /// Copy of this pokemon with the summary fields replaced, keeping any detail.
  pub fn with_summary(&self, summary: &PokemonSummary) -> Self {
    Self {
      name: summary.name.clone(),
      url: summary.url.clone(),
      detail: self.detail.clone(),
    }
  }

  /// Copy of this pokemon carrying the given detail.
  pub fn with_detail(&self, detail: PokemonDetail) -> Self {
    Self {
      detail: Some(detail),
      ..self.clone()
    }
  }

  pub fn id(&self) -> u32 {
    self.detail.as_ref().map(|d| d.id).unwrap_or(0)
  }

  pub fn types_label(&self) -> String {
    match &self.detail {
      Some(detail) => types_to_string(&detail.types),
      None => NO_TYPE.to_string(),
    }
  }
}

/// Join type labels as stored in the cache, e.g. `"fire, flying"`.
pub fn types_to_string(types: &[String]) -> String {
  if types.is_empty() {
    return NO_TYPE.to_string();
  }
  types
    .iter()
    .take(2)
    .map(String::as_str)
    .collect::<Vec<_>>()
    .join(TYPE_SEPARATOR)
}

/// Inverse of [`types_to_string`].
pub fn types_from_string(s: &str) -> Vec<String> {
  let s = s.trim();
  if s.is_empty() || s == NO_TYPE {
    return Vec::new();
  }
  s.split(TYPE_SEPARATOR).map(String::from).collect()
}
