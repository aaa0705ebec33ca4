use crate::config::Config;
use crate::pokeapi::api_types::{ApiPokemonData, ApiPokemonList};
use crate::pokeapi::types::{PokemonDetail, PokemonSummary};
use color_eyre::{eyre::eyre, Result};
use std::future::Future;
use std::time::Duration;
use url::Url;

/// One page of the remote list
#[derive(Debug, Clone)]
pub struct RemotePage {
  /// Total number of pokemon the API reports
  pub count: u32,
  pub results: Vec<PokemonSummary>,
}

/// Remote data the sync controller and image store depend on.
///
/// Implemented by [`PokeApiClient`] over HTTP and by in-process fakes in tests.
pub trait PokemonSource: Clone + Send + Sync + 'static {
  /// Fetch the summaries in `[offset, offset + limit)`.
  fn fetch_page(&self, offset: u32, limit: u32)
    -> impl Future<Output = Result<RemotePage>> + Send;

  /// Fetch extended attributes for a single pokemon.
  fn fetch_detail(&self, name: &str) -> impl Future<Output = Result<PokemonDetail>> + Send;

  /// Download raw image bytes.
  fn fetch_image(&self, url: &str) -> impl Future<Output = Result<Vec<u8>>> + Send;
}

/// PokeAPI HTTP client
#[derive(Clone)]
pub struct PokeApiClient {
  client: reqwest::Client,
  base_url: Url,
}

impl PokeApiClient {
  pub fn new(config: &Config) -> Result<Self> {
    let mut builder = reqwest::Client::builder().user_agent(concat!(
      env!("CARGO_PKG_NAME"),
      "/",
      env!("CARGO_PKG_VERSION")
    ));
    if let Some(secs) = config.api.timeout_secs {
      builder = builder.timeout(Duration::from_secs(secs));
    }
    let client = builder
      .build()
      .map_err(|e| eyre!("Failed to create HTTP client: {}", e))?;

    Ok(Self {
      client,
      base_url: normalize_base_url(&config.api.base_url)?,
    })
  }

  fn list_url(&self, offset: u32, limit: u32) -> Result<Url> {
    let mut url = self
      .base_url
      .join("pokemon/")
      .map_err(|e| eyre!("Failed to build list URL: {}", e))?;
    url
      .query_pairs_mut()
      .append_pair("offset", &offset.to_string())
      .append_pair("limit", &limit.to_string());
    Ok(url)
  }

  fn detail_url(&self, name: &str) -> Result<Url> {
    let mut url = self
      .base_url
      .join("pokemon/")
      .map_err(|e| eyre!("Failed to build detail URL: {}", e))?;
    url
      .path_segments_mut()
      .map_err(|_| eyre!("Base URL cannot carry a path: {}", self.base_url))?
      .pop_if_empty()
      .push(name);
    Ok(url)
  }

  async fn get(&self, url: Url) -> Result<reqwest::Response> {
    tracing::debug!("GET {}", url);
    self
      .client
      .get(url.clone())
      .send()
      .await
      .map_err(|e| eyre!("Request to {} failed: {}", url, e))?
      .error_for_status()
      .map_err(|e| eyre!("Request to {} returned an error status: {}", url, e))
  }
}

impl PokemonSource for PokeApiClient {
  async fn fetch_page(&self, offset: u32, limit: u32) -> Result<RemotePage> {
    let response = self.get(self.list_url(offset, limit)?).await?;

    let list: ApiPokemonList = response
      .json()
      .await
      .map_err(|e| eyre!("Failed to parse pokemon list: {}", e))?;

    Ok(RemotePage {
      count: list.count,
      results: list.results.into_iter().map(PokemonSummary::from).collect(),
    })
  }

  async fn fetch_detail(&self, name: &str) -> Result<PokemonDetail> {
    let response = self.get(self.detail_url(name)?).await?;

    let data: ApiPokemonData = response
      .json()
      .await
      .map_err(|e| eyre!("Failed to parse pokemon {}: {}", name, e))?;

    Ok(data.into_detail())
  }

  async fn fetch_image(&self, url: &str) -> Result<Vec<u8>> {
    let url = Url::parse(url).map_err(|e| eyre!("Invalid image URL {}: {}", url, e))?;
    let response = self.get(url).await?;

    let bytes = response
      .bytes()
      .await
      .map_err(|e| eyre!("Failed to read image body: {}", e))?;

    Ok(bytes.to_vec())
  }
}

/// Parse the configured base URL, making sure relative joins keep its path.
fn normalize_base_url(base: &str) -> Result<Url> {
  let with_slash = if base.ends_with('/') {
    base.to_string()
  } else {
    format!("{}/", base)
  };
  Url::parse(&with_slash).map_err(|e| eyre!("Invalid API base URL {}: {}", base, e))
}
