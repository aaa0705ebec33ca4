pub mod api_types;
pub mod client;
pub mod types;

pub use client::{PokeApiClient, PokemonSource, RemotePage};
pub use types::{Origin, Pokemon, PokemonDetail, PokemonSummary};
