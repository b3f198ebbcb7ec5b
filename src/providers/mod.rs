//! Backend adapters and the contract they implement.
//!
//! Cloud vendors are integrated by implementing [`ProviderAdapter`]; the
//! crate ships an Ollama adapter for local runtimes.

pub mod backpressure;
pub mod traits;

#[cfg(feature = "ollama")]
pub mod ollama;

pub use backpressure::{DEFAULT_STREAM_BUFFER, bounded_stream};
#[cfg(feature = "ollama")]
pub use ollama::OllamaAdapter;
pub use traits::ProviderAdapter;
