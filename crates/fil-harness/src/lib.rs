//! Provider plumbing for filament: a uniform abstraction over
//! heterogeneous LLM backends, the named-provider registry, secret
//! indirection, and the circuit breaker used by background effect paths.

pub mod circuit_breaker;
pub mod provider;
pub mod providers;
pub mod registry;
pub mod secrets;

pub use circuit_breaker::{CircuitBreaker, CircuitBreakerConfig, CircuitBreakerError, CircuitState};
pub use provider::{
    Capability, ChatChunk, ChatMessage, ChatProvider, ChatRequest, ChatResponse, ChunkStream,
    MockProvider, ProviderError,
};
pub use registry::{HealthReport, ProviderConfig, ProviderKind, ProviderRegistry};
pub use secrets::{Secret, SecretStore};
