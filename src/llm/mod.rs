//! LLM 层：客户端抽象、OpenAI 兼容实现、候选与回退链、混合路由器

pub mod candidate;
pub mod mock;
pub mod openai;
pub mod providers;
pub mod router;
pub mod secrets;
pub mod traits;

pub use candidate::{BackendCandidate, ClientFactory, EndpointParams, FallbackChain, OpenAiFactory};
pub use mock::{MockFactory, MockLlmClient, MockStep};
pub use openai::OpenAiClient;
pub use router::{
    select_primary, validate_budget, Completion, HybridRouter, ResourceState, RoutedStream,
    RouterError, RouterStatus,
};
pub use secrets::{load_secrets, Secrets, SecretsError};
pub use traits::{ChatMessage, CompletionRequest, LlmClient, LlmError, Role, TokenStream};
