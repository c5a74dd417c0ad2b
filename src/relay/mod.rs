//! Provider adaptors and the dispatch loop that drives them.

pub mod adaptor;
pub mod dispatch;
pub mod kling;
pub mod openai;

pub use adaptor::{
    AdaptorConstructor, AdaptorDeps, AdaptorKind, AdaptorOutcome, AdaptorRegistry, ProviderAdaptor, ProviderRequest,
    RawResponse, RelayMeta, RelayMode, RelayRequest, Usage,
};
pub(crate) use dispatch::execute_attempt;
pub use dispatch::{classify, AttemptOutcome, Dispatcher};
pub use kling::KlingAdaptor;
pub use openai::OpenAIAdaptor;
