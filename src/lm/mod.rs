//! The iterative language-model component: decoder-loop state machine,
//! chat normalization, and the collaborator seams it is built on.

pub mod infer;
pub mod messages;
pub mod model;
pub mod traits;

pub use infer::{language_module, COMPONENT_TYPE};
pub use model::{LanguageModel, MODE_OUTPUT_TEXT, MODE_REASONING, MODE_TOOL_CALL};
pub use traits::{
    BackendError, BackendMetadata, ChatTemplate, ComputeBackend, Grammar, GrammarCompiler,
    GrammarMatcher, GrammarSpec, ModelBundle, ModelLoader, SamplingConfig, TokenId, Tokenizer,
};
