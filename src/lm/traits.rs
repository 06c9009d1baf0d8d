//! Collaborator contracts for the language-model component.
//!
//! The runtime core does not ship a tokenizer, a chat template, or a tensor
//! program; hosts wire real implementations (or test doubles) in through
//! [`ModelLoader`]. Tensors cross these seams as [`NdArray`] values.

use std::sync::Arc;

use thiserror::Error;

use crate::error::{ErrorCode, OperatorError};
use crate::value::{NdArray, Value};

pub type TokenId = i32;

pub trait Tokenizer: Send + Sync {
    fn encode(&self, text: &str) -> Vec<TokenId>;
    fn decode(&self, tokens: &[TokenId], skip_special_tokens: bool) -> String;
    fn vocab_size(&self) -> usize;
    fn token_to_id(&self, token: &str) -> Option<TokenId>;
    fn id_to_token(&self, id: TokenId) -> Option<String>;
}

/// Renders a normalized conversation to a prompt string. Stateless from the
/// core's perspective; marker tokens come from the model's template config.
pub trait ChatTemplate: Send + Sync {
    fn render(
        &self,
        conversation: &Value,
        tools: Option<&Value>,
        add_generation_prompt: bool,
        enable_reasoning: bool,
    ) -> Result<String, OperatorError>;

    fn bos_token(&self) -> &str;
    fn eos_token(&self) -> &str;

    /// Begin-of-tool-call marker; empty when the model has none.
    fn botc_token(&self) -> &str {
        ""
    }

    /// End-of-tool-call marker; empty when the model has none.
    fn eotc_token(&self) -> &str {
        ""
    }
}

#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum BackendError {
    #[error("ContextLengthLimit")]
    ContextLengthLimit,
    #[error("compute backend: {0}")]
    Failed(String),
}

impl From<BackendError> for OperatorError {
    fn from(err: BackendError) -> Self {
        match err {
            BackendError::ContextLengthLimit => OperatorError::code(ErrorCode::ContextLengthLimit),
            BackendError::Failed(detail) => OperatorError::new(ErrorCode::ValueError, detail),
        }
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct BackendMetadata {
    pub context_window_size: usize,
    pub prefill_chunk_size: usize,
    /// -1 when the model has no sliding window.
    pub sliding_window_size: i64,
    pub page_size: usize,
}

/// The tensor-program seam: embedding, prefill, decode, KV-cache lifecycle,
/// and device-side sampling. Thread-safe only within one component.
pub trait ComputeBackend: Send {
    fn metadata(&self) -> BackendMetadata;

    fn clear_kv(&mut self);
    fn popn(&mut self, tokens: usize);
    fn begin_forward(&mut self, sequence_length: usize);
    fn end_forward(&mut self);
    fn num_available_pages(&self) -> usize;
    fn total_sequence_length(&self) -> usize;

    fn embed(&mut self, tokens: &[TokenId]) -> Result<NdArray, BackendError>;
    fn prefill(&mut self, embedding: NdArray) -> Result<(), BackendError>;
    /// One autoregressive step; returns logits of shape `[1, 1, vocab]`.
    fn decode(&mut self, embedding: NdArray) -> Result<NdArray, BackendError>;

    fn sample_top_p(
        &mut self,
        logits: &NdArray,
        temperature: f64,
        top_p: f64,
        draw: f64,
    ) -> Result<TokenId, BackendError>;

    fn apply_bitmask_inplace(
        &mut self,
        logits: &mut NdArray,
        bitmask: &[u32],
    ) -> Result<(), BackendError>;
}

/// A matcher instance for one decode run.
pub trait GrammarMatcher: Send {
    /// Sets a bit per allowed token id in `bitmask` (32 ids per word).
    fn fill_token_bitmask(&mut self, bitmask: &mut [u32]);
    fn accept_token(&mut self, token: TokenId);
    fn is_terminated(&self) -> bool;
}

/// A compiled grammar; compiled once per vocabulary, instantiated per run.
pub trait Grammar: Send + Sync {
    fn matcher(&self, close_indicator: &[TokenId]) -> Box<dyn GrammarMatcher>;
}

#[derive(Clone, Debug, PartialEq, Eq)]
pub enum GrammarSpec {
    Json,
    JsonSchema(String),
    Regex(String),
    Ebnf(String),
}

pub trait GrammarCompiler: Send + Sync {
    fn compile(&self, spec: &GrammarSpec) -> Result<Arc<dyn Grammar>, OperatorError>;
}

#[derive(Clone, Copy, Debug, PartialEq)]
pub struct SamplingConfig {
    pub temperature: f64,
    pub top_p: f64,
}

impl Default for SamplingConfig {
    fn default() -> Self {
        Self {
            temperature: 0.6,
            top_p: 0.9,
        }
    }
}

/// Everything the language-model factory needs for one instance.
pub struct ModelBundle {
    pub backend: Box<dyn ComputeBackend>,
    pub tokenizer: Arc<dyn Tokenizer>,
    pub template: Arc<dyn ChatTemplate>,
    pub grammar_compiler: Option<Arc<dyn GrammarCompiler>>,
    pub defaults: SamplingConfig,
    /// Sampling RNG seed; `None` draws one from the OS.
    pub seed: Option<u64>,
}

/// Host-supplied loader that resolves component attributes (`model`,
/// `quantization`, `device`, …) to a ready bundle.
pub trait ModelLoader: Send + Sync {
    fn load(&self, attrs: &Value) -> Result<ModelBundle, OperatorError>;
}
