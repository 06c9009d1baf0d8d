//! Mock language-model collaborators: a byte-level tokenizer with special
//! marker tokens, a scripted compute backend that replays a fixed token
//! sequence, a trivial chat template, and a counting grammar.

use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;

use ailoy::lm::{
    BackendError, BackendMetadata, ChatTemplate, ComputeBackend, Grammar, GrammarCompiler,
    GrammarMatcher, GrammarSpec, ModelBundle, ModelLoader, SamplingConfig, TokenId, Tokenizer,
};
use ailoy::{NdArray, OperatorError, Value};

pub const TOK_BOR: TokenId = 256; // <think>
pub const TOK_EOR: TokenId = 257; // </think>
pub const TOK_BOTC: TokenId = 258; // <tool_call>
pub const TOK_EOTC: TokenId = 259; // </tool_call>
pub const TOK_EOS: TokenId = 260; // </s>
pub const VOCAB_SIZE: usize = 261;

const SPECIALS: [(TokenId, &str); 5] = [
    (TOK_BOR, "<think>"),
    (TOK_EOR, "</think>"),
    (TOK_BOTC, "<tool_call>"),
    (TOK_EOTC, "</tool_call>"),
    (TOK_EOS, "</s>"),
];

/// Byte-level tokenizer: ids 0..=255 are raw bytes, the rest are the
/// marker tokens above. Multi-byte UTF-8 emerges one byte per token, which
/// exercises the replacement-character buffering.
pub struct ByteTokenizer;

impl Tokenizer for ByteTokenizer {
    fn encode(&self, text: &str) -> Vec<TokenId> {
        let bytes = text.as_bytes();
        let mut tokens = Vec::with_capacity(bytes.len());
        let mut position = 0;
        'outer: while position < bytes.len() {
            for (id, marker) in SPECIALS {
                if bytes[position..].starts_with(marker.as_bytes()) {
                    tokens.push(id);
                    position += marker.len();
                    continue 'outer;
                }
            }
            tokens.push(bytes[position] as TokenId);
            position += 1;
        }
        tokens
    }

    fn decode(&self, tokens: &[TokenId], skip_special_tokens: bool) -> String {
        let mut bytes = Vec::new();
        for &token in tokens {
            if let Some((_, marker)) = SPECIALS.iter().find(|(id, _)| *id == token) {
                if !skip_special_tokens {
                    bytes.extend_from_slice(marker.as_bytes());
                }
            } else if (0..=255).contains(&token) {
                bytes.push(token as u8);
            }
        }
        String::from_utf8_lossy(&bytes).into_owned()
    }

    fn vocab_size(&self) -> usize {
        VOCAB_SIZE
    }

    fn token_to_id(&self, token: &str) -> Option<TokenId> {
        SPECIALS
            .iter()
            .find(|(_, marker)| *marker == token)
            .map(|(id, _)| *id)
            .or_else(|| {
                let bytes = token.as_bytes();
                (bytes.len() == 1).then(|| bytes[0] as TokenId)
            })
    }

    fn id_to_token(&self, id: TokenId) -> Option<String> {
        SPECIALS
            .iter()
            .find(|(sid, _)| *sid == id)
            .map(|(_, marker)| marker.to_string())
            .or_else(|| (0..=255).contains(&id).then(|| (id as u8 as char).to_string()))
    }
}

/// Renders `role: content` lines plus a generation prompt. Content arrives
/// collapsed to bare strings by the normalization pipeline.
pub struct LineTemplate;

impl ChatTemplate for LineTemplate {
    fn render(
        &self,
        conversation: &Value,
        tools: Option<&Value>,
        add_generation_prompt: bool,
        _enable_reasoning: bool,
    ) -> Result<String, OperatorError> {
        let mut prompt = String::new();
        if let Some(tools) = tools {
            if let Ok(rendered) = tools.to_json_string() {
                prompt.push_str("tools: ");
                prompt.push_str(&rendered);
                prompt.push('\n');
            }
        }
        if let Some(messages) = conversation.as_array() {
            for message in messages {
                let role = message.get("role").and_then(Value::as_str).unwrap_or("?");
                let content = message.get("content").and_then(Value::as_str).unwrap_or("");
                prompt.push_str(role);
                prompt.push_str(": ");
                prompt.push_str(content);
                prompt.push('\n');
            }
        }
        if add_generation_prompt {
            prompt.push_str("assistant: ");
        }
        Ok(prompt)
    }

    fn bos_token(&self) -> &str {
        "<s>"
    }

    fn eos_token(&self) -> &str {
        "</s>"
    }

    fn botc_token(&self) -> &str {
        "<tool_call>"
    }

    fn eotc_token(&self) -> &str {
        "</tool_call>"
    }
}

/// Replays a fixed completion, one token per decode, as one-hot logits.
/// KV-cache accounting is real enough to exercise LCP prefill and
/// context-length overflow.
pub struct ScriptedBackend {
    script: Vec<TokenId>,
    cursor: usize,
    kv_len: usize,
    metadata: BackendMetadata,
    forwards_open: usize,
}

impl ScriptedBackend {
    pub fn new(script: Vec<TokenId>, context_window_size: usize) -> Self {
        Self {
            script,
            cursor: 0,
            kv_len: 0,
            metadata: BackendMetadata {
                context_window_size,
                prefill_chunk_size: 16,
                sliding_window_size: -1,
                page_size: 16,
            },
            forwards_open: 0,
        }
    }
}

impl ComputeBackend for ScriptedBackend {
    fn metadata(&self) -> BackendMetadata {
        self.metadata
    }

    fn clear_kv(&mut self) {
        self.kv_len = 0;
    }

    fn popn(&mut self, tokens: usize) {
        self.kv_len = self.kv_len.saturating_sub(tokens);
    }

    fn begin_forward(&mut self, _sequence_length: usize) {
        self.forwards_open += 1;
    }

    fn end_forward(&mut self) {
        self.forwards_open = self.forwards_open.saturating_sub(1);
    }

    fn num_available_pages(&self) -> usize {
        let total_pages = self.metadata.context_window_size / self.metadata.page_size;
        total_pages.saturating_sub(self.kv_len.div_ceil(self.metadata.page_size))
    }

    fn total_sequence_length(&self) -> usize {
        self.kv_len
    }

    fn embed(&mut self, tokens: &[TokenId]) -> Result<NdArray, BackendError> {
        let values: Vec<f32> = tokens.iter().map(|&t| t as f32).collect();
        NdArray::from_f32(vec![tokens.len(), 1], &values)
            .map_err(|err| BackendError::Failed(err.to_string()))
    }

    fn prefill(&mut self, embedding: NdArray) -> Result<(), BackendError> {
        self.kv_len += embedding.shape[0];
        Ok(())
    }

    fn decode(&mut self, _embedding: NdArray) -> Result<NdArray, BackendError> {
        self.kv_len += 1;
        let token = self
            .script
            .get(self.cursor)
            .copied()
            .unwrap_or(TOK_EOS);
        self.cursor += 1;
        let mut logits = vec![0.0f32; VOCAB_SIZE];
        logits[token as usize] = 1.0;
        NdArray::from_f32(vec![1, 1, VOCAB_SIZE], &logits)
            .map_err(|err| BackendError::Failed(err.to_string()))
    }

    fn sample_top_p(
        &mut self,
        logits: &NdArray,
        _temperature: f64,
        _top_p: f64,
        _draw: f64,
    ) -> Result<TokenId, BackendError> {
        let values = logits.to_f32_vec();
        let (argmax, _) = values
            .iter()
            .enumerate()
            .fold((0, f32::NEG_INFINITY), |(bi, bv), (i, &v)| {
                if v > bv {
                    (i, v)
                } else {
                    (bi, bv)
                }
            });
        Ok(argmax as TokenId)
    }

    fn apply_bitmask_inplace(
        &mut self,
        logits: &mut NdArray,
        bitmask: &[u32],
    ) -> Result<(), BackendError> {
        let mut values = logits.to_f32_vec();
        for (id, value) in values.iter_mut().enumerate() {
            let word = bitmask.get(id / 32).copied().unwrap_or(0);
            if word & (1 << (id % 32)) == 0 {
                *value = f32::NEG_INFINITY;
            }
        }
        *logits = NdArray::from_f32(logits.shape.clone(), &values)
            .map_err(|err| BackendError::Failed(err.to_string()))?;
        Ok(())
    }
}

/// Grammar that admits every token and counts how many the matcher was fed.
pub struct CountingGrammar {
    pub accepted: Arc<AtomicUsize>,
}

struct CountingMatcher {
    accepted: Arc<AtomicUsize>,
    terminated: bool,
    close_indicator: Vec<TokenId>,
    tail: Vec<TokenId>,
}

impl GrammarMatcher for CountingMatcher {
    fn fill_token_bitmask(&mut self, bitmask: &mut [u32]) {
        for word in bitmask.iter_mut() {
            *word = u32::MAX;
        }
    }

    fn accept_token(&mut self, token: TokenId) {
        self.accepted.fetch_add(1, Ordering::SeqCst);
        self.tail.push(token);
        if self.tail.len() >= self.close_indicator.len()
            && !self.close_indicator.is_empty()
            && self.tail[self.tail.len() - self.close_indicator.len()..] == self.close_indicator
        {
            self.terminated = true;
        }
    }

    fn is_terminated(&self) -> bool {
        self.terminated
    }
}

impl Grammar for CountingGrammar {
    fn matcher(&self, close_indicator: &[TokenId]) -> Box<dyn GrammarMatcher> {
        Box::new(CountingMatcher {
            accepted: Arc::clone(&self.accepted),
            terminated: false,
            close_indicator: close_indicator.to_vec(),
            tail: Vec::new(),
        })
    }
}

pub struct CountingCompiler {
    pub accepted: Arc<AtomicUsize>,
}

impl GrammarCompiler for CountingCompiler {
    fn compile(&self, _spec: &GrammarSpec) -> Result<Arc<dyn Grammar>, OperatorError> {
        Ok(Arc::new(CountingGrammar {
            accepted: Arc::clone(&self.accepted),
        }))
    }
}

/// Loader yielding a scripted model; `context_window_size` bounds prefill.
pub struct ScriptedLoader {
    pub script: Vec<TokenId>,
    pub context_window_size: usize,
    pub grammar_accepted: Option<Arc<AtomicUsize>>,
}

impl ScriptedLoader {
    pub fn new(script: Vec<TokenId>) -> Self {
        Self {
            script,
            context_window_size: 4096,
            grammar_accepted: None,
        }
    }

    /// Tokenizes a completion string into a script ending with EOS.
    pub fn for_completion(completion: &str) -> Self {
        let mut script = ByteTokenizer.encode(completion);
        script.push(TOK_EOS);
        Self::new(script)
    }
}

impl ModelLoader for ScriptedLoader {
    fn load(&self, _attrs: &Value) -> Result<ModelBundle, OperatorError> {
        let grammar_compiler: Option<Arc<dyn GrammarCompiler>> =
            self.grammar_accepted.as_ref().map(|accepted| {
                Arc::new(CountingCompiler {
                    accepted: Arc::clone(accepted),
                }) as Arc<dyn GrammarCompiler>
            });
        Ok(ModelBundle {
            backend: Box::new(ScriptedBackend::new(
                self.script.clone(),
                self.context_window_size,
            )),
            tokenizer: Arc::new(ByteTokenizer),
            template: Arc::new(LineTemplate),
            grammar_compiler,
            defaults: SamplingConfig {
                temperature: 0.0,
                top_p: 0.0,
            },
            seed: Some(7),
        })
    }
}
