//! Decoder-side state for one language-model component: token history kept
//! in sync with the backend KV cache, stream-mode tracking, grammar
//! matchers, and the detokenization buffer.

use std::collections::BTreeMap;
use std::sync::Arc;

use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};
use tracing::debug;

use crate::error::{ErrorCode, OperatorError, ValueError};
use crate::lm::messages;
use crate::lm::traits::{
    BackendError, ChatTemplate, ComputeBackend, Grammar, GrammarCompiler, GrammarMatcher,
    GrammarSpec, ModelBundle, SamplingConfig, TokenId, Tokenizer,
};
use crate::value::Value;

pub const MODE_OUTPUT_TEXT: &str = "output_text";
pub const MODE_REASONING: &str = "reasoning";
pub const MODE_TOOL_CALL: &str = "tool_call";

const BOR_TOKEN: &str = "<think>";
const EOR_TOKEN: &str = "</think>";

/// Unicode replacement character: marks an incomplete codepoint at the end
/// of a detokenized chunk.
const REPLACEMENT: char = '\u{FFFD}';

struct StreamMode {
    open_indicator: Vec<TokenId>,
    close_indicator: Vec<TokenId>,
    grammar: Option<Arc<dyn Grammar>>,
    matcher: Option<Box<dyn GrammarMatcher>>,
}

impl StreamMode {
    fn new(tokenizer: &dyn Tokenizer, open: &str, close: &str) -> Self {
        Self {
            open_indicator: if open.is_empty() {
                Vec::new()
            } else {
                tokenizer.encode(open)
            },
            close_indicator: if close.is_empty() {
                Vec::new()
            } else {
                tokenizer.encode(close)
            },
            grammar: None,
            matcher: None,
        }
    }
}

fn ends_with(history: &[TokenId], indicator: &[TokenId]) -> bool {
    !indicator.is_empty()
        && history.len() >= indicator.len()
        && history[history.len() - indicator.len()..] == *indicator
}

pub struct LanguageModel {
    backend: Box<dyn ComputeBackend>,
    tokenizer: Arc<dyn Tokenizer>,
    template: Arc<dyn ChatTemplate>,
    grammar_compiler: Option<Arc<dyn GrammarCompiler>>,

    /// Exact token prefix currently reflected in the backend KV cache.
    history: Vec<TokenId>,
    /// Emitted tokens awaiting detokenization (a codepoint may span tokens).
    output_stream: Vec<TokenId>,
    stream_modes: BTreeMap<String, StreamMode>,
    current_mode: String,

    pub config: SamplingConfig,
    defaults: SamplingConfig,
    rng: StdRng,
}

impl LanguageModel {
    pub fn new(bundle: ModelBundle) -> Self {
        let ModelBundle {
            backend,
            tokenizer,
            template,
            grammar_compiler,
            defaults,
            seed,
        } = bundle;

        let mut stream_modes = BTreeMap::new();
        stream_modes.insert(
            MODE_OUTPUT_TEXT.to_string(),
            StreamMode::new(tokenizer.as_ref(), "", ""),
        );
        stream_modes.insert(
            MODE_REASONING.to_string(),
            StreamMode::new(tokenizer.as_ref(), BOR_TOKEN, EOR_TOKEN),
        );
        let botc = template.botc_token().to_string();
        let eotc = template.eotc_token().to_string();
        if !botc.is_empty() && !eotc.is_empty() {
            stream_modes.insert(
                MODE_TOOL_CALL.to_string(),
                StreamMode::new(tokenizer.as_ref(), &botc, &eotc),
            );
        }

        let rng = match seed {
            Some(seed) => StdRng::seed_from_u64(seed),
            None => StdRng::from_entropy(),
        };

        Self {
            backend,
            tokenizer,
            template,
            grammar_compiler,
            history: Vec::new(),
            output_stream: Vec::new(),
            stream_modes,
            current_mode: MODE_OUTPUT_TEXT.to_string(),
            config: defaults,
            defaults,
            rng,
        }
    }

    pub fn defaults(&self) -> SamplingConfig {
        self.defaults
    }

    pub fn current_mode(&self) -> &str {
        &self.current_mode
    }

    pub fn history(&self) -> &[TokenId] {
        &self.history
    }

    pub fn tokenize(&self, prompt: &str) -> Vec<TokenId> {
        self.tokenizer.encode(prompt)
    }

    /// Validation-free render path: callers validate first. Runs the
    /// normalization pipeline and hands the result to the template.
    pub fn apply_chat_template(
        &self,
        conversation: &Value,
        tools: Option<&Value>,
        enable_reasoning: bool,
        add_generation_prompt: bool,
    ) -> Result<String, OperatorError> {
        let normalized = messages::normalize(conversation, enable_reasoning);
        self.template
            .render(&normalized, tools, add_generation_prompt, enable_reasoning)
    }

    /// Drops all decoder state: KV cache, history, stream mode.
    pub fn clear(&mut self) {
        self.backend.clear_kv();
        self.history.clear();
        self.output_stream.clear();
        self.current_mode = MODE_OUTPUT_TEXT.to_string();
        for mode in self.stream_modes.values_mut() {
            mode.matcher = None;
        }
    }

    /// Feeds `tokens` to the backend, reusing the longest common prefix
    /// already in the KV cache. Returns the token decode starts from.
    pub fn prefill(&mut self, tokens: &[TokenId]) -> Result<TokenId, BackendError> {
        if tokens.is_empty() {
            return Err(BackendError::Failed("token sequence is empty".to_string()));
        }

        // History and KV cache must agree before any reuse.
        if self.backend.total_sequence_length() != self.history.len() {
            self.clear();
        }

        let lcp = self
            .history
            .iter()
            .zip(tokens.iter())
            .take_while(|(a, b)| a == b)
            .count();
        if lcp < self.history.len() {
            self.backend.popn(self.history.len() - lcp);
        }

        let new_tokens = &tokens[lcp..];
        if new_tokens.is_empty() {
            self.history = tokens.to_vec();
            self.current_mode = MODE_OUTPUT_TEXT.to_string();
            return Ok(tokens[tokens.len() - 1]);
        }

        let metadata = self.backend.metadata();
        let capacity = self.backend.num_available_pages() * metadata.page_size;
        if new_tokens.len() >= capacity {
            return Err(BackendError::ContextLengthLimit);
        }

        debug!(
            total = tokens.len(),
            reused = lcp,
            fed = new_tokens.len(),
            "prefill"
        );
        for chunk in new_tokens.chunks(metadata.prefill_chunk_size.max(1)) {
            let embedding = self.backend.embed(chunk)?;
            self.backend.begin_forward(chunk.len());
            let outcome = self.backend.prefill(embedding);
            self.backend.end_forward();
            outcome?;
        }

        self.history = tokens.to_vec();
        // A prefill begins a new inference run.
        self.current_mode = MODE_OUTPUT_TEXT.to_string();
        Ok(tokens[tokens.len() - 1])
    }

    /// One autoregressive step: decode, constrain, sample, update stream
    /// mode. Returns the sampled token.
    pub fn decode(&mut self, last_token: TokenId) -> Result<TokenId, BackendError> {
        if self.backend.num_available_pages() < 1 {
            return Err(BackendError::ContextLengthLimit);
        }

        let embedding = self.backend.embed(&[last_token])?;
        self.backend.begin_forward(1);
        let logits = self.backend.decode(embedding);
        self.backend.end_forward();
        let mut logits = logits?;

        // Constrain logits while the active mode has a live matcher.
        let mut matcher = self
            .stream_modes
            .get_mut(&self.current_mode)
            .and_then(|mode| mode.matcher.take());
        if let Some(active) = matcher.as_mut() {
            let vocab = self.tokenizer.vocab_size();
            let mut bitmask = vec![0u32; vocab.div_ceil(32)];
            active.fill_token_bitmask(&mut bitmask);
            self.backend.apply_bitmask_inplace(&mut logits, &bitmask)?;
        }

        let draw = self.rng.gen::<f64>();
        let sampled =
            self.backend
                .sample_top_p(&logits, self.config.temperature, self.config.top_p, draw)?;
        self.history.push(sampled);

        if let Some(active) = matcher.as_mut() {
            active.accept_token(sampled);
            if active.is_terminated() {
                matcher = None;
            }
        }
        if let Some(mode) = self.stream_modes.get_mut(&self.current_mode) {
            mode.matcher = matcher;
        }

        self.update_stream_mode();
        Ok(sampled)
    }

    /// Trailing-token indicator matching. Correct because configuration
    /// rejects open indicators that collide (see `add_stream_mode`).
    fn update_stream_mode(&mut self) {
        if self.current_mode == MODE_OUTPUT_TEXT {
            let mut opened: Option<String> = None;
            for (name, mode) in &self.stream_modes {
                if name == MODE_OUTPUT_TEXT {
                    continue;
                }
                if ends_with(&self.history, &mode.open_indicator) {
                    opened = Some(name.clone());
                    break;
                }
            }
            if let Some(name) = opened {
                if let Some(mode) = self.stream_modes.get_mut(&name) {
                    if let Some(grammar) = &mode.grammar {
                        mode.matcher = Some(grammar.matcher(&mode.close_indicator));
                    }
                }
                debug!(mode = %name, "stream mode opened");
                self.current_mode = name;
            }
        } else if let Some(mode) = self.stream_modes.get_mut(&self.current_mode) {
            if ends_with(&self.history, &mode.close_indicator) {
                mode.matcher = None;
                debug!(mode = %self.current_mode, "stream mode closed");
                self.current_mode = MODE_OUTPUT_TEXT.to_string();
            }
        }
    }

    /// Buffers `token` and tries to detokenize the pending run. `None`
    /// while the run still ends in an incomplete codepoint.
    pub fn detokenize(&mut self, token: TokenId) -> Option<String> {
        self.output_stream.push(token);
        let text = self.tokenizer.decode(&self.output_stream, false);
        if text.ends_with(REPLACEMENT) {
            return None;
        }
        self.output_stream.clear();
        Some(text)
    }

    /// Registers a user-defined stream mode. Open indicators must be
    /// non-empty and unique across modes; overlap would make trailing-token
    /// matching ambiguous.
    pub fn add_stream_mode(
        &mut self,
        name: &str,
        open: &str,
        close: &str,
    ) -> Result<(), OperatorError> {
        let context = "add_stream_mode";
        if name == MODE_OUTPUT_TEXT {
            return Err(
                ValueError::new(context, "name", "a non-default mode name", name).into(),
            );
        }
        if open.is_empty() {
            return Err(ValueError::new(context, "open_indicator", "non-empty", "empty").into());
        }
        let open_tokens = self.tokenizer.encode(open);
        for (existing, mode) in &self.stream_modes {
            if existing != name && mode.open_indicator == open_tokens {
                return Err(OperatorError::new(
                    ErrorCode::ValueError,
                    format!("open indicator of `{name}` collides with mode `{existing}`"),
                ));
            }
        }
        self.stream_modes.insert(
            name.to_string(),
            StreamMode::new(self.tokenizer.as_ref(), open, close),
        );
        Ok(())
    }

    pub fn remove_stream_mode(&mut self, name: &str) -> Result<(), OperatorError> {
        if name == MODE_OUTPUT_TEXT {
            return Err(ValueError::new(
                "remove_stream_mode",
                "name",
                "a non-default mode name",
                name,
            )
            .into());
        }
        if self.current_mode == name {
            self.current_mode = MODE_OUTPUT_TEXT.to_string();
        }
        self.stream_modes.remove(name);
        Ok(())
    }

    /// Compiles and installs a grammar on a named mode. Matchers are
    /// instantiated per decode run when the mode opens.
    pub fn set_grammar(&mut self, mode_name: &str, spec: &GrammarSpec) -> Result<(), OperatorError> {
        let compiler = self.grammar_compiler.clone().ok_or_else(|| {
            OperatorError::new(
                ErrorCode::ValueError,
                "this model has no grammar compiler",
            )
        })?;
        let grammar = compiler.compile(spec)?;
        let mode = self.stream_modes.get_mut(mode_name).ok_or_else(|| {
            ValueError::new("set_grammar", "mode", "a registered stream mode", mode_name)
        })?;
        mode.grammar = Some(grammar);
        mode.matcher = None;
        Ok(())
    }

    pub fn reset_grammar(&mut self, mode_name: &str) {
        if let Some(mode) = self.stream_modes.get_mut(mode_name) {
            mode.grammar = None;
            mode.matcher = None;
        }
    }

    pub fn is_bor(&self, token: &str) -> bool {
        token == BOR_TOKEN
    }

    pub fn is_eor(&self, token: &str) -> bool {
        token == EOR_TOKEN
    }

    pub fn is_eos(&self, token: &str) -> bool {
        !token.is_empty() && token == self.template.eos_token()
    }

    pub fn is_botc(&self, token: &str) -> bool {
        !token.is_empty() && token == self.template.botc_token()
    }

    pub fn is_eotc(&self, token: &str) -> bool {
        !token.is_empty() && token == self.template.eotc_token()
    }
}
