//! Small backbones for offline runs and tests.
//!
//! Shapes are a few dozen units wide so a full forward/backward pass runs in
//! milliseconds on CPU.

use std::collections::HashMap;

use crate::backbone::BackboneSpec;
use crate::error::CoreResult;
use crate::tokenizer::Tokenize;

/// Words every prompt template uses.
pub const TEMPLATE_WORDS: &[&str] = &["a", "photo", "of", "x"];

fn tiny(name: &str, vision_width: usize, text_width: usize, embed_dim: usize) -> BackboneSpec {
    BackboneSpec {
        name: name.to_string(),
        hf_repo: String::new(),
        image_resolution: 32,
        patch_size: 8,
        vision_width,
        vision_layers: 2,
        vision_heads: 4,
        context_length: 16,
        vocab_size: 64,
        text_width,
        text_layers: 2,
        text_heads: 4,
        embed_dim,
    }
}

/// Student-sized backbone.
pub fn tiny_spec() -> BackboneSpec {
    tiny("tiny-student", 32, 32, 16)
}

/// Teacher-sized backbone with a wider embedding than [`tiny_spec`].
pub fn tiny_teacher_spec() -> BackboneSpec {
    tiny("tiny-teacher", 48, 32, 24)
}

/// Word tokenizer over the template words plus `classnames`.
pub fn tiny_tokenizer(classnames: &[&str]) -> WordTokenizer {
    let mut words: Vec<&str> = TEMPLATE_WORDS.to_vec();
    for name in classnames {
        words.extend(name.split(|c: char| c == '_' || c.is_whitespace()));
    }
    WordTokenizer::new(&words, tiny_spec().context_length)
}

/// Whitespace tokenizer over a fixed vocabulary.
///
/// Id 0 is padding, `1..=n` are the words, then unknown, start and end.
/// End-of-text is the largest id as in CLIP.
#[derive(Debug, Clone)]
pub struct WordTokenizer {
    vocab: HashMap<String, u32>,
    context_length: usize,
}

impl WordTokenizer {
    pub fn new<S: AsRef<str>>(words: &[S], context_length: usize) -> Self {
        let mut vocab = HashMap::new();
        for w in words {
            let next = vocab.len() as u32 + 1;
            vocab.entry(w.as_ref().to_lowercase()).or_insert(next);
        }
        Self { vocab, context_length }
    }

    /// Ids span `0..vocab_size()`.
    pub fn vocab_size(&self) -> usize {
        self.vocab.len() + 4
    }

    fn unk_token(&self) -> u32 {
        self.vocab.len() as u32 + 1
    }
}

impl Tokenize for WordTokenizer {
    fn context_length(&self) -> usize {
        self.context_length
    }

    fn sot_token(&self) -> u32 {
        self.vocab.len() as u32 + 2
    }

    fn eot_token(&self) -> u32 {
        self.vocab.len() as u32 + 3
    }

    fn encode(&self, text: &str) -> CoreResult<Vec<u32>> {
        Ok(text
            .split_whitespace()
            .map(|w| {
                let w = w.trim_end_matches('.').to_lowercase();
                self.vocab.get(&w).copied().unwrap_or_else(|| self.unk_token())
            })
            .collect())
    }
}
