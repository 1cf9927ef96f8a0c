use std::path::Path;

use candle_core::{Device, Tensor};
use tokenizers::Tokenizer as HfTokenizer;
use tracing::debug;

use crate::error::{CoreError, CoreResult};

/// Fixed-length tokenisation for the CLIP text tower.
///
/// `tokenize` yields `[SOT, ids.., EOT, 0, 0, ..]` of exactly
/// `context_length()` ids.
pub trait Tokenize: Send + Sync {
    fn context_length(&self) -> usize;
    fn sot_token(&self) -> u32;
    fn eot_token(&self) -> u32;

    /// Raw ids for `text`, without start/end markers.
    fn encode(&self, text: &str) -> CoreResult<Vec<u32>>;

    fn tokenize(&self, text: &str) -> CoreResult<Vec<u32>> {
        let ids = self.encode(text)?;
        let max = self.context_length();
        if ids.len() + 2 > max {
            return Err(CoreError::SequenceTooLong { got: ids.len() + 2, max });
        }
        let mut out = Vec::with_capacity(max);
        out.push(self.sot_token());
        out.extend_from_slice(&ids);
        out.push(self.eot_token());
        out.resize(max, 0);
        Ok(out)
    }
}

/// Tokenised prompts ready for the text tower.
#[derive(Debug, Clone)]
pub struct TokenizedBatch {
    /// `(n, context_length)` u32 ids.
    pub ids: Tensor,
    /// Index of the end-of-text token in each row.
    pub eot_positions: Vec<usize>,
}

/// Tokenise every text and stack the rows.
pub fn tokenize_batch(tok: &dyn Tokenize, texts: &[String], device: &Device) -> CoreResult<TokenizedBatch> {
    let ctx = tok.context_length();
    let mut flat = Vec::with_capacity(texts.len() * ctx);
    let mut eot_positions = Vec::with_capacity(texts.len());
    for text in texts {
        let ids = tok.tokenize(text)?;
        eot_positions.push(eot_position(&ids, tok.eot_token()));
        flat.extend(ids);
    }
    let ids = Tensor::from_vec(flat, (texts.len(), ctx), device)?;
    Ok(TokenizedBatch { ids, eot_positions })
}

/// First occurrence of `eot` in `ids`, or the last index when absent.
pub fn eot_position(ids: &[u32], eot: u32) -> usize {
    ids.iter().position(|&t| t == eot).unwrap_or(ids.len().saturating_sub(1))
}

// ── ClipTokenizer ─────────────────────────────────────────────────────────────

/// The byte-level BPE tokenizer shipped with OpenAI CLIP (`tokenizer.json`).
#[derive(Debug)]
pub struct ClipTokenizer {
    inner: HfTokenizer,
    sot: u32,
    eot: u32,
    context_length: usize,
}

impl ClipTokenizer {
    pub fn from_file(path: &Path, context_length: usize) -> CoreResult<Self> {
        let inner = HfTokenizer::from_file(path).map_err(|e| CoreError::Tokenizer(e.to_string()))?;
        let special = |tok: &str| {
            inner.token_to_id(tok).ok_or_else(|| CoreError::Tokenizer(format!("{tok} missing from vocabulary")))
        };
        let sot = special("<|startoftext|>")?;
        let eot = special("<|endoftext|>")?;

        debug!(sot, eot, vocab_size = inner.get_vocab_size(true), "CLIP tokenizer loaded");
        Ok(Self { inner, sot, eot, context_length })
    }
}

impl Tokenize for ClipTokenizer {
    fn context_length(&self) -> usize {
        self.context_length
    }

    fn sot_token(&self) -> u32 {
        self.sot
    }

    fn eot_token(&self) -> u32 {
        self.eot
    }

    fn encode(&self, text: &str) -> CoreResult<Vec<u32>> {
        let enc = self.inner.encode(text, false).map_err(|e| CoreError::Tokenizer(e.to_string()))?;
        Ok(enc.get_ids().to_vec())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::testing::WordTokenizer;

    fn words() -> WordTokenizer {
        WordTokenizer::new(&["a", "photo", "of", "cat", "dog", "x"], 8)
    }

    #[test]
    fn test_tokenize_pads_to_context() {
        let tok = words();
        let ids = tok.tokenize("a photo of a cat.").unwrap();
        assert_eq!(ids.len(), 8);
        assert_eq!(ids[0], tok.sot_token());
        assert_eq!(&ids[1..6], &[1, 2, 3, 1, 4]);
        assert_eq!(ids[6], tok.eot_token());
        assert_eq!(ids[7], 0);
    }

    #[test]
    fn test_tokenize_rejects_overflow() {
        let tok = words();
        let err = tok.tokenize("x x x x x x x").unwrap_err();
        assert!(matches!(err, CoreError::SequenceTooLong { got: 9, max: 8 }));
    }

    #[test]
    fn test_unknown_words_map_to_unk() {
        let tok = words();
        assert_eq!(tok.encode("zebra").unwrap(), vec![7]);
        assert_eq!(tok.vocab_size(), 10);
        assert_eq!(tok.eot_token(), 9, "end-of-text is the largest id");
    }

    #[test]
    fn test_batch_eot_positions() {
        let tok = words();
        let batch = tokenize_batch(&tok, &["cat".to_string(), "a photo of dog".to_string()], &Device::Cpu).unwrap();
        assert_eq!(batch.ids.dims(), &[2, 8]);
        assert_eq!(batch.eot_positions, vec![2, 5]);
    }

    #[test]
    fn test_eot_position_fallback() {
        assert_eq!(eot_position(&[5, 6, 7], 9), 2);
        assert_eq!(eot_position(&[5, 9, 9], 9), 1);
    }
}
