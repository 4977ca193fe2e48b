use std::path::Path;
use tokenizers::Tokenizer as HfTokenizer;
use tracing::{info, warn};

use crate::error::{Error, Result};

const BOS_CANDIDATES: &[&str] = &["<s>", "<bos>", "<|begin_of_text|>", "[CLS]"];
const EOS_CANDIDATES: &[&str] = &["</s>", "<eos>", "<|endoftext|>", "<|end_of_text|>", "[SEP]"];
const PAD_CANDIDATES: &[&str] = &["<pad>", "[PAD]"];

#[derive(Debug, Clone, Copy)]
pub struct TokenizerOptions {
    pub add_bos: bool,
    pub add_eos: bool,
    /// Hard cap on returned sequence length, markers included
    pub max_length: usize,
}

/// Subword tokenizer producing bounded ID sequences with optional
/// boundary markers.
pub struct Tokenizer {
    inner: HfTokenizer,
    options: TokenizerOptions,
    pad_token_id: u32,
    bos_token_id: u32,
    eos_token_id: u32,
}

impl Tokenizer {
    /// Load from a local `tokenizer.json`, falling back to a pretrained
    /// identifier when no such file exists.
    pub fn load(path: &str, options: TokenizerOptions) -> Result<Self> {
        let inner = if Path::new(path).exists() {
            info!("Loading tokenizer from {}", path);
            HfTokenizer::from_file(path)
        } else {
            info!("Resolving pretrained tokenizer {}", path);
            HfTokenizer::from_pretrained(path, None)
        }
        .map_err(|e| Error::TokenizerLoad {
            path: path.to_string(),
            reason: e.to_string(),
        })?;
        Self::build(inner, options, path)
    }

    pub fn from_hf(inner: HfTokenizer, options: TokenizerOptions) -> Result<Self> {
        Self::build(inner, options, "<in-memory>")
    }

    /// Padding and truncation stored in `tokenizer.json` are switched off;
    /// sequences are bounded by `max_length` and padded downstream.
    fn build(mut inner: HfTokenizer, options: TokenizerOptions, path: &str) -> Result<Self> {
        if inner.get_padding().is_some() || inner.get_truncation().is_some() {
            info!("Disabling padding and truncation configured in {}", path);
        }
        inner.with_padding(None);
        inner
            .with_truncation(None)
            .map_err(|e| Error::TokenizerLoad {
                path: path.to_string(),
                reason: e.to_string(),
            })?;

        let lookup = |candidates: &[&str]| candidates.iter().find_map(|t| inner.token_to_id(t));
        let bos_token_id = lookup(BOS_CANDIDATES).unwrap_or(1);
        let eos_token_id = lookup(EOS_CANDIDATES).unwrap_or(2);
        let pad_token_id = lookup(PAD_CANDIDATES).unwrap_or(0);
        if options.add_bos && lookup(BOS_CANDIDATES).is_none() {
            warn!("No BOS token in vocabulary, using id {}", bos_token_id);
        }
        if options.add_eos && lookup(EOS_CANDIDATES).is_none() {
            warn!("No EOS token in vocabulary, using id {}", eos_token_id);
        }
        Ok(Self {
            inner,
            options,
            pad_token_id,
            bos_token_id,
            eos_token_id,
        })
    }

    pub fn options(&self) -> TokenizerOptions {
        self.options
    }

    fn finish(&self, mut ids: Vec<u32>) -> Vec<u32> {
        let markers = usize::from(self.options.add_bos) + usize::from(self.options.add_eos);
        ids.truncate(self.options.max_length.saturating_sub(markers));
        if self.options.add_bos {
            ids.insert(0, self.bos_token_id);
        }
        if self.options.add_eos {
            ids.push(self.eos_token_id);
        }
        ids.truncate(self.options.max_length);
        ids
    }

    pub fn encode(&self, text: &str) -> Result<Vec<u32>> {
        let encoding = self
            .inner
            .encode(text, false)
            .map_err(|e| Error::Tokenization(e.to_string()))?;
        Ok(self.finish(encoding.get_ids().to_vec()))
    }

    pub fn decode(&self, ids: &[u32], skip_special_tokens: bool) -> Result<String> {
        self.inner
            .decode(ids, skip_special_tokens)
            .map_err(|e| Error::Tokenization(e.to_string()))
    }

    pub fn vocab_size(&self) -> usize {
        self.inner.get_vocab_size(true)
    }

    pub fn pad_token_id(&self) -> u32 {
        self.pad_token_id
    }

    pub fn bos_token_id(&self) -> u32 {
        self.bos_token_id
    }

    pub fn eos_token_id(&self) -> u32 {
        self.eos_token_id
    }
}
