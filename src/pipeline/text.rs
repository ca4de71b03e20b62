//! Prompt tokenization and text encoding.

use ndarray::{Array2, Array3};
use ort::session::Session;
use ort::value::Tensor;
use tokenizers::Tokenizer;

use crate::error::{Error, Result};

use super::tensor::{element_type, extract_array3, is_int32};

/// Token context length of the CLIP text encoder.
pub const MAX_TOKENS: usize = 77;

/// End-of-text token, also used for padding.
const EOS_TOKEN: &str = "<|endoftext|>";

/// Turns prompts into CLIP token ids of fixed length.
pub struct PromptTokenizer {
    tokenizer: Tokenizer,
    pad_id: u32,
}

impl PromptTokenizer {
    /// Wrap a CLIP tokenizer.
    ///
    /// # Errors
    ///
    /// Returns an error if the tokenizer has no end-of-text token.
    pub fn new(tokenizer: Tokenizer) -> Result<Self> {
        let pad_id = tokenizer
            .token_to_id(EOS_TOKEN)
            .ok_or_else(|| Error::Tokenizer {
                reason: format!("vocabulary has no {EOS_TOKEN} token"),
            })?;

        Ok(Self { tokenizer, pad_id })
    }

    /// Tokenize `prompt` to exactly [`MAX_TOKENS`] ids.
    ///
    /// Long prompts are truncated with the end-of-text token kept last; short
    /// prompts are padded with it.
    ///
    /// # Errors
    ///
    /// Returns an error if tokenization fails.
    pub fn encode(&self, prompt: &str) -> Result<Vec<u32>> {
        let encoding = self
            .tokenizer
            .encode(prompt, true)
            .map_err(|err| Error::Tokenizer {
                reason: err.to_string(),
            })?;

        Ok(fit_to_context(encoding.get_ids(), self.pad_id))
    }
}

/// Truncate or pad token ids to the encoder context length.
fn fit_to_context(ids: &[u32], pad_id: u32) -> Vec<u32> {
    let mut ids = ids.to_vec();

    if ids.len() > MAX_TOKENS {
        ids.truncate(MAX_TOKENS);
        ids[MAX_TOKENS - 1] = pad_id;
    }
    ids.resize(MAX_TOKENS, pad_id);

    ids
}

/// Run the text encoder over one row of token ids.
///
/// Returns the last hidden state, shaped (1, 77, hidden).
///
/// # Errors
///
/// Returns an error if inference fails.
#[allow(clippy::cast_possible_wrap)]
pub fn encode_tokens(encoder: &mut Session, ids: &[u32]) -> Result<Array3<f32>> {
    let int32 = encoder
        .inputs
        .first()
        .and_then(|input| element_type(&input.input_type))
        .is_some_and(is_int32);

    let input_value = if int32 {
        let arr = Array2::from_shape_fn((1, ids.len()), |(_, i)| ids[i] as i32);
        Tensor::from_array(arr)
            .map_err(|source| Error::Inference { source })?
            .into_dyn()
    } else {
        let arr = Array2::from_shape_fn((1, ids.len()), |(_, i)| i64::from(ids[i]));
        Tensor::from_array(arr)
            .map_err(|source| Error::Inference { source })?
            .into_dyn()
    };

    let outputs = encoder
        .run(ort::inputs![input_value])
        .map_err(|source| Error::Inference { source })?;

    // First output is the last hidden state
    let output = outputs
        .values()
        .next()
        .ok_or_else(|| Error::ShapeMismatch {
            expected: "last_hidden_state output".to_string(),
            actual: "no output".to_string(),
        })?;

    extract_array3(&output)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_short_prompt_is_padded() {
        let ids = fit_to_context(&[49406, 320, 49407], 49407);

        assert_eq!(ids.len(), MAX_TOKENS);
        assert_eq!(&ids[..3], &[49406, 320, 49407]);
        assert!(ids[3..].iter().all(|&id| id == 49407));
    }

    #[test]
    fn test_long_prompt_keeps_eos_last() {
        let long: Vec<u32> = (0..100).collect();
        let ids = fit_to_context(&long, 49407);

        assert_eq!(ids.len(), MAX_TOKENS);
        assert_eq!(ids[0], 0);
        assert_eq!(ids[MAX_TOKENS - 2], 75);
        assert_eq!(ids[MAX_TOKENS - 1], 49407);
    }

    #[test]
    fn test_empty_prompt_is_all_padding() {
        let ids = fit_to_context(&[], 49407);
        assert_eq!(ids, vec![49407; MAX_TOKENS]);
    }
}
