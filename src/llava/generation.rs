use candle_core::{Result, Tensor};
use candle_transformers::generation::{LogitsProcessor, Sampling};

/// Greedy decoding: always picks the most likely token, stops on any of
/// `eos_token_ids` (kept in the output) or after `max_new_tokens`.
///
/// `first_logits` are the logits after the prompt; `step` feeds one token back
/// into the model and returns the logits that follow it.
pub fn greedy_generate<F>(
    first_logits: Tensor,
    mut step: F,
    max_new_tokens: usize,
    eos_token_ids: &[u32],
) -> Result<Vec<u32>>
where
    F: FnMut(u32) -> Result<Tensor>,
{
    let mut logits_processor = LogitsProcessor::from_sampling(0, Sampling::ArgMax);
    let mut generated = Vec::with_capacity(max_new_tokens.min(1024));
    let mut logits = first_logits;

    while generated.len() < max_new_tokens {
        let next_token = logits_processor.sample(&logits)?;
        generated.push(next_token);
        if eos_token_ids.contains(&next_token) || generated.len() == max_new_tokens {
            break;
        }
        logits = step(next_token)?;
    }

    Ok(generated)
}
