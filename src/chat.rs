use rand::Rng;
use tracing::{info, warn};

use crate::error::Result;
use crate::generation::{self, DecodingPolicy};
use crate::model::{LanguageModel, TextCodec};

/// Prefix of the reply shown when a turn could not be generated.
pub const APOLOGY_PREFIX: &str = "Sorry, I encountered an error:";

/// An assistant reply and the token history to carry into the next turn.
#[derive(Debug, Clone, PartialEq)]
pub struct Reply {
    pub text: String,
    /// `None` after a failed turn, which resets the conversation context.
    pub history: Option<Vec<u32>>,
}

/// Answers `user_text` in the context of `history`.
///
/// Never fails: any tokenizer or model error becomes an apology reply with
/// no history.
pub fn generate_response<R: Rng + ?Sized>(
    tokenizer: &dyn TextCodec,
    model: &dyn LanguageModel,
    history: Option<&[u32]>,
    user_text: &str,
    max_length: usize,
    policy: &DecodingPolicy,
    rng: &mut R,
) -> Reply {
    match run_turn(tokenizer, model, history, user_text, max_length, policy, rng) {
        Ok(reply) => reply,
        Err(e) => {
            warn!("Generation failed: {}", e);
            Reply { text: format!("{} {}", APOLOGY_PREFIX, e), history: None }
        }
    }
}

fn run_turn<R: Rng + ?Sized>(
    tokenizer: &dyn TextCodec,
    model: &dyn LanguageModel,
    history: Option<&[u32]>,
    user_text: &str,
    max_length: usize,
    policy: &DecodingPolicy,
    rng: &mut R,
) -> Result<Reply> {
    let turn = format!("{}{}", user_text, tokenizer.eos_token());
    let new_input_ids = tokenizer.encode(&turn)?;

    let bot_input_ids = match history {
        Some(previous) => [previous, new_input_ids.as_slice()].concat(),
        None => new_input_ids,
    };
    info!(
        "Generating reply: {} context tokens, max length {}",
        bot_input_ids.len(),
        max_length
    );

    let output_ids = generation::generate(
        model,
        &bot_input_ids,
        max_length,
        tokenizer.eos_token_id(),
        policy,
        rng,
    )?;

    let generated_text = tokenizer.decode(&output_ids[bot_input_ids.len()..])?;
    let text = clean_reply(&generated_text, tokenizer.eos_token());
    info!("Generated {} tokens: '{}'", output_ids.len() - bot_input_ids.len(), text);

    Ok(Reply { text, history: Some(output_ids) })
}

/// Strips any end-of-turn markers that survived decoding.
fn clean_reply(text: &str, eos_token: &str) -> String {
    if eos_token.is_empty() {
        return text.trim().to_string();
    }
    text.replace(eos_token, "").trim().to_string()
}
