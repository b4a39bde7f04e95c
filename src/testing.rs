//! Deterministic stand-ins for the tokenizer and the ONNX model.

use std::sync::atomic::{AtomicUsize, Ordering};
use std::time::Duration;

use crate::error::{ChatError, Result};
use crate::model::{LanguageModel, TextCodec};

pub const EOS: &str = "<|endoftext|>";
pub const EOS_ID: u32 = 0;

const WORDS: &[&str] = &[
    EOS, "<unk>", "hello", "how", "are", "you", "i", "am", "fine", "thanks", "doing", "today",
    "what", "about", "ai", "life", "good",
];

/// Whitespace tokenizer over a tiny fixed vocabulary.
#[derive(Default)]
pub struct WordCodec;

impl WordCodec {
    pub fn id(word: &str) -> u32 {
        WORDS.iter().position(|w| *w == word).unwrap_or(1) as u32
    }
}

impl TextCodec for WordCodec {
    fn encode(&self, text: &str) -> Result<Vec<u32>> {
        let (body, closes_turn) = match text.strip_suffix(EOS) {
            Some(body) => (body, true),
            None => (text, false),
        };
        let mut ids: Vec<u32> = body
            .split_whitespace()
            .map(|w| {
                let word = w.trim_matches(|c: char| !c.is_alphanumeric()).to_lowercase();
                Self::id(&word)
            })
            .collect();
        if closes_turn {
            ids.push(EOS_ID);
        }
        Ok(ids)
    }

    fn decode(&self, ids: &[u32]) -> Result<String> {
        let words: Vec<&str> = ids
            .iter()
            .filter(|&&id| id != EOS_ID)
            .map(|&id| WORDS.get(id as usize).copied().unwrap_or("<unk>"))
            .collect();
        Ok(words.join(" "))
    }

    fn eos_token(&self) -> &str {
        EOS
    }

    fn eos_token_id(&self) -> u32 {
        EOS_ID
    }

    fn pad_token_id(&self) -> u32 {
        EOS_ID
    }
}

/// A model that strongly prefers `next(sequence)` and spreads the rest of
/// the mass evenly.
pub struct ScriptedModel {
    pub next: fn(&[u32]) -> u32,
    pub vocab: usize,
    pub window: usize,
    pub calls: AtomicUsize,
    /// Wall-clock time each forward pass takes.
    pub delay: Duration,
}

impl ScriptedModel {
    pub fn new(next: fn(&[u32]) -> u32) -> Self {
        Self {
            next,
            vocab: WORDS.len(),
            window: 1024,
            calls: AtomicUsize::new(0),
            delay: Duration::ZERO,
        }
    }
}

impl LanguageModel for ScriptedModel {
    fn next_token_logits(&self, sequences: &[Vec<u32>]) -> Result<Vec<Vec<f32>>> {
        self.calls.fetch_add(1, Ordering::SeqCst);
        if !self.delay.is_zero() {
            std::thread::sleep(self.delay);
        }
        Ok(sequences
            .iter()
            .map(|seq| {
                let mut logits = vec![0.0; self.vocab];
                logits[(self.next)(seq) as usize] = 10.0;
                logits
            })
            .collect())
    }

    fn context_window(&self) -> usize {
        self.window
    }
}

/// Answers every turn with "i am fine thanks" and then closes it.
pub fn scripted_reply(seq: &[u32]) -> u32 {
    let i = WordCodec::id("i");
    let am = WordCodec::id("am");
    let fine = WordCodec::id("fine");
    let thanks = WordCodec::id("thanks");
    match seq.last().copied() {
        Some(EOS_ID) => i,
        Some(t) if t == i => am,
        Some(t) if t == am => fine,
        Some(t) if t == fine => thanks,
        _ => EOS_ID,
    }
}

pub fn scripted_model() -> ScriptedModel {
    ScriptedModel::new(scripted_reply)
}

/// A model whose forward pass always fails.
pub struct FailingModel;

impl LanguageModel for FailingModel {
    fn next_token_logits(&self, _sequences: &[Vec<u32>]) -> Result<Vec<Vec<f32>>> {
        Err(ChatError::Inference("onnx runtime exploded".to_string()))
    }

    fn context_window(&self) -> usize {
        1024
    }
}
