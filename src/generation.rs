//! Beam sampling, the decoding policy every chat reply goes through.
//!
//! Each step scores the next token of every live beam, blocks tokens that
//! would repeat an n-gram, and picks `2 × beams` candidates (sampled at the
//! policy temperature, or the best ones when sampling is off). Candidates
//! that close the turn become finished hypotheses; the rest carry on.

use rand::distributions::{Distribution, WeightedIndex};
use rand::Rng;
use tracing::debug;

use crate::error::{ChatError, Result};
use crate::model::LanguageModel;

#[derive(Debug, Clone, Copy, PartialEq)]
pub struct DecodingPolicy {
    pub num_beams: usize,
    /// 0 disables n-gram blocking.
    pub no_repeat_ngram_size: usize,
    pub temperature: f32,
    /// Candidates kept per beam before sampling. 0 keeps all of them.
    pub top_k: usize,
    pub length_penalty: f32,
    pub do_sample: bool,
}

impl DecodingPolicy {
    pub const CHAT: DecodingPolicy = DecodingPolicy {
        num_beams: 3,
        no_repeat_ngram_size: 2,
        temperature: 0.7,
        top_k: 50,
        length_penalty: 1.0,
        do_sample: true,
    };

    /// Same policy with sampling turned off.
    pub fn deterministic(self) -> Self {
        Self { do_sample: false, ..self }
    }
}

impl Default for DecodingPolicy {
    fn default() -> Self {
        Self::CHAT
    }
}

#[derive(Debug, Clone, Copy)]
struct Candidate {
    beam: usize,
    token: u32,
    /// Cumulative log-probability of the beam extended by `token`.
    score: f32,
}

/// Finished sequences, at most `capacity` of them, best by normalized score.
struct Hypotheses {
    capacity: usize,
    length_penalty: f32,
    finished: Vec<(f32, Vec<u32>)>,
}

impl Hypotheses {
    fn new(capacity: usize, length_penalty: f32) -> Self {
        Self { capacity, length_penalty, finished: Vec::with_capacity(capacity + 1) }
    }

    fn normalize(&self, sum_logprobs: f32, len: usize) -> f32 {
        sum_logprobs / (len as f32).powf(self.length_penalty)
    }

    fn worst(&self) -> Option<(usize, f32)> {
        self.finished
            .iter()
            .enumerate()
            .map(|(i, (score, _))| (i, *score))
            .min_by(|a, b| a.1.total_cmp(&b.1))
    }

    fn add(&mut self, tokens: Vec<u32>, sum_logprobs: f32) {
        let score = self.normalize(sum_logprobs, tokens.len());
        if self.finished.len() < self.capacity {
            self.finished.push((score, tokens));
        } else if let Some((idx, worst)) = self.worst() {
            if score > worst {
                self.finished[idx] = (score, tokens);
            }
        }
    }

    /// True once no live beam can beat the worst finished hypothesis.
    fn is_done(&self, best_running: f32, cur_len: usize) -> bool {
        if self.finished.len() < self.capacity {
            return false;
        }
        let best_possible = self.normalize(best_running, cur_len);
        self.worst().map_or(false, |(_, worst)| worst >= best_possible)
    }

    fn into_best(self) -> Option<Vec<u32>> {
        self.finished
            .into_iter()
            .max_by(|a, b| a.0.total_cmp(&b.0))
            .map(|(_, tokens)| tokens)
    }
}

/// Tokens that would complete an n-gram already present in `sequence`.
pub fn banned_tokens(sequence: &[u32], ngram_size: usize) -> Vec<u32> {
    if ngram_size == 0 || sequence.len() + 1 < ngram_size {
        return Vec::new();
    }
    let prefix = &sequence[sequence.len() + 1 - ngram_size..];
    sequence
        .windows(ngram_size)
        .filter(|window| &window[..ngram_size - 1] == prefix)
        .map(|window| window[ngram_size - 1])
        .collect()
}

fn log_softmax(logits: &[f32]) -> Vec<f32> {
    let max_logit = logits.iter().copied().fold(f32::NEG_INFINITY, f32::max);
    let log_sum = logits.iter().map(|&l| (l - max_logit).exp()).sum::<f32>().ln() + max_logit;
    logits.iter().map(|&l| l - log_sum).collect()
}

/// The `keep` best continuations of one beam.
fn beam_candidates(
    beam: usize,
    logits: &[f32],
    sequence: &[u32],
    beam_score: f32,
    ngram_size: usize,
    keep: usize,
) -> Vec<Candidate> {
    let mut logprobs = log_softmax(logits);
    for token in banned_tokens(sequence, ngram_size) {
        if let Some(lp) = logprobs.get_mut(token as usize) {
            *lp = f32::NEG_INFINITY;
        }
    }

    let mut candidates: Vec<Candidate> = logprobs
        .iter()
        .enumerate()
        .filter(|(_, lp)| lp.is_finite())
        .map(|(token, lp)| Candidate { beam, token: token as u32, score: lp + beam_score })
        .collect();

    if keep > 0 && candidates.len() > keep {
        candidates.select_nth_unstable_by(keep - 1, |a, b| b.score.total_cmp(&a.score));
        candidates.truncate(keep);
    }
    candidates
}

/// Draws `count` distinct candidates, weighted by softmax(score / temperature).
fn sample_candidates<R: Rng + ?Sized>(
    candidates: &[Candidate],
    count: usize,
    temperature: f32,
    rng: &mut R,
) -> Vec<Candidate> {
    let temperature = temperature.max(f32::EPSILON);
    let max_score = candidates.iter().map(|c| c.score).fold(f32::NEG_INFINITY, f32::max);
    let mut weights: Vec<f32> = candidates
        .iter()
        .map(|c| ((c.score - max_score) / temperature).exp())
        .collect();

    let mut chosen = Vec::with_capacity(count);
    while chosen.len() < count {
        let Ok(dist) = WeightedIndex::new(&weights) else {
            break;
        };
        let idx = dist.sample(rng);
        chosen.push(candidates[idx]);
        weights[idx] = 0.0;
    }
    chosen
}

/// Extends `input_ids` under `policy` until `max_length` total tokens, the
/// model's context window, or every beam has finished its turn.
///
/// The returned sequence starts with `input_ids`. When it ends before the
/// length limit, it closes with `eos_token_id`.
pub fn generate<M, R>(
    model: &M,
    input_ids: &[u32],
    max_length: usize,
    eos_token_id: u32,
    policy: &DecodingPolicy,
    rng: &mut R,
) -> Result<Vec<u32>>
where
    M: LanguageModel + ?Sized,
    R: Rng + ?Sized,
{
    if input_ids.is_empty() {
        return Err(ChatError::EmptyInput);
    }

    let num_beams = policy.num_beams.max(1);
    let limit = max_length.min(model.context_window());
    if input_ids.len() >= limit {
        debug!("Prompt of {} tokens already fills the limit of {}", input_ids.len(), limit);
        return Ok(input_ids.to_vec());
    }

    let mut sequences: Vec<Vec<u32>> = vec![input_ids.to_vec(); num_beams];
    // without sampling, identical beams would pick identical tokens
    let mut scores: Vec<f32> = (0..num_beams)
        .map(|i| if policy.do_sample || i == 0 { 0.0 } else { -1e9 })
        .collect();
    let mut hypotheses = Hypotheses::new(num_beams, policy.length_penalty);
    let mut cur_len = input_ids.len();
    let mut done = false;

    while cur_len < limit {
        let logits = model.next_token_logits(&sequences)?;
        if logits.len() != sequences.len() {
            return Err(ChatError::Shape(format!(
                "{} logit rows for {} beams",
                logits.len(),
                sequences.len()
            )));
        }

        let per_beam = if policy.do_sample { policy.top_k } else { 2 * num_beams };
        let mut candidates = Vec::new();
        for (beam, (row, sequence)) in logits.iter().zip(&sequences).enumerate() {
            candidates.extend(beam_candidates(
                beam,
                row,
                sequence,
                scores[beam],
                policy.no_repeat_ngram_size,
                per_beam,
            ));
        }

        let mut chosen = if policy.do_sample {
            sample_candidates(&candidates, 2 * num_beams, policy.temperature, rng)
        } else {
            candidates.sort_by(|a, b| b.score.total_cmp(&a.score));
            candidates.truncate(2 * num_beams);
            candidates
        };
        chosen.sort_by(|a, b| b.score.total_cmp(&a.score));

        let mut next_sequences = Vec::with_capacity(num_beams);
        let mut next_scores = Vec::with_capacity(num_beams);
        for (rank, candidate) in chosen.iter().enumerate() {
            if candidate.token == eos_token_id {
                if rank < num_beams {
                    hypotheses.add(sequences[candidate.beam].clone(), candidate.score);
                }
                continue;
            }
            let mut tokens = sequences[candidate.beam].clone();
            tokens.push(candidate.token);
            next_sequences.push(tokens);
            next_scores.push(candidate.score);
            if next_sequences.len() == num_beams {
                break;
            }
        }

        cur_len += 1;
        sequences = next_sequences;
        scores = next_scores;

        let Some(best_running) = scores.iter().copied().reduce(f32::max) else {
            done = true;
            break;
        };
        if hypotheses.is_done(best_running, cur_len) {
            done = true;
            break;
        }
    }

    if !done {
        for (sequence, score) in sequences.into_iter().zip(scores) {
            hypotheses.add(sequence, score);
        }
    }

    let mut best = hypotheses.into_best().unwrap_or_else(|| input_ids.to_vec());
    debug!("Generated {} tokens in {} steps", best.len() - input_ids.len(), cur_len - input_ids.len());
    if best.len() < limit {
        best.push(eos_token_id);
    }
    Ok(best)
}
