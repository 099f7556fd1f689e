//! Token sampling.
//!
//! One [`Sampler`] is built per request, after the slot and destroyed
//! before it.  Sampling reads the slot's logits and applies, in order:
//! repetition penalties over a sliding window of accepted tokens, the
//! grammar constraint (when structured output was requested), then either
//! greedy argmax (`temperature == 0`) or temperature-scaled top-p
//! nucleus sampling with a per-request seeded RNG.

use std::cmp::Ordering;
use std::collections::{HashMap, VecDeque};
use std::sync::Arc;

use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};

use crate::error::EngineError;
use crate::grammar::{Grammar, GrammarMachine};
use crate::model::Model;
use crate::slot::Slot;
use crate::token::Token;

/// How many recently accepted tokens the penalties look at.
const PENALTY_WINDOW: usize = 64;

/// Sampling configuration for one request.
#[derive(Debug, Clone)]
pub struct SamplerParams {
    /// 0 selects greedy decoding; otherwise scales the distribution.
    pub temperature: f32,
    /// Nucleus mass; 1.0 disables the filter.
    pub top_p: f32,
    /// Penalty proportional to a token's count in the window.
    pub frequency_penalty: f32,
    /// Flat penalty for any token present in the window.
    pub presence_penalty: f32,
    /// Seed for the per-request RNG.
    pub seed: u64,
    /// Optional structured-output constraint.
    pub grammar: Option<Grammar>,
}

impl Default for SamplerParams {
    fn default() -> Self {
        Self {
            temperature: 1.0,
            top_p: 1.0,
            frequency_penalty: 0.0,
            presence_penalty: 0.0,
            seed: 0,
            grammar: None,
        }
    }
}

/// Stateful per-request sampler.
pub struct Sampler {
    temperature: f32,
    top_p: f32,
    frequency_penalty: f32,
    presence_penalty: f32,
    rng: StdRng,
    recent: VecDeque<Token>,
    constraint: Option<GrammarMachine>,
}

impl Sampler {
    /// Build a sampler from request parameters.
    ///
    /// # Errors
    /// Fails when the grammar does not validate.
    pub fn new(params: SamplerParams) -> Result<Self, EngineError> {
        let constraint = params.grammar.map(GrammarMachine::new).transpose()?;
        Ok(Self {
            temperature: params.temperature,
            top_p: params.top_p,
            frequency_penalty: params.frequency_penalty,
            presence_penalty: params.presence_penalty,
            rng: StdRng::seed_from_u64(params.seed),
            recent: VecDeque::with_capacity(PENALTY_WINDOW),
            constraint,
        })
    }

    /// Sample the next token from the slot's current logits.
    pub fn sample(&mut self, slot: &Slot) -> Result<Token, EngineError> {
        let mut logits = slot.logits()?.to_vec();
        self.apply_penalties(&mut logits);

        if self.constraint.is_some() {
            return self.sample_constrained(slot, &logits);
        }

        if self.temperature <= 0.0 {
            return Ok(argmax(&logits));
        }
        let probs = softmax_with_temperature(&logits, self.temperature);
        let nucleus = nucleus_indices(&probs, self.top_p);
        Ok(draw(&mut self.rng, &nucleus, &probs))
    }

    /// Record a sampled token: it enters the penalty window and, unless it
    /// is an end-of-generation token, advances the grammar state.
    pub fn accept(&mut self, slot: &Slot, token: Token, apply_grammar: bool) {
        self.recent.push_back(token);
        if self.recent.len() > PENALTY_WINDOW {
            self.recent.pop_front();
        }
        if !apply_grammar {
            return;
        }
        if let Some(machine) = self.constraint.as_mut() {
            if !slot.model().token_is_eog(token) {
                if let Ok(piece) = slot.model().token_to_piece(token, false) {
                    machine.accept_piece(&piece);
                }
            }
        }
    }

    fn apply_penalties(&self, logits: &mut [f32]) {
        if self.frequency_penalty == 0.0 && self.presence_penalty == 0.0 {
            return;
        }
        let mut counts: HashMap<Token, u32> = HashMap::new();
        for &token in &self.recent {
            *counts.entry(token).or_insert(0) += 1;
        }
        for (&token, &count) in &counts {
            if let Some(logit) = logits.get_mut(token as usize) {
                *logit -= count as f32 * self.frequency_penalty + self.presence_penalty;
            }
        }
    }

    /// Sampling restricted to tokens the grammar accepts.  The nucleus is
    /// filtered first; if nothing in it is viable the whole vocabulary is
    /// scanned in probability order.
    fn sample_constrained(&mut self, slot: &Slot, logits: &[f32]) -> Result<Token, EngineError> {
        let model = slot.model();
        let machine = self
            .constraint
            .as_ref()
            .expect("sample_constrained requires a constraint");

        if self.temperature <= 0.0 {
            let order = descending_order(logits);
            for &i in &order {
                if token_allowed(model, machine, i as Token) {
                    return Ok(i as Token);
                }
            }
            return Err(EngineError::Grammar(
                "no viable continuation".to_string(),
            ));
        }

        let probs = softmax_with_temperature(logits, self.temperature);
        let viable: Vec<usize> = nucleus_indices(&probs, self.top_p)
            .into_iter()
            .filter(|&i| token_allowed(model, machine, i as Token))
            .collect();
        if !viable.is_empty() {
            return Ok(draw(&mut self.rng, &viable, &probs));
        }
        let order = descending_order(&probs);
        for &i in &order {
            if token_allowed(model, machine, i as Token) {
                return Ok(i as Token);
            }
        }
        Err(EngineError::Grammar("no viable continuation".to_string()))
    }
}

/// End-of-generation is allowed only once the grammar is complete; other
/// tokens must keep the output inside the language.
fn token_allowed(model: &Arc<dyn Model>, machine: &GrammarMachine, token: Token) -> bool {
    if model.token_is_eog(token) {
        return machine.is_complete();
    }
    model
        .token_to_piece(token, false)
        .map(|piece| machine.allows_piece(&piece))
        .unwrap_or(false)
}

fn argmax(logits: &[f32]) -> Token {
    let mut best = 0usize;
    for (i, &logit) in logits.iter().enumerate() {
        if logit > logits[best] {
            best = i;
        }
    }
    best as Token
}

fn descending_order(values: &[f32]) -> Vec<usize> {
    let mut order: Vec<usize> = (0..values.len()).collect();
    order.sort_by(|&a, &b| values[b].partial_cmp(&values[a]).unwrap_or(Ordering::Equal));
    order
}

fn softmax_with_temperature(logits: &[f32], temperature: f32) -> Vec<f32> {
    let max = logits.iter().copied().fold(f32::NEG_INFINITY, f32::max);
    let mut probs: Vec<f32> = logits
        .iter()
        .map(|&l| ((l - max) / temperature).exp())
        .collect();
    let sum: f32 = probs.iter().sum();
    if sum > 0.0 {
        for p in &mut probs {
            *p /= sum;
        }
    }
    probs
}

/// Indices of the smallest set of most-probable tokens whose mass reaches
/// `top_p`, in descending probability order.
fn nucleus_indices(probs: &[f32], top_p: f32) -> Vec<usize> {
    let order = descending_order(probs);
    if top_p >= 1.0 {
        return order;
    }
    let mut kept = Vec::new();
    let mut mass = 0.0f32;
    for i in order {
        kept.push(i);
        mass += probs[i];
        if mass >= top_p {
            break;
        }
    }
    kept
}

/// Weighted draw among `candidates`, renormalized over their mass.
fn draw(rng: &mut StdRng, candidates: &[usize], probs: &[f32]) -> Token {
    let total: f32 = candidates.iter().map(|&i| probs[i]).sum();
    let mut remaining = rng.gen::<f32>() * total;
    for &i in candidates {
        remaining -= probs[i];
        if remaining <= 0.0 {
            return i as Token;
        }
    }
    *candidates.last().expect("candidates must not be empty") as Token
}

// ── Tests ──────────────────────────────────────────────────────────────────────

#[cfg(test)]
mod test {
    use super::*;
    use crate::testing::StubModel;

    fn row(n_vocab: usize, pairs: &[(usize, f32)]) -> Vec<f32> {
        let mut logits = vec![-10.0; n_vocab];
        for &(i, l) in pairs {
            logits[i] = l;
        }
        logits
    }

    fn slot_with_rows(model: StubModel, rows: Vec<Vec<f32>>) -> Slot {
        let model: Arc<dyn Model> = Arc::new(model.with_logit_rows(rows));
        let mut slot = Slot::new(model);
        slot.start().expect("start failed");
        slot.prefill(&[72, 73]).expect("prefill failed");
        slot
    }

    #[test]
    fn greedy_picks_the_largest_logit() {
        let n = StubModel::BASE_VOCAB;
        let slot = slot_with_rows(StubModel::new(), vec![row(n, &[(65, 3.0), (66, 2.0)])]);
        let mut sampler = Sampler::new(SamplerParams {
            temperature: 0.0,
            ..SamplerParams::default()
        })
        .unwrap();
        assert_eq!(sampler.sample(&slot).unwrap(), 65);
    }

    #[test]
    fn frequency_penalty_demotes_repeated_tokens() {
        let n = StubModel::BASE_VOCAB;
        let repeated = row(n, &[(65, 2.0), (66, 1.9)]);
        let mut slot = slot_with_rows(StubModel::new(), vec![repeated.clone(), repeated]);
        let mut sampler = Sampler::new(SamplerParams {
            temperature: 0.0,
            frequency_penalty: 0.5,
            ..SamplerParams::default()
        })
        .unwrap();

        let first = sampler.sample(&slot).unwrap();
        assert_eq!(first, 65);
        sampler.accept(&slot, first, true);
        slot.eval_token(first).unwrap();

        // 65 now carries a penalty of 0.5, dropping it below 66.
        assert_eq!(sampler.sample(&slot).unwrap(), 66);
    }

    #[test]
    fn equal_seeds_draw_identical_sequences() {
        let n = StubModel::BASE_VOCAB;
        let rows: Vec<Vec<f32>> = (0..8)
            .map(|_| row(n, &[(65, 1.0), (66, 0.9), (67, 0.8)]))
            .collect();

        let mut picks = Vec::new();
        for _ in 0..2 {
            let mut slot = slot_with_rows(StubModel::new(), rows.clone());
            let mut sampler = Sampler::new(SamplerParams {
                temperature: 0.9,
                seed: 42,
                ..SamplerParams::default()
            })
            .unwrap();
            let mut sequence = Vec::new();
            for _ in 0..8 {
                let token = sampler.sample(&slot).unwrap();
                sampler.accept(&slot, token, true);
                slot.eval_token(token).unwrap();
                sequence.push(token);
            }
            picks.push(sequence);
        }
        assert_eq!(picks[0], picks[1]);
    }

    #[test]
    fn nucleus_keeps_the_smallest_covering_prefix() {
        let probs = vec![0.5, 0.3, 0.2];
        assert_eq!(nucleus_indices(&probs, 0.7), vec![0, 1]);
        assert_eq!(nucleus_indices(&probs, 1.0), vec![0, 1, 2]);
        assert_eq!(nucleus_indices(&probs, 0.4), vec![0]);
    }

    #[test]
    fn grammar_redirects_greedy_sampling_to_viable_tokens() {
        let n = StubModel::BASE_VOCAB;
        // The model is dead set on emitting `x`; the grammar wants an object.
        let rows = vec![
            row(n, &[(b'x' as usize, 5.0), (b'{' as usize, 4.0)]),
            row(n, &[(b'x' as usize, 5.0), (b'}' as usize, 4.0)]),
            row(n, &[(b'x' as usize, 5.0)]),
        ];
        let mut slot = slot_with_rows(StubModel::new(), rows);
        let grammar = Grammar::from_json_schema(r#"{"type": "object"}"#).unwrap();
        let mut sampler = Sampler::new(SamplerParams {
            temperature: 0.0,
            grammar: Some(grammar),
            ..SamplerParams::default()
        })
        .unwrap();

        let mut output = String::new();
        loop {
            let token = sampler.sample(&slot).unwrap();
            sampler.accept(&slot, token, true);
            if slot.model().token_is_eog(token) {
                break;
            }
            output.push_str(&slot.model().token_to_piece(token, false).unwrap());
            slot.eval_token(token).unwrap();
        }
        assert_eq!(output, "{}");
    }

    #[test]
    fn eog_is_blocked_until_the_grammar_is_complete() {
        let n = StubModel::BASE_VOCAB;
        // The model wants to stop immediately; the grammar forces `{}` first.
        let eog = StubModel::EOG as usize;
        let rows = vec![
            row(n, &[(eog, 5.0), (b'{' as usize, 1.0)]),
            row(n, &[(eog, 5.0), (b'}' as usize, 1.0)]),
        ];
        let mut slot = slot_with_rows(StubModel::new(), rows);
        let grammar = Grammar::from_json_schema(r#"{"type": "object"}"#).unwrap();
        let mut sampler = Sampler::new(SamplerParams {
            temperature: 0.0,
            grammar: Some(grammar),
            ..SamplerParams::default()
        })
        .unwrap();

        let first = sampler.sample(&slot).unwrap();
        assert_eq!(first, b'{' as Token);
        sampler.accept(&slot, first, true);
        slot.eval_token(first).unwrap();

        let second = sampler.sample(&slot).unwrap();
        assert_eq!(second, b'}' as Token);
        sampler.accept(&slot, second, true);
        slot.eval_token(second).unwrap();

        // Object closed: end-of-generation becomes admissible.
        let third = sampler.sample(&slot).unwrap();
        assert!(slot.model().token_is_eog(third));
    }
}
