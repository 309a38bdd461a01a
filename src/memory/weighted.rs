//! Token-budgeted memory selection.
//!
//! Each history entry is scored `decay^rank × source_weight`, where `rank` is
//! the distance of its turn from the most recent one. Entries are taken in
//! descending score (ties to the more recent entry) until the next one would
//! overflow the budget; the retained entries are then replayed in
//! chronological order. Within a turn the question comes first, then the
//! retained reasoning steps, then the answer.

use std::cmp::Ordering;

use serde::{Deserialize, Serialize};

use super::{estimate_tokens, Turn};
use crate::llm::ChatMessage;

/// Origin of a weighted entry.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum MemorySource {
    /// A question/answer pair of the conversation
    ShortTerm,
    /// One tool call and its observation from an earlier turn
    Reasoning,
}

/// Per-source multipliers.
#[derive(Debug, Clone, Copy)]
pub struct SourceWeights {
    pub short_term: f64,
    pub reasoning: f64,
}

impl Default for SourceWeights {
    fn default() -> Self {
        Self {
            short_term: 1.0,
            reasoning: 0.6,
        }
    }
}

impl SourceWeights {
    pub fn weight(&self, source: MemorySource) -> f64 {
        match source {
            MemorySource::ShortTerm => self.short_term,
            MemorySource::Reasoning => self.reasoning,
        }
    }
}

/// A scored slice of history.
#[derive(Debug, Clone)]
pub struct WeightedEntry {
    /// Chronological turn index (0 = oldest)
    pub turn: usize,
    /// Position within the turn; the question/answer pair is step 0
    pub step: usize,
    pub source: MemorySource,
    pub messages: Vec<ChatMessage>,
    pub tokens: usize,
    pub score: f64,
}

impl WeightedEntry {
    pub fn new(turn: usize, step: usize, source: MemorySource, messages: Vec<ChatMessage>, score: f64) -> Self {
        let tokens = messages.iter().map(|m| estimate_tokens(&m.content)).sum();
        Self {
            turn,
            step,
            source,
            messages,
            tokens,
            score,
        }
    }

    fn chronology(&self) -> (usize, usize) {
        (self.turn, self.step)
    }
}

/// Score every question/answer pair and reasoning step of `turns`
/// (oldest first).
pub fn weigh_turns(turns: &[Turn], decay: f64, weights: SourceWeights) -> Vec<WeightedEntry> {
    let newest = turns.len().saturating_sub(1);
    let mut entries = Vec::new();

    for (index, turn) in turns.iter().enumerate() {
        let rank = (newest - index) as i32;
        let position_weight = decay.powi(rank);

        entries.push(WeightedEntry::new(
            index,
            0,
            MemorySource::ShortTerm,
            vec![
                ChatMessage::user(turn.query.clone()),
                ChatMessage::assistant(turn.answer.clone()),
            ],
            position_weight * weights.weight(MemorySource::ShortTerm),
        ));

        for (step, pair) in turn.reasoning.chunks(2).enumerate() {
            entries.push(WeightedEntry::new(
                index,
                step + 1,
                MemorySource::Reasoning,
                pair.to_vec(),
                position_weight * weights.weight(MemorySource::Reasoning),
            ));
        }
    }

    entries
}

/// Keep the maximal score-ordered prefix that fits `budget` tokens.
///
/// Returns the retained entries in chronological order.
pub fn select_within_budget(mut entries: Vec<WeightedEntry>, budget: usize) -> Vec<WeightedEntry> {
    entries.sort_by(|a, b| {
        b.score
            .partial_cmp(&a.score)
            .unwrap_or(Ordering::Equal)
            .then_with(|| b.chronology().cmp(&a.chronology()))
    });

    let mut used = 0usize;
    let mut retained = Vec::new();
    for entry in entries {
        if used + entry.tokens > budget {
            break;
        }
        used += entry.tokens;
        retained.push(entry);
    }

    tracing::trace!(retained = retained.len(), tokens = used, budget, "Selected weighted memory");

    retained.sort_by_key(WeightedEntry::chronology);
    retained
}

/// Render chronologically ordered entries as messages.
///
/// A turn's question/answer pair brackets that turn's reasoning steps.
pub fn replay(retained: Vec<WeightedEntry>) -> Vec<ChatMessage> {
    let mut messages = Vec::new();
    // Answer of the current turn, held back until its steps are out
    let mut pending: Option<(usize, Vec<ChatMessage>)> = None;

    for entry in retained {
        if pending.as_ref().is_some_and(|(turn, _)| *turn != entry.turn) {
            if let Some((_, answer)) = pending.take() {
                messages.extend(answer);
            }
        }
        match entry.source {
            MemorySource::ShortTerm => {
                let mut pair = entry.messages.into_iter();
                messages.extend(pair.next());
                pending = Some((entry.turn, pair.collect()));
            }
            MemorySource::Reasoning => messages.extend(entry.messages),
        }
    }
    if let Some((_, answer)) = pending {
        messages.extend(answer);
    }
    messages
}
