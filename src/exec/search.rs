//! Beam search step and hypothesis bookkeeping.
//!
//! Candidate scoring runs on the CPU over plain vectors: for every batch
//! entry and incoming hypothesis, each source's scores are pruned to that
//! source's beam size, the pruned lists are combined, and the best
//! candidates across all incoming hypotheses form the new beam.
//!
//! The [`SearchRecord`] keeps, per choice layer and step, which incoming
//! hypothesis each new one extends (`src_beams`). Following those pointers
//! from the final beam backwards recovers the ancestors of every final
//! hypothesis at every earlier step.

use std::cmp::Ordering;
use std::collections::BTreeMap;

use crate::error::ExecError;
use crate::exec::value::BeamRef;
use crate::layers::choice::{ChoiceConfig, InputType};

/// Floor applied before taking the log of a probability.
const PROB_FLOOR: f32 = 1e-30;

/// Result of one search step for one choice layer. Row `r` of the new beam
/// belongs to batch entry `r / beam_size`.
#[derive(Clone, Debug, PartialEq)]
pub struct SearchStep {
    /// Incoming slot (within its batch entry) each new hypothesis extends.
    pub src_beams: Vec<usize>,
    /// Accumulated score of each new hypothesis.
    pub scores: Vec<f32>,
    /// Chosen label per source, per new hypothesis.
    pub labels: Vec<Vec<usize>>,
    pub beam_size: usize,
    /// Hypotheses per batch entry before this step.
    pub incoming: usize,
    /// Candidates scored per batch entry.
    pub considered: Vec<usize>,
}

/// Everything one search step reads.
pub struct SearchInput<'a> {
    /// The choice layer, for error reports.
    pub layer: &'a str,
    pub config: &'a ChoiceConfig,
    pub batch: usize,
    /// Hypotheses per batch entry in the incoming beam.
    pub incoming: usize,
    /// Scores of the incoming hypotheses, `batch * incoming`.
    pub prev_scores: &'a [f32],
    /// Incoming hypotheses that already ended.
    pub ended: &'a [bool],
    /// Steps taken so far per incoming hypothesis.
    pub lengths: &'a [usize],
    /// Per source: `batch * incoming` rows of `widths[i]` scores, row major.
    pub sources: &'a [Vec<f32>],
    pub widths: &'a [usize],
    /// Ground-truth label of source 0 per batch entry, for cheating.
    pub gold: Option<&'a [usize]>,
}

#[derive(Clone, Debug)]
struct Candidate {
    slot: usize,
    labels: Vec<usize>,
    score: f32,
    rank: f32,
}

/// Select the next beam.
///
/// Ties keep enumeration order: incoming slot first, then the combination
/// order of the pruned label lists (each sorted by score, lower label first
/// on ties).
pub fn search_step(input: &SearchInput<'_>) -> Result<SearchStep, ExecError> {
    let cfg = input.config;
    let k_in = input.incoming.max(1);
    let k_out = if cfg.keep_beams { k_in } else { cfg.beam_size };
    let n_src = input.sources.len();

    let mut out = SearchStep {
        src_beams: Vec::with_capacity(input.batch * k_out),
        scores: Vec::with_capacity(input.batch * k_out),
        labels: vec![Vec::with_capacity(input.batch * k_out); n_src],
        beam_size: k_out,
        incoming: k_in,
        considered: Vec::with_capacity(input.batch),
    };

    for b in 0..input.batch {
        let mut cands = Vec::new();
        for slot in 0..k_in {
            let row = b * k_in + slot;
            let prev = input.prev_scores.get(row).copied().unwrap_or(0.0);
            let len = input.lengths.get(row).copied().unwrap_or(0);
            if input.ended.get(row).copied().unwrap_or(false) {
                cands.push(Candidate {
                    slot,
                    labels: vec![cfg.eos_label; n_src],
                    score: prev,
                    rank: normalized(prev, len, cfg.length_normalization),
                });
                continue;
            }
            let pruned: Vec<Vec<(usize, f32)>> = (0..n_src)
                .map(|i| Ok(prune(&source_row(input, i, row)?, cfg.source_beam_sizes[i])))
                .collect::<Result<_, ExecError>>()?;
            for combo in combinations(&pruned) {
                let score = prev + combo.iter().map(|&(_, s)| s).sum::<f32>();
                cands.push(Candidate {
                    slot,
                    labels: combo.iter().map(|&(l, _)| l).collect(),
                    score,
                    rank: normalized(score, len + 1, cfg.length_normalization),
                });
            }
        }
        out.considered.push(cands.len());

        let mut order: Vec<usize> = (0..cands.len()).collect();
        order.sort_by(|&a, &b| {
            cands[b]
                .rank
                .partial_cmp(&cands[a].rank)
                .unwrap_or(Ordering::Equal)
        });

        let mut selected: Vec<Candidate> = if cfg.keep_beams {
            (0..k_in)
                .filter_map(|slot| order.iter().find(|&&i| cands[i].slot == slot))
                .map(|&i| cands[i].clone())
                .collect()
        } else {
            order.iter().take(k_out).map(|&i| cands[i].clone()).collect()
        };

        if cfg.cheating && !cfg.keep_beams {
            if let Some(&gold) = input.gold.and_then(|g| g.get(b)) {
                force_gold(input, b * k_in, gold, k_out, &mut selected)?;
            }
        }

        while selected.len() < k_out {
            selected.push(Candidate {
                slot: 0,
                labels: vec![cfg.eos_label; n_src],
                score: f32::NEG_INFINITY,
                rank: f32::NEG_INFINITY,
            });
        }
        for cand in selected {
            out.src_beams.push(cand.slot);
            out.scores.push(cand.score);
            for (i, label) in cand.labels.into_iter().enumerate() {
                out.labels[i].push(label);
            }
        }
    }
    Ok(out)
}

fn normalized(score: f32, len: usize, enabled: bool) -> f32 {
    if enabled {
        score / len.max(1) as f32
    } else {
        score
    }
}

/// Log scores of source `i` at `row`.
fn source_row(input: &SearchInput<'_>, i: usize, row: usize) -> Result<Vec<f32>, ExecError> {
    let width = input.widths[i];
    let start = row * width;
    let raw = input.sources[i]
        .get(start..start + width)
        .ok_or_else(|| ExecError::SearchInconsistency {
            layer: input.layer.to_string(),
            expected: Some(input.batch * input.incoming.max(1)),
            found: input.sources[i].len() / width.max(1),
        })?;
    Ok(match input.config.input_type {
        InputType::Prob => raw.iter().map(|&p| p.max(PROB_FLOOR).ln()).collect(),
        InputType::LogProb => raw.to_vec(),
    })
}

/// The `size` best labels, best first; lower label first on ties.
fn prune(scores: &[f32], size: usize) -> Vec<(usize, f32)> {
    let mut labelled: Vec<(usize, f32)> = scores.iter().copied().enumerate().collect();
    labelled.sort_by(|a, b| b.1.partial_cmp(&a.1).unwrap_or(Ordering::Equal));
    labelled.truncate(size);
    labelled
}

/// Cartesian product of the pruned lists, source 0 outermost.
fn combinations(pruned: &[Vec<(usize, f32)>]) -> Vec<Vec<(usize, f32)>> {
    let mut combos: Vec<Vec<(usize, f32)>> = vec![Vec::new()];
    for list in pruned {
        let mut next = Vec::with_capacity(combos.len() * list.len());
        for prefix in &combos {
            for &entry in list {
                let mut c = prefix.clone();
                c.push(entry);
                next.push(c);
            }
        }
        combos = next;
    }
    combos
}

/// Make sure slot 0 extended by `gold` is in the beam, replacing the last
/// selected hypothesis if needed. The beam stays ordered by rank.
fn force_gold(
    input: &SearchInput<'_>,
    row0: usize,
    gold: usize,
    k_out: usize,
    selected: &mut Vec<Candidate>,
) -> Result<(), ExecError> {
    if selected
        .iter()
        .any(|c| c.slot == 0 && c.labels.first() == Some(&gold))
    {
        return Ok(());
    }
    let prev = input.prev_scores.get(row0).copied().unwrap_or(0.0);
    let len = input.lengths.get(row0).copied().unwrap_or(0);
    let logp = source_row(input, 0, row0)?
        .get(gold)
        .copied()
        .unwrap_or(f32::NEG_INFINITY);
    let score = prev + logp;
    let forced = Candidate {
        slot: 0,
        labels: vec![gold],
        score,
        rank: normalized(score, len + 1, input.config.length_normalization),
    };
    if selected.len() < k_out {
        selected.push(forced);
    } else if let Some(last) = selected.last_mut() {
        *last = forced;
    }
    selected.sort_by(|a, b| b.rank.partial_cmp(&a.rank).unwrap_or(Ordering::Equal));
    Ok(())
}

// ─── SearchRecord ──────────────────────────────────────────────────

/// One choice layer's beam at one step, with the beam it was selected from.
#[derive(Clone, Debug)]
pub struct BeamEntry {
    pub layer: String,
    /// The beam the incoming hypotheses lived in; `None` is one row per
    /// batch entry.
    pub parent: Option<BeamRef>,
    pub step: SearchStep,
}

/// All search decisions of one run.
#[derive(Clone, Debug, Default)]
pub struct SearchRecord {
    beams: BTreeMap<BeamRef, BeamEntry>,
}

impl SearchRecord {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn insert(&mut self, beam: BeamRef, layer: &str, parent: Option<BeamRef>, step: SearchStep) {
        self.beams.insert(
            beam,
            BeamEntry {
                layer: layer.to_string(),
                parent,
                step,
            },
        );
    }

    pub fn get(&self, beam: BeamRef) -> Option<&BeamEntry> {
        self.beams.get(&beam)
    }

    pub fn is_empty(&self) -> bool {
        self.beams.is_empty()
    }

    /// Hypotheses per batch entry in `beam`.
    pub fn size(&self, beam: Option<BeamRef>) -> usize {
        beam.and_then(|b| self.beams.get(&b))
            .map_or(1, |e| e.step.beam_size)
    }

    /// Scores of the hypotheses in `beam`, or zeros outside any beam.
    pub fn scores(&self, beam: Option<BeamRef>, batch: usize) -> Vec<f32> {
        match beam.and_then(|b| self.beams.get(&b)) {
            Some(e) => e.step.scores.clone(),
            None => vec![0.0; batch],
        }
    }

    /// Whether `ancestor` is `beam` or lies on its parent chain. No beam is
    /// an ancestor of every beam.
    pub fn is_ancestor(&self, ancestor: Option<BeamRef>, beam: Option<BeamRef>) -> bool {
        let mut current = beam;
        loop {
            if current == ancestor {
                return true;
            }
            match current.and_then(|b| self.beams.get(&b)) {
                Some(entry) => current = entry.parent,
                None => return false,
            }
        }
    }

    /// The newest beam among `beams`: the one every other is an ancestor of.
    /// Returns the first unrelated pair otherwise.
    pub fn common_beam<I>(&self, beams: I) -> Result<Option<BeamRef>, (Option<BeamRef>, Option<BeamRef>)>
    where
        I: IntoIterator<Item = Option<BeamRef>>,
    {
        let mut common = None;
        for beam in beams {
            if self.is_ancestor(beam, common) {
                continue;
            }
            if self.is_ancestor(common, beam) {
                common = beam;
                continue;
            }
            return Err((common, beam));
        }
        Ok(common)
    }

    /// For each row of `to`, the row of `from` it descends from. `None` if
    /// `from` is not an ancestor of `to`.
    pub fn rows_between(
        &self,
        from: Option<BeamRef>,
        to: Option<BeamRef>,
        batch: usize,
    ) -> Option<Vec<usize>> {
        let mut rows: Vec<usize> = (0..batch * self.size(to)).collect();
        let mut current = to;
        while current != from {
            let entry = self.beams.get(&current?)?;
            let k_out = entry.step.beam_size;
            let k_in = entry.step.incoming;
            for r in rows.iter_mut() {
                *r = (*r / k_out) * k_in + entry.step.src_beams[*r];
            }
            current = entry.parent;
        }
        Some(rows)
    }

    /// Row mappings from `to` back to every beam on its chain, including
    /// `to` itself and the beamless root.
    pub fn chain_rows(
        &self,
        to: Option<BeamRef>,
        batch: usize,
    ) -> BTreeMap<Option<BeamRef>, Vec<usize>> {
        let mut chain = BTreeMap::new();
        let mut rows: Vec<usize> = (0..batch * self.size(to)).collect();
        let mut current = to;
        loop {
            chain.insert(current, rows.clone());
            let Some(entry) = current.and_then(|b| self.beams.get(&b)) else {
                break;
            };
            let k_out = entry.step.beam_size;
            let k_in = entry.step.incoming;
            for r in rows.iter_mut() {
                *r = (*r / k_out) * k_in + entry.step.src_beams[*r];
            }
            current = entry.parent;
        }
        chain
    }

    /// Every recorded step of one choice layer, in step order.
    pub fn steps_of<'s>(&'s self, layer: &'s str) -> impl Iterator<Item = (usize, &'s SearchStep)> + 's {
        self.beams
            .iter()
            .filter(move |(_, e)| e.layer == layer)
            .map(|(b, e)| (b.step, &e.step))
    }
}
