//! Weighted per-packet path selector (C5).
//!
//! Sorts candidate links by ascending `tried`, charges `1/factor` to the
//! first link with positive factor scanned (§4.5 step 2 — charged whether or
//! not it is ultimately eligible, a deliberate oddity preserved from the
//! reference per §9), then sends on the first *eligible* candidate.

use crate::config::FACTOR_SCALE;

/// Rescale threshold from §9: once the smallest `tried` value would push the
/// largest past this, subtract the minimum from every link. Only
/// differences between `tried` values matter, so this is behavior-preserving.
pub const RESCALE_THRESHOLD: f64 = (1u64 << 40) as f64;

pub struct Candidate<'a> {
    pub factor: u32,
    pub tried: &'a mut f64,
    pub eligible: bool,
}

/// Selects the link to send `frame` on, mutating `tried` accumulators as a
/// side effect, and returns the chosen candidate's index into `candidates`
/// (in original, not sorted, order), or `None` if nothing is eligible.
///
/// `candidates` is consumed as a `Vec` because we need to sort a view of it
/// by `tried` while keeping each element's origin for the return index.
pub fn select(mut candidates: Vec<Candidate<'_>>) -> Option<usize> {
    let mut order: Vec<usize> = (0..candidates.len()).collect();
    order.sort_by(|&a, &b| {
        candidates[a]
            .tried
            .partial_cmp(candidates[b].tried)
            .unwrap_or(std::cmp::Ordering::Equal)
    });

    let mut charged = false;
    let mut winner = None;

    for idx in order {
        let factor_positive = candidates[idx].factor > 0;

        if !charged && factor_positive {
            *candidates[idx].tried += FACTOR_SCALE / candidates[idx].factor as f64;
            charged = true;
        }

        if winner.is_none() && candidates[idx].eligible {
            winner = Some(idx);
        }
    }

    winner
}

/// Subtracts the minimum `tried` value across all links whenever any value
/// exceeds [`RESCALE_THRESHOLD`] (§9). Call once per dispatch loop iteration
/// or on a slow tick; cheap no-op in the common case.
pub fn rescale_if_needed(tried: &mut [f64]) {
    if tried.iter().all(|&t| t < RESCALE_THRESHOLD) {
        return;
    }
    let min = tried.iter().cloned().fold(f64::INFINITY, f64::min);
    if min.is_finite() && min > 0.0 {
        for t in tried.iter_mut() {
            *t -= min;
        }
    }
}
