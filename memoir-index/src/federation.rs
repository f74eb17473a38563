// Copyright 2025 Memoir (https://github.com/memoir-mem/memoir)
//
// This program is free software: you can redistribute it and/or modify
// it under the terms of the GNU Affero General Public License as published by
// the Free Software Foundation, either version 3 of the License, or
// (at your option) any later version.
//
// This program is distributed in the hope that it will be useful,
// but WITHOUT ANY WARRANTY; without even the implied warranty of
// MERCHANTABILITY or FITNESS FOR A PARTICULAR PURPOSE. See the
// GNU Affero General Public License for more details.
//
// You should have received a copy of the GNU Affero General Public License
// along with this program. If not, see <https://www.gnu.org/licenses/>.

//! Weighted federation.
//!
//! The local node scores with weight 1.0; remotes occupy positions 1..N
//! (N <= 3) and contribute with a multiplicative weight from a decay
//! schedule. A candidate's combined score is
//! `local_score + sum(remote_score_i * weight_i)` over matching doc ids,
//! ranked descending. Remotes are always opened read-only.

use crate::document::QueryHit;
use crate::{IndexError, IndexResult};
use memoir_core::settings::DecayStrategy;

/// Hard cap on attached remotes.
pub const MAX_REMOTES: usize = 3;

/// One federation source: a read-only remote at a weighted position.
#[derive(Debug, Clone)]
pub struct FederationSource {
    /// 1-based position in the decay schedule.
    pub position: usize,
    pub path: std::path::PathBuf,
}

/// Positional weights under a decay schedule.
#[derive(Debug, Clone, Copy)]
pub struct FederationWeights {
    strategy: DecayStrategy,
}

impl FederationWeights {
    pub fn new(strategy: DecayStrategy) -> Self {
        Self { strategy }
    }

    /// Weight at a position: 1.0 for the local node (position 0), the decay
    /// schedule thereafter.
    pub fn weight(&self, position: usize) -> f64 {
        if position == 0 {
            return 1.0;
        }
        match self.strategy {
            DecayStrategy::Golden => {
                // phi^-1, phi^-2, phi^-3, ...
                let inv_phi = 2.0 / (1.0 + 5.0_f64.sqrt());
                inv_phi.powi(position as i32)
            }
            DecayStrategy::Exponential => 0.5_f64.powi(position as i32),
            DecayStrategy::Linear => (1.0 - 0.25 * position as f64).max(0.0),
        }
    }
}

/// Reject configurations asking for more than [`MAX_REMOTES`] remotes.
pub fn validate_federation_config(remote_count: usize) -> IndexResult<()> {
    if remote_count > MAX_REMOTES {
        return Err(IndexError::Federation(format!(
            "{remote_count} remotes requested; at most {MAX_REMOTES} are supported"
        )));
    }
    Ok(())
}

/// Merge the local result set with per-position remote result sets into a
/// combined ranking.
///
/// Scores are `1 - distance`. Hits for the same doc id accumulate; each
/// source contributes its positional weight. The output is ordered by
/// descending combined score, truncated to `limit`, with distances mapped
/// back as `1 - score`.
pub fn merge_federated(
    local: Vec<QueryHit>,
    remotes: Vec<(usize, Vec<QueryHit>)>,
    weights: FederationWeights,
    limit: usize,
) -> Vec<QueryHit> {
    use std::collections::HashMap;

    struct Scored {
        hit: QueryHit,
        score: f64,
    }

    let mut combined: HashMap<String, Scored> = HashMap::new();

    let mut absorb = |position: usize, hits: Vec<QueryHit>| {
        let weight = weights.weight(position);
        for hit in hits {
            let score = (1.0 - hit.distance as f64) * weight;
            combined
                .entry(hit.doc_id.clone())
                .and_modify(|s| s.score += score)
                .or_insert(Scored { hit, score });
        }
    };

    absorb(0, local);
    for (position, hits) in remotes {
        absorb(position, hits);
    }

    let mut merged: Vec<Scored> = combined.into_values().collect();
    merged.sort_by(|a, b| b.score.partial_cmp(&a.score).unwrap_or(std::cmp::Ordering::Equal));
    merged.truncate(limit);

    merged
        .into_iter()
        .map(|s| {
            let mut hit = s.hit;
            hit.distance = (1.0 - s.score) as f32;
            hit
        })
        .collect()
}
