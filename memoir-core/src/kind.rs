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

//! Observation kind taxonomy.
//!
//! A closed classification of what a captured unit of work represents.
//! Unrecognized kinds from the extractor fall back to `Discovery`, keeping
//! the parser tolerant of model drift.

use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;

/// What an observation records about a unit of work.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ObservationKind {
    /// Something learned about the codebase or problem space.
    Discovery,
    /// A defect found and corrected.
    Bugfix,
    /// New functionality added.
    Feature,
    /// Structural change without behavior change.
    Refactor,
    /// A decision taken, with rationale.
    Decision,
    /// Any other concrete change.
    Change,
}

impl Default for ObservationKind {
    fn default() -> Self {
        ObservationKind::Discovery
    }
}

impl ObservationKind {
    /// All kinds, in display order.
    pub fn all() -> [ObservationKind; 6] {
        [
            ObservationKind::Discovery,
            ObservationKind::Bugfix,
            ObservationKind::Feature,
            ObservationKind::Refactor,
            ObservationKind::Decision,
            ObservationKind::Change,
        ]
    }

    /// String form used in storage and wire payloads.
    pub fn as_str(&self) -> &'static str {
        match self {
            ObservationKind::Discovery => "discovery",
            ObservationKind::Bugfix => "bugfix",
            ObservationKind::Feature => "feature",
            ObservationKind::Refactor => "refactor",
            ObservationKind::Decision => "decision",
            ObservationKind::Change => "change",
        }
    }
}

impl fmt::Display for ObservationKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

impl FromStr for ObservationKind {
    type Err = ();

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_lowercase().as_str() {
            "discovery" => Ok(ObservationKind::Discovery),
            "bugfix" | "bug_fix" | "fix" => Ok(ObservationKind::Bugfix),
            "feature" => Ok(ObservationKind::Feature),
            "refactor" | "refactoring" => Ok(ObservationKind::Refactor),
            "decision" => Ok(ObservationKind::Decision),
            "change" => Ok(ObservationKind::Change),
            _ => Err(()),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_round_trip() {
        for kind in ObservationKind::all() {
            assert_eq!(kind.as_str().parse::<ObservationKind>().unwrap(), kind);
        }
    }

    #[test]
    fn test_unknown_defaults_to_discovery() {
        let kind: ObservationKind = "something-else".parse().unwrap_or_default();
        assert_eq!(kind, ObservationKind::Discovery);
    }

    #[test]
    fn test_aliases() {
        assert_eq!("FIX".parse::<ObservationKind>().unwrap(), ObservationKind::Bugfix);
        assert_eq!(
            "refactoring".parse::<ObservationKind>().unwrap(),
            ObservationKind::Refactor
        );
    }
}
