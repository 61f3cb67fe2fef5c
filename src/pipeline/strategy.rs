//! Prompting strategies and the escalation ladder.
//!
//! A retry caused by malformed output or an arithmetic near-miss climbs
//! the ladder to a stricter prompt; transport failures retry on the same
//! rung. The ladder is ordered cheapest-first.

use serde::{Deserialize, Serialize};

/// How aggressively the prompt constrains the model.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum StrategyKind {
    /// Full schema, normal instructions.
    Standard,
    /// Full schema plus hard output-format rules and a worked example.
    StrictFormat,
    /// Required fields only, one value per line of instruction.
    ReducedSchema,
}

impl StrategyKind {
    /// Confidence rank: an earlier (less constrained) rung produced a
    /// record the model volunteered rather than was cornered into, so it
    /// outranks later rungs. Lower is better.
    pub fn priority(&self) -> u8 {
        match self {
            Self::Standard => 0,
            Self::StrictFormat => 1,
            Self::ReducedSchema => 2,
        }
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Standard => "standard",
            Self::StrictFormat => "strict_format",
            Self::ReducedSchema => "reduced_schema",
        }
    }
}

impl std::fmt::Display for StrategyKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Ordered sequence of strategies a request may climb through.
#[derive(Debug, Clone)]
pub struct StrategyLadder {
    tiers: Vec<StrategyKind>,
}

impl StrategyLadder {
    /// The default ladder: standard, then strict format, then reduced schema.
    pub fn standard() -> Self {
        Self {
            tiers: vec![
                StrategyKind::Standard,
                StrategyKind::StrictFormat,
                StrategyKind::ReducedSchema,
            ],
        }
    }

    pub fn custom(tiers: Vec<StrategyKind>) -> Option<Self> {
        if tiers.is_empty() {
            return None;
        }
        Some(Self { tiers })
    }

    /// Strategy after `escalations` content failures. Clamps at the top
    /// rung; further escalations keep the strictest strategy.
    pub fn tier(&self, escalations: usize) -> StrategyKind {
        let ix = escalations.min(self.tiers.len() - 1);
        self.tiers[ix]
    }

    /// Stable identifier folded into request fingerprints, so results
    /// produced under different ladders never alias in the cache.
    pub fn id(&self) -> String {
        self.tiers
            .iter()
            .map(StrategyKind::as_str)
            .collect::<Vec<_>>()
            .join("+")
    }
}

impl Default for StrategyLadder {
    fn default() -> Self {
        Self::standard()
    }
}
