//! Phase enum and per-phase iteration budgets.

use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::fmt;

/// A named step in the per-task pipeline.
///
/// The built-in phases are well known; a session may configure additional
/// named phases, each of which must supply its own worker prompt elsewhere in
/// configuration. Unknown phases round-trip through `Custom`.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub enum Phase {
    Plan,
    Implement,
    Docs,
    Verify,
    Complete,
    Blocked,
    NothingToDo,
    Custom(String),
}

impl Phase {
    pub fn as_str(&self) -> &str {
        match self {
            Self::Plan => "PLAN",
            Self::Implement => "IMPLEMENT",
            Self::Docs => "DOCS",
            Self::Verify => "VERIFY",
            Self::Complete => "COMPLETE",
            Self::Blocked => "BLOCKED",
            Self::NothingToDo => "NOTHING_TO_DO",
            Self::Custom(s) => s,
        }
    }

    pub fn parse(s: &str) -> Self {
        match s {
            "PLAN" => Self::Plan,
            "IMPLEMENT" => Self::Implement,
            "DOCS" => Self::Docs,
            "VERIFY" => Self::Verify,
            "COMPLETE" => Self::Complete,
            "BLOCKED" => Self::Blocked,
            "NOTHING_TO_DO" => Self::NothingToDo,
            other => Self::Custom(other.to_string()),
        }
    }

    /// `COMPLETE`, `BLOCKED`, and `NOTHING_TO_DO` are terminal: once reached a
    /// task never transitions away from them.
    pub fn is_terminal(&self) -> bool {
        matches!(self, Self::Complete | Self::Blocked | Self::NothingToDo)
    }
}

impl fmt::Display for Phase {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl Serialize for Phase {
    fn serialize<S>(&self, serializer: S) -> Result<S::Ok, S::Error>
    where
        S: serde::Serializer,
    {
        serializer.serialize_str(self.as_str())
    }
}

impl<'de> Deserialize<'de> for Phase {
    fn deserialize<D>(deserializer: D) -> Result<Self, D::Error>
    where
        D: serde::Deserializer<'de>,
    {
        let s = String::deserialize(deserializer)?;
        Ok(Phase::parse(&s))
    }
}

/// The ordered, non-terminal phase list for a session. `VERIFY` only appears
/// when auto-merge is enabled.
#[derive(Debug, Clone)]
pub struct PhaseList {
    pub phases: Vec<Phase>,
}

impl PhaseList {
    pub fn default_phases(verify_enabled: bool) -> Self {
        let mut phases = vec![Phase::Plan, Phase::Implement, Phase::Docs];
        if verify_enabled {
            phases.push(Phase::Verify);
        }
        Self { phases }
    }

    pub fn new(phases: Vec<Phase>) -> Self {
        Self { phases }
    }

    /// `advance(current) = phases[i+1]` if it exists, else `COMPLETE`. A
    /// phase not present in the configured list (including any of the
    /// terminal values) also advances to `COMPLETE`.
    pub fn advance(&self, current: &Phase) -> Phase {
        match self.phases.iter().position(|p| p == current) {
            Some(i) if i + 1 < self.phases.len() => self.phases[i + 1].clone(),
            _ => Phase::Complete,
        }
    }

    pub fn first(&self) -> Phase {
        self.phases.first().cloned().unwrap_or(Phase::Complete)
    }
}

/// Built-in per-phase iteration budget defaults.
fn builtin_default_budget(phase: &Phase) -> u32 {
    match phase.as_str() {
        "PLAN" => 3,
        "IMPLEMENT" => 5,
        "DOCS" => 2,
        "VERIFY" => 3,
        "REVIEW" => 3,
        "PR" => 1,
        _ => 3,
    }
}

/// Per-phase iteration budget configuration. Lookup order, first hit wins:
/// simple-workflow override (only consulted for tasks classified simple),
/// per-phase override, session-wide override, built-in default.
#[derive(Debug, Clone, Default)]
pub struct BudgetConfig {
    pub simple_overrides: HashMap<Phase, u32>,
    pub per_phase_overrides: HashMap<Phase, u32>,
    pub session_wide_override: Option<u32>,
}

impl BudgetConfig {
    pub fn budget_for(&self, phase: &Phase, is_simple_task: bool) -> u32 {
        if is_simple_task
            && let Some(&b) = self.simple_overrides.get(phase)
        {
            return b;
        }
        if let Some(&b) = self.per_phase_overrides.get(phase) {
            return b;
        }
        if let Some(b) = self.session_wide_override {
            return b;
        }
        builtin_default_budget(phase)
    }
}

/// Fixed plan-skip indicator substrings (checked against the raw item body).
pub const PLAN_SKIP_INDICATORS: [&str; 4] = [
    "Files to Create/Modify",
    "Files to Modify",
    "Implementation Steps",
    "## Implementation Plan",
];

/// Whether the plan-skip rule applies: phase is `PLAN`, this is iteration 1,
/// plan-skip is enabled, and the body contains one of the fixed indicators.
pub fn should_skip_plan_iteration(
    phase: &Phase,
    phase_iteration: u32,
    plan_skip_enabled: bool,
    body: &str,
) -> bool {
    *phase == Phase::Plan
        && phase_iteration == 1
        && plan_skip_enabled
        && PLAN_SKIP_INDICATORS.iter().any(|ind| body.contains(ind))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn phase_round_trips_through_parse_and_as_str() {
        for p in [
            Phase::Plan,
            Phase::Implement,
            Phase::Docs,
            Phase::Verify,
            Phase::Complete,
            Phase::Blocked,
            Phase::NothingToDo,
        ] {
            assert_eq!(Phase::parse(p.as_str()), p);
        }
    }

    #[test]
    fn unknown_phase_name_becomes_custom() {
        let p = Phase::parse("RELEASE");
        assert_eq!(p, Phase::Custom("RELEASE".to_string()));
        assert_eq!(p.as_str(), "RELEASE");
    }

    #[test]
    fn terminal_phases() {
        assert!(Phase::Complete.is_terminal());
        assert!(Phase::Blocked.is_terminal());
        assert!(Phase::NothingToDo.is_terminal());
        assert!(!Phase::Plan.is_terminal());
        assert!(!Phase::Custom("RELEASE".to_string()).is_terminal());
    }

    #[test]
    fn serde_round_trip() {
        let json = serde_json::to_string(&Phase::Implement).unwrap();
        assert_eq!(json, "\"IMPLEMENT\"");
        let back: Phase = serde_json::from_str(&json).unwrap();
        assert_eq!(back, Phase::Implement);
    }

    #[test]
    fn advance_moves_to_next_configured_phase() {
        let list = PhaseList::default_phases(false);
        assert_eq!(list.advance(&Phase::Plan), Phase::Implement);
        assert_eq!(list.advance(&Phase::Implement), Phase::Docs);
        assert_eq!(list.advance(&Phase::Docs), Phase::Complete);
    }

    #[test]
    fn advance_includes_verify_when_enabled() {
        let list = PhaseList::default_phases(true);
        assert_eq!(list.advance(&Phase::Docs), Phase::Verify);
        assert_eq!(list.advance(&Phase::Verify), Phase::Complete);
    }

    #[test]
    fn advance_on_unknown_phase_goes_to_complete() {
        let list = PhaseList::default_phases(false);
        assert_eq!(list.advance(&Phase::Custom("RELEASE".to_string())), Phase::Complete);
        assert_eq!(list.advance(&Phase::Blocked), Phase::Complete);
    }

    #[test]
    fn builtin_budget_defaults() {
        let cfg = BudgetConfig::default();
        assert_eq!(cfg.budget_for(&Phase::Plan, false), 3);
        assert_eq!(cfg.budget_for(&Phase::Implement, false), 5);
        assert_eq!(cfg.budget_for(&Phase::Docs, false), 2);
        assert_eq!(cfg.budget_for(&Phase::Verify, false), 3);
        assert_eq!(cfg.budget_for(&Phase::Custom("REVIEW".to_string()), false), 3);
        assert_eq!(cfg.budget_for(&Phase::Custom("PR".to_string()), false), 1);
    }

    #[test]
    fn budget_lookup_order() {
        let mut cfg = BudgetConfig::default();
        cfg.session_wide_override = Some(10);
        assert_eq!(cfg.budget_for(&Phase::Plan, false), 10);

        cfg.per_phase_overrides.insert(Phase::Plan, 7);
        assert_eq!(cfg.budget_for(&Phase::Plan, false), 7);

        cfg.simple_overrides.insert(Phase::Plan, 1);
        assert_eq!(cfg.budget_for(&Phase::Plan, false), 7, "simple override only applies to simple tasks");
        assert_eq!(cfg.budget_for(&Phase::Plan, true), 1);
    }

    #[test]
    fn plan_skip_rule_requires_all_conditions() {
        let body = "## Implementation Plan\n\nDo the thing.";
        assert!(should_skip_plan_iteration(&Phase::Plan, 1, true, body));
        assert!(!should_skip_plan_iteration(&Phase::Plan, 2, true, body), "only iteration 1");
        assert!(!should_skip_plan_iteration(&Phase::Plan, 1, false, body), "must be enabled");
        assert!(!should_skip_plan_iteration(&Phase::Implement, 1, true, body), "only PLAN");
        assert!(!should_skip_plan_iteration(&Phase::Plan, 1, true, "no indicators here"));
    }

    #[test]
    fn plan_skip_rule_matches_any_indicator() {
        for indicator in PLAN_SKIP_INDICATORS {
            let body = format!("intro\n{indicator}\nmore text");
            assert!(should_skip_plan_iteration(&Phase::Plan, 1, true, &body));
        }
    }
}
