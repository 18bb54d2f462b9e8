//! Dependency sequencing between platform tiers
//!
//! Storage must be up before the serving tier is touched, and the
//! enforcement tier waits for serving. The plan is recomputed each pass from
//! tier states observed before any write.

use crate::crd::LifecycleState;
use std::collections::{BTreeMap, BTreeSet};
use std::fmt;

/// A group of sub-systems that become ready together
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub enum Tier {
    Storage,
    Serving,
    Enforcement,
}

impl Tier {
    /// Tiers in dependency order
    pub const ORDER: [Tier; 3] = [Tier::Storage, Tier::Serving, Tier::Enforcement];

    /// The tier this one waits for
    pub fn predecessor(&self) -> Option<Tier> {
        match self {
            Tier::Storage => None,
            Tier::Serving => Some(Tier::Storage),
            Tier::Enforcement => Some(Tier::Serving),
        }
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            Tier::Storage => "storage",
            Tier::Serving => "serving",
            Tier::Enforcement => "enforcement",
        }
    }
}

impl fmt::Display for Tier {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Aggregated readiness of one tier
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum TierState {
    /// Nothing observed for the tier
    #[default]
    Absent,
    Pending,
    UpdateInProgress,
    Running,
}

impl TierState {
    /// Combine the states of two members of the same tier.
    ///
    /// `Absent` is the identity; any `Pending` member makes the tier
    /// `Pending`; otherwise any rolling member makes it `UpdateInProgress`.
    pub fn join(self, other: TierState) -> TierState {
        use TierState::*;
        match (self, other) {
            (Absent, x) | (x, Absent) => x,
            (Pending, _) | (_, Pending) => Pending,
            (UpdateInProgress, _) | (_, UpdateInProgress) => UpdateInProgress,
            (Running, Running) => Running,
        }
    }

    /// Whether successors may proceed past this tier
    pub fn admits_successor(self) -> bool {
        matches!(self, TierState::Running | TierState::UpdateInProgress)
    }
}

/// Observed states per tier
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct TierStates {
    states: BTreeMap<Tier, TierState>,
}

impl TierStates {
    pub fn new() -> Self {
        Self::default()
    }

    /// Fold one member's state into its tier
    pub fn record(&mut self, tier: Tier, state: TierState) {
        let entry = self.states.entry(tier).or_default();
        *entry = entry.join(state);
    }

    pub fn get(&self, tier: Tier) -> TierState {
        self.states.get(&tier).copied().unwrap_or_default()
    }
}

/// A tier held back by its predecessor
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Deferral {
    pub tier: Tier,
    pub blocked_by: Tier,
}

impl Deferral {
    /// Lifecycle state this deferral surfaces as
    pub fn lifecycle_state(&self) -> LifecycleState {
        match self.blocked_by {
            Tier::Storage => LifecycleState::WaitingOnDependency,
            Tier::Serving => LifecycleState::EnforcementWaiting,
            Tier::Enforcement => LifecycleState::Pending,
        }
    }
}

/// Which requested tiers may be reconciled this pass
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct SequencePlan {
    /// Eligible tiers, in dependency order
    pub eligible: Vec<Tier>,
    /// Deferred tiers, in dependency order
    pub deferred: Vec<Deferral>,
}

impl SequencePlan {
    pub fn is_eligible(&self, tier: Tier) -> bool {
        self.eligible.contains(&tier)
    }

    pub fn deferral_of(&self, tier: Tier) -> Option<&Deferral> {
        self.deferred.iter().find(|d| d.tier == tier)
    }
}

/// Decide which requested tiers proceed.
///
/// A tier proceeds when its direct predecessor is not requested, or is
/// requested and `Running` / `UpdateInProgress`. A `Pending` (or unobserved)
/// predecessor defers it, and deferral is transitive.
pub fn plan(requested: &BTreeSet<Tier>, observed: &TierStates) -> SequencePlan {
    let mut result = SequencePlan::default();
    for tier in Tier::ORDER.into_iter().filter(|t| requested.contains(t)) {
        let blocker = match tier.predecessor() {
            Some(pred) if requested.contains(&pred) => {
                if result.deferral_of(pred).is_some() || !observed.get(pred).admits_successor() {
                    Some(pred)
                } else {
                    None
                }
            }
            _ => None,
        };
        match blocker {
            Some(blocked_by) => result.deferred.push(Deferral { tier, blocked_by }),
            None => result.eligible.push(tier),
        }
    }
    result
}

#[cfg(test)]
mod tests {
    use super::*;

    const STATES: [TierState; 4] = [
        TierState::Absent,
        TierState::Pending,
        TierState::UpdateInProgress,
        TierState::Running,
    ];

    fn requested(tiers: &[Tier]) -> BTreeSet<Tier> {
        tiers.iter().copied().collect()
    }

    fn all_requested_sets() -> Vec<BTreeSet<Tier>> {
        (0u8..8)
            .map(|mask| {
                Tier::ORDER
                    .iter()
                    .enumerate()
                    .filter(|(i, _)| mask & (1 << i) != 0)
                    .map(|(_, t)| *t)
                    .collect()
            })
            .collect()
    }

    #[test]
    fn test_join() {
        use TierState::*;
        assert_eq!(Absent.join(Running), Running);
        assert_eq!(Running.join(Pending), Pending);
        assert_eq!(Running.join(UpdateInProgress), UpdateInProgress);
        assert_eq!(UpdateInProgress.join(Pending), Pending);
        assert_eq!(Running.join(Running), Running);
    }

    #[test]
    fn test_storage_pending_defers_serving() {
        let mut states = TierStates::new();
        states.record(Tier::Storage, TierState::Pending);

        let plan = plan(&requested(&[Tier::Storage, Tier::Serving]), &states);

        assert_eq!(plan.eligible, vec![Tier::Storage]);
        let deferral = plan.deferral_of(Tier::Serving).unwrap();
        assert_eq!(deferral.blocked_by, Tier::Storage);
        assert_eq!(
            deferral.lifecycle_state(),
            LifecycleState::WaitingOnDependency
        );
    }

    #[test]
    fn test_deferral_is_transitive() {
        let mut states = TierStates::new();
        states.record(Tier::Storage, TierState::Pending);
        // Serving looks healthy but is itself deferred
        states.record(Tier::Serving, TierState::Running);

        let plan = plan(&Tier::ORDER.into_iter().collect(), &states);

        assert_eq!(plan.eligible, vec![Tier::Storage]);
        assert!(plan.deferral_of(Tier::Enforcement).is_some());
    }

    #[test]
    fn test_unrequested_predecessor_proceeds() {
        let plan = plan(&requested(&[Tier::Enforcement]), &TierStates::new());
        assert_eq!(plan.eligible, vec![Tier::Enforcement]);
        assert!(plan.deferred.is_empty());
    }

    #[test]
    fn test_update_in_progress_proceeds() {
        let mut states = TierStates::new();
        states.record(Tier::Storage, TierState::Running);
        states.record(Tier::Serving, TierState::UpdateInProgress);

        let plan = plan(&Tier::ORDER.into_iter().collect(), &states);
        assert_eq!(plan.eligible, Tier::ORDER.to_vec());
    }

    #[test]
    fn test_enforcement_waits_for_serving() {
        let mut states = TierStates::new();
        states.record(Tier::Serving, TierState::Running);
        states.record(Tier::Serving, TierState::Pending);

        let plan = plan(&requested(&[Tier::Serving, Tier::Enforcement]), &states);
        assert_eq!(
            plan.deferral_of(Tier::Enforcement).unwrap().lifecycle_state(),
            LifecycleState::EnforcementWaiting
        );
    }

    #[test]
    fn test_gating_holds_for_every_combination() {
        for set in all_requested_sets() {
            for storage in STATES {
                for serving in STATES {
                    let mut states = TierStates::new();
                    states.record(Tier::Storage, storage);
                    states.record(Tier::Serving, serving);
                    let plan = plan(&set, &states);

                    for tier in [Tier::Serving, Tier::Enforcement] {
                        if !set.contains(&tier) {
                            assert!(!plan.is_eligible(tier));
                            continue;
                        }
                        let Some(pred) = tier.predecessor().filter(|p| set.contains(p)) else {
                            assert!(plan.is_eligible(tier));
                            continue;
                        };
                        let pred_state = states.get(pred);
                        if matches!(pred_state, TierState::Pending | TierState::Absent) {
                            assert!(!plan.is_eligible(tier), "{:?} {:?}", set, pred_state);
                        }
                        if pred_state == TierState::Running && plan.is_eligible(pred) {
                            assert!(plan.is_eligible(tier), "{:?} {:?}", set, pred_state);
                        }
                    }
                }
            }
        }
    }
}
