//! Durability Policy (spec §4.1, component C1): pure, stateless rules for
//! who must acknowledge a write and who may be promoted.

use crate::error::{ErsError, Result};
use crate::tablet::{Tablet, TabletRole};

/// Per-tablet promotion eligibility label. Ordered so that sorting
/// candidates by `priority()` descending yields a total preference order
/// (spec §9 "Promotion-rule ordering").
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PromotionRule {
    Must,
    Prefer,
    Neutral,
    PreferNot,
    MustNot,
}

impl PromotionRule {
    pub fn priority(self) -> u8 {
        match self {
            PromotionRule::Must => 4,
            PromotionRule::Prefer => 3,
            PromotionRule::Neutral => 2,
            PromotionRule::PreferNot => 1,
            PromotionRule::MustNot => 0,
        }
    }

    pub fn excludes_candidacy(self) -> bool {
        matches!(self, PromotionRule::MustNot)
    }
}

fn base_promotion_rule(tablet: &Tablet) -> PromotionRule {
    match tablet.role {
        TabletRole::Replica => PromotionRule::Neutral,
        TabletRole::Rdonly => PromotionRule::PreferNot,
        // Only REPLICA is promotion-eligible by default (spec GLOSSARY). A
        // tablet still reporting PRIMARY is the old primary probed via
        // primary-status (spec §4.5) — its position feeds errant-GTID
        // comparisons but it is never itself re-elected.
        TabletRole::Primary
        | TabletRole::Spare
        | TabletRole::Drained
        | TabletRole::Backup
        | TabletRole::Restore => PromotionRule::MustNot,
    }
}

/// A named durability policy (spec §4.1 table).
pub trait DurabilityPolicy: Send + Sync + std::fmt::Debug {
    fn name(&self) -> &'static str;

    fn promotion_rule(&self, tablet: &Tablet) -> PromotionRule;

    /// Whether this tablet's ACK counts toward durability.
    fn is_replica_eligible(&self, tablet: &Tablet) -> bool;

    /// Forward-progress predicate: after `candidate` is promoted, can the
    /// chosen policy ever be satisfied again using `reachable` tablets
    /// (which excludes `candidate` itself)?
    fn can_establish(&self, candidate: &Tablet, reachable: &[Tablet]) -> bool;
}

#[derive(Debug, Clone, Copy, Default)]
pub struct NonePolicy;

impl DurabilityPolicy for NonePolicy {
    fn name(&self) -> &'static str {
        "none"
    }

    fn promotion_rule(&self, tablet: &Tablet) -> PromotionRule {
        base_promotion_rule(tablet)
    }

    fn is_replica_eligible(&self, _tablet: &Tablet) -> bool {
        true
    }

    fn can_establish(&self, _candidate: &Tablet, _reachable: &[Tablet]) -> bool {
        true
    }
}

#[derive(Debug, Clone, Copy, Default)]
pub struct SemiSyncPolicy;

impl DurabilityPolicy for SemiSyncPolicy {
    fn name(&self) -> &'static str {
        "semi_sync"
    }

    fn promotion_rule(&self, tablet: &Tablet) -> PromotionRule {
        base_promotion_rule(tablet)
    }

    fn is_replica_eligible(&self, tablet: &Tablet) -> bool {
        !matches!(tablet.role, TabletRole::Rdonly)
    }

    fn can_establish(&self, candidate: &Tablet, reachable: &[Tablet]) -> bool {
        reachable
            .iter()
            .any(|t| t.alias != candidate.alias && self.is_replica_eligible(t))
    }
}

#[derive(Debug, Clone, Copy, Default)]
pub struct CrossCellPolicy;

impl DurabilityPolicy for CrossCellPolicy {
    fn name(&self) -> &'static str {
        "cross_cell"
    }

    fn promotion_rule(&self, tablet: &Tablet) -> PromotionRule {
        base_promotion_rule(tablet)
    }

    fn is_replica_eligible(&self, tablet: &Tablet) -> bool {
        !matches!(tablet.role, TabletRole::Rdonly)
    }

    fn can_establish(&self, candidate: &Tablet, reachable: &[Tablet]) -> bool {
        reachable.iter().any(|t| {
            t.alias != candidate.alias
                && self.is_replica_eligible(t)
                && t.alias.cell != candidate.alias.cell
        })
    }
}

#[derive(Debug, Clone, Copy, Default)]
pub struct CrossCellSemiSyncPolicy;

impl DurabilityPolicy for CrossCellSemiSyncPolicy {
    fn name(&self) -> &'static str {
        "cross_cell_semi_sync"
    }

    fn promotion_rule(&self, tablet: &Tablet) -> PromotionRule {
        base_promotion_rule(tablet)
    }

    fn is_replica_eligible(&self, tablet: &Tablet) -> bool {
        !matches!(tablet.role, TabletRole::Rdonly)
    }

    fn can_establish(&self, candidate: &Tablet, reachable: &[Tablet]) -> bool {
        CrossCellPolicy.can_establish(candidate, reachable)
    }
}

/// Resolve a policy name (spec §6 `durability` option) to an implementation.
/// Unknown names are `ErsError::Configuration`.
pub fn resolve(name: &str) -> Result<Box<dyn DurabilityPolicy>> {
    match name {
        "none" => Ok(Box::new(NonePolicy)),
        "semi_sync" => Ok(Box::new(SemiSyncPolicy)),
        "cross_cell" => Ok(Box::new(CrossCellPolicy)),
        "cross_cell_semi_sync" => Ok(Box::new(CrossCellSemiSyncPolicy)),
        other => Err(ErsError::Configuration(format!("unknown durability policy {other:?}"))),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::tablet::TabletAlias;

    fn tablet(cell: &str, uid: u32, role: TabletRole) -> Tablet {
        Tablet::new(TabletAlias::new(cell, uid), "ks", "0", role)
    }

    #[test]
    fn none_policy_establishes_with_zero_replicas() {
        let policy = NonePolicy;
        let candidate = tablet("z1", 1, TabletRole::Replica);
        assert!(policy.can_establish(&candidate, &[]));
    }

    #[test]
    fn semi_sync_requires_one_eligible_non_rdonly_ack() {
        let policy = SemiSyncPolicy;
        let candidate = tablet("z1", 1, TabletRole::Replica);
        let only_rdonly = vec![tablet("z1", 2, TabletRole::Rdonly)];
        assert!(!policy.can_establish(&candidate, &only_rdonly));

        let with_replica = vec![tablet("z1", 2, TabletRole::Rdonly), tablet("z1", 3, TabletRole::Replica)];
        assert!(policy.can_establish(&candidate, &with_replica));
    }

    #[test]
    fn cross_cell_requires_ack_outside_candidate_cell() {
        let policy = CrossCellPolicy;
        let candidate = tablet("z1", 1, TabletRole::Replica);
        let same_cell_only = vec![tablet("z1", 2, TabletRole::Replica)];
        assert!(!policy.can_establish(&candidate, &same_cell_only));

        let other_cell = vec![tablet("z1", 2, TabletRole::Replica), tablet("z2", 3, TabletRole::Replica)];
        assert!(policy.can_establish(&candidate, &other_cell));
    }

    #[test]
    fn spare_and_drained_are_must_not() {
        let policy = NonePolicy;
        assert!(policy.promotion_rule(&tablet("z1", 1, TabletRole::Spare)).excludes_candidacy());
        assert!(policy.promotion_rule(&tablet("z1", 1, TabletRole::Drained)).excludes_candidacy());
        assert!(!policy.promotion_rule(&tablet("z1", 1, TabletRole::Replica)).excludes_candidacy());
    }

    #[test]
    fn unknown_policy_name_is_configuration_error() {
        assert!(matches!(resolve("bogus"), Err(ErsError::Configuration(_))));
    }
}
