//! Candidate Selection (spec §4.5, component C5): turn the raw stop-replication
//! results into a single elected primary, or a reason why none qualifies.

use std::collections::HashMap;
use std::time::Duration;

use crate::durability::DurabilityPolicy;
use crate::error::{ErsError, Result};
use crate::gtid::Position;
use crate::tablet::{StopReplicationStatus, Tablet, TabletAlias, TabletMap};
use crate::tmc::TabletManagerClient;

/// Pass A (spec §4.5): one position per tablet that either stopped
/// successfully or answered a primary-status probe. `ErrZeroPosition` if a
/// successfully-stopped tablet's relay log position is empty — an
/// uninitialized replica can't be trusted as a candidate.
pub fn collect_positions(
    status_map: &HashMap<TabletAlias, StopReplicationStatus>,
    primary_status_map: &HashMap<TabletAlias, Position>,
) -> Result<HashMap<TabletAlias, Position>> {
    let mut positions = HashMap::with_capacity(status_map.len() + primary_status_map.len());
    for (alias, status) in status_map {
        if status.after.relay_log_position.is_empty() {
            return Err(ErsError::ZeroPosition(alias.to_string()));
        }
        positions.insert(alias.clone(), status.after.relay_log_position.clone());
    }
    for (alias, position) in primary_status_map {
        positions.insert(alias.clone(), position.clone());
    }
    Ok(positions)
}

/// Reads the reparent journal's term counter from every tablet that has a
/// known position. Any single failed read is fatal to the whole selection
/// (spec §4.5 step 1).
pub async fn fetch_journal_terms(
    tmc: &dyn TabletManagerClient,
    aliases: impl Iterator<Item = &TabletAlias>,
    deadline: Duration,
) -> Result<HashMap<TabletAlias, u64>> {
    let mut terms = HashMap::new();
    for alias in aliases {
        let term = tmc
            .read_reparent_journal_info(alias, deadline)
            .await
            .map_err(|e| ErsError::JournalUnreadable(alias.to_string(), e.to_string()))?;
        terms.insert(alias.clone(), term);
    }
    Ok(terms)
}

/// Pass B (spec §4.5): mark tablets carrying errant GTIDs relative to the
/// current-term consensus ineligible, with the §4.5 step-3 fallback for the
/// pathological case where every tablet is (wrongly) marked errant.
pub fn mark_errant(
    positions: &HashMap<TabletAlias, Position>,
    journal_terms: &HashMap<TabletAlias, u64>,
) -> Result<HashMap<TabletAlias, bool>> {
    let max_journal = journal_terms.values().copied().max().unwrap_or(0);

    let mut eligible = HashMap::with_capacity(positions.len());
    for (alias, position) in positions {
        let reference = union_where(positions, journal_terms, |t, term| {
            t != alias && term == max_journal
        })?;
        // No other current-term tablet to corroborate against: a lone
        // survivor can't be errant relative to itself.
        let eligible_now = match reference {
            Some(reference) => position.errant_against(&reference)?.is_empty(),
            None => true,
        };
        eligible.insert(alias.clone(), eligible_now);
    }

    if eligible.values().all(|&e| !e) {
        for (alias, position) in positions {
            let own_term = journal_terms.get(alias).copied().unwrap_or(0);
            let reference = union_where(positions, journal_terms, |t, term| {
                t != alias && term >= own_term
            })?;
            let eligible_now = match reference {
                Some(reference) => position.errant_against(&reference)?.is_empty(),
                None => true,
            };
            eligible.insert(alias.clone(), eligible_now);
        }
    }

    Ok(eligible)
}

/// Union of every position whose tablet satisfies `pred`, or `None` if no
/// tablet does (as opposed to a degenerate empty union, which can't happen
/// here since every input position is already known non-zero).
fn union_where(
    positions: &HashMap<TabletAlias, Position>,
    journal_terms: &HashMap<TabletAlias, u64>,
    pred: impl Fn(&TabletAlias, u64) -> bool,
) -> Result<Option<Position>> {
    let mut acc: Option<Position> = None;
    for (alias, position) in positions {
        let term = journal_terms.get(alias).copied().unwrap_or(0);
        if pred(alias, term) {
            acc = Some(match acc {
                Some(a) => Position::union(&a, position)?,
                None => position.clone(),
            });
        }
    }
    Ok(acc)
}

#[derive(Debug, Clone)]
pub struct Selection {
    pub primary: TabletAlias,
    pub position: Position,
}

/// Most-advanced-primary selection with tie-breaks and the forward-progress
/// check (spec §4.5, final two subsections).
///
/// `prefer_on_tie` breaks ties among equal-priority maxima in favor of a
/// specific tablet when no explicit candidate is given — used by the E->F
/// re-selection (spec §4.6) to keep the already-promoted intermediate primary
/// rather than hand it to an arbitrary same-priority sibling just because
/// everyone now shares its position.
///
/// `enforce_promotion_rule` gates the `MUST_NOT` exclusion itself, not just
/// the tie-break: spec §4.6's D->E intermediate-source selection must still
/// be willing to pick a `MUST_NOT` tablet holding the most-advanced position
/// so its data is relayed onward rather than lost, with a rule-eligible
/// tablet substituted afterward in the E->F final selection (the
/// "intermediate-then-final pattern" — see spec §4.6 and §8.2 "no lost
/// writes"). Callers doing the final selection pass `true`; the D->E
/// intermediate-source selection passes `false`.
#[allow(clippy::too_many_arguments)]
pub fn select_primary(
    tablet_map: &TabletMap,
    positions: &HashMap<TabletAlias, Position>,
    eligible: &HashMap<TabletAlias, bool>,
    policy: &dyn DurabilityPolicy,
    prevent_cross_cell_promotion: bool,
    previous_primary_cell: Option<&str>,
    explicit_candidate: Option<&TabletAlias>,
    prefer_on_tie: Option<&TabletAlias>,
    enforce_promotion_rule: bool,
) -> Result<Selection> {
    let reachable_all: Vec<Tablet> = positions
        .keys()
        .filter_map(|a| tablet_map.get(a).cloned())
        .collect();

    let mut pool: Vec<TabletAlias> = positions
        .keys()
        .filter(|a| eligible.get(*a).copied().unwrap_or(false))
        .filter(|a| {
            !enforce_promotion_rule
                || tablet_map
                    .get(a)
                    .map(|t| !policy.promotion_rule(t).excludes_candidacy())
                    .unwrap_or(false)
        })
        .cloned()
        .collect();

    if prevent_cross_cell_promotion {
        if let Some(cell) = previous_primary_cell {
            pool.retain(|a| a.cell == cell);
        }
    }

    if pool.is_empty() {
        return Err(ErsError::NoCandidates);
    }

    let maxima = find_maxima(&pool, positions)?;
    if let Some(first) = maxima.first() {
        for other in &maxima[1..] {
            if !Position::equal(&positions[first], &positions[other])? {
                return Err(ErsError::SplitBrain);
            }
        }
    }

    let max_priority = maxima
        .iter()
        .map(|a| policy.promotion_rule(&tablet_map[a]).priority())
        .max()
        .expect("maxima is non-empty because pool is non-empty");
    let mut best: Vec<TabletAlias> = maxima
        .iter()
        .filter(|a| policy.promotion_rule(&tablet_map[a]).priority() == max_priority)
        .cloned()
        .collect();
    best.sort();

    let winner = if let Some(explicit) = explicit_candidate {
        reject_if_ineligible(
            explicit,
            tablet_map,
            positions,
            eligible,
            policy,
            prevent_cross_cell_promotion,
            previous_primary_cell,
            &reachable_all,
            &pool,
            enforce_promotion_rule,
        )?;
        if best.contains(explicit) {
            explicit.clone()
        } else {
            best[0].clone()
        }
    } else if let Some(preferred) = prefer_on_tie.filter(|p| best.contains(*p)) {
        preferred.clone()
    } else {
        best[0].clone()
    };

    let winner_tablet = tablet_map
        .get(&winner)
        .ok_or_else(|| ErsError::Internal(format!("selected tablet {winner} missing from tablet map")))?;
    if !policy.can_establish(winner_tablet, &reachable_all) {
        return Err(ErsError::CannotEstablish(winner.to_string()));
    }

    Ok(Selection {
        position: positions[&winner].clone(),
        primary: winner,
    })
}

#[allow(clippy::too_many_arguments)]
fn reject_if_ineligible(
    explicit: &TabletAlias,
    tablet_map: &TabletMap,
    positions: &HashMap<TabletAlias, Position>,
    eligible: &HashMap<TabletAlias, bool>,
    policy: &dyn DurabilityPolicy,
    prevent_cross_cell_promotion: bool,
    previous_primary_cell: Option<&str>,
    reachable_all: &[Tablet],
    pool: &[TabletAlias],
    enforce_promotion_rule: bool,
) -> Result<()> {
    let reason = if !positions.contains_key(explicit) {
        Some("tablet has no known replication position".to_string())
    } else if !eligible.get(explicit).copied().unwrap_or(false) {
        Some("tablet carries errant GTIDs".to_string())
    } else if enforce_promotion_rule
        && tablet_map
            .get(explicit)
            .map(|t| policy.promotion_rule(t).excludes_candidacy())
            .unwrap_or(true)
    {
        Some("tablet's promotion rule is MUST_NOT".to_string())
    } else if prevent_cross_cell_promotion
        && previous_primary_cell
            .map(|cell| cell != explicit.cell.as_str())
            .unwrap_or(false)
    {
        Some("tablet is in a different cell than the previous primary".to_string())
    } else if !pool.contains(explicit) {
        Some("tablet excluded from the candidate pool".to_string())
    } else {
        let tablet = tablet_map
            .get(explicit)
            .expect("presence checked above");
        if !policy.can_establish(tablet, reachable_all) {
            Some("cannot establish durability with this candidate".to_string())
        } else {
            None
        }
    };

    match reason {
        Some(reason) => Err(ErsError::ExplicitCandidateIneligible {
            alias: explicit.to_string(),
            reason,
        }),
        None => Ok(()),
    }
}

fn find_maxima(pool: &[TabletAlias], positions: &HashMap<TabletAlias, Position>) -> Result<Vec<TabletAlias>> {
    let mut maxima = Vec::new();
    for a in pool {
        let pos_a = &positions[a];
        let mut dominated = false;
        for b in pool {
            if a == b {
                continue;
            }
            let pos_b = &positions[b];
            if Position::subset(pos_a, pos_b)? && !Position::equal(pos_a, pos_b)? {
                dominated = true;
                break;
            }
        }
        if !dominated {
            maxima.push(a.clone());
        }
    }
    Ok(maxima)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::durability::NonePolicy;
    use crate::tablet::{AfterStopStatus, ReplicationRunningFlags, TabletRole};

    fn stop_status(pos: &str) -> StopReplicationStatus {
        StopReplicationStatus {
            before: ReplicationRunningFlags { io_thread_running: true, sql_thread_running: true },
            after: AfterStopStatus {
                relay_log_position: Position::parse(pos).unwrap(),
                source_uuid: "00000000-0000-0000-0000-000000000000".to_string(),
            },
        }
    }

    fn map(pairs: Vec<(TabletAlias, TabletRole)>) -> TabletMap {
        pairs
            .into_iter()
            .map(|(alias, role)| {
                let t = Tablet::new(alias.clone(), "ks", "0", role);
                (alias, t)
            })
            .collect()
    }

    const U: &str = "00000000-0000-0000-0000-000000000001";

    #[test]
    fn s1_clean_failover_picks_most_advanced_replica() {
        let z1_101 = TabletAlias::new("z1", 101);
        let z1_102 = TabletAlias::new("z1", 102);
        let tablet_map = map(vec![
            (z1_101.clone(), TabletRole::Replica),
            (z1_102.clone(), TabletRole::Replica),
        ]);
        let mut status_map = HashMap::new();
        status_map.insert(z1_101.clone(), stop_status(&format!("MySQL56/{U}:1-21")));
        status_map.insert(z1_102.clone(), stop_status(&format!("MySQL56/{U}:1-26")));
        let positions = collect_positions(&status_map, &HashMap::new()).unwrap();
        let mut terms = HashMap::new();
        terms.insert(z1_101.clone(), 1);
        terms.insert(z1_102.clone(), 1);
        let eligible = mark_errant(&positions, &terms).unwrap();

        let policy = NonePolicy;
        let selection = select_primary(&tablet_map, &positions, &eligible, &policy, false, None, None, None, true).unwrap();
        assert_eq!(selection.primary, z1_102);
    }

    #[test]
    fn s2_explicit_laggard_tied_with_returned_primary() {
        let z1_101 = TabletAlias::new("z1", 101);
        let z1_102 = TabletAlias::new("z1", 102);
        let z1_100 = TabletAlias::new("z1", 100);
        let tablet_map = map(vec![
            (z1_101.clone(), TabletRole::Replica),
            (z1_102.clone(), TabletRole::Replica),
            (z1_100.clone(), TabletRole::Replica),
        ]);
        let mut status_map = HashMap::new();
        status_map.insert(z1_101.clone(), stop_status(&format!("MySQL56/{U}:1-20")));
        status_map.insert(z1_102.clone(), stop_status(&format!("MySQL56/{U}:1-21")));
        let mut primary_status_map = HashMap::new();
        primary_status_map.insert(z1_100.clone(), Position::parse(&format!("MySQL56/{U}:1-21")).unwrap());
        let positions = collect_positions(&status_map, &primary_status_map).unwrap();
        let mut terms = HashMap::new();
        terms.insert(z1_101.clone(), 1);
        terms.insert(z1_102.clone(), 1);
        terms.insert(z1_100.clone(), 1);
        let eligible = mark_errant(&positions, &terms).unwrap();

        let policy = NonePolicy;
        let selection =
            select_primary(&tablet_map, &positions, &eligible, &policy, false, None, Some(&z1_102), None, true).unwrap();
        assert_eq!(selection.primary, z1_102);
    }

    #[test]
    fn s3_split_brain_has_no_mutation_path() {
        let u2 = "00000000-0000-0000-0000-000000000002";
        let z1_100 = TabletAlias::new("z1", 100);
        let z1_101 = TabletAlias::new("z1", 101);
        let z1_102 = TabletAlias::new("z1", 102);
        let tablet_map = map(vec![
            (z1_100.clone(), TabletRole::Replica),
            (z1_101.clone(), TabletRole::Replica),
            (z1_102.clone(), TabletRole::Replica),
        ]);
        let mut status_map = HashMap::new();
        status_map.insert(z1_100.clone(), stop_status(&format!("MySQL56/{U}:1-21,{u2}:1-5")));
        status_map.insert(z1_101.clone(), stop_status(&format!("MySQL56/{U}:1-22")));
        status_map.insert(z1_102.clone(), stop_status(&format!("MySQL56/{U}:1-21,{u2}:1-6")));
        let positions = collect_positions(&status_map, &HashMap::new()).unwrap();
        let mut terms = HashMap::new();
        terms.insert(z1_100.clone(), 1);
        terms.insert(z1_101.clone(), 1);
        terms.insert(z1_102.clone(), 1);
        let eligible = mark_errant(&positions, &terms).unwrap();

        let policy = NonePolicy;
        let err = select_primary(&tablet_map, &positions, &eligible, &policy, false, None, None, None, true).unwrap_err();
        assert!(matches!(err, ErsError::SplitBrain));
    }

    #[test]
    fn s4_errant_replica_excluded() {
        let v = "00000000-0000-0000-0000-000000000002";
        let z1_100 = TabletAlias::new("z1", 100);
        let z1_101 = TabletAlias::new("z1", 101);
        let z1_102 = TabletAlias::new("z1", 102);
        let tablet_map = map(vec![
            (z1_101.clone(), TabletRole::Replica),
            (z1_102.clone(), TabletRole::Replica),
        ]);
        let mut status_map = HashMap::new();
        status_map.insert(z1_101.clone(), stop_status(&format!("MySQL56/{U}:1-19,{v}:1-1")));
        status_map.insert(z1_102.clone(), stop_status(&format!("MySQL56/{U}:1-20")));
        let mut primary_status_map = HashMap::new();
        primary_status_map.insert(z1_100.clone(), Position::parse(&format!("MySQL56/{U}:1-20")).unwrap());
        let positions = collect_positions(&status_map, &primary_status_map).unwrap();
        let mut terms = HashMap::new();
        terms.insert(z1_101.clone(), 1);
        terms.insert(z1_102.clone(), 1);
        terms.insert(z1_100.clone(), 1);
        let eligible = mark_errant(&positions, &terms).unwrap();
        assert_eq!(eligible.get(&z1_101), Some(&false));

        let mut full_tablet_map = tablet_map;
        full_tablet_map.insert(z1_100.clone(), Tablet::new(z1_100, "ks", "0", TabletRole::Primary));
        let policy = NonePolicy;
        let selection =
            select_primary(&full_tablet_map, &positions, &eligible, &policy, false, None, None, None, true).unwrap();
        assert_eq!(selection.primary, z1_102);
    }

    #[test]
    fn s5_cross_cell_blocked_when_only_other_cell_candidates_live() {
        let z1_101 = TabletAlias::new("z1", 101);
        let tablet_map = map(vec![(z1_101.clone(), TabletRole::Replica)]);
        let mut status_map = HashMap::new();
        status_map.insert(z1_101.clone(), stop_status(&format!("MySQL56/{U}:1-10")));
        let positions = collect_positions(&status_map, &HashMap::new()).unwrap();
        let mut terms = HashMap::new();
        terms.insert(z1_101.clone(), 1);
        let eligible = mark_errant(&positions, &terms).unwrap();

        let policy = NonePolicy;
        let err = select_primary(&tablet_map, &positions, &eligible, &policy, true, Some("z2"), None, None, true).unwrap_err();
        assert!(matches!(err, ErsError::NoCandidates));
    }

    #[test]
    fn zero_position_is_rejected() {
        let z1_101 = TabletAlias::new("z1", 101);
        let mut status_map = HashMap::new();
        status_map.insert(z1_101, stop_status("MySQL56/"));
        let err = collect_positions(&status_map, &HashMap::new()).unwrap_err();
        assert!(matches!(err, ErsError::ZeroPosition(_)));
    }

    #[test]
    fn one_reachable_replica_cannot_establish_semi_sync() {
        use crate::durability::SemiSyncPolicy;
        let z1_101 = TabletAlias::new("z1", 101);
        let tablet_map = map(vec![(z1_101.clone(), TabletRole::Replica)]);
        let mut status_map = HashMap::new();
        status_map.insert(z1_101.clone(), stop_status(&format!("MySQL56/{U}:1-5")));
        let positions = collect_positions(&status_map, &HashMap::new()).unwrap();
        let mut terms = HashMap::new();
        terms.insert(z1_101.clone(), 1);
        let eligible = mark_errant(&positions, &terms).unwrap();

        let policy = SemiSyncPolicy;
        let err = select_primary(&tablet_map, &positions, &eligible, &policy, false, None, None, None, true).unwrap_err();
        assert!(matches!(err, ErsError::CannotEstablish(_)));
    }

    #[test]
    fn with_promotion_rule_enforced_a_must_not_tablet_is_never_selected() {
        let z1_101 = TabletAlias::new("z1", 101);
        let z1_102 = TabletAlias::new("z1", 102);
        let tablet_map = map(vec![
            (z1_101.clone(), TabletRole::Replica),
            (z1_102.clone(), TabletRole::Spare),
        ]);
        let mut status_map = HashMap::new();
        status_map.insert(z1_101.clone(), stop_status(&format!("MySQL56/{U}:1-10")));
        status_map.insert(z1_102.clone(), stop_status(&format!("MySQL56/{U}:1-20")));
        let positions = collect_positions(&status_map, &HashMap::new()).unwrap();
        let mut terms = HashMap::new();
        terms.insert(z1_101.clone(), 1);
        terms.insert(z1_102.clone(), 1);
        let eligible = mark_errant(&positions, &terms).unwrap();

        let policy = NonePolicy;
        // 102 is the most advanced position but carries a MUST_NOT rule, so
        // with enforcement on, 101 is the only eligible candidate.
        let selection =
            select_primary(&tablet_map, &positions, &eligible, &policy, false, None, None, None, true).unwrap();
        assert_eq!(selection.primary, z1_101);
    }

    #[test]
    fn without_promotion_rule_enforced_a_must_not_tablet_can_relay_as_intermediate() {
        let z1_101 = TabletAlias::new("z1", 101);
        let z1_102 = TabletAlias::new("z1", 102);
        let tablet_map = map(vec![
            (z1_101.clone(), TabletRole::Replica),
            (z1_102.clone(), TabletRole::Spare),
        ]);
        let mut status_map = HashMap::new();
        status_map.insert(z1_101.clone(), stop_status(&format!("MySQL56/{U}:1-10")));
        status_map.insert(z1_102.clone(), stop_status(&format!("MySQL56/{U}:1-20")));
        let positions = collect_positions(&status_map, &HashMap::new()).unwrap();
        let mut terms = HashMap::new();
        terms.insert(z1_101.clone(), 1);
        terms.insert(z1_102.clone(), 1);
        let eligible = mark_errant(&positions, &terms).unwrap();

        let policy = NonePolicy;
        // Position-only selection (spec §4.6 D->E): the MUST_NOT tablet
        // holds the most-advanced position, so it is still picked as the
        // intermediate relay rather than losing its data.
        let selection =
            select_primary(&tablet_map, &positions, &eligible, &policy, false, None, None, None, false).unwrap();
        assert_eq!(selection.primary, z1_102);
    }
}
