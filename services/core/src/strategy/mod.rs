//! Deployment strategies.
//!
//! Pure functions mapping candidate capacities and a desired count to
//! per-node counts. Every strategy is deterministic given identical
//! inputs, including tie-breaks, so scheduling is reproducible.

use std::collections::HashMap;

use serde::{Deserialize, Serialize};

use eru_types::{CoreError, CoreResult};

/// Strategy tag carried in a deploy request.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Strategy {
    /// Greedy fill, capacity-descending.
    Auto,
    /// Top each candidate up to the per-node limit.
    Fill,
    /// Exactly the per-node limit on every candidate.
    Each,
    /// Minimize usage-rate variance, one replica at a time.
    Global,
    /// One replica per candidate.
    Dummy,
}

impl Strategy {
    /// Family default selected by `scheduler.type`.
    pub fn default_for(sched_type: &str) -> Self {
        match sched_type {
            "complex" => Strategy::Global,
            _ => Strategy::Auto,
        }
    }
}

/// One candidate node as the strategies see it.
#[derive(Debug, Clone, PartialEq)]
pub struct StrategyInfo {
    pub nodename: String,
    /// How many replicas of the request this node can still hold.
    pub capacity: i64,
    /// Tightest-dimension usage fraction, 0..=1.
    pub usage_rate: f64,
    /// Workloads already deployed on the node.
    pub count: i64,
}

/// Split `need` replicas across the candidates.
pub fn plan(
    strategy: Strategy,
    infos: &[StrategyInfo],
    need: i64,
    each_limit: i64,
) -> CoreResult<HashMap<String, i64>> {
    match strategy {
        Strategy::Auto => auto_plan(infos, need),
        Strategy::Fill => fill_plan(infos, each_limit),
        Strategy::Each => each_plan(infos, each_limit),
        Strategy::Global => global_plan(infos, need),
        Strategy::Dummy => dummy_plan(infos, need),
    }
}

/// Deterministic candidate order: capacity descending, usage-rate
/// ascending, name ascending.
fn sorted(infos: &[StrategyInfo]) -> Vec<&StrategyInfo> {
    let mut refs: Vec<&StrategyInfo> = infos.iter().collect();
    refs.sort_by(|a, b| {
        b.capacity
            .cmp(&a.capacity)
            .then(a.usage_rate.total_cmp(&b.usage_rate))
            .then(a.nodename.cmp(&b.nodename))
    });
    refs
}

fn total_capacity(infos: &[StrategyInfo]) -> i64 {
    infos.iter().fold(0i64, |acc, info| acc.saturating_add(info.capacity))
}

fn insufficient(infos: &[StrategyInfo], need: i64) -> CoreError {
    CoreError::InsufficientResource {
        need,
        available: total_capacity(infos),
    }
}

/// Greedy fill: assign as much as fits per node, biggest first.
fn auto_plan(infos: &[StrategyInfo], need: i64) -> CoreResult<HashMap<String, i64>> {
    let mut remaining = need;
    let mut deploy = HashMap::new();
    for info in sorted(infos) {
        if remaining == 0 {
            break;
        }
        let assign = info.capacity.min(remaining);
        if assign > 0 {
            deploy.insert(info.nodename.clone(), assign);
            remaining -= assign;
        }
    }
    if remaining > 0 {
        return Err(insufficient(infos, need));
    }
    Ok(deploy)
}

/// Top every candidate up to `limit` workloads in total, counting what is
/// already deployed. A candidate that cannot reach the limit fails the
/// whole plan.
fn fill_plan(infos: &[StrategyInfo], limit: i64) -> CoreResult<HashMap<String, i64>> {
    if limit <= 0 {
        return Err(CoreError::InvalidCount(limit));
    }
    let mut deploy = HashMap::new();
    for info in sorted(infos) {
        let shortfall = (limit - info.count).max(0);
        if shortfall == 0 {
            continue;
        }
        if shortfall > info.capacity {
            return Err(insufficient(infos, shortfall));
        }
        deploy.insert(info.nodename.clone(), shortfall);
    }
    Ok(deploy)
}

/// Exactly `limit` replicas on every candidate.
fn each_plan(infos: &[StrategyInfo], limit: i64) -> CoreResult<HashMap<String, i64>> {
    if limit <= 0 {
        return Err(CoreError::InvalidCount(limit));
    }
    let mut deploy = HashMap::new();
    for info in infos {
        if info.capacity < limit {
            return Err(insufficient(infos, limit));
        }
        deploy.insert(info.nodename.clone(), limit);
    }
    Ok(deploy)
}

/// Place one replica at a time on the node whose post-placement usage
/// rate is minimum; ties break on name.
///
/// Each placement on a node advances its rate by an equal share of the
/// headroom, `(1 - usage_rate) / capacity`, so a node reaches rate 1.0
/// exactly when its capacity is exhausted.
fn global_plan(infos: &[StrategyInfo], need: i64) -> CoreResult<HashMap<String, i64>> {
    let mut candidates: Vec<(&StrategyInfo, i64)> = sorted(infos)
        .into_iter()
        .filter(|info| info.capacity > 0)
        .map(|info| (info, 0i64))
        .collect();

    let mut deploy: HashMap<String, i64> = HashMap::new();
    for _ in 0..need {
        let next = candidates
            .iter_mut()
            .filter(|(info, placed)| *placed < info.capacity)
            .min_by(|(a, placed_a), (b, placed_b)| {
                let rate_a = post_placement_rate(a, *placed_a);
                let rate_b = post_placement_rate(b, *placed_b);
                rate_a.total_cmp(&rate_b).then(a.nodename.cmp(&b.nodename))
            });
        let Some((info, placed)) = next else {
            return Err(insufficient(infos, need));
        };
        *placed += 1;
        *deploy.entry(info.nodename.clone()).or_insert(0) += 1;
    }
    Ok(deploy)
}

fn post_placement_rate(info: &StrategyInfo, placed: i64) -> f64 {
    let step = (1.0 - info.usage_rate) / info.capacity as f64;
    info.usage_rate + (placed + 1) as f64 * step
}

/// One replica on each of the first `need` candidates.
fn dummy_plan(infos: &[StrategyInfo], need: i64) -> CoreResult<HashMap<String, i64>> {
    if need > infos.len() as i64 {
        return Err(insufficient(infos, need));
    }
    Ok(sorted(infos)
        .into_iter()
        .take(need as usize)
        .map(|info| (info.nodename.clone(), 1))
        .collect())
}

#[cfg(test)]
mod tests {
    use super::*;

    fn info(nodename: &str, capacity: i64, usage_rate: f64, count: i64) -> StrategyInfo {
        StrategyInfo {
            nodename: nodename.to_string(),
            capacity,
            usage_rate,
            count,
        }
    }

    #[test]
    fn default_family_by_scheduler_type() {
        assert_eq!(Strategy::default_for("simple"), Strategy::Auto);
        assert_eq!(Strategy::default_for("complex"), Strategy::Global);
        assert_eq!(Strategy::default_for(""), Strategy::Auto);
    }

    #[test]
    fn auto_fills_biggest_first() {
        let infos = vec![info("b", 2, 0.0, 0), info("a", 5, 0.0, 0)];
        let deploy = plan(Strategy::Auto, &infos, 3, 0).unwrap();
        assert_eq!(deploy.len(), 1);
        assert_eq!(deploy["a"], 3);
    }

    #[test]
    fn auto_spills_over_and_errors_when_short() {
        let infos = vec![info("a", 5, 0.0, 0), info("b", 2, 0.0, 0)];
        let deploy = plan(Strategy::Auto, &infos, 6, 0).unwrap();
        assert_eq!(deploy["a"], 5);
        assert_eq!(deploy["b"], 1);

        let err = plan(Strategy::Auto, &infos, 8, 0).unwrap_err();
        assert!(matches!(
            err,
            CoreError::InsufficientResource { need: 8, available: 7 }
        ));
    }

    #[test]
    fn auto_tie_breaks_on_usage_then_name() {
        let infos = vec![
            info("c", 3, 0.5, 0),
            info("b", 3, 0.1, 0),
            info("a", 3, 0.5, 0),
        ];
        let deploy = plan(Strategy::Auto, &infos, 3, 0).unwrap();
        assert_eq!(deploy["b"], 3);

        let infos = vec![info("c", 3, 0.5, 0), info("a", 3, 0.5, 0)];
        let deploy = plan(Strategy::Auto, &infos, 3, 0).unwrap();
        assert_eq!(deploy["a"], 3);
    }

    #[test]
    fn fill_tops_up_to_limit() {
        let infos = vec![info("a", 10, 0.0, 3), info("b", 10, 0.0, 7)];
        let deploy = plan(Strategy::Fill, &infos, 0, 5).unwrap();
        assert_eq!(deploy["a"], 2);
        // b already beyond the limit, nothing added
        assert!(!deploy.contains_key("b"));
    }

    #[test]
    fn fill_fails_when_a_node_cannot_reach_limit() {
        let infos = vec![info("a", 1, 0.0, 0)];
        assert!(plan(Strategy::Fill, &infos, 0, 5).is_err());
        assert!(plan(Strategy::Fill, &infos, 0, 0).is_err());
    }

    #[test]
    fn each_demands_limit_everywhere() {
        let infos = vec![info("a", 3, 0.0, 0), info("b", 3, 0.0, 0)];
        let deploy = plan(Strategy::Each, &infos, 0, 2).unwrap();
        assert_eq!(deploy["a"], 2);
        assert_eq!(deploy["b"], 2);

        let infos = vec![info("a", 3, 0.0, 0), info("b", 1, 0.0, 0)];
        assert!(plan(Strategy::Each, &infos, 0, 2).is_err());
    }

    #[test]
    fn global_balances_usage() {
        // a starts emptier, so it takes the first replicas until the
        // projected rates cross
        let infos = vec![info("a", 10, 0.0, 0), info("b", 10, 0.5, 0)];
        let deploy = plan(Strategy::Global, &infos, 4, 0).unwrap();
        assert_eq!(deploy["a"], 4);
        assert!(!deploy.contains_key("b"));

        let deploy = plan(Strategy::Global, &infos, 8, 0).unwrap();
        assert_eq!(deploy["a"], 6);
        assert_eq!(deploy["b"], 2);
    }

    #[test]
    fn global_tie_breaks_on_name() {
        let infos = vec![info("b", 5, 0.0, 0), info("a", 5, 0.0, 0)];
        let deploy = plan(Strategy::Global, &infos, 1, 0).unwrap();
        assert_eq!(deploy["a"], 1);
    }

    #[test]
    fn global_respects_capacity() {
        let infos = vec![info("a", 1, 0.0, 0), info("b", 1, 0.9, 0)];
        let deploy = plan(Strategy::Global, &infos, 2, 0).unwrap();
        assert_eq!(deploy["a"], 1);
        assert_eq!(deploy["b"], 1);
        assert!(plan(Strategy::Global, &infos, 3, 0).is_err());
    }

    #[test]
    fn dummy_one_per_candidate() {
        let infos = vec![info("a", 5, 0.0, 0), info("b", 2, 0.0, 0)];
        let deploy = plan(Strategy::Dummy, &infos, 2, 0).unwrap();
        assert_eq!(deploy["a"], 1);
        assert_eq!(deploy["b"], 1);
        assert!(plan(Strategy::Dummy, &infos, 3, 0).is_err());
    }

    #[test]
    fn plans_are_deterministic() {
        let infos = vec![
            info("a", 5, 0.2, 1),
            info("b", 5, 0.2, 0),
            info("c", 2, 0.9, 4),
        ];
        for strategy in [Strategy::Auto, Strategy::Global, Strategy::Dummy] {
            let first = plan(strategy, &infos, 3, 0).unwrap();
            let second = plan(strategy, &infos, 3, 0).unwrap();
            assert_eq!(first, second);
        }
    }
}
