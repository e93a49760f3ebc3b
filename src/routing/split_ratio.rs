//! Weighted split-ratio tables.
//!
//! A table is built in two phases. During setup, [`SplitRatioTable::add_choice`]
//! accumulates raw, non-normalized weights per flow (several paths crossing the
//! same switch each contribute one choice). [`SplitRatioTable::reconcile`] then
//! runs once and turns every flow's list into a cumulative distribution sorted
//! by descending weight. After that the table is read-only and
//! [`SplitRatioTable::select`] maps a uniform draw to a target with a linear
//! scan, which beats a binary search for the handful of paths a flow has.

use std::collections::BTreeMap;
use std::fmt;

use crate::error::{Result, RoutingError};
use crate::types::FlowKey;
use crate::util::{approx_eq, DrawSource};

/// One forwarding choice.
///
/// Before reconciliation `weight` is the raw weight; afterwards it is the
/// cumulative probability of this choice and every higher-ranked one.
#[derive(Debug, Clone, PartialEq)]
pub struct WeightedChoice<T> {
    pub weight: f64,
    pub target: T,
}

/// Per-flow weighted forwarding choices.
#[derive(Debug, Clone)]
pub struct SplitRatioTable<T> {
    entries: BTreeMap<FlowKey, Vec<WeightedChoice<T>>>,
    reconciled: bool,
}

impl<T> Default for SplitRatioTable<T> {
    fn default() -> Self {
        Self {
            entries: BTreeMap::new(),
            reconciled: false,
        }
    }
}

impl<T: Clone + fmt::Debug> SplitRatioTable<T> {
    /// Create an empty table.
    pub fn new() -> Self {
        Self::default()
    }

    /// Append a weighted choice for `flow`, creating its list if needed.
    ///
    /// Weights are stored as given; normalization happens in [`reconcile`](Self::reconcile).
    pub fn add_choice(&mut self, flow: FlowKey, weight: f64, target: T) -> Result<()> {
        if self.reconciled {
            return Err(RoutingError::AlreadyReconciled.into());
        }
        if !weight.is_finite() || weight < 0.0 {
            return Err(RoutingError::InvalidWeight { flow, weight }.into());
        }

        let choices = self.entries.entry(flow).or_default();
        tracing::debug!(
            flow = %flow,
            weight,
            target = ?target,
            existing = choices.len(),
            "Adding split ratio choice"
        );
        choices.push(WeightedChoice { weight, target });
        Ok(())
    }

    /// Add a single rule that always applies, e.g. for acknowledgment traffic.
    pub fn add_deterministic(&mut self, flow: FlowKey, target: T) -> Result<()> {
        self.add_choice(flow, 1.0, target)
    }

    /// Normalize every flow into a cumulative distribution.
    ///
    /// Zero-weight choices are dropped; a flow left with no choices stays in
    /// the table and fails on [`select`](Self::select). Equal weights keep
    /// their insertion order. The new table is built separately and swapped in
    /// only if every flow normalizes.
    pub fn reconcile(&mut self) -> Result<()> {
        if self.reconciled {
            return Err(RoutingError::AlreadyReconciled.into());
        }

        let mut reconciled = BTreeMap::new();
        for (flow, choices) in &self.entries {
            reconciled.insert(*flow, Self::normalize(flow, choices)?);
        }

        self.entries = reconciled;
        self.reconciled = true;
        Ok(())
    }

    fn normalize(flow: &FlowKey, choices: &[WeightedChoice<T>]) -> Result<Vec<WeightedChoice<T>>> {
        tracing::debug!(
            flow = %flow,
            weights = ?choices.iter().map(|c| c.weight).collect::<Vec<_>>(),
            "Split ratios before reconciliation"
        );

        let mut kept: Vec<WeightedChoice<T>> = choices
            .iter()
            .filter(|c| c.weight != 0.0)
            .cloned()
            .collect();

        if kept.is_empty() {
            tracing::warn!(flow = %flow, "Flow has no non-zero split ratio");
            return Ok(kept);
        }

        let total: f64 = kept.iter().map(|c| c.weight).sum();
        for choice in &mut kept {
            choice.weight /= total;
        }

        // Stable: equal weights keep insertion order.
        kept.sort_by(|a, b| b.weight.total_cmp(&a.weight));

        let mut cumulative = 0.0;
        for choice in &mut kept {
            cumulative += choice.weight;
            choice.weight = cumulative;
        }

        if let Some(last) = kept.last_mut() {
            if approx_eq(last.weight, 1.0) {
                last.weight = 1.0;
            } else {
                return Err(RoutingError::NotNormalized {
                    flow: *flow,
                    cumulative: last.weight,
                }
                .into());
            }
        }

        tracing::debug!(
            flow = %flow,
            cumulative = ?kept.iter().map(|c| c.weight).collect::<Vec<_>>(),
            "Split ratios after reconciliation"
        );
        Ok(kept)
    }

    /// Pick the target for `draw` in `[0, 1)`.
    ///
    /// Returns the first choice whose cumulative weight is at least `draw`.
    pub fn select(&self, flow: &FlowKey, draw: f64) -> Result<&T> {
        if !self.reconciled {
            return Err(RoutingError::NotReconciled.into());
        }
        if !(0.0..=1.0).contains(&draw) {
            return Err(RoutingError::InvalidDraw(draw).into());
        }

        let choices = self
            .entries
            .get(flow)
            .ok_or(RoutingError::TableMiss { flow: *flow })?;

        choices
            .iter()
            .find(|c| draw <= c.weight)
            .map(|c| &c.target)
            .ok_or_else(|| RoutingError::NoChoices { flow: *flow }.into())
    }

    /// Draw from `source` and select.
    pub fn select_with<D: DrawSource + ?Sized>(&self, flow: &FlowKey, source: &mut D) -> Result<&T> {
        self.select(flow, source.next_draw())
    }

    /// Choices for a flow, raw before reconciliation and cumulative after.
    pub fn choices(&self, flow: &FlowKey) -> Option<&[WeightedChoice<T>]> {
        self.entries.get(flow).map(Vec::as_slice)
    }

    /// Sum of the weights currently stored for `flow`.
    pub fn total_weight(&self, flow: &FlowKey) -> f64 {
        self.entries
            .get(flow)
            .map_or(0.0, |choices| choices.iter().map(|c| c.weight).sum())
    }

    /// Iterate over the flows present in the table.
    pub fn flows(&self) -> impl Iterator<Item = &FlowKey> {
        self.entries.keys()
    }

    pub fn contains(&self, flow: &FlowKey) -> bool {
        self.entries.contains_key(flow)
    }

    pub fn is_reconciled(&self) -> bool {
        self.reconciled
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }
}

#[cfg(test)]
mod tests {
    use std::collections::HashMap;
    use std::net::Ipv4Addr;

    use super::*;
    use crate::error::Error;
    use crate::types::FlowProtocol;
    use crate::util::RandomStreams;

    fn flow(n: u16) -> FlowKey {
        FlowKey::new(
            Ipv4Addr::new(10, 0, 0, 1),
            Ipv4Addr::new(10, 0, 1, 1),
            n,
            80,
            FlowProtocol::Udp,
        )
    }

    fn cumulative(table: &SplitRatioTable<&'static str>, key: &FlowKey) -> Vec<f64> {
        table.choices(key).unwrap().iter().map(|c| c.weight).collect()
    }

    #[test]
    fn test_reconcile_produces_cumulative_distribution() {
        let mut table = SplitRatioTable::new();
        table.add_choice(flow(1), 2.0, "b").unwrap();
        table.add_choice(flow(1), 5.0, "a").unwrap();
        table.add_choice(flow(1), 3.0, "c").unwrap();
        table.reconcile().unwrap();

        let choices = table.choices(&flow(1)).unwrap();
        let targets: Vec<_> = choices.iter().map(|c| c.target).collect();
        assert_eq!(targets, vec!["a", "c", "b"]);

        let weights = cumulative(&table, &flow(1));
        assert!((weights[0] - 0.5).abs() < 1e-12);
        assert!((weights[1] - 0.8).abs() < 1e-12);
        assert_eq!(weights[2], 1.0);
    }

    #[test]
    fn test_normalization_invariant_holds_for_every_flow() {
        let mut table = SplitRatioTable::new();
        let mut streams = RandomStreams::new(11, 1);
        let mut rng = streams.next_rng();
        for f in 0..50u16 {
            for _ in 0..(1 + f % 6) {
                let w = 1.0 + rng.next_draw() * 1e6;
                table.add_choice(flow(f), w, "x").unwrap();
            }
        }
        table.reconcile().unwrap();

        for key in table.flows() {
            let weights: Vec<f64> = table.choices(key).unwrap().iter().map(|c| c.weight).collect();
            assert_eq!(*weights.last().unwrap(), 1.0);
            assert!(weights.iter().all(|w| *w >= 0.0));
            assert!(weights.windows(2).all(|w| w[0] <= w[1]));
        }
    }

    #[test]
    fn test_zero_weights_dropped() {
        let mut table = SplitRatioTable::new();
        table.add_choice(flow(1), 0.0, "zero").unwrap();
        table.add_choice(flow(1), 4.0, "only").unwrap();
        table.reconcile().unwrap();

        let choices = table.choices(&flow(1)).unwrap();
        assert_eq!(choices.len(), 1);
        assert_eq!(choices[0].target, "only");
        assert_eq!(choices[0].weight, 1.0);
    }

    #[test]
    fn test_all_zero_flow_is_present_but_empty() {
        let mut table: SplitRatioTable<&str> = SplitRatioTable::new();
        table.add_choice(flow(1), 0.0, "a").unwrap();
        table.reconcile().unwrap();

        assert!(table.contains(&flow(1)));
        let err = table.select(&flow(1), 0.5).unwrap_err();
        assert!(matches!(err, Error::Routing(RoutingError::NoChoices { .. })));
    }

    #[test]
    fn test_missing_flow_is_table_miss() {
        let mut table = SplitRatioTable::new();
        table.add_choice(flow(1), 1.0, "a").unwrap();
        table.reconcile().unwrap();

        let err = table.select(&flow(2), 0.5).unwrap_err();
        assert!(matches!(err, Error::Routing(RoutingError::TableMiss { .. })));
    }

    #[test]
    fn test_select_picks_first_cumulative_at_or_above_draw() {
        let mut table = SplitRatioTable::new();
        table.add_choice(flow(1), 0.5, "a").unwrap();
        table.add_choice(flow(1), 0.3, "b").unwrap();
        table.add_choice(flow(1), 0.2, "c").unwrap();
        table.reconcile().unwrap();

        assert_eq!(*table.select(&flow(1), 0.0).unwrap(), "a");
        assert_eq!(*table.select(&flow(1), 0.5).unwrap(), "a");
        assert_eq!(*table.select(&flow(1), 0.500_001).unwrap(), "b");
        assert_eq!(*table.select(&flow(1), 0.79).unwrap(), "b");
        assert_eq!(*table.select(&flow(1), 0.81).unwrap(), "c");
        assert_eq!(*table.select(&flow(1), 0.999_999).unwrap(), "c");
    }

    #[test]
    fn test_equal_weights_keep_insertion_order() {
        let mut table = SplitRatioTable::new();
        table.add_choice(flow(1), 1.0, "first").unwrap();
        table.add_choice(flow(1), 1.0, "second").unwrap();
        table.add_choice(flow(1), 1.0, "third").unwrap();
        table.reconcile().unwrap();

        let targets: Vec<_> = table.choices(&flow(1)).unwrap().iter().map(|c| c.target).collect();
        assert_eq!(targets, vec!["first", "second", "third"]);
        assert_eq!(*table.select(&flow(1), 0.1).unwrap(), "first");
    }

    #[test]
    fn test_accumulates_contributions_for_same_flow() {
        let mut table = SplitRatioTable::new();
        table.add_choice(flow(1), 10.0, "p1").unwrap();
        table.add_choice(flow(1), 10.0, "p1").unwrap();
        table.add_choice(flow(1), 20.0, "p2").unwrap();
        assert_eq!(table.total_weight(&flow(1)), 40.0);
        assert_eq!(table.choices(&flow(1)).unwrap().len(), 3);
    }

    #[test]
    fn test_selection_is_deterministic_for_fixed_draws() {
        let mut table = SplitRatioTable::new();
        table.add_choice(flow(1), 0.6, 1u32).unwrap();
        table.add_choice(flow(1), 0.4, 2u32).unwrap();
        table.reconcile().unwrap();

        let draws = [0.1, 0.7, 0.59, 0.61, 0.0, 0.99];
        let first: Vec<u32> = draws.iter().map(|d| *table.select(&flow(1), *d).unwrap()).collect();
        let second: Vec<u32> = draws.iter().map(|d| *table.select(&flow(1), *d).unwrap()).collect();
        assert_eq!(first, second);
        assert_eq!(first, vec![1, 2, 1, 2, 1, 2]);
    }

    #[test]
    fn test_weighted_distribution_converges() {
        let mut table = SplitRatioTable::new();
        table.add_choice(flow(1), 0.5, 'a').unwrap();
        table.add_choice(flow(1), 0.3, 'b').unwrap();
        table.add_choice(flow(1), 0.2, 'c').unwrap();
        table.reconcile().unwrap();

        let mut rng = RandomStreams::new(42, 1).next_rng();
        let draws = 100_000;
        let mut counts: HashMap<char, u32> = HashMap::new();
        for _ in 0..draws {
            let target = *table.select_with(&flow(1), &mut rng).unwrap();
            *counts.entry(target).or_insert(0) += 1;
        }

        for (target, expected) in [('a', 0.5), ('b', 0.3), ('c', 0.2)] {
            let share = f64::from(counts[&target]) / f64::from(draws);
            assert!(
                (share - expected).abs() <= 0.01,
                "target {target}: share {share}, expected {expected}"
            );
        }
    }

    #[test]
    fn test_two_phase_misuse_is_rejected() {
        let mut table = SplitRatioTable::new();
        table.add_choice(flow(1), 1.0, "a").unwrap();
        assert!(matches!(
            table.select(&flow(1), 0.5).unwrap_err(),
            Error::Routing(RoutingError::NotReconciled)
        ));

        table.reconcile().unwrap();
        assert!(matches!(
            table.reconcile().unwrap_err(),
            Error::Routing(RoutingError::AlreadyReconciled)
        ));
        assert!(matches!(
            table.add_choice(flow(1), 1.0, "b").unwrap_err(),
            Error::Routing(RoutingError::AlreadyReconciled)
        ));
    }

    #[test]
    fn test_invalid_weights_and_draws() {
        let mut table = SplitRatioTable::new();
        assert!(table.add_choice(flow(1), -1.0, "a").is_err());
        assert!(table.add_choice(flow(1), f64::NAN, "a").is_err());
        assert!(table.add_choice(flow(1), f64::INFINITY, "a").is_err());

        table.add_choice(flow(1), 1.0, "a").unwrap();
        table.reconcile().unwrap();
        assert!(table.select(&flow(1), 1.5).is_err());
        assert!(table.select(&flow(1), f64::NAN).is_err());
    }

    #[test]
    fn test_overflowing_total_is_not_normalized() {
        let mut table = SplitRatioTable::new();
        table.add_choice(flow(1), f64::MAX, "a").unwrap();
        table.add_choice(flow(1), f64::MAX, "b").unwrap();
        table.add_choice(flow(2), 1.0, "c").unwrap();

        let err = table.reconcile().unwrap_err();
        assert!(matches!(err, Error::Routing(RoutingError::NotNormalized { .. })));
        // Failed reconciliation leaves the table untouched.
        assert!(!table.is_reconciled());
        assert_eq!(table.total_weight(&flow(2)), 1.0);
    }
}
