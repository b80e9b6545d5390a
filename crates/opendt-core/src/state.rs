//! Topology state cells
//!
//! Two cells, `observed` and `calibrated`, each holding the current
//! `(fingerprint, Topology)` pair plus a monotonically increasing generation
//! counter. Subscribers watch a cell and run change handlers on their own
//! loop, never on the notifier's.

use std::sync::Arc;

use tokio::sync::watch;

use crate::fingerprint::topology_fingerprint;
use crate::topology::Topology;
use crate::Result;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TopologyCell {
    Observed,
    Calibrated,
}

/// Immutable view of a cell at one generation.
#[derive(Debug, Clone)]
pub struct CellView {
    pub generation: u64,
    pub fingerprint: String,
    pub topology: Arc<Topology>,
}

struct Cell {
    tx: watch::Sender<Option<Arc<CellView>>>,
    generation: u64,
}

impl Cell {
    fn new() -> Self {
        let (tx, _) = watch::channel(None);
        Self { tx, generation: 0 }
    }

    fn set(&mut self, topology: Topology) -> Result<Option<u64>> {
        let fingerprint = topology_fingerprint(&topology)?;
        if let Some(current) = self.tx.borrow().as_ref() {
            if current.fingerprint == fingerprint {
                return Ok(None);
            }
        }
        self.generation += 1;
        let view = Arc::new(CellView {
            generation: self.generation,
            fingerprint,
            topology: Arc::new(topology),
        });
        // send_replace never fails; the sender keeps the value alive even
        // with zero receivers
        self.tx.send_replace(Some(view));
        Ok(Some(self.generation))
    }

    fn current(&self) -> Option<Arc<CellView>> {
        self.tx.borrow().clone()
    }

    fn subscribe(&self) -> watch::Receiver<Option<Arc<CellView>>> {
        self.tx.subscribe()
    }
}

/// Holder of the observed and calibrated topology cells.
///
/// Single-writer per cell: the observed cell is fed by the compacted
/// `topology.observed` channel, the calibrated cell by `topology.calibrated`.
/// On the first observed arrival the calibrated cell is seeded with a copy so
/// the simulation side always has a model to run.
pub struct TopologyState {
    observed: Cell,
    calibrated: Cell,
}

impl Default for TopologyState {
    fn default() -> Self {
        Self::new()
    }
}

impl TopologyState {
    pub fn new() -> Self {
        Self {
            observed: Cell::new(),
            calibrated: Cell::new(),
        }
    }

    /// Install a topology into a cell. Returns the new generation, or `None`
    /// when the fingerprint is unchanged (no generation bump, no
    /// notification).
    pub fn set(&mut self, cell: TopologyCell, topology: Topology) -> Result<Option<u64>> {
        match cell {
            TopologyCell::Observed => {
                let generation = self.observed.set(topology.clone())?;
                if generation.is_some() && self.calibrated.current().is_none() {
                    self.calibrated.set(topology)?;
                }
                Ok(generation)
            }
            TopologyCell::Calibrated => self.calibrated.set(topology),
        }
    }

    pub fn current(&self, cell: TopologyCell) -> Option<Arc<CellView>> {
        match cell {
            TopologyCell::Observed => self.observed.current(),
            TopologyCell::Calibrated => self.calibrated.current(),
        }
    }

    pub fn generation(&self, cell: TopologyCell) -> u64 {
        match cell {
            TopologyCell::Observed => self.observed.generation,
            TopologyCell::Calibrated => self.calibrated.generation,
        }
    }

    /// Watch a cell for changes. The receiver observes the latest view on
    /// subscribe (compacted semantics) and every generation bump thereafter.
    pub fn subscribe(&self, cell: TopologyCell) -> watch::Receiver<Option<Arc<CellView>>> {
        match cell {
            TopologyCell::Observed => self.observed.subscribe(),
            TopologyCell::Calibrated => self.calibrated.subscribe(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::topology::test_topology;

    #[test]
    fn test_set_bumps_generation_once_per_change() {
        let mut state = TopologyState::new();
        let topology = test_topology();

        let g1 = state.set(TopologyCell::Observed, topology.clone()).unwrap();
        assert_eq!(g1, Some(1));

        // Same fingerprint: no-op
        let g2 = state.set(TopologyCell::Observed, topology.clone()).unwrap();
        assert_eq!(g2, None);
        assert_eq!(state.generation(TopologyCell::Observed), 1);

        let mut changed = topology;
        changed.clusters[0].hosts[0].cpu_power_model.asym_util = 0.7;
        let g3 = state.set(TopologyCell::Observed, changed).unwrap();
        assert_eq!(g3, Some(2));
    }

    #[test]
    fn test_first_observed_seeds_calibrated() {
        let mut state = TopologyState::new();
        assert!(state.current(TopologyCell::Calibrated).is_none());

        state.set(TopologyCell::Observed, test_topology()).unwrap();

        let calibrated = state.current(TopologyCell::Calibrated).unwrap();
        let observed = state.current(TopologyCell::Observed).unwrap();
        assert_eq!(calibrated.fingerprint, observed.fingerprint);
    }

    #[test]
    fn test_later_observed_does_not_touch_calibrated() {
        let mut state = TopologyState::new();
        state.set(TopologyCell::Observed, test_topology()).unwrap();

        let mut calibrated = test_topology();
        calibrated.clusters[0].hosts[0].cpu_power_model.asym_util = 0.5;
        state.set(TopologyCell::Calibrated, calibrated).unwrap();
        let calibrated_fp = state.current(TopologyCell::Calibrated).unwrap().fingerprint.clone();

        let mut observed = test_topology();
        observed.clusters[0].hosts[0].count = 4;
        state.set(TopologyCell::Observed, observed).unwrap();

        assert_eq!(
            state.current(TopologyCell::Calibrated).unwrap().fingerprint,
            calibrated_fp,
            "observed updates after the first must not overwrite calibration"
        );
    }

    #[tokio::test]
    async fn test_subscribers_see_generation_bumps() {
        let mut state = TopologyState::new();
        let mut rx = state.subscribe(TopologyCell::Calibrated);

        state.set(TopologyCell::Observed, test_topology()).unwrap();
        rx.changed().await.unwrap();
        let view = rx.borrow_and_update().clone().unwrap();
        assert_eq!(view.generation, 1);
    }
}
