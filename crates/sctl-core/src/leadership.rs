//! # Leadership View
//!
//! The in-process view of the distributed lease: a single boolean that
//! flips only when the lease is acquired or lost. The elector owns the
//! [`LeaderSignal`]; coordinators and the sweeper hold [`LeaderWatch`]
//! receivers and gate every new unit of work on them.

use tokio::sync::watch;

/// Gauge reporting whether this instance currently leads (1) or not (0).
pub const LEADER_GAUGE: &str = "sctl_leader";

/// Create a linked signal/watch pair with the given initial state.
pub fn leadership_channel(initial: bool) -> (LeaderSignal, LeaderWatch) {
    let (tx, rx) = watch::channel(initial);
    metrics::gauge!(LEADER_GAUGE).set(if initial { 1.0 } else { 0.0 });
    (LeaderSignal { tx }, LeaderWatch { rx })
}

/// Write side of the leadership view, held by the elector.
#[derive(Debug)]
pub struct LeaderSignal {
    tx: watch::Sender<bool>,
}

impl LeaderSignal {
    /// Publish the current leadership state. Only transitions notify
    /// watchers.
    pub fn set(&self, leader: bool) {
        let changed = self.tx.send_if_modified(|current| {
            if *current == leader {
                false
            } else {
                *current = leader;
                true
            }
        });
        if changed {
            metrics::gauge!(LEADER_GAUGE).set(if leader { 1.0 } else { 0.0 });
            if leader {
                tracing::info!("acquired leadership");
            } else {
                tracing::warn!("lost leadership");
            }
        }
    }

    /// Current state.
    pub fn is_leader(&self) -> bool {
        *self.tx.borrow()
    }

    /// A new watch on this signal.
    pub fn subscribe(&self) -> LeaderWatch {
        LeaderWatch {
            rx: self.tx.subscribe(),
        }
    }
}

/// Read side of the leadership view.
#[derive(Debug, Clone)]
pub struct LeaderWatch {
    rx: watch::Receiver<bool>,
}

impl LeaderWatch {
    /// A watch that always reports leadership, for single-instance mode.
    pub fn always() -> Self {
        let (tx, rx) = watch::channel(true);
        drop(tx);
        Self { rx }
    }

    /// Whether this instance currently leads.
    pub fn is_leader(&self) -> bool {
        *self.rx.borrow()
    }

    /// Wait until this instance leads.
    ///
    /// Returns `true` once leadership is held, or `false` if the signal was
    /// dropped while not leading (no leadership will ever arrive).
    pub async fn wait_for_leadership(&mut self) -> bool {
        // wait_for checks the current value before checking for a closed
        // channel, so a dropped sender that last reported `true` still resolves.
        self.rx.wait_for(|leader| *leader).await.is_ok()
    }

    /// Wait for the next leadership transition. Returns `false` once the
    /// signal has been dropped.
    pub async fn changed(&mut self) -> bool {
        self.rx.changed().await.is_ok()
    }
}
