//! Restart supervision.
//!
//! Asynchronous failures raise [`ResetReason`]s. The first raise of a reason
//! queues one `ResetGraph` command; the worker then runs
//! [`RestartSupervisor::service`], which stops the affected branches and
//! coalesces further resets arriving during the backoff window. The normal
//! reconciliation pass brings the branches back afterwards.

use crossbeam_channel::{Receiver, RecvTimeoutError, Sender};
use std::fmt;
use std::ops::BitOr;
use std::sync::atomic::{AtomicU8, Ordering};
use std::time::Instant;
use tracing::{debug, info, warn};

use crate::branch::BranchKind;
use crate::worker::Command;

pub mod pacer;

pub use pacer::RestartPacer;

/// Why a restart is owed.
///
/// The bridge raises `Graph` for upstream failures and `Recording` for
/// filesink errors. The other per-branch reasons are for embedders that
/// want to cycle a single branch through [`RestartSupervisor::raise`];
/// they coalesce with everything else pending.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ResetReason {
    Display,
    PushRtmp,
    PushRtsp,
    Recording,
    /// The whole graph, every branch included.
    Graph,
}

impl ResetReason {
    pub fn mask(self) -> ResetMask {
        match self {
            ResetReason::Display => ResetMask::DISPLAY,
            ResetReason::PushRtmp => ResetMask::PUSH_RTMP,
            ResetReason::PushRtsp => ResetMask::PUSH_RTSP,
            ResetReason::Recording => ResetMask::RECORDING,
            ResetReason::Graph => ResetMask::GRAPH,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct ResetMask(u8);

impl ResetMask {
    pub const EMPTY: ResetMask = ResetMask(0);
    pub const DISPLAY: ResetMask = ResetMask(1);
    pub const PUSH_RTMP: ResetMask = ResetMask(2);
    pub const PUSH_RTSP: ResetMask = ResetMask(4);
    pub const RECORDING: ResetMask = ResetMask(8);
    pub const GRAPH: ResetMask = ResetMask(1 | 2 | 4 | 8);

    pub fn from_bits(bits: u8) -> Self {
        ResetMask(bits & Self::GRAPH.0)
    }

    pub fn bits(self) -> u8 {
        self.0
    }

    pub fn is_empty(self) -> bool {
        self.0 == 0
    }

    pub fn contains(self, other: ResetMask) -> bool {
        self.0 & other.0 == other.0
    }

    pub fn difference(self, other: ResetMask) -> ResetMask {
        ResetMask(self.0 & !other.0)
    }

    /// Whether a reset with this mask has to stop `kind`.
    pub fn covers(self, kind: BranchKind) -> bool {
        let bit = match kind {
            BranchKind::Display => Self::DISPLAY,
            BranchKind::PushRtmp => Self::PUSH_RTMP,
            BranchKind::PushRtsp => Self::PUSH_RTSP,
            BranchKind::Recording => Self::RECORDING,
        };
        self.contains(bit)
    }
}

impl BitOr for ResetMask {
    type Output = ResetMask;

    fn bitor(self, rhs: ResetMask) -> ResetMask {
        ResetMask(self.0 | rhs.0)
    }
}

impl fmt::Display for ResetMask {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{:#06b}", self.0)
    }
}

/// What the supervisor acts on while servicing a reset.
pub trait RestartTarget {
    fn set_restarting(&self, restarting: bool);
    /// Stops every enabled branch `mask` covers.
    fn stop_for(&self, mask: ResetMask);
    fn is_running(&self) -> bool;
}

#[derive(Debug)]
pub struct RestartSupervisor {
    pending: AtomicU8,
    commands: Sender<Command>,
}

impl RestartSupervisor {
    pub fn new(commands: Sender<Command>) -> Self {
        Self {
            pending: AtomicU8::new(0),
            commands,
        }
    }

    pub fn pending(&self) -> ResetMask {
        ResetMask::from_bits(self.pending.load(Ordering::SeqCst))
    }

    /// Records `reason`. Returns false if it was already pending, in which
    /// case no further `ResetGraph` is queued. Safe to call from any thread.
    pub fn raise(&self, reason: ResetReason) -> bool {
        let bits = reason.mask().bits();
        let previous = self.pending.fetch_or(bits, Ordering::SeqCst);
        if previous & bits == bits {
            debug!("Reset {:?} already requested", reason);
            return false;
        }

        info!("Reset requested: {:?}", reason);
        if self.commands.send(Command::ResetGraph).is_err() {
            warn!("Worker gone, reset {:?} dropped", reason);
        }
        true
    }

    /// Runs one restart sequence on the worker thread.
    ///
    /// Returns a non-reset command received while waiting, which the caller
    /// must handle next.
    pub fn service(
        &self,
        target: &dyn RestartTarget,
        pacer: &mut RestartPacer,
        commands: &Receiver<Command>,
    ) -> Option<Command> {
        target.set_restarting(true);

        let mut serviced = ResetMask::EMPTY;
        let mut carried = None;
        loop {
            let pending = self.pending();
            if pending.is_empty() {
                break;
            }

            let fresh = pending.difference(serviced);
            serviced = serviced | pending;
            if !fresh.is_empty() {
                info!("Restarting branches for reset mask {}", fresh);
                target.stop_for(fresh);
            }

            if !target.is_running() {
                break;
            }

            let delay = pacer.next_delay(Instant::now());
            debug!("Restart settle delay {:?} (streak {})", delay, pacer.streak());
            match commands.recv_timeout(delay) {
                Ok(Command::ResetGraph) => continue,
                Ok(other) => {
                    carried = Some(other);
                    break;
                }
                Err(RecvTimeoutError::Timeout) | Err(RecvTimeoutError::Disconnected) => break,
            }
        }

        self.pending.fetch_and(!serviced.bits(), Ordering::SeqCst);
        target.set_restarting(false);
        carried
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crossbeam_channel::unbounded;
    use parking_lot::Mutex;
    use std::sync::atomic::AtomicBool;
    use std::time::Duration;

    #[derive(Default)]
    struct FakeTarget {
        restarting: AtomicBool,
        stopped: Mutex<Vec<ResetMask>>,
        halted: AtomicBool,
    }

    impl RestartTarget for FakeTarget {
        fn set_restarting(&self, restarting: bool) {
            self.restarting.store(restarting, Ordering::SeqCst);
        }

        fn stop_for(&self, mask: ResetMask) {
            self.stopped.lock().push(mask);
        }

        fn is_running(&self) -> bool {
            !self.halted.load(Ordering::SeqCst)
        }
    }

    fn fast_pacer() -> RestartPacer {
        RestartPacer::new(Duration::from_millis(1000), 4, Duration::from_millis(20))
    }

    #[test]
    fn test_mask_covers() {
        assert!(ResetMask::GRAPH.covers(BranchKind::Recording));
        assert!(ResetMask::PUSH_RTSP.covers(BranchKind::PushRtsp));
        assert!(!ResetMask::PUSH_RTSP.covers(BranchKind::PushRtmp));
        assert!((ResetMask::DISPLAY | ResetMask::PUSH_RTMP).covers(BranchKind::Display));
        assert_eq!(
            ResetMask::GRAPH.difference(ResetMask::DISPLAY),
            ResetMask::PUSH_RTMP | ResetMask::PUSH_RTSP | ResetMask::RECORDING
        );
    }

    #[test]
    fn test_raise_is_idempotent() {
        let (tx, rx) = unbounded();
        let supervisor = RestartSupervisor::new(tx);

        assert!(supervisor.raise(ResetReason::Graph));
        assert!(!supervisor.raise(ResetReason::Graph));
        assert!(!supervisor.raise(ResetReason::PushRtsp));
        assert_eq!(rx.try_iter().count(), 1);
        assert_eq!(supervisor.pending(), ResetMask::GRAPH);
    }

    #[test]
    fn test_service_stops_and_clears() {
        let (tx, rx) = unbounded();
        let supervisor = RestartSupervisor::new(tx);
        let target = FakeTarget::default();
        let mut pacer = fast_pacer();

        supervisor.raise(ResetReason::PushRtmp);
        assert_eq!(rx.recv().unwrap(), Command::ResetGraph);

        let carried = supervisor.service(&target, &mut pacer, &rx);
        assert!(carried.is_none());
        assert_eq!(*target.stopped.lock(), vec![ResetMask::PUSH_RTMP]);
        assert!(supervisor.pending().is_empty());
        assert!(!target.restarting.load(Ordering::SeqCst));

        // A fresh raise goes through again once serviced.
        assert!(supervisor.raise(ResetReason::PushRtmp));
    }

    #[test]
    fn test_service_coalesces_and_carries() {
        let (tx, rx) = unbounded();
        let supervisor = RestartSupervisor::new(tx.clone());
        let target = FakeTarget::default();
        let mut pacer = fast_pacer();

        supervisor.raise(ResetReason::Display);
        rx.recv().unwrap();
        supervisor.raise(ResetReason::Graph);
        tx.send(Command::StartPushRtmp).unwrap();

        let carried = supervisor.service(&target, &mut pacer, &rx);
        assert_eq!(carried, Some(Command::StartPushRtmp));
        // Both reasons were pending before servicing began; the queued
        // second ResetGraph only extends the loop.
        assert_eq!(*target.stopped.lock(), vec![ResetMask::GRAPH]);
        assert!(supervisor.pending().is_empty());
    }

    #[test]
    fn test_service_exits_when_halted() {
        let (tx, rx) = unbounded();
        let supervisor = RestartSupervisor::new(tx);
        let target = FakeTarget::default();
        target.halted.store(true, Ordering::SeqCst);
        let mut pacer = fast_pacer();

        supervisor.raise(ResetReason::Graph);
        rx.recv().unwrap();
        assert!(supervisor.service(&target, &mut pacer, &rx).is_none());
        assert_eq!(target.stopped.lock().len(), 1);
        assert!(!target.restarting.load(Ordering::SeqCst));
        assert_eq!(pacer.streak(), 0);
    }
}
