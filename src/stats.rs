//! Instance statistics
//!
//! Counters are plain atomics, individually synchronized only when
//! read. A process-wide registry maps instance numbers to their
//! counters and is cleaned up at teardown.

use std::collections::BTreeMap;
use std::sync::atomic::AtomicU64;
use std::sync::{Arc, Mutex};

pub type StatCounter = AtomicU64;

#[derive(Debug, Default)]
pub struct NatStats {
    /// Frames handed to the engine (after segmentation).
    pub frames_in: StatCounter,
    /// Wire segments produced from super-frames.
    pub gso_segments: StatCounter,
    /// Packets queued for delivery to the guest.
    pub pkts_to_guest: StatCounter,
    /// Packets dropped before reaching the guest.
    pub pkts_dropped: StatCounter,
    /// Signals sent to the receive thread.
    pub recv_wakeups: StatCounter,
    /// Bytes written to the wakeup channel.
    pub wakeup_notifies: StatCounter,
    /// Completed NAT poll rounds.
    pub poll_rounds: StatCounter,
    /// Timer handlers fired.
    pub timers_fired: StatCounter,
}

static REGISTRY: Mutex<BTreeMap<usize, Arc<NatStats>>> = Mutex::new(BTreeMap::new());

pub fn register(instance: usize, stats: Arc<NatStats>) {
    REGISTRY.lock().unwrap().insert(instance, stats);
}

pub fn deregister(instance: usize) {
    REGISTRY.lock().unwrap().remove(&instance);
}

pub fn lookup(instance: usize) -> Option<Arc<NatStats>> {
    REGISTRY.lock().unwrap().get(&instance).cloned()
}
