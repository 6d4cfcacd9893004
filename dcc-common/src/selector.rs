//! Host selection and slot locking.
//!
//! Every client process on the machine competes for the same lock files,
//! so choosing a host is simply finding the first (host, slot) lock nobody
//! holds. Slots are scanned slot-major: every host's slot 0 is tried before
//! any host's slot 1, which spreads jobs across hosts before stacking them.
//! When everything is busy the selector sleeps a fixed pause and rescans;
//! waiting jobs keep their place instead of backing off exponentially.

use crate::backoff::ReputationTracker;
use crate::errors::DccError;
use crate::hosts::{HostDefinition, HostRegistry};
use crate::lock::{LockKind, LockProvider, SlotLock};
use crate::state::{Phase, StatePublisher, StateTarget};
use std::time::Duration;
use tracing::{debug, error, trace};

// =========================================================================
// Constants
// =========================================================================

/// Upper bound on slot indices, whatever a host claims.
pub const MAX_SLOTS: u32 = 50;

/// Slots of the local host used for compiles that must run here.
pub const LOCAL_COMPILE_SLOTS: u32 = 4;

/// Slots of the local host used for preprocessing ahead of a remote compile.
/// Preprocessing is lighter than compiling, so more of them may overlap.
pub const LOCAL_PREPROCESS_SLOTS: u32 = 8;

// =========================================================================
// Candidate filtering
// =========================================================================

/// Hosts eligible for selection: not in backoff and marked up.
///
/// Returns [`DccError::NoHosts`] when nothing remains.
pub fn candidate_hosts(
    registry: &HostRegistry,
    reputation: &ReputationTracker,
) -> Result<HostRegistry, DccError> {
    let candidates = reputation.remove_disliked(registry).up_hosts();
    if candidates.is_empty() {
        debug!("no hosts left after filtering {} configured", registry.len());
        return Err(DccError::NoHosts);
    }
    Ok(candidates)
}

/// State-file target for work done on `host`.
fn target_for(host: &HostDefinition) -> StateTarget {
    if host.hostname == "localhost" {
        StateTarget::Local
    } else {
        StateTarget::Remote
    }
}

// =========================================================================
// Selector
// =========================================================================

/// Finds and locks a free slot.
pub struct HostSelector<'a> {
    locks: &'a dyn LockProvider,
    pause: Duration,
    local: HostDefinition,
    local_preprocess: HostDefinition,
}

impl<'a> HostSelector<'a> {
    /// Selector taking locks from `locks`, sleeping `pause` between full
    /// unsuccessful scans. A zero pause rescans immediately.
    pub fn new(locks: &'a dyn LockProvider, pause: Duration) -> Self {
        Self {
            locks,
            pause,
            local: HostDefinition::localhost(LOCAL_COMPILE_SLOTS),
            local_preprocess: HostDefinition::localhost(LOCAL_PREPROCESS_SLOTS),
        }
    }

    pub fn pause(&self) -> Duration {
        self.pause
    }

    /// Lock one free slot on one of `registry`'s hosts, blocking until one
    /// frees up.
    ///
    /// The chosen slot is noted in `state` under the Local target for
    /// `localhost`, otherwise under Remote. A lock error other than
    /// contention aborts the search.
    pub fn select_and_lock(
        &self,
        registry: &HostRegistry,
        state: &mut StatePublisher,
    ) -> Result<(HostDefinition, SlotLock), DccError> {
        if registry.is_empty() {
            return Err(DccError::NoHosts);
        }
        let (host, lock) = self.lock_one(registry.hosts())?;
        state.note_slot(lock.slot(), target_for(host));
        Ok((host.clone(), lock))
    }

    /// Lock a slot for a compile that runs on this machine.
    pub fn lock_local(&self, state: &mut StatePublisher) -> Result<SlotLock, DccError> {
        let (host, lock) = self.lock_one(std::slice::from_ref(&self.local))?;
        state.note_slot(lock.slot(), target_for(host));
        Ok(lock)
    }

    /// Lock a slot for local preprocessing and publish the Preprocess phase.
    pub fn lock_local_preprocess(&self, state: &mut StatePublisher) -> Result<SlotLock, DccError> {
        let (host, lock) = self.lock_one(std::slice::from_ref(&self.local_preprocess))?;
        let target = target_for(host);
        state.note_slot(lock.slot(), target);
        state.publish(Phase::Preprocess, None, Some(&host.hostname), target);
        Ok(lock)
    }

    fn lock_one<'h>(
        &self,
        hosts: &'h [HostDefinition],
    ) -> Result<(&'h HostDefinition, SlotLock), DccError> {
        loop {
            if let Some(found) = self.scan_once(hosts)? {
                return Ok(found);
            }
            trace!("nothing available, sleeping {:?}", self.pause);
            if !self.pause.is_zero() {
                std::thread::sleep(self.pause);
            }
        }
    }

    /// One slot-major pass over `hosts`.
    fn scan_once<'h>(
        &self,
        hosts: &'h [HostDefinition],
    ) -> Result<Option<(&'h HostDefinition, SlotLock)>, DccError> {
        for slot in 0..MAX_SLOTS {
            for host in hosts.iter().filter(|h| slot < h.slots) {
                match self.locks.acquire(LockKind::Cpu, host, slot, false) {
                    Ok(lock) => {
                        debug!("locked {} slot {}", host, slot);
                        return Ok(Some((host, lock)));
                    }
                    Err(e) if e.is_busy() => continue,
                    Err(e) => {
                        error!("failed to lock {} slot {}: {}", host, slot, e);
                        return Err(e.into());
                    }
                }
            }
        }
        Ok(None)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::hosts::{Compression, CppWhere};
    use crate::lock::{FileLockProvider, LockError, lock_name};
    use std::cell::RefCell;
    use std::collections::HashSet;
    use std::time::SystemTime;
    use tempfile::TempDir;

    /// In-memory provider recording every attempt.
    #[derive(Default)]
    struct MockLocks {
        busy: RefCell<HashSet<String>>,
        attempts: RefCell<Vec<String>>,
        broken: Option<String>,
    }

    impl MockLocks {
        fn busy(names: &[&str]) -> Self {
            Self {
                busy: RefCell::new(names.iter().map(|n| n.to_string()).collect()),
                ..Default::default()
            }
        }
    }

    impl LockProvider for MockLocks {
        fn acquire(
            &self,
            kind: LockKind,
            host: &HostDefinition,
            slot: u32,
            _blocking: bool,
        ) -> Result<SlotLock, LockError> {
            let name = lock_name(kind, host, slot);
            self.attempts.borrow_mut().push(name.clone());
            if self.broken.as_deref() == Some(name.as_str()) {
                return Err(LockError::Io {
                    path: name.into(),
                    source: std::io::Error::other("disk on fire"),
                });
            }
            if !self.busy.borrow_mut().insert(name.clone()) {
                return Err(LockError::Busy(name));
            }
            Ok(SlotLock::detached(name, slot))
        }
    }

    fn tcp(name: &str, slots: u32) -> HostDefinition {
        HostDefinition::tcp(name, 3632, slots, Compression::None, CppWhere::OnClient).unwrap()
    }

    fn registry() -> HostRegistry {
        HostRegistry::new(vec![tcp("a", 2), tcp("b", 1), HostDefinition::localhost(2)])
    }

    #[test]
    fn test_slot_major_order() {
        let locks = MockLocks::default();
        let selector = HostSelector::new(&locks, Duration::ZERO);
        let mut state = StatePublisher::disabled();
        let registry = registry();

        let mut picked = Vec::new();
        let mut held = Vec::new();
        for _ in 0..5 {
            let (host, lock) = selector.select_and_lock(&registry, &mut state).unwrap();
            picked.push(format!("{}:{}", host.hostname, lock.slot()));
            held.push(lock);
        }
        assert_eq!(picked, ["a:0", "b:0", "localhost:0", "a:1", "localhost:1"]);
    }

    #[test]
    fn test_slot_recorded_for_target() {
        let locks = MockLocks::busy(&["cpu_tcp_a_3632_0"]);
        let selector = HostSelector::new(&locks, Duration::ZERO);
        let mut state = StatePublisher::disabled();

        let (host, _lock) = selector.select_and_lock(&registry(), &mut state).unwrap();
        assert_eq!(host.hostname, "b");
        assert_eq!(state.snapshot(StateTarget::Remote).slot, 0);
        assert_eq!(state.snapshot(StateTarget::Local).slot, -1);

        let locks = MockLocks::busy(&["cpu_tcp_a_3632_0", "cpu_tcp_b_3632_0"]);
        let selector = HostSelector::new(&locks, Duration::ZERO);
        let mut state = StatePublisher::disabled();
        let (host, _lock) = selector.select_and_lock(&registry(), &mut state).unwrap();
        assert!(host.is_local());
        assert_eq!(state.snapshot(StateTarget::Local).slot, 0);
    }

    #[test]
    fn test_hard_lock_error_aborts() {
        let locks = MockLocks {
            broken: Some("cpu_tcp_b_3632_0".to_string()),
            ..MockLocks::busy(&["cpu_tcp_a_3632_0"])
        };
        let selector = HostSelector::new(&locks, Duration::ZERO);
        let mut state = StatePublisher::disabled();

        let err = selector.select_and_lock(&registry(), &mut state).unwrap_err();
        assert!(matches!(err, DccError::Io { .. }));
        assert_eq!(
            *locks.attempts.borrow(),
            ["cpu_tcp_a_3632_0", "cpu_tcp_b_3632_0"]
        );
    }

    #[test]
    fn test_empty_registry_is_no_hosts() {
        let locks = MockLocks::default();
        let selector = HostSelector::new(&locks, Duration::ZERO);
        let mut state = StatePublisher::disabled();
        let err = selector
            .select_and_lock(&HostRegistry::default(), &mut state)
            .unwrap_err();
        assert!(matches!(err, DccError::NoHosts));
    }

    #[test]
    fn test_local_locks_use_local_slot_counts() {
        let locks = MockLocks::default();
        let selector = HostSelector::new(&locks, Duration::ZERO);
        let mut state = StatePublisher::disabled();

        let held: Vec<_> = (0..LOCAL_COMPILE_SLOTS)
            .map(|_| selector.lock_local(&mut state).unwrap())
            .collect();
        assert_eq!(held.last().unwrap().name(), "cpu_localhost_3");

        // Preprocess slots share the namespace but go further.
        let lock = selector.lock_local_preprocess(&mut state).unwrap();
        assert_eq!(lock.name(), "cpu_localhost_4");
        let snapshot = state.snapshot(StateTarget::Local);
        assert_eq!(snapshot.phase, Phase::Preprocess);
        assert_eq!(snapshot.host, "localhost");
        assert_eq!(snapshot.slot, 4);
    }

    #[test]
    fn test_waits_for_released_slot() {
        let dir = TempDir::new().unwrap();
        let locks = FileLockProvider::new(dir.path());
        let host = tcp("solo", 1);
        let registry = HostRegistry::new(vec![host.clone()]);

        let held = locks.acquire(LockKind::Cpu, &host, 0, false).unwrap();
        let releaser = std::thread::spawn(move || {
            std::thread::sleep(Duration::from_millis(100));
            drop(held);
        });

        let selector = HostSelector::new(&locks, Duration::from_millis(20));
        let mut state = StatePublisher::disabled();
        let (chosen, lock) = selector.select_and_lock(&registry, &mut state).unwrap();
        assert_eq!(chosen.hostname, "solo");
        assert_eq!(lock.slot(), 0);
        releaser.join().unwrap();
    }

    #[test]
    fn test_candidates_skip_backoff_and_down_hosts() {
        let dir = TempDir::new().unwrap();
        let reputation = ReputationTracker::new(dir.path(), Duration::from_secs(60));
        let mut down = tcp("down", 1);
        down.is_up = false;
        let registry = HostRegistry::new(vec![tcp("a", 1), tcp("b", 1), down]);

        reputation.mark_disliked(&registry.hosts()[0]);
        assert!(reputation.is_in_backoff_at(&registry.hosts()[0], SystemTime::now()));

        let candidates = candidate_hosts(&registry, &reputation).unwrap();
        let names: Vec<_> = candidates.iter().map(|h| h.hostname.as_str()).collect();
        assert_eq!(names, ["b"]);

        reputation.mark_disliked(&registry.hosts()[1]);
        assert!(matches!(
            candidate_hosts(&registry, &reputation),
            Err(DccError::NoHosts)
        ));
    }
}
