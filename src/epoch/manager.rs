// Epoch manager
//
// Lets threads of this process declare critical sections that destructive
// operations elsewhere must not overlap, and runs the two background loops
// of the fault-tolerance protocol:
//
//  - heartbeat: periodically takes the epoch lock exclusively (draining all
//    shared-mode critical sections), then reports this process at the
//    frontier. A report therefore proves no local critical section still
//    observes an older epoch.
//  - monitor: periodically scans the vector; advances the frontier when all
//    active participants report it, and kills + unregisters a participant
//    whose report has been stale longer than the timeout.
//
// The exclusive/shared lock is a raw parking_lot rwlock because the shared
// acquisition in enter_critical must outlive the call and be released from
// exit_critical, possibly on another statement path; guard types cannot
// express that.

use parking_lot::lock_api::RawRwLock as _;
use parking_lot::{Mutex, RawRwLock};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::thread::JoinHandle;
use std::time::{Duration, Instant};
use tracing::{debug, error, info, trace, warn};

use crate::config::Config;
use crate::epoch::vector::{EpochVector, EPOCH_MIN_ACTIVE, EPOCH_NO_PARTICIPANT};
use crate::epoch_shelf::EpochShelf;
use crate::error::{MmError, Result};

/// How often the heartbeat republishes our reported epoch.
pub const HEARTBEAT_INTERVAL: Duration = Duration::from_millis(100);

/// How often the monitor scans and tries to advance the frontier.
pub const MONITOR_INTERVAL: Duration = Duration::from_millis(100);

/// A participant stale for longer than this is presumed dead.
pub const TIMEOUT: Duration = Duration::from_secs(10);

pub type FailureCallback = Box<dyn Fn(u64) + Send + Sync>;

struct Inner {
    // the shelf keeps the vector's mapping alive; field order is the drop
    // order contract: vector first, then shelf
    vector: Mutex<EpochVector>,
    _shelf: EpochShelf,
    slot: usize,
    pid: u64,
    epoch_lock: RawRwLock,
    active_epochs: Mutex<u64>,
    last_scan: Mutex<Instant>,
    callbacks: Mutex<Vec<FailureCallback>>,
    terminate_heartbeat: AtomicBool,
    terminate_monitor: AtomicBool,
    monitor_disabled: AtomicBool,
    heartbeat_interval: Duration,
    monitor_interval: Duration,
    timeout: Duration,
}

// Safety: the vector is mutex-guarded; everything else is Sync already.
unsafe impl Send for Inner {}
unsafe impl Sync for Inner {}

pub struct EpochManager {
    inner: Arc<Inner>,
    heartbeat: Mutex<Option<JoinHandle<()>>>,
    monitor: Mutex<Option<JoinHandle<()>>>,
}

impl EpochManager {
    /// Opens (creating if needed) the namespace's epoch shelf, registers
    /// this process as a participant, and starts the heartbeat and monitor
    /// threads.
    pub fn new(config: &Config) -> Result<Self> {
        Self::with_intervals(config, HEARTBEAT_INTERVAL, MONITOR_INTERVAL, TIMEOUT)
    }

    /// Like [`Self::new`] with explicit protocol intervals; tests shrink
    /// them to milliseconds.
    pub fn with_intervals(
        config: &Config,
        heartbeat_interval: Duration,
        monitor_interval: Duration,
        timeout: Duration,
    ) -> Result<Self> {
        let mut shelf = EpochShelf::new(config.epoch_shelf_path());
        if !shelf.exist() {
            match shelf.create() {
                Ok(()) | Err(MmError::ShelfFileFound(_)) => {}
                Err(err) => return Err(err),
            }
        }
        shelf.open()?;
        let addr = shelf.addr().expect("just opened");
        // Safety: the shelf stays mapped for as long as Inner (and with it
        // the vector) lives.
        let mut vector = unsafe { EpochVector::new(addr, true)? };

        // Safety: getpid never fails.
        let pid = unsafe { libc::getpid() } as u64;
        let slot = vector.register_participant(pid)?;
        info!(pid, slot, "registered epoch participant");

        let inner = Arc::new(Inner {
            vector: Mutex::new(vector),
            _shelf: shelf,
            slot,
            pid,
            epoch_lock: RawRwLock::INIT,
            active_epochs: Mutex::new(0),
            last_scan: Mutex::new(Instant::now()),
            callbacks: Mutex::new(Vec::new()),
            terminate_heartbeat: AtomicBool::new(false),
            terminate_monitor: AtomicBool::new(false),
            monitor_disabled: AtomicBool::new(false),
            heartbeat_interval,
            monitor_interval,
            timeout,
        });

        // make sure the frontier moves at least once per participant
        // lifetime, even in short-lived processes
        inner.advance_frontier();

        let heartbeat = {
            let inner = inner.clone();
            std::thread::Builder::new()
                .name("epoch-heartbeat".into())
                .spawn(move || heartbeat_loop(inner))
                .map_err(MmError::Io)?
        };
        let monitor = {
            let inner = inner.clone();
            std::thread::Builder::new()
                .name("epoch-monitor".into())
                .spawn(move || monitor_loop(inner))
                .map_err(MmError::Io)?
        };

        Ok(Self {
            inner,
            heartbeat: Mutex::new(Some(heartbeat)),
            monitor: Mutex::new(Some(monitor)),
        })
    }

    /// Enters a critical section: while any are open, the heartbeat cannot
    /// move our reported epoch, so the frontier cannot pass us by.
    pub fn enter_critical(&self) {
        self.inner.epoch_lock.lock_shared();
        let mut active = self.inner.active_epochs.lock();
        *active += 1;
        if *active == 1 {
            self.inner.report_frontier();
        }
    }

    pub fn exit_critical(&self) {
        {
            let mut active = self.inner.active_epochs.lock();
            debug_assert!(*active > 0);
            *active -= 1;
        }
        // Safety: paired with the lock_shared in enter_critical.
        unsafe { self.inner.epoch_lock.unlock_shared() };
    }

    /// RAII form of enter/exit_critical.
    pub fn critical(&self) -> EpochGuard<'_> {
        self.enter_critical();
        EpochGuard { manager: self }
    }

    pub fn exists_active_critical(&self) -> bool {
        *self.inner.active_epochs.lock() > 0
    }

    pub fn reported_epoch(&self) -> u64 {
        self.inner.vector.lock().reported(self.inner.slot)
    }

    pub fn frontier_epoch(&self) -> u64 {
        self.inner.vector.lock().frontier()
    }

    /// One monitor pass, callable directly; true iff the frontier advanced.
    pub fn advance_frontier(&self) -> bool {
        self.inner.advance_frontier()
    }

    /// Registers a callback invoked with the participant id of every peer
    /// the monitor terminates.
    pub fn register_failure_callback(&self, callback: FailureCallback) {
        self.inner.callbacks.lock().push(callback);
    }

    /// Stops the monitor thread's scanning without stopping heartbeats.
    pub fn disable_monitor(&self) {
        self.inner.monitor_disabled.store(true, Ordering::SeqCst);
    }

    /// Stops both threads and unregisters this participant. Idempotent,
    /// callable from any context holding the manager, and invoked by drop.
    pub fn stop(&self) {
        self.inner.terminate_heartbeat.store(true, Ordering::SeqCst);
        self.inner.terminate_monitor.store(true, Ordering::SeqCst);
        if let Some(handle) = self.heartbeat.lock().take() {
            let _ = handle.join();
        }
        if let Some(handle) = self.monitor.lock().take() {
            let _ = handle.join();
        }
        if Arc::strong_count(&self.inner) == 1 {
            self.inner
                .vector
                .lock()
                .unregister_participant(self.inner.slot);
            info!(pid = self.inner.pid, "epoch participant unregistered");
        }
    }
}

impl Drop for EpochManager {
    fn drop(&mut self) {
        self.stop();
    }
}

pub struct EpochGuard<'a> {
    manager: &'a EpochManager,
}

impl Drop for EpochGuard<'_> {
    fn drop(&mut self) {
        self.manager.exit_critical();
    }
}

impl Inner {
    fn report_frontier(&self) {
        let vector = self.vector.lock();
        let frontier = vector.frontier();
        vector.set_reported(self.slot, frontier);
    }

    /// The monitor body: scan every slot, advance the frontier when all
    /// active participants report it, and evict participants stale past the
    /// timeout.
    fn advance_frontier(&self) -> bool {
        // briefly exclusive: no local critical section may straddle the
        // cache invalidation point
        self.epoch_lock.lock_exclusive();
        self.vector.lock().invalidate_cache();
        // Safety: paired with lock_exclusive above.
        unsafe { self.epoch_lock.unlock_exclusive() };

        let now = Instant::now();
        {
            let mut last_scan = self.last_scan.lock();
            // if we ourselves stalled, our staleness observations are junk;
            // refresh them instead of accusing everyone else
            if now.duration_since(*last_scan) > self.timeout {
                self.vector.lock().refresh_modified_time();
            }
            *last_scan = now;
        }

        let mut all_in_frontier = true;
        let mut likely_dead: Vec<(usize, u64)> = Vec::new();
        let frontier;
        {
            let mut vector = self.vector.lock();
            frontier = vector.frontier();
            for slot in 0..vector.n_slots() {
                let obs = vector.observe(slot);
                if obs.participant_id == 0 {
                    continue;
                }
                if obs.reported >= EPOCH_MIN_ACTIVE && obs.reported != frontier {
                    all_in_frontier = false;
                }
                if obs.reported != EPOCH_NO_PARTICIPANT
                    && obs.reported != frontier
                    && now.duration_since(obs.last_change) > self.timeout
                {
                    likely_dead.push((slot, obs.participant_id));
                }
            }
        }

        let mut advanced = false;
        if all_in_frontier {
            let prev = self.vector.lock().cas_frontier(frontier, frontier + 1);
            advanced = prev == frontier;
            if advanced {
                debug!(frontier = frontier + 1, "advanced epoch frontier");
            }
        }

        for (slot, participant) in likely_dead {
            if participant == self.pid {
                // our own heartbeat has stalled; evicting ourselves would
                // tear down the process monitoring the others
                warn!("own reported epoch is stale; heartbeat starved?");
                continue;
            }
            error!(participant, slot, "terminating stale epoch participant");
            // Safety: SIGKILL to an already-dead pid fails harmlessly.
            unsafe { libc::kill(participant as libc::pid_t, libc::SIGKILL) };
            for callback in self.callbacks.lock().iter() {
                callback(participant);
            }
            self.vector.lock().unregister_participant(slot);
        }

        advanced
    }
}

fn heartbeat_loop(inner: Arc<Inner>) {
    while !inner.terminate_heartbeat.load(Ordering::SeqCst) {
        std::thread::sleep(inner.heartbeat_interval);
        // exclusive: drains every shared-mode critical section, so the
        // report below cannot hide an in-flight observer of an old epoch
        inner.epoch_lock.lock_exclusive();
        {
            let active = inner.active_epochs.lock();
            debug_assert_eq!(*active, 0);
            inner.report_frontier();
        }
        // Safety: paired with lock_exclusive above.
        unsafe { inner.epoch_lock.unlock_exclusive() };
    }
}

fn monitor_loop(inner: Arc<Inner>) {
    while !inner.terminate_monitor.load(Ordering::SeqCst) {
        std::thread::sleep(inner.monitor_interval);
        if inner.monitor_disabled.load(Ordering::SeqCst) {
            continue;
        }
        inner.advance_frontier();
        if tracing::enabled!(tracing::Level::TRACE) {
            trace!(state = %inner.vector.lock().dump(), "epoch scan");
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::AtomicUsize;

    fn test_config() -> (tempfile::TempDir, Config) {
        let dir = tempfile::tempdir().unwrap();
        let config = Config::new(dir.path(), "test");
        (dir, config)
    }

    fn fast_manager(config: &Config) -> EpochManager {
        EpochManager::with_intervals(
            config,
            Duration::from_millis(5),
            Duration::from_millis(5),
            Duration::from_millis(500),
        )
        .unwrap()
    }

    #[test]
    fn test_frontier_advances_while_idle() {
        let (_dir, config) = test_config();
        let mut manager = fast_manager(&config);
        let start = manager.frontier_epoch();
        std::thread::sleep(Duration::from_millis(200));
        assert!(
            manager.frontier_epoch() > start,
            "frontier must advance while all participants heartbeat"
        );
        manager.stop();
    }

    #[test]
    fn test_critical_sections_nest() {
        let (_dir, config) = test_config();
        let mut manager = fast_manager(&config);
        manager.enter_critical();
        manager.enter_critical();
        assert!(manager.exists_active_critical());
        manager.exit_critical();
        assert!(manager.exists_active_critical());
        manager.exit_critical();
        assert!(!manager.exists_active_critical());

        {
            let _guard = manager.critical();
            assert!(manager.exists_active_critical());
        }
        assert!(!manager.exists_active_critical());
        manager.stop();
    }

    #[test]
    fn test_live_participant_not_terminated() {
        let (_dir, config) = test_config();
        let mut manager = fast_manager(&config);
        let hits = Arc::new(AtomicUsize::new(0));
        let hits2 = hits.clone();
        manager.register_failure_callback(Box::new(move |_| {
            hits2.fetch_add(1, Ordering::SeqCst);
        }));
        // heartbeat well inside the timeout: nobody must be evicted
        std::thread::sleep(Duration::from_millis(300));
        assert_eq!(hits.load(Ordering::SeqCst), 0);
        manager.stop();
    }

    #[test]
    fn test_stale_participant_evicted_with_callback() {
        let (_dir, config) = test_config();
        let mut manager = EpochManager::with_intervals(
            &config,
            Duration::from_millis(5),
            Duration::from_millis(5),
            Duration::from_millis(50),
        )
        .unwrap();

        // a ghost participant that never reports: a child we already reaped,
        // so the monitor's SIGKILL is a harmless ESRCH
        let mut child = std::process::Command::new("true").spawn().unwrap();
        let ghost_pid = child.id() as u64;
        child.wait().unwrap();

        let evicted = Arc::new(AtomicUsize::new(0));
        let evicted2 = evicted.clone();
        manager.register_failure_callback(Box::new(move |pid| {
            assert_eq!(pid, ghost_pid);
            evicted2.fetch_add(1, Ordering::SeqCst);
        }));

        {
            let mut vector = manager.inner.vector.lock();
            let slot = vector.register_participant(ghost_pid).unwrap();
            vector.set_reported(slot, EPOCH_MIN_ACTIVE);
        }

        // frontier is stuck while the ghost lags, then unsticks after the
        // monitor evicts it
        std::thread::sleep(Duration::from_millis(400));
        assert!(evicted.load(Ordering::SeqCst) >= 1);
        let f = manager.frontier_epoch();
        std::thread::sleep(Duration::from_millis(100));
        assert!(manager.frontier_epoch() > f, "frontier stuck after eviction");
        manager.stop();
    }

    #[test]
    fn test_stop_is_idempotent() {
        let (_dir, config) = test_config();
        let mut manager = fast_manager(&config);
        manager.stop();
        manager.stop();
    }

    #[test]
    fn test_disable_monitor_keeps_heartbeat() {
        let (_dir, config) = test_config();
        let mut manager = fast_manager(&config);
        manager.disable_monitor();
        let reported_before = manager.reported_epoch();
        std::thread::sleep(Duration::from_millis(100));
        // heartbeat still reports (frontier no longer advances, so reported
        // simply stays pinned at the frontier)
        assert!(manager.reported_epoch() >= reported_before);
        manager.stop();
    }
}
