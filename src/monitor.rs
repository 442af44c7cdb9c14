//! Memory pressure monitoring for the refresh scheduler.
//!
//! `MemoryMonitor` is an enum over threshold strategies so the check stays
//! portable: true process introspection where available, a resident-record
//! count proxy where it is not, and a settable reading for tests.

use std::sync::{
    Arc, Mutex,
    atomic::{AtomicU64, Ordering},
};

use sysinfo::{Pid, System};

use crate::cache::CacheStore;

/// All available threshold strategies.
#[derive(Debug)]
pub enum MemoryMonitor {
    /// Resident set size of this process, via sysinfo.
    Process(ProcessMonitor),
    /// Count of materialized full records as a memory proxy — useful where
    /// process introspection is unavailable or too coarse.
    ResidentProxy(ResidentProxyMonitor),
    /// Fixed shared reading, set explicitly. Tests and manual overrides.
    Static(StaticMonitor),
}

impl MemoryMonitor {
    pub fn process(ceiling_mb: u64) -> Self {
        MemoryMonitor::Process(ProcessMonitor::new(ceiling_mb))
    }

    pub fn resident_proxy(cache: Arc<CacheStore>, max_resident_full: usize) -> Self {
        MemoryMonitor::ResidentProxy(ResidentProxyMonitor { cache, max_resident_full })
    }

    pub fn fixed(ceiling_mb: u64) -> (Self, Arc<AtomicU64>) {
        let reading = Arc::new(AtomicU64::new(0));
        let monitor = MemoryMonitor::Static(StaticMonitor {
            reading_bytes: Arc::clone(&reading),
            ceiling_bytes: ceiling_mb * 1024 * 1024,
        });
        (monitor, reading)
    }

    /// True when resident usage exceeds the configured ceiling. Polled by
    /// the scheduler before each key.
    pub fn over_ceiling(&self) -> bool {
        match self {
            MemoryMonitor::Process(m) => m.over_ceiling(),
            MemoryMonitor::ResidentProxy(m) => {
                m.cache.resident_full_count() >= m.max_resident_full
            }
            MemoryMonitor::Static(m) => {
                m.reading_bytes.load(Ordering::SeqCst) > m.ceiling_bytes
            }
        }
    }

    /// Current reading for log lines, in megabytes where meaningful.
    pub fn reading_mb(&self) -> u64 {
        match self {
            MemoryMonitor::Process(m) => m.resident_bytes() / (1024 * 1024),
            MemoryMonitor::ResidentProxy(m) => m.cache.resident_full_count() as u64,
            MemoryMonitor::Static(m) => m.reading_bytes.load(Ordering::SeqCst) / (1024 * 1024),
        }
    }
}

/// RSS-based monitor. Refreshing mutates the sysinfo handle, so it sits
/// behind a mutex; readings are taken between keys, never on a hot path.
#[derive(Debug)]
pub struct ProcessMonitor {
    system: Mutex<System>,
    pid: Option<Pid>,
    ceiling_bytes: u64,
}

impl ProcessMonitor {
    pub fn new(ceiling_mb: u64) -> Self {
        Self {
            system: Mutex::new(System::new()),
            pid: sysinfo::get_current_pid().ok(),
            ceiling_bytes: ceiling_mb * 1024 * 1024,
        }
    }

    fn resident_bytes(&self) -> u64 {
        let Some(pid) = self.pid else { return 0 };
        let mut sys = self.system.lock().expect("sysinfo lock poisoned");
        sys.refresh_process(pid);
        sys.process(pid).map(|p| p.memory()).unwrap_or(0)
    }

    fn over_ceiling(&self) -> bool {
        self.resident_bytes() > self.ceiling_bytes
    }
}

#[derive(Debug)]
pub struct ResidentProxyMonitor {
    cache: Arc<CacheStore>,
    max_resident_full: usize,
}

#[derive(Debug)]
pub struct StaticMonitor {
    reading_bytes: Arc<AtomicU64>,
    ceiling_bytes: u64,
}
