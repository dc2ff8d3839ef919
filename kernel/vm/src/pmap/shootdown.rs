//! Cross-CPU TLB shootdown.
//!
//! One request is in flight at a time. The initiator publishes the range,
//! sets the pending mask to the target CPUs, sends the IPI and spins until
//! every target has cleared its bit. A target that never answers means a
//! wedged or lost CPU: the wait is bounded and ends in a panic.

use core::hint::spin_loop;
use core::sync::atomic::{AtomicU64, Ordering};

use hadron_core::addr::VirtAddr;
use hadron_core::cpu::CpuSet;
use hadron_core::kfatal;
use hadron_core::sync::SpinLock;

use super::Mmu;
use crate::{PAGE_SIZE, lock_level};

/// Shootdown coordinator shared by every pmap.
pub struct TlbShootdown {
    slot: SpinLock<()>,
    pending: AtomicU64,
    start: AtomicU64,
    /// Pages to invalidate; 0 means the whole TLB.
    pages: AtomicU64,
    online: AtomicU64,
    timeout_spins: u64,
    flush_all_threshold: u64,
}

impl TlbShootdown {
    /// Creates a coordinator that waits `timeout_spins` iterations for
    /// acknowledgments and asks for a full flush above
    /// `flush_all_threshold` pages.
    pub fn new(timeout_spins: u64, flush_all_threshold: u64) -> Self {
        Self {
            slot: SpinLock::leveled("tlb_shootdown", lock_level::SHOOTDOWN, ()),
            pending: AtomicU64::new(0),
            start: AtomicU64::new(0),
            pages: AtomicU64::new(0),
            online: AtomicU64::new(1),
            timeout_spins,
            flush_all_threshold,
        }
    }

    /// Marks `cpu` as running and able to answer shootdowns.
    pub fn cpu_online(&self, cpu: u32) {
        self.online.fetch_or(CpuSet::single(cpu).bits(), Ordering::SeqCst);
    }

    /// Marks `cpu` as stopped.
    pub fn cpu_offline(&self, cpu: u32) {
        self.online.fetch_and(!CpuSet::single(cpu).bits(), Ordering::SeqCst);
    }

    /// Returns the CPUs that answer shootdowns.
    pub fn online(&self) -> CpuSet {
        CpuSet::from_bits(self.online.load(Ordering::SeqCst))
    }

    /// Returns the page count above which a full flush is used.
    pub fn flush_all_threshold(&self) -> u64 {
        self.flush_all_threshold
    }

    /// Invalidates `pages` pages at `start` on every CPU in `targets` other
    /// than the caller, returning once all of them acknowledged.
    ///
    /// # Panics
    ///
    /// Panics if a target fails to acknowledge within the timeout.
    pub fn shoot<M: Mmu>(&self, mmu: &M, targets: CpuSet, start: VirtAddr, pages: u64) {
        let me = mmu.current_cpu();
        let targets = CpuSet::from_bits(targets.bits() & self.online.load(Ordering::SeqCst)).without(me);
        if targets.is_empty() {
            return;
        }

        // Another initiator may be waiting on us: keep answering while the
        // slot is taken.
        let guard = loop {
            if let Some(guard) = self.slot.try_lock() {
                break guard;
            }
            self.handle_ipi(mmu);
            spin_loop();
        };

        let pages = if pages > self.flush_all_threshold { 0 } else { pages };
        self.start.store(start.as_u64(), Ordering::Relaxed);
        self.pages.store(pages, Ordering::Relaxed);
        self.pending.store(targets.bits(), Ordering::Release);
        mmu.notify_shootdown(targets);

        let mut spins = 0u64;
        loop {
            let pending = self.pending.load(Ordering::Acquire);
            if pending == 0 {
                break;
            }
            if spins >= self.timeout_spins {
                kfatal!(
                    "tlb: shootdown of {:#x} (+{} pages) unacknowledged by {:?}",
                    start.as_u64(),
                    pages,
                    CpuSet::from_bits(pending)
                );
                panic!("TLB shootdown timed out waiting for {:#x}", pending);
            }
            spins += 1;
            spin_loop();
        }
        drop(guard);
    }

    /// Answers the in-flight request if it targets the calling CPU. Called
    /// from the shootdown IPI handler and by initiators waiting for the
    /// slot.
    pub fn handle_ipi<M: Mmu>(&self, mmu: &M) {
        let bit = CpuSet::single(mmu.current_cpu()).bits();
        if self.pending.load(Ordering::Acquire) & bit == 0 {
            return;
        }
        let start = self.start.load(Ordering::Relaxed);
        let pages = self.pages.load(Ordering::Relaxed);
        if pages == 0 {
            mmu.invalidate_local_all();
        } else {
            for i in 0..pages {
                mmu.invalidate_local(VirtAddr::new_truncate(start + i * PAGE_SIZE));
            }
        }
        self.pending.fetch_and(!bit, Ordering::Release);
    }
}

impl core::fmt::Debug for TlbShootdown {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        f.debug_struct("TlbShootdown")
            .field("pending", &CpuSet::from_bits(self.pending.load(Ordering::Relaxed)))
            .field("online", &self.online())
            .finish_non_exhaustive()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::testutil::{FakePhys, SimMmu};
    use std::sync::Arc;
    use std::sync::atomic::AtomicBool;

    fn mmu() -> &'static SimMmu {
        Box::leak(Box::new(SimMmu::new(FakePhys::new().hhdm())))
    }

    #[test]
    fn no_remote_targets_returns_immediately() {
        let mmu = mmu();
        let sd = TlbShootdown::new(10, 32);
        sd.shoot(mmu, CpuSet::single(0), VirtAddr::new(0x1000), 1);
        assert_eq!(mmu.ipis_sent(), 0);
    }

    #[test]
    fn remote_cpu_acknowledges() {
        let mmu = mmu();
        let sd: &'static TlbShootdown = Box::leak(Box::new(TlbShootdown::new(u64::MAX, 32)));
        sd.cpu_online(1);
        mmu.tlb_fill(1, VirtAddr::new(0x5000), 0x9000);

        let stop = Arc::new(AtomicBool::new(false));
        let responder = {
            let stop = Arc::clone(&stop);
            std::thread::spawn(move || {
                SimMmu::set_cpu(1);
                while !stop.load(Ordering::SeqCst) {
                    mmu.poll(sd);
                    std::thread::yield_now();
                }
            })
        };

        SimMmu::set_cpu(0);
        sd.shoot(mmu, CpuSet::from_bits(0b11), VirtAddr::new(0x5000), 1);
        assert!(!mmu.tlb_contains(1, VirtAddr::new(0x5000)));
        stop.store(true, Ordering::SeqCst);
        responder.join().unwrap();
    }

    #[test]
    fn large_ranges_flush_everything() {
        let mmu = mmu();
        let sd: &'static TlbShootdown = Box::leak(Box::new(TlbShootdown::new(u64::MAX, 4)));
        sd.cpu_online(1);
        mmu.tlb_fill(1, VirtAddr::new(0x40_0000), 0x9000);

        let responder = std::thread::spawn(move || {
            SimMmu::set_cpu(1);
            while !mmu.poll(sd) {
                std::thread::yield_now();
            }
        });
        SimMmu::set_cpu(0);
        sd.shoot(mmu, CpuSet::from_bits(0b10), VirtAddr::new(0x1000), 8);
        responder.join().unwrap();
        assert!(!mmu.tlb_contains(1, VirtAddr::new(0x40_0000)));
    }

    #[test]
    #[should_panic(expected = "TLB shootdown timed out")]
    fn silent_cpu_is_fatal() {
        let mmu = mmu();
        let sd = TlbShootdown::new(1000, 32);
        sd.cpu_online(3);
        SimMmu::set_cpu(0);
        sd.shoot(mmu, CpuSet::single(3), VirtAddr::new(0x1000), 1);
    }
}
