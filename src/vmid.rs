//! Generation-counted VMID allocation.
//!
//! The hardware tags cached stage-2 translations with an 8-bit VMID, value 0
//! reserved for the host, so at most 255 machines can hold live tags at
//! once. Instead of tracking tag liveness, tags are handed out sequentially
//! and the whole space is recycled through monotonically increasing
//! generations: when the sequence wraps, every cached translation anywhere
//! is flushed and all machines' tags become stale at once, to be lazily
//! reassigned on their next run.

use core::sync::atomic::{AtomicU64, Ordering};

use spin::Mutex;

use crate::hal::AxVmHal;
use crate::vm::AxVM;

// 40-bit IPA space with T0SZ = 0; the table base must be aligned past the
// concatenated level-1 entries.
const VTTBR_X: u64 = 5;
const VTTBR_BADDR_MASK: u64 = ((1u64 << 40) - 1) & !((2u64 << VTTBR_X) - 1);
const VTTBR_VMID_SHIFT: u32 = 48;

/// Hands out VMIDs and rolls the generation when the tag space is exhausted.
///
/// The generation counter is read lock-free on the hot path; assignment and
/// rollover are serialized by a single lock. Because generations only grow
/// and are published after the matching flush, a stale-generation check can
/// never falsely report "current" - a falsely reported "stale" is re-checked
/// under the lock and is harmless.
#[derive(Debug)]
pub struct VmidAllocator {
    /// Monotonic generation counter, starting at 1 so that a machine's
    /// initial generation of 0 always reads as stale.
    generation: AtomicU64,
    /// Next VMID to hand out. Wrapping to 0 (the reserved value) marks the
    /// space exhausted and forces a rollover on the next request.
    next: Mutex<u8>,
}

impl VmidAllocator {
    /// A fresh allocator in generation 1 with the whole tag space free.
    pub const fn new() -> Self {
        Self {
            generation: AtomicU64::new(1),
            next: Mutex::new(1),
        }
    }

    /// The current generation.
    pub fn generation(&self) -> u64 {
        self.generation.load(Ordering::Acquire)
    }

    /// Whether `vm`'s assigned VMID belongs to a previous generation and may
    /// now alias another machine's translations.
    ///
    /// Lock-free; safe to check speculatively.
    pub fn needs_new_generation(&self, vm: &AxVM) -> bool {
        vm.vmid_gen() != self.generation()
    }

    /// Guarantee that `vm` holds a VMID valid for the current generation,
    /// assigning a fresh one (and rolling the generation if the tag space is
    /// exhausted) as needed.
    ///
    /// On rollover, [`AxVmHal::flush_vm_context_all`] has completed on every
    /// CPU before any tag from the new generation is handed out; combined
    /// with the run loop's IRQs-off re-check of the generation, no VCPU can
    /// enter a guest with a stale tag.
    pub fn ensure_valid<H: AxVmHal>(&self, vm: &AxVM) {
        if !self.needs_new_generation(vm) {
            return;
        }

        let mut next = self.next.lock();

        // Another VCPU of the same machine may have won the race while we
        // waited for the lock.
        if !self.needs_new_generation(vm) {
            return;
        }

        // First user of a new VMID generation?
        if *next == 0 {
            self.generation.fetch_add(1, Ordering::SeqCst);
            *next = 1;

            // No other CPU can re-enter a guest while we hold the lock, so
            // flushing here guarantees every CPU has dropped its cached
            // state before any new-generation tag exists.
            H::flush_vm_context_all();
        }

        let generation = self.generation.load(Ordering::SeqCst);
        let vmid = *next as u32;
        *next = next.wrapping_add(1);

        let vttbr = (vm.stage2_root().as_usize() as u64 & VTTBR_BADDR_MASK)
            | ((vmid as u64) << VTTBR_VMID_SHIFT);
        vm.publish_vmid(generation, vmid, vttbr);
    }
}

impl Default for VmidAllocator {
    fn default() -> Self {
        Self::new()
    }
}
