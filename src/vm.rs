//! The guest machine: one isolated VM instance.

use alloc::sync::Arc;
use core::sync::atomic::{AtomicU32, AtomicU64, Ordering};

pub use memory_addr::PhysAddr as HostPhysAddr;

/// One isolated virtual machine instance.
///
/// The stage-2 address space itself is owned by the surrounding system; the
/// machine only records the translation root it was built with, plus the
/// VMID-generation bookkeeping that tags its cached translations. Creation
/// happens at VM-creation time with the VMID still invalid; the first run
/// lazily assigns one through [`crate::VmidAllocator`].
#[derive(Debug)]
pub struct AxVM {
    /// Physical address of the stage-2 translation table root, prepared by
    /// the external address-space layer.
    stage2_root: HostPhysAddr,
    /// The VMID generation this machine's tag belongs to. 0 means a VMID was
    /// never assigned.
    vmid_gen: AtomicU64,
    /// The assigned VMID. 0 is reserved for the host and never assigned.
    vmid: AtomicU32,
    /// Cached VTTBR value: stage-2 root plus the VMID in the tag field.
    vttbr: AtomicU64,
}

impl AxVM {
    /// Create a new guest machine over an already-prepared stage-2 root.
    pub fn new(stage2_root: HostPhysAddr) -> Arc<Self> {
        Arc::new(Self {
            stage2_root,
            // Mark the initial VMID generation invalid.
            vmid_gen: AtomicU64::new(0),
            vmid: AtomicU32::new(0),
            vttbr: AtomicU64::new(0),
        })
    }

    /// The stage-2 translation root this machine was created with.
    pub fn stage2_root(&self) -> HostPhysAddr {
        self.stage2_root
    }

    /// The generation of the currently assigned VMID (0 = never assigned).
    ///
    /// Acquire pairs with the allocator's publication so that a current
    /// generation guarantees `vttbr()` is the matching value.
    pub fn vmid_gen(&self) -> u64 {
        self.vmid_gen.load(Ordering::Acquire)
    }

    /// The currently assigned VMID (0 = invalid).
    pub fn vmid(&self) -> u32 {
        self.vmid.load(Ordering::Relaxed)
    }

    /// The VTTBR value to run this machine's VCPUs with.
    pub fn vttbr(&self) -> u64 {
        self.vttbr.load(Ordering::Acquire)
    }

    /// Publish a freshly assigned VMID. Only the allocator calls this, with
    /// its lock held; the ordering makes the vttbr visible before the
    /// generation that validates it.
    pub(crate) fn publish_vmid(&self, generation: u64, vmid: u32, vttbr: u64) {
        self.vmid.store(vmid, Ordering::Relaxed);
        self.vttbr.store(vttbr, Ordering::Release);
        self.vmid_gen.store(generation, Ordering::Release);
    }
}

impl Drop for AxVM {
    fn drop(&mut self) {
        debug!(
            "AxVM dropped, vmid {} (generation {})",
            self.vmid(),
            self.vmid_gen.load(Ordering::Relaxed)
        );
    }
}
