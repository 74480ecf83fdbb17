//! Exit reasons surfaced to the external caller.
//!
//! [`AxVmRunState`] plays the role of the state-exchange record between the
//! run loop and whoever services emulation requests: the run loop fills it in
//! when a guest slice stops, and the caller completes the request (for MMIO
//! reads, by storing the read data back into the record) before calling run
//! again.

memory_addr::def_usize_addr! {
    /// A guest physical address.
    pub type GuestPhysAddr;
}

memory_addr::def_usize_addr_formatter! {
    GuestPhysAddr = "GPA:{}";
}

/// The width of an emulated memory access.
#[repr(u8)]
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AccessWidth {
    /// 8-bit access.
    Byte = 1,
    /// 16-bit access.
    Halfword = 2,
    /// 32-bit access.
    Word = 4,
    /// 64-bit access.
    Doubleword = 8,
}

impl AccessWidth {
    /// The access size in bytes.
    pub const fn size(self) -> usize {
        self as usize
    }

    /// Mask covering the accessed bytes.
    pub const fn mask(self) -> u64 {
        match self {
            Self::Doubleword => u64::MAX,
            _ => (1 << (self as u32 * 8)) - 1,
        }
    }
}

/// Why a `run_vcpu` call returned to the external caller.
///
/// Guest-recoverable traps never show up here; they are handled by dispatch
/// and the loop continues. Only conditions the caller must act on stop the
/// loop.
#[non_exhaustive]
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AxVmExitReason {
    /// The loop has not stopped yet, or the previous reason was consumed.
    Unknown,
    /// A host signal is pending; retry the run call once it is serviced.
    Interrupted,
    /// The guest read from an emulated device. The caller performs the read,
    /// stores the result in `data`, and calls run again to complete it.
    MmioRead {
        /// Guest physical address of the access.
        addr: GuestPhysAddr,
        /// Access width.
        width: AccessWidth,
        /// Destination general-purpose register index.
        reg: usize,
        /// Filled in by the caller before the next run call.
        data: u64,
    },
    /// The guest wrote to an emulated device. The caller performs the write;
    /// nothing needs to be completed on re-entry.
    MmioWrite {
        /// Guest physical address of the access.
        addr: GuestPhysAddr,
        /// Access width.
        width: AccessWidth,
        /// The value the guest wrote.
        data: u64,
    },
    /// The entry primitive reported an exit this build does not understand.
    InternalError {
        /// The raw exception code.
        code: u32,
    },
}

/// Per-VCPU state exchanged between the run loop and the external caller.
#[derive(Debug)]
pub struct AxVmRunState {
    /// Why the last run call stopped.
    pub exit: AxVmExitReason,
}

impl AxVmRunState {
    /// A fresh run state with no exit recorded.
    pub const fn new() -> Self {
        Self {
            exit: AxVmExitReason::Unknown,
        }
    }
}

impl Default for AxVmRunState {
    fn default() -> Self {
        Self::new()
    }
}
