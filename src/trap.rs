//! Trap decoding: raw exception indices and the HSR syndrome register.
//!
//! The physical-entry primitive returns a raw exception index telling why
//! control came back to the host. For guest traps, the Hyp Syndrome Register
//! (HSR) carries the exception class and instruction-specific syndrome that
//! the dispatch logic decodes.

/// Saved program status register bits (32-bit ARM).
pub mod psr {
    /// Negative condition flag.
    pub const N: u32 = 1 << 31;
    /// Zero condition flag.
    pub const Z: u32 = 1 << 30;
    /// Carry condition flag.
    pub const C: u32 = 1 << 29;
    /// Overflow condition flag.
    pub const V: u32 = 1 << 28;
    /// Thumb execution state.
    pub const T: u32 = 1 << 5;
    /// Asynchronous abort mask.
    pub const A: u32 = 1 << 8;
    /// IRQ mask.
    pub const I: u32 = 1 << 7;
    /// FIQ mask.
    pub const F: u32 = 1 << 6;
    /// IT (if-then) state bits, split across CPSR[15:10] and CPSR[26:25].
    pub const IT_MASK: u32 = 0x0600_fc00;
    /// Supervisor mode.
    pub const SVC_MODE: u32 = 0x13;
}

/// Raw reason codes returned by the guest-entry primitive.
///
/// These mirror the hardware exception vector taken while the guest (or the
/// hypervisor's own privileged code) was executing.
#[repr(u32)]
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ExceptionIndex {
    /// Reset vector. Never expected from a world switch.
    Reset = 0,
    /// Undefined instruction taken in hyp mode. Unrecoverable.
    Undefined = 1,
    /// Supervisor call taken in hyp mode.
    SoftwareInterrupt = 2,
    /// Prefetch abort. The HSR tells whether it came from the guest.
    PrefetchAbort = 3,
    /// Data abort. The HSR tells whether it came from the guest.
    DataAbort = 4,
    /// A host interrupt arrived while the guest was running.
    Irq = 5,
    /// A host FIQ arrived while the guest was running.
    Fiq = 6,
    /// The guest trapped into hyp mode (HVC or a configured trap).
    HvcTrap = 7,
}

impl TryFrom<u32> for ExceptionIndex {
    type Error = u32;

    fn try_from(raw: u32) -> Result<Self, u32> {
        Ok(match raw {
            0 => Self::Reset,
            1 => Self::Undefined,
            2 => Self::SoftwareInterrupt,
            3 => Self::PrefetchAbort,
            4 => Self::DataAbort,
            5 => Self::Irq,
            6 => Self::Fiq,
            7 => Self::HvcTrap,
            other => return Err(other),
        })
    }
}

/// Exception classes found in HSR[31:26] for guest-caused traps.
///
/// Every class that a correctly configured world switch can produce must have
/// a dispatch arm; an unknown class at runtime means the architecture support
/// is incomplete and is treated as fatal rather than silently ignored.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ExceptionClass {
    /// WFI/WFE instruction.
    Wfi,
    /// 32-bit CP15 register access (MCR/MRC).
    Cp15_32,
    /// 64-bit CP15 register access (MCRR/MRRC).
    Cp15_64,
    /// 32-bit CP14 register access.
    Cp14Mr,
    /// CP14 load/store (LDC/STC).
    Cp14Ls,
    /// 64-bit CP14 register access.
    Cp14_64,
    /// CP0..CP13 access trapped by HCR.TCPx.
    Cp0_13,
    /// CP10 identification register access (VFPID).
    Cp10Id,
    /// SVC taken from hyp mode. Must never happen.
    SvcHyp,
    /// HVC instruction executed by the guest.
    Hvc,
    /// SMC instruction executed by the guest.
    Smc,
    /// Instruction abort from the guest (stage-2 fault).
    Iabt,
    /// Instruction abort from hyp mode itself.
    IabtHyp,
    /// Data abort from the guest (stage-2 fault).
    Dabt,
    /// Data abort from hyp mode itself.
    DabtHyp,
}

impl ExceptionClass {
    /// Decode an HSR exception-class field. `None` means the class has no
    /// assigned handler; the caller treats that as a fatal internal error.
    pub fn from_hsr_ec(ec: u32) -> Option<Self> {
        Some(match ec {
            0x01 => Self::Wfi,
            0x03 => Self::Cp15_32,
            0x04 => Self::Cp15_64,
            0x05 => Self::Cp14Mr,
            0x06 => Self::Cp14Ls,
            0x07 => Self::Cp0_13,
            0x08 => Self::Cp10Id,
            0x0c => Self::Cp14_64,
            0x11 => Self::SvcHyp,
            0x12 => Self::Hvc,
            0x13 => Self::Smc,
            0x20 => Self::Iabt,
            0x21 => Self::IabtHyp,
            0x24 => Self::Dabt,
            0x25 => Self::DabtHyp,
            _ => return None,
        })
    }
}

/// The Hyp Syndrome Register, recorded by the world switch on every trap.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct Hsr(pub u32);

impl Hsr {
    const EC_SHIFT: u32 = 26;
    const IL: u32 = 1 << 25;
    const CV: u32 = 1 << 24;
    const COND_SHIFT: u32 = 20;
    const COND_MASK: u32 = 0xf << Self::COND_SHIFT;
    const ISS_MASK: u32 = (1 << 25) - 1;

    /// The exception class field, HSR[31:26].
    pub fn ec(self) -> u32 {
        self.0 >> Self::EC_SHIFT
    }

    /// Whether the trapped instruction used a 32-bit encoding.
    pub fn is_wide(self) -> bool {
        self.0 & Self::IL != 0
    }

    /// Whether the condition field of this syndrome is valid.
    pub fn cond_valid(self) -> bool {
        self.0 & Self::CV != 0
    }

    /// The 4-bit condition field of the trapped instruction.
    pub fn cond(self) -> u32 {
        (self.0 & Self::COND_MASK) >> Self::COND_SHIFT
    }

    /// The instruction-specific syndrome, HSR[24:0].
    pub fn iss(self) -> u32 {
        self.0 & Self::ISS_MASK
    }

    /// Classes with the top two EC bits set trap unconditionally; only
    /// classes below 0x10 can belong to a conditional instruction.
    pub fn is_unconditional(self) -> bool {
        self.0 >> 30 != 0
    }
}

/// Build an HSR value from parts. Mostly useful for tests and for hosts that
/// synthesize syndromes.
pub fn hsr_from_parts(ec: u32, is_wide: bool, cond: Option<u32>, iss: u32) -> Hsr {
    let mut raw = (ec << Hsr::EC_SHIFT) | (iss & Hsr::ISS_MASK);
    if is_wide {
        raw |= Hsr::IL;
    }
    if let Some(cond) = cond {
        raw |= Hsr::CV | ((cond & 0xf) << Hsr::COND_SHIFT);
    }
    Hsr(raw)
}
