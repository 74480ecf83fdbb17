//! Condition-code re-evaluation for trapped guest instructions.
//!
//! A conditional instruction is allowed to trap even though its condition
//! check failed and it would never have executed (ARM ARM B1.14.1, "Hyp traps
//! on instructions that fail their condition code check"). Before dispatching
//! such a trap we re-run the condition check in software; if it fails, the
//! instruction is skipped instead of emulated. Getting this wrong causes
//! either double-execution or missed emulation of real guest instructions.

use crate::trap::{psr, Hsr};
use crate::vcpu::GuestContext;

/// Evaluate a 4-bit ARM condition field against the CPSR flags.
///
/// Condition 0xE is "always"; 0xF selects the unconditional instruction space
/// and never fails the check either.
fn condition_passed(cond: u32, cpsr: u32) -> bool {
    let n = cpsr & psr::N != 0;
    let z = cpsr & psr::Z != 0;
    let c = cpsr & psr::C != 0;
    let v = cpsr & psr::V != 0;

    match cond & 0xf {
        0x0 => z,            // EQ
        0x1 => !z,           // NE
        0x2 => c,            // CS
        0x3 => !c,           // CC
        0x4 => n,            // MI
        0x5 => !n,           // PL
        0x6 => v,            // VS
        0x7 => !v,           // VC
        0x8 => c && !z,      // HI
        0x9 => !c || z,      // LS
        0xa => n == v,       // GE
        0xb => n != v,       // LT
        0xc => !z && n == v, // GT
        0xd => z || n != v,  // LE
        _ => true,           // AL / unconditional space
    }
}

/// Decide whether the trapped instruction would actually have executed.
///
/// The trap record may carry an explicit condition field (HSR.CV). When it
/// does not, the instruction may still be conditional through the Thumb IT
/// block state in the CPSR, so both decoding paths are kept distinct.
pub fn guest_condition_valid(hsr: Hsr, cpsr: u32) -> bool {
    // Exception class 0 cannot reach the dispatch table, so a zero syndrome
    // here means the trap record was never filled in.
    debug_assert!(hsr.ec() != 0);

    // Classes with the top two EC bits set trap unconditionally.
    if hsr.is_unconditional() {
        return true;
    }

    let cond = if hsr.cond_valid() {
        hsr.cond()
    } else {
        // Thumb mode: the condition comes from the IT state instead.
        let it = ((cpsr >> 8) & 0xfc) | ((cpsr >> 25) & 0x3);

        // An empty IT state means the instruction was unconditional.
        if it == 0 {
            return true;
        }

        // The condition for the current instruction is the top 4 bits.
        it >> 4
    };

    condition_passed(cond, cpsr)
}

/// Perform ITAdvance (ARM DDI 0406C, page A-52) on the CPSR IT bits.
///
/// Skipping an instruction inside a Thumb IT block must still consume one
/// slot of the block, or the conditions applied to the following
/// instructions shift out of step with the guest's program.
fn advance_itstate(cpsr: u32) -> u32 {
    debug_assert!(cpsr & psr::T != 0 || cpsr & psr::IT_MASK == 0);

    if cpsr & psr::IT_MASK == 0 {
        return cpsr;
    }

    let mut cond = (cpsr & 0xe000) >> 13;
    let mut itbits = (cpsr & 0x1c00) >> (10 - 2);
    itbits |= (cpsr >> 25) & 0x3;

    if itbits & 0x7 == 0 {
        cond = 0;
        itbits = 0;
    } else {
        itbits = (itbits << 1) & 0x1f;
    }

    let mut cpsr = cpsr & !psr::IT_MASK;
    cpsr |= cond << 13;
    cpsr |= (itbits & 0x1c) << (10 - 2);
    cpsr |= (itbits & 0x3) << 25;
    cpsr
}

/// Advance the guest PC past the trapped instruction.
///
/// `is_wide` comes from HSR.IL and distinguishes 16-bit from 32-bit Thumb
/// encodings; ARM-state instructions are always 4 bytes.
pub fn skip_guest_instr(ctx: &mut GuestContext, is_wide: bool) {
    let is_thumb = ctx.cpsr & psr::T != 0;
    if is_thumb && !is_wide {
        ctx.pc = ctx.pc.wrapping_add(2);
    } else {
        ctx.pc = ctx.pc.wrapping_add(4);
    }
    ctx.cpsr = advance_itstate(ctx.cpsr);
}
