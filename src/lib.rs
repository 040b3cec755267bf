#![doc = include_str!("../README.md")]
#![no_std]

#[cfg(test)]
#[macro_use]
extern crate std;

pub mod constant;
pub mod csrs;
pub mod emulate;
pub mod error;
pub mod hw;
pub mod init;
pub mod log;
pub mod memmap;
pub mod state;
pub mod trap;

pub use error::{HextError, Result};
pub use init::{init_cold, init_warm, InitOutcome, Platform, RootDomain};
pub use log::set_console;
pub use trap::{Outcome, TrapInfo, TrapRegs};

use hw::{MachineHw, MachinePhys};

/// Has the emulation been enabled on this platform?
#[must_use]
pub fn hext_enabled() -> bool {
    state::enabled()
}

/// Entry point for illegal-instruction traps on a CSR read in the
/// hypervisor or virtual-supervisor ranges (or `satp` under TVM).
///
/// # Errors
///
/// `NotSupported` when the emulation is disabled or the CSR is not one it
/// claims; the firmware redirects the original trap.
pub fn hext_csr_read(hart_index: usize, csr_num: u16, regs: &TrapRegs) -> Result<usize> {
    if !state::enabled() {
        return Err(HextError::NotSupported);
    }

    let hext = state::hart_state(hart_index).lock();
    emulate::csr::csr_read(csr_num, regs, &hext)
}

/// Entry point for illegal-instruction traps on a CSR write. See
/// [`hext_csr_read`].
///
/// # Errors
///
/// `NotSupported` when the emulation is disabled or the CSR is not one it
/// claims.
pub fn hext_csr_write(
    hart_index: usize,
    csr_num: u16,
    regs: &mut TrapRegs,
    value: usize,
) -> Result<()> {
    if !state::enabled() {
        return Err(HextError::NotSupported);
    }

    let mut hext = state::hart_state(hart_index).lock();
    emulate::csr::csr_write(csr_num, regs, &mut hext, value, &mut MachineHw)
}

/// Entry point for illegal-instruction traps whose encoding matches a
/// hypervisor or trapped supervisor instruction.
///
/// # Errors
///
/// `NotSupported` or `Denied`; the firmware redirects the original trap.
pub fn hext_insn(hart_index: usize, insn: usize, regs: &mut TrapRegs) -> Result<Outcome> {
    if !state::enabled() {
        return Err(HextError::NotSupported);
    }

    let mut hext = state::hart_state(hart_index).lock();
    emulate::insn::hext_insn(insn, regs, &mut hext, &MachinePhys, &mut MachineHw)
}

/// Entry point for the three page-fault causes while the emulation is
/// active.
///
/// # Errors
///
/// `NotSupported` when the emulation is disabled.
pub fn hext_page_fault(
    hart_index: usize,
    tval: usize,
    cause: usize,
    regs: &mut TrapRegs,
) -> Result<Outcome> {
    if !state::enabled() {
        return Err(HextError::NotSupported);
    }

    let mut hext = state::hart_state(hart_index).lock();
    emulate::page_fault::page_fault_handler(tval, cause, regs, &mut hext, &MachinePhys)
}

/// World switch on behalf of the firmware (e.g. when redirecting a trap
/// out of the guest into the host supervisor).
pub fn hext_switch_virt(hart_index: usize, regs: &mut TrapRegs, virt: bool) {
    let mut hext = state::hart_state(hart_index).lock();
    emulate::switch::switch_virt(regs, &mut hext, &mut MachineHw, virt);
}
