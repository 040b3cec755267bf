//! Trapped hypervisor and supervisor instructions.
//!
//! Hypervisor-level encodings (HFENCE.*, HLVX.HU) never decode on hardware
//! without the extension, so they are matched by mask the way the opcode
//! tables define them. Supervisor-level instructions that trap because of
//! the `mstatus.{TSR,TVM,TW}` bits are real instructions and go through the
//! decoder.

use raki::{Decode, Isa::Rv64, OpcodeKind, PrivOpcode};

use crate::constant::PRV_S;
use crate::csrs::{hstatus, mstatus, pte, satp};
use crate::emulate::switch::{switch_virt, SwitchHw};
use crate::error::{HextError, Result};
use crate::memmap::ptw::{check_access, translate, PhysAccess, PtwCsr};
use crate::memmap::GuestVirtualAddress;
use crate::state::HextState;
use crate::trap::{cause, convert_access_type, Outcome, TrapInfo, TrapRegs};

const INSN_MASK_HFENCE: usize = 0xfe00_707f;
const INSN_MATCH_HFENCE_VVMA: usize = 0x2200_0073;
const INSN_MATCH_HFENCE_GVMA: usize = 0x6200_0073;

const INSN_MASK_HLVX_HU: usize = 0xfff0_707f;
const INSN_MATCH_HLVX_HU: usize = 0x6430_4073;

const INSN_MASK_SINVAL_VMA: usize = 0xfe00_707f;
const INSN_MATCH_SINVAL_VMA: usize = 0x1600_0073;

/// rs1 field of an R-type instruction.
fn insn_rs1(insn: usize) -> usize {
    (insn >> 15) & 0x1f
}

/// rd field of an R-type instruction.
fn insn_rd(insn: usize) -> usize {
    (insn >> 7) & 0x1f
}

/// Emulate a trapped hypervisor or supervisor instruction.
///
/// # Errors
///
/// `NotSupported` when the instruction is not one the emulation claims
/// (the firmware then redirects the illegal-instruction trap), `Denied`
/// when a hypervisor instruction comes from U-mode without permission.
///
/// # Panics
///
/// Panics on a trapped SRET that no prior `hstatus.SPV` write armed;
/// `mstatus.TSR` is only ever set by this core.
pub fn hext_insn<M: PhysAccess, H: SwitchHw>(
    insn: usize,
    regs: &mut TrapRegs,
    hext: &mut HextState,
    mem: &M,
    hw: &mut H,
) -> Result<Outcome> {
    let mpp = regs.mpp();
    let csr = PtwCsr {
        vsatp: hext.vsatp,
        hgatp: hext.hgatp,
    };

    // Bits 31:28 distinguish the hypervisor-level encodings (0b01xx) from
    // supervisor-level ones (0b0001) within the SYSTEM opcode space.
    let prv = (insn >> 28) & 0x3;
    let funct3 = (insn >> 12) & 0x7;

    if prv == 0x2 {
        // Hypervisor-level instruction.
        if hext.virt {
            // H-instructions do not exist in VS-mode.
            return Err(HextError::NotSupported);
        }

        match funct3 {
            0b000 => {
                if mpp < PRV_S {
                    return Err(HextError::Denied);
                }

                if insn & INSN_MASK_HFENCE == INSN_MATCH_HFENCE_GVMA
                    || insn & INSN_MASK_HFENCE == INSN_MATCH_HFENCE_VVMA
                {
                    // Conservatively flush everything.
                    hext.pt_area.flush();
                    regs.mepc += 4;
                    Ok(Outcome::Handled)
                } else {
                    Err(HextError::NotSupported)
                }
            }

            0b100 => {
                if mpp < PRV_S && hext.hstatus & hstatus::HU == 0 {
                    return Err(HextError::Denied);
                }

                hyp_mem(insn, &csr, regs, hext, mem)
            }

            _ => Err(HextError::NotSupported),
        }
    } else if prv == PRV_S {
        // Supervisor-level instruction, trapped because of mstatus.T*.

        if insn & INSN_MASK_SINVAL_VMA == INSN_MATCH_SINVAL_VMA {
            return guest_vma_fence(regs, hext);
        }

        let decoded = (insn as u32)
            .decode(Rv64)
            .map_err(|_| HextError::NotSupported)?;

        match decoded.opc {
            OpcodeKind::Priv(PrivOpcode::WFI) => Ok(Outcome::Redirect(TrapInfo {
                cause: cause::VIRTUAL_INSTRUCTION,
                epc: regs.mepc,
                tval: insn,
                tval2: 0,
                tinst: 0,
            })),

            OpcodeKind::Priv(PrivOpcode::SRET) => {
                assert!(
                    !hext.virt && hext.hstatus & hstatus::SPV != 0,
                    "unexpected trapped sret"
                );

                switch_virt(regs, hext, hw, true);
                // The swap moved the HS-mode sepc into the mirror; that is
                // where the guest resumes.
                regs.mepc = hext.sepc;
                Ok(Outcome::Handled)
            }

            OpcodeKind::Priv(PrivOpcode::SFENCE_VMA) => guest_vma_fence(regs, hext),

            _ => Err(HextError::NotSupported),
        }
    } else {
        Err(HextError::NotSupported)
    }
}

/// SFENCE.VMA / SINVAL.VMA executed by the guest: drop the whole shadow
/// table.
fn guest_vma_fence(regs: &mut TrapRegs, hext: &mut HextState) -> Result<Outcome> {
    if !hext.virt {
        // Without TVM set there is nothing to emulate here.
        return Err(HextError::NotSupported);
    }

    hext.pt_area.flush();
    regs.mepc += 4;
    Ok(Outcome::Handled)
}

/// Load one byte through the guest's two-stage translation.
fn hyp_load_u8<M: PhysAccess>(
    gva: usize,
    csr: &PtwCsr,
    access: usize,
    u_mode: bool,
    sum: bool,
    mem: &M,
) -> core::result::Result<u8, TrapInfo> {
    let (vsout, gout) =
        translate(GuestVirtualAddress(gva), csr, mem).map_err(|mut trap| {
            trap.cause = convert_access_type(trap.cause, cause::LOAD_PAGE_FAULT);
            trap
        })?;

    let gpa = vsout.base | (gva & (vsout.len - 1));
    let pa = gout.base | (gpa & (gout.len - 1));

    let vsatp_bare = satp::mode(csr.vsatp) == satp::MODE_OFF;
    check_access(&vsout, &gout, access, vsatp_bare, u_mode, sum).map_err(|mut trap| {
        trap.tval = gva;
        trap.tval2 = gpa >> 2;
        trap.tinst = 0;
        trap
    })?;

    mem.load_u8(pa)
}

/// Hypervisor virtual-machine load/store. Only HLVX.HU is implemented.
fn hyp_mem<M: PhysAccess>(
    insn: usize,
    csr: &PtwCsr,
    regs: &mut TrapRegs,
    hext: &HextState,
    mem: &M,
) -> Result<Outcome> {
    if insn & INSN_MASK_HLVX_HU != INSN_MATCH_HLVX_HU {
        return Err(HextError::NotSupported);
    }

    // HLVX.HU: an unsigned halfword load that checks execute permission.
    let len = 2;
    let access = pte::X;

    let gva = regs.xreg(insn_rs1(insn));
    let u_mode = hext.hstatus & hstatus::SPVP == 0;
    let sum = hext.sstatus & mstatus::SUM != 0;

    let mut data: usize = 0;

    for i in 0..len {
        match hyp_load_u8(gva + i, csr, access, u_mode, sum, mem) {
            Ok(byte) => data |= (byte as usize) << (i * 8),
            Err(mut trap) => {
                trap.epc = regs.mepc;
                return Ok(Outcome::Redirect(trap));
            }
        }
    }

    regs.set_xreg(insn_rd(insn), data);
    regs.mepc += 4;
    Ok(Outcome::Handled)
}
