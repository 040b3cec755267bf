//! Demand-filling of the shadow page table from M-mode page faults.
//!
//! While the guest runs, the real MMU walks the (initially empty) shadow
//! table, so the first touch of every page faults to M-mode. The router
//! re-walks both guest translation stages, composes the protections, and
//! either installs the missing shadow leaf or hands the fault to the guest
//! as its own.

use crate::constant::{PAGE_MASK, PAGE_SIZE, PRV_U};
use crate::csrs::{mstatus, pte, satp};
use crate::memmap::ptw::{check_access, translate, PhysAccess, PtwCsr, PtwOut};
use crate::memmap::shadow_pt::{prot_translate, pt_map};
use crate::memmap::GuestVirtualAddress;
use crate::state::{self, HextState};
use crate::trap::{cause, convert_access_type, Outcome, TrapRegs};
use crate::{hw, error::Result};

/// Permission bit exercised by the faulting access.
fn access_bit(cause_num: usize) -> usize {
    match cause_num {
        cause::FETCH_PAGE_FAULT => pte::X,
        cause::STORE_PAGE_FAULT => pte::W,
        _ => pte::R,
    }
}

/// Recover a usable fault address on cores with the CIP-453 erratum, which
/// report a stale `mtval` on instruction page faults. `mepc` is precise
/// except when the fetch straddles into the following page, so `mtval` is
/// only believed when it points there.
fn errata_cip_453_tval(tval: usize, cause_num: usize, regs: &TrapRegs) -> usize {
    if !state::errata_cip_453() || cause_num != cause::FETCH_PAGE_FAULT {
        return tval;
    }

    let fetch_page = regs.mepc & PAGE_MASK;

    if tval & PAGE_MASK == fetch_page || tval & PAGE_MASK == fetch_page + PAGE_SIZE {
        tval
    } else {
        regs.mepc
    }
}

/// Handle an M-mode page fault taken while the guest's shadow table is
/// live.
///
/// On success a shadow leaf covering `tval` is installed and the faulting
/// instruction can simply be retried. Translation and permission failures
/// become the guest's own (guest-)page faults.
///
/// # Errors
///
/// This handler does not reject faults; failures are expressed as
/// [`Outcome::Redirect`]. The `Result` only satisfies the common handler
/// signature.
pub fn page_fault_handler<M: PhysAccess>(
    tval: usize,
    cause_num: usize,
    regs: &mut TrapRegs,
    hext: &mut HextState,
    mem: &M,
) -> Result<Outcome> {
    let tval = errata_cip_453_tval(tval, cause_num, regs);
    let csr = PtwCsr {
        vsatp: hext.vsatp,
        hgatp: hext.hgatp,
    };
    let gva = GuestVirtualAddress(tval);

    let (vsout, gout) = match translate(gva, &csr, mem) {
        Ok(outputs) => outputs,
        Err(mut trap) => {
            trap.cause = convert_access_type(trap.cause, cause_num);
            trap.epc = regs.mepc;
            return Ok(Outcome::Redirect(trap));
        }
    };

    let access = access_bit(cause_num);
    let u_mode = regs.mpp() == PRV_U;
    // The guest's sstatus view is live while V = 1.
    let sum = if hext.virt {
        regs.mstatus & mstatus::SUM != 0
    } else {
        hext.sstatus & mstatus::SUM != 0
    };
    let vsatp_bare = satp::mode(csr.vsatp) == satp::MODE_OFF;
    let gpa = vsout.base + (tval & (vsout.len - 1));

    if let Err(mut trap) = check_access(&vsout, &gout, access, vsatp_bare, u_mode, sum) {
        trap.tval = tval;
        trap.tval2 = gpa >> 2;
        trap.cause = convert_access_type(trap.cause, cause_num);
        trap.epc = regs.mepc;
        return Ok(Outcome::Redirect(trap));
    }

    let prot = prot_translate(vsout.prot, gout.prot);
    debug_assert!(prot != 0, "composition rejected after access check passed");

    let pa = gout.base + (gpa & (gout.len - 1));
    let leaf = PtwOut {
        base: pa & PAGE_MASK,
        len: PAGE_SIZE,
        prot,
    };

    pt_map(gva, &leaf, &mut hext.pt_area);
    hw::local_fence_vma();

    Ok(Outcome::Handled)
}
