//! Generic multi-level page-table walker.
//!
//! One walker serves both translation stages: the VS-stage (guest-virtual to
//! guest-physical, governed by `vsatp`) and the G-stage (guest-physical to
//! host-physical, governed by `hgatp`). A walk is parameterised by a mode
//! descriptor carrying the address layout and by a [`PteLoader`] that knows
//! how to fetch entries for that stage.

use crate::constant::{PAGE_SHIFT, PAGE_SIZE};
use crate::csrs::{pte, satp};
use crate::memmap::GuestVirtualAddress;
use crate::trap::{cause, convert_pf_to_gpf, TrapInfo, INSN_PSEUDO_VS_LOAD};

/// Size of one page table entry.
const PTE_SIZE: usize = core::mem::size_of::<usize>();

/// Snapshot of the translation CSRs relevant to one walk.
#[derive(Debug, Clone, Copy)]
pub struct PtwCsr {
    /// Mirrored `vsatp` value.
    pub vsatp: usize,
    /// Mirrored `hgatp` value.
    pub hgatp: usize,
}

/// A contiguous physical range the translated page falls within, plus the
/// raw leaf PTE bits.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PtwOut {
    /// Start of the range.
    pub base: usize,
    /// Length of the range (a power-of-two page size).
    pub len: usize,
    /// Raw leaf protection bits.
    pub prot: usize,
}

/// Address layout of a translation scheme.
#[derive(Debug, Clone, Copy)]
pub struct PtwMode {
    /// Whether the address is sign-extended above the translated bits.
    pub addr_signed: bool,
    /// Bit widths, LSB first: page offset, then each level's index width.
    pub parts: &'static [u8],
}

/// Page-based 39-bit virtual memory system, used by the VS-stage.
pub const SV39: PtwMode = PtwMode {
    addr_signed: true,
    parts: &[12, 9, 9, 9],
};

/// Sv39 with a 4-page root node, used by the G-stage.
pub const SV39X4: PtwMode = PtwMode {
    addr_signed: false,
    parts: &[12, 9, 9, 11],
};

/// Access to host-physical memory with the S-mode view of the PMP/domain
/// policy. Implemented by the machine backend; tests supply a buffer-backed
/// implementation.
pub trait PhysAccess {
    /// Load one PTE-sized word.
    fn load_pte_word(&self, pa: usize) -> Result<usize, TrapInfo>;

    /// Load a single byte.
    fn load_u8(&self, pa: usize) -> Result<u8, TrapInfo>;
}

/// How to fetch a page table entry for one translation stage.
pub trait PteLoader {
    /// Load the PTE stored at `addr` (in this stage's address space).
    fn load_pte(&self, addr: usize, csr: &PtwCsr) -> Result<usize, TrapInfo>;
}

/// Loads G-stage PTEs: entry addresses are already host-physical.
pub struct PaLoader<'a, M: PhysAccess> {
    /// Physical memory access.
    pub mem: &'a M,
}

impl<M: PhysAccess> PteLoader for PaLoader<'_, M> {
    fn load_pte(&self, addr: usize, _csr: &PtwCsr) -> Result<usize, TrapInfo> {
        self.mem.load_pte_word(addr)
    }
}

/// Loads VS-stage PTEs: entry addresses are guest-physical and are pushed
/// through the G-stage first.
pub struct GpaLoader<'a, M: PhysAccess> {
    /// Physical memory access.
    pub mem: &'a M,
}

impl<M: PhysAccess> PteLoader for GpaLoader<'_, M> {
    fn load_pte(&self, addr: usize, csr: &PtwCsr) -> Result<usize, TrapInfo> {
        assert!(
            satp::mode(csr.hgatp) == satp::MODE_SV39X4,
            "VS-stage walk without a G-stage table"
        );

        let g_root = satp::root(csr.hgatp);
        let result = walk(addr, g_root, csr, &SV39X4, &PaLoader { mem: self.mem })
            .map_err(|mut trap| {
                trap.cause = convert_pf_to_gpf(trap.cause);
                trap
            })
            .and_then(|out| {
                let pa = (out.base & !(out.len - 1)) | (addr & (out.len - 1));
                self.mem.load_pte_word(pa)
            });

        result.map_err(|mut trap| {
            trap.tval2 = addr;
            trap.tinst = INSN_PSEUDO_VS_LOAD;
            trap
        })
    }
}

/// Is `addr` canonical for this mode?
fn addr_valid(addr: usize, mode: &PtwMode, va_bits: usize) -> bool {
    if mode.addr_signed {
        let high = (addr as i64) >> (va_bits - 1);
        high == 0 || high == -1
    } else {
        addr >> va_bits == 0
    }
}

/// Perform a page-table based address translation.
///
/// The returned trap cause is "load page fault" for all page-table related
/// faults. The caller converts it to the original access type, and possibly
/// to a guest-page fault.
///
/// # Errors
///
/// Fails with the loader's trap if an entry cannot be fetched, or with a
/// plain page fault on an invalid, malformed, or missing entry.
pub fn walk(
    addr: usize,
    pt_root: usize,
    csr: &PtwCsr,
    mode: &PtwMode,
    loader: &impl PteLoader,
) -> Result<PtwOut, TrapInfo> {
    let va_bits: usize = mode.parts.iter().map(|width| *width as usize).sum();

    if !addr_valid(addr, mode, va_bits) {
        return Err(TrapInfo::page_fault());
    }

    let mut shift = va_bits;
    let mut node = pt_root;

    for level in (1..mode.parts.len()).rev() {
        shift -= mode.parts[level] as usize;
        let mask = (1usize << mode.parts[level]) - 1;
        let addr_part = (addr >> shift) & mask;

        let entry = loader.load_pte(node + addr_part * PTE_SIZE, csr)?;

        if entry & pte::V == 0 {
            return Err(TrapInfo::page_fault());
        }

        if entry >> pte::RESERVED_SHIFT != 0 {
            return Err(TrapInfo::page_fault());
        }

        let ppn = pte::ppn(entry);

        if entry & (pte::R | pte::W | pte::X) != 0 {
            // Leaf: the PPN bits below this level's shift must be zero.
            if ppn & ((1 << (shift - PAGE_SHIFT)) - 1) != 0 {
                return Err(TrapInfo::page_fault());
            }

            return Ok(PtwOut {
                base: ppn << PAGE_SHIFT,
                len: 1 << shift,
                prot: entry,
            });
        }

        // A, D, U bits are reserved for non-leaf PTEs.
        if entry & (pte::A | pte::D | pte::U) != 0 {
            return Err(TrapInfo::page_fault());
        }

        node = ppn << PAGE_SHIFT;
    }

    Err(TrapInfo::page_fault())
}

/// Translate a guest virtual address based on `vsatp` and `hgatp`.
///
/// Returns the VS-stage and G-stage walk results. The returned trap cause
/// may carry the wrong access type; the caller converts it.
///
/// # Errors
///
/// VS-stage failures come back with `tval` set to `gva`. G-stage failures
/// additionally carry `tval2 = gpa >> 2` and a guest-page-fault cause.
///
/// # Panics
///
/// Panics when `hgatp` is not Sv39x4 or `vsatp` holds a mode the CSR layer
/// never admits; both are emulation-state invariants.
pub fn translate<M: PhysAccess>(
    gva: GuestVirtualAddress,
    csr: &PtwCsr,
    mem: &M,
) -> Result<(PtwOut, PtwOut), TrapInfo> {
    assert!(
        satp::mode(csr.hgatp) == satp::MODE_SV39X4,
        "translate: unsupported hgatp mode"
    );

    let addr = gva.raw();

    let vsout = match satp::mode(csr.vsatp) {
        satp::MODE_OFF => PtwOut {
            base: addr & crate::constant::PAGE_MASK,
            len: PAGE_SIZE,
            prot: pte::PROT_ALL & !pte::U,
        },
        satp::MODE_SV39 => walk(addr, satp::root(csr.vsatp), csr, &SV39, &GpaLoader { mem })
            .map_err(|mut trap| {
                trap.tval = addr;
                trap
            })?,
        _ => panic!("translate: unsupported vsatp mode"),
    };

    let gpa = vsout.base + (addr & (vsout.len - 1));

    let gout = walk(gpa, satp::root(csr.hgatp), csr, &SV39X4, &PaLoader { mem }).map_err(
        |mut trap| {
            trap.tval = addr;
            trap.tval2 = gpa >> 2;
            trap.tinst = 0;
            trap.cause = convert_pf_to_gpf(trap.cause);
            trap
        },
    )?;

    Ok((vsout, gout))
}

/// R/W/X as derated by the software-managed access and dirty bits: a clear
/// A revokes everything, a clear D revokes W.
fn effective_perms(prot: usize) -> usize {
    let mut perms = prot & (pte::R | pte::W | pte::X);

    if prot & pte::A == 0 {
        return 0;
    }

    if prot & pte::D == 0 {
        perms &= !pte::W;
    }

    perms
}

/// Check a composed translation against the requested access.
///
/// `access` is the single requested permission bit (R, W or X); `u_mode`
/// tells whether the faulting access came from (virtual) U-mode; `sum` is
/// the mirrored `vsstatus.SUM`.
///
/// # Errors
///
/// G-stage denials fail as a guest-page fault, VS-stage denials as a plain
/// page fault. Either way the cause access type is "load"; the caller
/// rewrites it to the original access type.
pub fn check_access(
    vsout: &PtwOut,
    gout: &PtwOut,
    access: usize,
    vsatp_bare: bool,
    u_mode: bool,
    sum: bool,
) -> Result<(), TrapInfo> {
    let pte_u = vsout.prot & pte::U != 0;

    // The G-stage has no supervisor pages: U must be set on every leaf.
    if gout.prot & pte::U == 0 || effective_perms(gout.prot) & access == 0 {
        return Err(TrapInfo {
            cause: cause::LOAD_GUEST_PAGE_FAULT,
            ..TrapInfo::default()
        });
    }

    if !vsatp_bare
        && ((u_mode != pte_u && (u_mode || access == pte::X || !sum))
            || effective_perms(vsout.prot) & access == 0)
    {
        return Err(TrapInfo {
            cause: cause::LOAD_PAGE_FAULT,
            ..TrapInfo::default()
        });
    }

    Ok(())
}
