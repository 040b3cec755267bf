//! Shadow page table: installs composed VS-stage + G-stage translations
//! into the real table the MMU walks.

use crate::constant::{PAGE_SHIFT, PAGE_SIZE};
use crate::csrs::pte;
use crate::memmap::pt_arena::PtArena;
use crate::memmap::ptw::{PtwOut, SV39};
use crate::memmap::GuestVirtualAddress;

/// Size of one page table entry.
const PTE_SIZE: usize = core::mem::size_of::<usize>();

/// Compose VS-stage and G-stage leaf protections into one shadow PTE
/// protection.
///
/// All permission bits are the intersection of the two stages, except U
/// which follows the VS-stage leaf (the G-stage U bit only gates
/// reachability). The A/D bits are software managed: a mapping without A is
/// not installed at all, and a mapping without D loses W so the first write
/// faults and reaches the guest's fault handler.
#[must_use]
pub fn prot_translate(vsprot: usize, gprot: usize) -> usize {
    let mut prot = (vsprot & gprot & pte::PROT_ALL & !pte::U) | (vsprot & pte::U);

    if gprot & pte::U == 0 || prot & pte::A == 0 {
        return 0;
    }

    if prot & pte::D == 0 {
        prot &= !pte::W;
    }

    prot | pte::V
}

/// Map one page into the shadow page table.
///
/// This function cannot fail: the worst-case number of interior nodes is
/// taken from the arena up front — which may flush the whole arena, hence
/// before any entry of this mapping is written — and unused nodes go back
/// afterwards.
///
/// # Panics
///
/// Panics when `out` describes anything but a 4 KiB page; huge shadow
/// leaves are not supported.
pub fn pt_map(va: GuestVirtualAddress, out: &PtwOut, arena: &mut PtArena) {
    let mode = &SV39;
    let num_parts = mode.parts.len();
    let va_bits: usize = mode.parts.iter().map(|width| *width as usize).sum();

    assert!(
        out.len == PAGE_SIZE,
        "pt_map: unhandled huge page size {:#x}",
        out.len
    );

    let mut alloc = [0usize; 3];
    arena.alloc(&mut alloc[..num_parts - 1]);
    let mut alloc_used = 0;

    let mut shift = va_bits;
    let mut node = arena.root();

    for level in (1..num_parts).rev() {
        shift -= mode.parts[level] as usize;
        let mask = (1usize << mode.parts[level]) - 1;
        let addr_part = (va.raw() >> shift) & mask;

        let entry_ptr = (node + addr_part * PTE_SIZE) as *mut usize;

        if level > 1 {
            let mut entry = unsafe { entry_ptr.read_volatile() };

            if entry & pte::V == 0 {
                let new_node = alloc[alloc_used];
                alloc_used += 1;
                entry = pte::V | ((new_node >> PAGE_SHIFT) << pte::PPN_SHIFT);
                unsafe { entry_ptr.write_volatile(entry) };
            }

            node = pte::ppn(entry) << PAGE_SHIFT;
        } else {
            let leaf = out.prot | ((out.base >> PAGE_SHIFT) << pte::PPN_SHIFT);
            unsafe { entry_ptr.write_volatile(leaf) };
        }
    }

    arena.dealloc(&alloc[alloc_used..num_parts - 1]);
}
