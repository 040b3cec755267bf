//! World switch between the host supervisor (V = 0) and the virtual
//! supervisor (V = 1).
//!
//! The transition is a single function over a hardware seam so it can be
//! exercised without a RISC-V machine underneath: the machine backend maps
//! the seam onto real CSR swaps, the tests onto a value store.

use crate::constant::{PAGE_SHIFT, PRV_S};
use crate::csrs::{
    hstatus, mip, mstatus, satp, CSR_SCAUSE, CSR_SEPC, CSR_SIE, CSR_SSCRATCH, CSR_STVAL,
    CSR_STVEC,
};
use crate::state::HextState;
use crate::trap::{cause, TrapRegs};

/// Exception causes that must keep trapping to M-mode while the guest
/// runs, no matter what `hedeleg` says: illegal instructions feed the CSR
/// and instruction emulation, page faults feed the shadow-table router.
const MEDELEG_ALWAYS_TRAPPED: usize = (1 << cause::ILLEGAL_INSTRUCTION)
    | (1 << cause::SUPERVISOR_ECALL)
    | (1 << cause::FETCH_PAGE_FAULT)
    | (1 << cause::LOAD_PAGE_FAULT)
    | (1 << cause::STORE_PAGE_FAULT);

/// Hardware operations the world switch needs.
///
/// All methods touch this hart only.
pub trait SwitchHw {
    /// Swap an S-mode CSR, returning the previous hardware value.
    fn csr_swap(&mut self, csr: u16, val: usize) -> usize;
    /// Read `mip` and clear `mask`, returning the previous value.
    fn mip_read_clear(&mut self, mask: usize) -> usize;
    /// Set bits in `mip`.
    fn mip_set(&mut self, bits: usize);
    /// Swap `satp`, returning the previous hardware value.
    fn satp_swap(&mut self, val: usize) -> usize;
    /// Write `satp`.
    fn satp_write(&mut self, val: usize);
    /// Local `SFENCE.VMA`.
    fn fence_vma(&mut self);
    /// Read `medeleg`.
    fn medeleg_read(&mut self) -> usize;
    /// Write `medeleg`.
    fn medeleg_write(&mut self, val: usize);
    /// Read `mideleg`.
    fn mideleg_read(&mut self) -> usize;
    /// Write `mideleg`.
    fn mideleg_write(&mut self, val: usize);
    /// Enable or disable the TIME counter in `mcounteren`.
    fn mcounteren_time(&mut self, enable: bool);
    /// Does the hart implement the F extension?
    fn has_ext_f(&self) -> bool;
    /// Does the hart implement the V extension?
    fn has_ext_v(&self) -> bool;
    /// Is the privileged spec version at least 1.10?
    fn priv_version_1_10(&self) -> bool;
}

/// Transition the hart between V = 0 and V = 1.
///
/// No-op when the hart is already in the requested world. Swaps the live
/// supervisor CSR set against the mirror, switches the live `satp`, adjusts
/// the delegation masks and the `mstatus` trap bits.
///
/// # Panics
///
/// Panics when the F or V extension is implemented and the saved HS-mode
/// `sstatus` turns it off: `mstatus.FS` does not override `sstatus.FS`, so
/// machine mode has no way to enforce an off unit underneath the guest.
pub fn switch_virt<H: SwitchHw>(
    regs: &mut TrapRegs,
    hext: &mut HextState,
    hw: &mut H,
    virt: bool,
) {
    if hext.virt == virt {
        return;
    }

    hext.virt = virt;

    // The live sstatus is a view of mstatus; swap that subset through the
    // trap frame. The remaining supervisor CSRs swap directly.
    let sstatus = regs.mstatus & mstatus::SSTATUS_MASK;
    regs.mstatus =
        (regs.mstatus & !mstatus::SSTATUS_MASK) | (hext.sstatus & mstatus::SSTATUS_MASK);
    hext.sstatus = sstatus;

    hext.stvec = hw.csr_swap(CSR_STVEC, hext.stvec);
    hext.sscratch = hw.csr_swap(CSR_SSCRATCH, hext.sscratch);
    hext.sepc = hw.csr_swap(CSR_SEPC, hext.sepc);
    hext.scause = hw.csr_swap(CSR_SCAUSE, hext.scause);
    hext.stval = hw.csr_swap(CSR_STVAL, hext.stval);
    hext.sie = hw.csr_swap(CSR_SIE, hext.sie);

    let (tvm, tw, tsr);

    if virt {
        tvm = true;
        tw = hext.hstatus & hstatus::VTW != 0;
        tsr = hext.hstatus & hstatus::VTSR != 0;

        enter_virt(regs, hext, hw);
    } else {
        tvm = false;
        tw = false;
        tsr = hext.hstatus & hstatus::SPV != 0;

        exit_virt(regs, hext, hw);
    }

    for (enable, bit) in [
        (tvm, mstatus::TVM),
        (tw, mstatus::TW),
        (tsr, mstatus::TSR),
    ] {
        if enable {
            regs.mstatus |= bit;
        } else {
            regs.mstatus &= !bit;
        }
    }
}

fn enter_virt<H: SwitchHw>(regs: &mut TrapRegs, hext: &mut HextState, hw: &mut H) {
    // After the swap, `hext.sstatus` holds the HS-mode sstatus. On real
    // hardware HS-level sstatus.FS overrides vsstatus.FS, but mstatus.FS
    // does not override sstatus.FS, so an off unit cannot be emulated.
    assert!(
        !(hw.has_ext_f() && hext.sstatus & mstatus::FS == 0),
        "cannot enforce sstatus.FS = Off underneath a guest"
    );
    assert!(
        !(hw.has_ext_v() && hext.sstatus & mstatus::VS == 0),
        "cannot enforce sstatus.VS = Off underneath a guest"
    );

    // Apply SRET semantics to the HS world being left behind.
    if hext.sstatus & mstatus::SPIE != 0 {
        hext.sstatus |= mstatus::SIE;
    } else {
        hext.sstatus &= !mstatus::SIE;
    }
    hext.sstatus |= mstatus::SPIE;

    // The guest resumes at the privilege HS named in sstatus.SPP.
    regs.mstatus &= !mstatus::MPP;
    if hext.sstatus & mstatus::SPP != 0 {
        regs.mstatus |= PRV_S << mstatus::MPP_SHIFT;
    }
    hext.sstatus &= !mstatus::SPP;

    hext.hstatus &= !hstatus::SPV;

    // Hold host S-level interrupts back while the guest runs, and expose
    // the virtual pending set in their place (VS bits sit one position
    // above their S counterparts).
    hext.sip = hw.mip_read_clear(mip::S_ALL) & mip::S_ALL;
    hw.mip_set((hext.hvip & mip::VS_ALL) >> 1);
    hext.mideleg = hw.mideleg_read();
    hw.mideleg_write(hext.mideleg & !mip::S_ALL);

    // Live satp: the shadow table when the G-stage translates, the guest's
    // own satp when hgatp is Bare.
    let live_satp = if satp::mode(hext.hgatp) == satp::MODE_SV39X4 {
        (satp::MODE_SV39 << satp::MODE_SHIFT) | (hext.pt_area.root() >> PAGE_SHIFT)
    } else {
        hext.vsatp
    };
    hext.satp = hw.satp_swap(live_satp);
    hw.fence_vma();

    // While V = 1, a cause may bypass the firmware only if the host
    // already delegated it, hedeleg hands it to the guest, and the
    // emulation itself does not depend on seeing it.
    hext.medeleg = hw.medeleg_read();
    hw.medeleg_write(hext.medeleg & hext.hedeleg & !MEDELEG_ALWAYS_TRAPPED);

    // Trap TIME reads to emulate htimedelta.
    if hw.priv_version_1_10() {
        hw.mcounteren_time(false);
    }
}

fn exit_virt<H: SwitchHw>(regs: &mut TrapRegs, hext: &mut HextState, hw: &mut H) {
    // The guest had full control of the unit states and sstatus.FS is an
    // alias of mstatus.FS, so the worst case must be assumed.
    regs.mstatus |= mstatus::FS | mstatus::VS;

    // Fold pending virtual software interrupts back into hvip and restore
    // the host pending set. SEIP belongs to the interrupt controller and
    // is never forced.
    let vsip = hw.mip_read_clear(mip::S_ALL);
    hw.mip_set(hext.sip & (mip::S_ALL & !mip::SEIP));

    hext.hvip &= !mip::VSSIP;
    if vsip & mip::SSIP != 0 {
        hext.hvip |= mip::VSSIP;
    }

    hw.satp_write(hext.satp);
    hw.fence_vma();

    hw.medeleg_write(hext.medeleg);
    hw.mideleg_write(hext.mideleg);

    if hw.priv_version_1_10() {
        hw.mcounteren_time(true);
    }
}
