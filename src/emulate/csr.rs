//! Trapped CSR accesses: the hypervisor CSRs, the virtual-supervisor CSRs,
//! and `satp` while the guest runs.

use crate::csrs::{
    hstatus, mip, mstatus, satp, CSR_HCOUNTEREN, CSR_HEDELEG, CSR_HENVCFG, CSR_HGATP, CSR_HIDELEG,
    CSR_HIE, CSR_HIP, CSR_HSTATUS, CSR_HTINST, CSR_HTVAL, CSR_HVIP, CSR_SATP, CSR_VSATP,
    CSR_VSCAUSE, CSR_VSEPC, CSR_VSIE, CSR_VSIP, CSR_VSSCRATCH, CSR_VSSTATUS, CSR_VSTVAL,
    CSR_VSTVEC,
};
use crate::constant::PRV_S;
use crate::error::{HextError, Result};
use crate::state::{self, HextState};
use crate::trap::TrapRegs;

/// `hedeleg` bits a hypervisor may set: misaligned fetch, faults,
/// illegal instruction, breakpoint, U-mode ecall, page faults.
const HEDELEG_WRITABLE: usize = 0xb1ff;

/// `hstatus` bits writable by the hypervisor.
const HSTATUS_WRITABLE: usize = hstatus::GVA
    | hstatus::SPV
    | hstatus::SPVP
    | hstatus::HU
    | hstatus::VTVM
    | hstatus::VTW
    | hstatus::VTSR;

/// Sanitisation of virtual-supervisor CSR writes.
///
/// The machine backend implements [`WarlOracle::sanitise`] by writing the
/// candidate into the HS-mode counterpart register, reading back what the
/// hardware kept, and restoring the previous value: the real CSR acts as
/// the WARL oracle, so reserved fields mask themselves without per-CSR
/// logic here.
pub trait WarlOracle {
    /// Feed `candidate` through the hardware counterpart of `csr` and
    /// return the value the hardware would hold.
    fn sanitise(&mut self, csr: u16, candidate: usize) -> usize;

    /// Write the live `satp` and fence. Used when a trapped guest `satp`
    /// write passes straight through because `hgatp` is Bare.
    fn satp_write_through(&mut self, value: usize);
}

/// HS-mode register number backing a virtual-supervisor CSR.
fn hs_counterpart(csr_num: u16) -> u16 {
    csr_num - 0x100
}

fn gate(csr_num: u16, regs: &TrapRegs, hext: &HextState) -> Result<()> {
    // Trapped CSR accesses below S-mode are genuine illegal instructions.
    if regs.mpp() < PRV_S {
        return Err(HextError::NotSupported);
    }

    // With V = 1 the only CSR that legitimately traps here is satp
    // (because of mstatus.TVM); hypervisor CSRs do not exist in VS-mode.
    if hext.virt && csr_num != CSR_SATP {
        return Err(HextError::NotSupported);
    }

    Ok(())
}

/// Emulate a trapped CSR read.
///
/// # Errors
///
/// `NotSupported` for CSRs outside the emulated set or accesses from the
/// wrong mode; the firmware redirects those as illegal instructions.
pub fn csr_read(csr_num: u16, regs: &TrapRegs, hext: &HextState) -> Result<usize> {
    gate(csr_num, regs, hext)?;

    match csr_num {
        CSR_HSTATUS => Ok(hext.hstatus),
        CSR_HEDELEG => Ok(hext.hedeleg),
        CSR_HIDELEG => Ok(hext.hideleg),
        CSR_HIE => Ok(hext.hie),
        CSR_HIP => Ok(hext.hip),
        CSR_HVIP => Ok(hext.hvip),
        CSR_HGATP => Ok(hext.hgatp),
        CSR_HTVAL => Ok(hext.htval),
        CSR_HTINST => Ok(hext.htinst),
        // Read-only zero by choice: no guest counter delegation, no
        // extended environment configuration.
        CSR_HCOUNTEREN | CSR_HENVCFG => Ok(0),

        CSR_VSSTATUS => Ok(hext.sstatus),
        CSR_VSIE => Ok(hext.sie),
        CSR_VSTVEC => Ok(hext.stvec),
        CSR_VSSCRATCH => Ok(hext.sscratch),
        CSR_VSEPC => Ok(hext.sepc),
        CSR_VSCAUSE => Ok(hext.scause),
        CSR_VSTVAL => Ok(hext.stval),
        CSR_VSIP => Ok(hext.sip),
        CSR_VSATP => Ok(hext.vsatp),

        // satp only traps to us under mstatus.TVM, i.e. while the guest
        // runs; a trap with V = 0 is not ours.
        CSR_SATP if hext.virt => Ok(hext.vsatp),
        CSR_SATP => Err(HextError::NotSupported),

        _ => {
            crate::println!("csr_read {:#05x}: not implemented", csr_num);
            Err(HextError::NotSupported)
        }
    }
}

/// `satp`-format sanitisation shared by `vsatp` and trapped `satp`:
/// strip the ASID, keep MODE = Off (with a zero root) or MODE = Sv39,
/// silently discard anything else.
fn sanitise_vsatp(current: usize, candidate: usize) -> usize {
    let candidate = candidate & !satp::ASID;
    let ppn = candidate & satp::PPN;

    match satp::mode(candidate) {
        satp::MODE_OFF if ppn == 0 => candidate,
        satp::MODE_SV39 => candidate,
        _ => current,
    }
}

/// Emulate a trapped CSR write.
///
/// # Errors
///
/// `NotSupported` for CSRs outside the emulated set or accesses from the
/// wrong mode; the firmware redirects those as illegal instructions.
pub fn csr_write<O: WarlOracle>(
    csr_num: u16,
    regs: &mut TrapRegs,
    hext: &mut HextState,
    value: usize,
    oracle: &mut O,
) -> Result<()> {
    gate(csr_num, regs, hext)?;

    match csr_num {
        CSR_HSTATUS => {
            let mut writable = HSTATUS_WRITABLE;

            // Without mstatus.TW the firmware never sees guest WFIs, so
            // VTW degrades to a hard zero.
            if !state::hw_has_tw() {
                writable &= !hstatus::VTW;
            }

            hext.hstatus = (value & writable) | (hext.hstatus & !writable);

            // An armed SPV means the next SRET enters the guest; trap it.
            if hext.hstatus & hstatus::SPV != 0 {
                regs.mstatus |= mstatus::TSR;
            } else {
                regs.mstatus &= !mstatus::TSR;
            }

            Ok(())
        }

        CSR_HEDELEG => {
            hext.hedeleg = value & HEDELEG_WRITABLE;
            Ok(())
        }

        CSR_HIDELEG => {
            hext.hideleg = value & mip::VS_ALL;
            Ok(())
        }

        CSR_HIE => {
            hext.hie = value & mip::VS_ALL;
            Ok(())
        }

        CSR_HIP => {
            hext.hip = value & mip::VS_ALL;
            Ok(())
        }

        CSR_HVIP => {
            hext.hvip = value & mip::VS_ALL;
            Ok(())
        }

        CSR_HGATP => {
            // VMIDLEN = 0.
            let value = value & !satp::VMID;
            let ppn = value & satp::PPN;

            if (satp::mode(value) == satp::MODE_OFF && ppn == 0)
                || satp::mode(value) == satp::MODE_SV39X4
            {
                hext.hgatp = value;
            }
            // Unsupported modes are discarded, WARL.

            Ok(())
        }

        // Accepted and discarded: both read as zero.
        CSR_HCOUNTEREN | CSR_HENVCFG => Ok(()),

        CSR_HTVAL => {
            hext.htval = value;
            Ok(())
        }

        CSR_HTINST => {
            hext.htinst = value;
            Ok(())
        }

        CSR_VSSTATUS | CSR_VSIE | CSR_VSTVEC | CSR_VSSCRATCH | CSR_VSEPC | CSR_VSCAUSE
        | CSR_VSTVAL | CSR_VSIP => {
            let sanitised = oracle.sanitise(hs_counterpart(csr_num), value);

            match csr_num {
                CSR_VSSTATUS => hext.sstatus = sanitised,
                CSR_VSIE => hext.sie = sanitised,
                CSR_VSTVEC => hext.stvec = sanitised,
                CSR_VSSCRATCH => hext.sscratch = sanitised,
                CSR_VSEPC => hext.sepc = sanitised,
                CSR_VSCAUSE => hext.scause = sanitised,
                CSR_VSTVAL => hext.stval = sanitised,
                CSR_VSIP => hext.sip = sanitised,
                _ => unreachable!(),
            }

            Ok(())
        }

        CSR_VSATP => {
            let accepted = sanitise_vsatp(hext.vsatp, value);

            if accepted != hext.vsatp {
                hext.vsatp = accepted;
                // Shadow entries compose the old vsatp; drop them all.
                hext.pt_area.flush();
            }

            Ok(())
        }

        CSR_SATP if !hext.virt => Err(HextError::NotSupported),

        CSR_SATP => {
            // Reached only with V = 1 (mstatus.TVM). The write targets the
            // guest's satp, i.e. the vsatp mirror.
            let accepted = sanitise_vsatp(hext.vsatp, value);

            if accepted == hext.vsatp {
                return Ok(());
            }

            hext.vsatp = accepted;

            if satp::mode(hext.hgatp) == satp::MODE_OFF {
                // No G-stage: the guest's satp is the live satp.
                oracle.satp_write_through(accepted);
            } else {
                // The shadow table caches translations of the old vsatp.
                hext.pt_area.flush();
            }

            Ok(())
        }

        _ => {
            crate::println!("csr_write {:#05x}: not implemented", csr_num);
            Err(HextError::NotSupported)
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::constant::PAGE_SHIFT;
    use crate::csrs::CSR_HGEIE;
    use crate::memmap::ptw::tests::{backing, page_addr};

    /// Mask-based oracle standing in for the hardware WARL behavior.
    struct FixedOracle {
        satp_written: Option<usize>,
    }

    impl FixedOracle {
        fn new() -> Self {
            FixedOracle { satp_written: None }
        }
    }

    impl WarlOracle for FixedOracle {
        fn sanitise(&mut self, csr: u16, candidate: usize) -> usize {
            use crate::csrs::{CSR_SCAUSE, CSR_SIE, CSR_SIP, CSR_STVEC};

            match csr {
                // Vectored mode keeps two low bits, reserved otherwise.
                CSR_STVEC => candidate & !0b10,
                CSR_SIE | CSR_SIP => candidate & mip::S_ALL,
                CSR_SCAUSE => candidate & 0x8000_0000_0000_00ff,
                _ => candidate,
            }
        }

        fn satp_write_through(&mut self, value: usize) {
            self.satp_written = Some(value);
        }
    }

    fn state_with_arena(blocks: &[crate::memmap::ptw::tests::PageBlock]) -> HextState {
        let mut hext = HextState::new();
        hext.reset();
        hext.pt_area.init(page_addr(blocks, 0), blocks.len());
        hext
    }

    fn hs_regs() -> TrapRegs {
        TrapRegs {
            gpr: [0; 32],
            mepc: 0,
            mstatus: PRV_S << mstatus::MPP_SHIFT,
        }
    }

    #[test]
    fn hgatp_write_zero_reads_back_zero() {
        let blocks = backing(4);
        let mut hext = state_with_arena(&blocks);
        let mut regs = hs_regs();
        let mut oracle = FixedOracle::new();

        hext.hgatp = (satp::MODE_SV39X4 << satp::MODE_SHIFT) | 0x80000;
        csr_write(CSR_HGATP, &mut regs, &mut hext, 0, &mut oracle).unwrap();

        assert_eq!(csr_read(CSR_HGATP, &regs, &hext).unwrap(), 0);
    }

    #[test]
    fn hgatp_strips_vmid_and_discards_bad_modes() {
        let blocks = backing(4);
        let mut hext = state_with_arena(&blocks);
        let mut regs = hs_regs();
        let mut oracle = FixedOracle::new();

        let ppn = 0x80400;
        let with_vmid =
            (satp::MODE_SV39X4 << satp::MODE_SHIFT) | (0x7 << 44) | ppn;
        csr_write(CSR_HGATP, &mut regs, &mut hext, with_vmid, &mut oracle).unwrap();
        assert_eq!(
            hext.hgatp,
            (satp::MODE_SV39X4 << satp::MODE_SHIFT) | ppn
        );

        // Sv48x4 is not supported: the write is discarded, WARL.
        csr_write(
            CSR_HGATP,
            &mut regs,
            &mut hext,
            (9 << satp::MODE_SHIFT) | ppn,
            &mut oracle,
        )
        .unwrap();
        assert_eq!(
            hext.hgatp,
            (satp::MODE_SV39X4 << satp::MODE_SHIFT) | ppn
        );

        // MODE = Off with a non-zero root is also discarded.
        csr_write(CSR_HGATP, &mut regs, &mut hext, ppn, &mut oracle).unwrap();
        assert_eq!(
            hext.hgatp,
            (satp::MODE_SV39X4 << satp::MODE_SHIFT) | ppn
        );
    }

    #[test]
    fn delegation_registers_apply_their_masks() {
        let blocks = backing(4);
        let mut hext = state_with_arena(&blocks);
        let mut regs = hs_regs();
        let mut oracle = FixedOracle::new();

        csr_write(CSR_HEDELEG, &mut regs, &mut hext, !0, &mut oracle).unwrap();
        assert_eq!(hext.hedeleg, HEDELEG_WRITABLE);

        csr_write(CSR_HIDELEG, &mut regs, &mut hext, !0, &mut oracle).unwrap();
        assert_eq!(hext.hideleg, mip::VS_ALL);

        csr_write(CSR_HVIP, &mut regs, &mut hext, mip::SSIP | mip::VSSIP, &mut oracle)
            .unwrap();
        assert_eq!(hext.hvip, mip::VSSIP);
    }

    #[test]
    fn hstatus_masks_writes_and_arms_tsr() {
        let blocks = backing(4);
        let mut hext = state_with_arena(&blocks);
        let mut regs = hs_regs();
        let mut oracle = FixedOracle::new();
        state::set_mstatus_features(mstatus::TVM | mstatus::TW | mstatus::TSR);

        let vsxl = hext.hstatus;
        csr_write(
            CSR_HSTATUS,
            &mut regs,
            &mut hext,
            hstatus::SPV | hstatus::HU | (1 << 5),
            &mut oracle,
        )
        .unwrap();

        // Writable bits took, the stray bit and VSXL stayed put.
        assert_eq!(hext.hstatus, vsxl | hstatus::SPV | hstatus::HU);
        // SPV armed the SRET trap.
        assert_ne!(regs.mstatus & mstatus::TSR, 0);

        csr_write(CSR_HSTATUS, &mut regs, &mut hext, 0, &mut oracle).unwrap();
        assert_eq!(regs.mstatus & mstatus::TSR, 0);

        // VTW follows the hardware: take it when TW exists...
        csr_write(CSR_HSTATUS, &mut regs, &mut hext, hstatus::VTW, &mut oracle).unwrap();
        assert_ne!(hext.hstatus & hstatus::VTW, 0);
        csr_write(CSR_HSTATUS, &mut regs, &mut hext, 0, &mut oracle).unwrap();

        // ... degrade it to a hard zero when TW is missing.
        state::set_mstatus_features(mstatus::TVM | mstatus::TSR);
        csr_write(CSR_HSTATUS, &mut regs, &mut hext, hstatus::VTW, &mut oracle).unwrap();
        assert_eq!(hext.hstatus & hstatus::VTW, 0);
        state::set_mstatus_features(mstatus::TVM | mstatus::TW | mstatus::TSR);
    }

    #[test]
    fn vs_csr_writes_go_through_the_oracle_idempotently() {
        let blocks = backing(4);
        let mut hext = state_with_arena(&blocks);
        let mut regs = hs_regs();
        let mut oracle = FixedOracle::new();

        let dirty = 0xffff_ffff_ffff_ffff;
        csr_write(CSR_VSIE, &mut regs, &mut hext, dirty, &mut oracle).unwrap();
        let first = csr_read(CSR_VSIE, &regs, &hext).unwrap();

        // Writing the sanitised value back changes nothing.
        csr_write(CSR_VSIE, &mut regs, &mut hext, first, &mut oracle).unwrap();
        assert_eq!(csr_read(CSR_VSIE, &regs, &hext).unwrap(), first);
        assert_eq!(first, mip::S_ALL);
    }

    #[test]
    fn vsatp_write_strips_asid_and_flushes_shadow() {
        let blocks = backing(4);
        let mut hext = state_with_arena(&blocks);
        let mut regs = hs_regs();
        let mut oracle = FixedOracle::new();

        let value = (satp::MODE_SV39 << satp::MODE_SHIFT) | (0x42 << 44) | 0x90000;
        csr_write(CSR_VSATP, &mut regs, &mut hext, value, &mut oracle).unwrap();

        assert_eq!(
            hext.vsatp,
            (satp::MODE_SV39 << satp::MODE_SHIFT) | 0x90000
        );
        assert_eq!(hext.pt_area.generation(), 1);

        // Unsupported mode: discarded, no extra flush.
        csr_write(
            CSR_VSATP,
            &mut regs,
            &mut hext,
            10 << satp::MODE_SHIFT,
            &mut oracle,
        )
        .unwrap();
        assert_eq!(hext.pt_area.generation(), 1);
    }

    #[test]
    fn trapped_satp_is_guest_only() {
        let blocks = backing(4);
        let mut hext = state_with_arena(&blocks);
        let regs = hs_regs();

        // V = 0: a trapped satp access is not ours to emulate.
        assert_eq!(
            csr_read(CSR_SATP, &regs, &hext),
            Err(HextError::NotSupported)
        );

        // V = 1: satp reads give the guest's satp.
        hext.virt = true;
        hext.vsatp = (satp::MODE_SV39 << satp::MODE_SHIFT) | 0x90000;
        assert_eq!(csr_read(CSR_SATP, &regs, &hext).unwrap(), hext.vsatp);

        // ... and every other CSR is rejected while V = 1.
        assert_eq!(
            csr_read(CSR_HGATP, &regs, &hext),
            Err(HextError::NotSupported)
        );
    }

    #[test]
    fn trapped_satp_flushes_shadow_under_g_stage() {
        let blocks = backing(4);
        let mut hext = state_with_arena(&blocks);
        let mut regs = hs_regs();
        let mut oracle = FixedOracle::new();

        hext.virt = true;
        hext.hgatp =
            (satp::MODE_SV39X4 << satp::MODE_SHIFT) | (page_addr(&blocks, 0) >> PAGE_SHIFT);

        let value = (satp::MODE_SV39 << satp::MODE_SHIFT) | 0x90000;
        csr_write(CSR_SATP, &mut regs, &mut hext, value, &mut oracle).unwrap();

        assert_eq!(hext.vsatp, value);
        assert_eq!(hext.pt_area.generation(), 1);
        assert_eq!(oracle.satp_written, None);
    }

    #[test]
    fn trapped_satp_passes_through_when_hgatp_bare() {
        let blocks = backing(4);
        let mut hext = state_with_arena(&blocks);
        let mut regs = hs_regs();
        let mut oracle = FixedOracle::new();

        hext.virt = true;
        hext.hgatp = 0;

        let value = (satp::MODE_SV39 << satp::MODE_SHIFT) | 0x90000;
        csr_write(CSR_SATP, &mut regs, &mut hext, value, &mut oracle).unwrap();

        assert_eq!(oracle.satp_written, Some(value));
    }

    #[test]
    fn accesses_below_s_mode_are_rejected() {
        let blocks = backing(4);
        let hext = state_with_arena(&blocks);
        let regs = TrapRegs {
            gpr: [0; 32],
            mepc: 0,
            mstatus: 0, // MPP = U
        };

        assert_eq!(
            csr_read(CSR_HGATP, &regs, &hext),
            Err(HextError::NotSupported)
        );
    }

    #[test]
    fn unknown_hypervisor_csrs_are_rejected() {
        let blocks = backing(4);
        let mut hext = state_with_arena(&blocks);
        let mut regs = hs_regs();
        let mut oracle = FixedOracle::new();

        assert_eq!(
            csr_read(CSR_HGEIE, &regs, &hext),
            Err(HextError::NotSupported)
        );
        assert_eq!(
            csr_write(CSR_HGEIE, &mut regs, &mut hext, 1, &mut oracle),
            Err(HextError::NotSupported)
        );
    }

    #[test]
    fn hcounteren_and_henvcfg_are_wired_zero() {
        let blocks = backing(4);
        let mut hext = state_with_arena(&blocks);
        let mut regs = hs_regs();
        let mut oracle = FixedOracle::new();

        csr_write(CSR_HCOUNTEREN, &mut regs, &mut hext, !0, &mut oracle).unwrap();
        csr_write(CSR_HENVCFG, &mut regs, &mut hext, !0, &mut oracle).unwrap();

        assert_eq!(csr_read(CSR_HCOUNTEREN, &regs, &hext).unwrap(), 0);
        assert_eq!(csr_read(CSR_HENVCFG, &regs, &hext).unwrap(), 0);
    }
}
