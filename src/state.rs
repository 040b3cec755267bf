//! Per-hart emulation state.
//!
//! One [`HextState`] exists per hart, created at cold boot and never freed.
//! All fields are hart-private; the `Mutex` only serialises a hart against
//! itself across nested trap entries, never across harts.

use core::num::NonZeroUsize;
use core::sync::atomic::{AtomicBool, AtomicUsize, Ordering};

use once_cell::race::OnceNonZeroUsize;
use spin::Mutex;

use crate::constant::MAX_HART_NUM;
use crate::csrs::{hstatus, mip, mstatus};
use crate::memmap::pt_arena::PtArena;

/// Emulation state of one hart.
///
/// The supervisor CSR fields mirror whichever world is *not* live in
/// hardware: with `virt == false` they hold the VS-mode values, with
/// `virt == true` the HS-mode values.
#[derive(Debug)]
pub struct HextState {
    /// The emulated virtualization bit V.
    pub virt: bool,
    /// Set at init if this hart has an MMU and is enabled.
    pub available: bool,

    /// Saved host `medeleg` while the hart runs with V = 1.
    pub medeleg: usize,
    /// Saved host `mideleg` while the hart runs with V = 1.
    pub mideleg: usize,

    /// Hypervisor status. Only exists as this mirror.
    pub hstatus: usize,
    /// Hypervisor exception delegation.
    pub hedeleg: usize,
    /// Hypervisor interrupt delegation.
    pub hideleg: usize,
    /// Hypervisor interrupt enable.
    pub hie: usize,
    /// Hypervisor interrupt pending.
    pub hip: usize,
    /// Hypervisor virtual interrupt pending.
    pub hvip: usize,
    /// Hypervisor guest address translation and protection.
    pub hgatp: usize,
    /// Hypervisor bad guest physical address.
    pub htval: usize,
    /// Hypervisor transformed trap instruction.
    pub htinst: usize,

    /// Inactive-world `sstatus`.
    pub sstatus: usize,
    /// Inactive-world `stvec`.
    pub stvec: usize,
    /// Inactive-world `sscratch`.
    pub sscratch: usize,
    /// Inactive-world `sepc`.
    pub sepc: usize,
    /// Inactive-world `scause`.
    pub scause: usize,
    /// Inactive-world `stval`.
    pub stval: usize,
    /// Inactive-world `sie`.
    pub sie: usize,
    /// Inactive-world `sip`.
    pub sip: usize,

    /// Saved HS-mode `satp` while V = 1.
    pub satp: usize,
    /// VS-mode `satp`. Never live in hardware while the shadow table is.
    pub vsatp: usize,

    /// This hart's shadow page-table pool.
    pub pt_area: PtArena,
}

impl HextState {
    /// An all-clear state. [`HextState::reset`] applies the architectural
    /// reset values on top.
    #[must_use]
    pub const fn new() -> Self {
        HextState {
            virt: false,
            available: false,
            medeleg: 0,
            mideleg: 0,
            hstatus: 0,
            hedeleg: 0,
            hideleg: 0,
            hie: 0,
            hip: 0,
            hvip: 0,
            hgatp: 0,
            htval: 0,
            htinst: 0,
            sstatus: 0,
            stvec: 0,
            sscratch: 0,
            sepc: 0,
            scause: 0,
            stval: 0,
            sie: 0,
            sip: 0,
            satp: 0,
            vsatp: 0,
            pt_area: PtArena::empty(),
        }
    }

    /// Reset the guest-visible registers to their specified values.
    pub fn reset(&mut self) {
        self.virt = false;
        self.hgatp = 0;
        self.hedeleg = 0;
        self.hideleg = 0;
        self.hie = 0;
        self.hip = 0;
        self.hvip = 0;
        self.htval = 0;
        self.htinst = 0;
        self.vsatp = 0;
        // hstatus.VSXL = RV64, read-only.
        self.hstatus = 2 << hstatus::VSXL_SHIFT;
    }

    /// Pending VS-level interrupts: `hvip` plus the external and timer
    /// sources the platform routes to this guest.
    #[must_use]
    pub fn vs_pending(&self, external: bool, timer: bool) -> usize {
        let mut pending = self.hvip & mip::VS_ALL;

        if external {
            pending |= mip::VSEIP;
        }

        if timer {
            pending |= mip::VSTIP;
        }

        pending
    }

    /// VS-level interrupts that may be delivered right now, gated on the
    /// delegation chain and the guest's interrupt-enable state.
    ///
    /// `vsstatus` is the guest's `sstatus` view: the live register when
    /// V = 1, the mirror otherwise.
    #[must_use]
    pub fn vs_deliverable(&self, vsstatus: usize, external: bool, timer: bool) -> usize {
        if vsstatus & mstatus::SIE == 0 {
            return 0;
        }

        self.vs_pending(external, timer) & self.hideleg & self.hie
    }
}

impl Default for HextState {
    fn default() -> Self {
        Self::new()
    }
}

/// Per-hart emulation states.
static HART_STATE: [Mutex<HextState>; MAX_HART_NUM] =
    [const { Mutex::new(HextState::new()) }; MAX_HART_NUM];

/// Emulation state of the given hart.
///
/// # Panics
///
/// Panics when `hart_index` exceeds [`MAX_HART_NUM`].
#[must_use]
pub fn hart_state(hart_index: usize) -> &'static Mutex<HextState> {
    &HART_STATE[hart_index]
}

/// Start address of the carved shadow page-table region. Doubles as the
/// "emulation enabled" flag.
static PT_REGION_START: OnceNonZeroUsize = OnceNonZeroUsize::new();

/// Publish the shadow page-table region. Returns false if the address is
/// zero or the region was already published.
pub fn publish_pt_region(start: usize) -> bool {
    match NonZeroUsize::new(start) {
        Some(start) => PT_REGION_START.set(start).is_ok(),
        None => false,
    }
}

/// Has the emulation been enabled on this platform?
#[must_use]
pub fn enabled() -> bool {
    PT_REGION_START.get().is_some()
}

/// Start of the shadow page-table region, once published.
#[must_use]
pub fn pt_region_start() -> Option<usize> {
    PT_REGION_START.get().map(NonZeroUsize::get)
}

/// `mstatus.{TVM,TW,TSR}` bits the hardware actually implements,
/// recorded by the init probe.
static MSTATUS_FEATURES: AtomicUsize = AtomicUsize::new(0);

/// Record the probed `mstatus` feature bits.
pub fn set_mstatus_features(bits: usize) {
    MSTATUS_FEATURES.store(bits, Ordering::Relaxed);
}

/// Probed `mstatus` feature bits.
#[must_use]
pub fn mstatus_features() -> usize {
    MSTATUS_FEATURES.load(Ordering::Relaxed)
}

/// Does the hardware implement `mstatus.TW`?
#[must_use]
pub fn hw_has_tw() -> bool {
    mstatus_features() & mstatus::TW != 0
}

/// Whether the platform reports privileged spec 1.10 or newer.
static PRIV_VERSION_1_10: AtomicBool = AtomicBool::new(false);

/// Record the platform's privileged spec level.
pub fn set_priv_version_1_10(at_least: bool) {
    PRIV_VERSION_1_10.store(at_least, Ordering::Relaxed);
}

/// Is the privileged spec version at least 1.10?
#[must_use]
pub fn priv_version_1_10() -> bool {
    PRIV_VERSION_1_10.load(Ordering::Relaxed)
}

/// Whether this core needs the CIP-453 trap value workaround.
static ERRATA_CIP_453: AtomicBool = AtomicBool::new(false);

/// Record the CIP-453 errata probe result.
pub fn set_errata_cip_453(present: bool) {
    ERRATA_CIP_453.store(present, Ordering::Relaxed);
}

/// Does this core corrupt `tval` on instruction page faults?
#[must_use]
pub fn errata_cip_453() -> bool {
    ERRATA_CIP_453.load(Ordering::Relaxed)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn reset_sets_vsxl_and_clears_guest_state() {
        let mut state = HextState::new();
        state.hgatp = 0xdead;
        state.hvip = mip::VSSIP;
        state.virt = true;

        state.reset();

        assert!(!state.virt);
        assert_eq!(state.hgatp, 0);
        assert_eq!(state.hvip, 0);
        assert_eq!(state.hstatus, 2 << hstatus::VSXL_SHIFT);
    }

    #[test]
    fn vs_pending_merges_platform_sources() {
        let mut state = HextState::new();
        state.hvip = mip::VSSIP;

        assert_eq!(state.vs_pending(false, false), mip::VSSIP);
        assert_eq!(
            state.vs_pending(true, true),
            mip::VSSIP | mip::VSEIP | mip::VSTIP
        );
    }

    #[test]
    fn vs_deliverable_gates_on_delegation_and_sie() {
        let mut state = HextState::new();
        state.hvip = mip::VSSIP | mip::VSTIP;
        state.hideleg = mip::VS_ALL;
        state.hie = mip::VSSIP;

        // SIE clear: nothing is deliverable.
        assert_eq!(state.vs_deliverable(0, false, false), 0);

        // SIE set: pending ∧ hideleg ∧ hie.
        assert_eq!(
            state.vs_deliverable(mstatus::SIE, false, false),
            mip::VSSIP
        );

        // Undelegated interrupts stay with the hypervisor.
        state.hideleg = 0;
        assert_eq!(state.vs_deliverable(mstatus::SIE, true, true), 0);
    }
}
