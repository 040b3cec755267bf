//! Machine backends for the hardware seams.
//!
//! Everything that touches a real CSR or raw physical memory lives here,
//! gated to `riscv64` targets. Hosted builds keep the types so the rest of
//! the crate compiles and tests against mock backends; calling a machine
//! backend on a host is a programming error and panics.

use spin::Mutex;

use crate::emulate::csr::WarlOracle;
use crate::emulate::switch::SwitchHw;
use crate::memmap::ptw::PhysAccess;
use crate::state;
use crate::trap::{cause, TrapInfo};

/// Local `SFENCE.VMA`.
///
/// A no-op on hosted builds, which have no translation caches to fence.
pub fn local_fence_vma() {
    #[cfg(target_arch = "riscv64")]
    unsafe {
        core::arch::asm!("sfence.vma");
    }
}

/// Implement a CSR swap function. CSRs are named by number: the hypervisor
/// and virtual-supervisor registers do not assemble on this hardware, and
/// the supervisor ones keep the style uniform.
#[cfg(target_arch = "riscv64")]
macro_rules! csr_swap_as {
    ($fn_name:ident, $csr_number:literal) => {
        #[inline]
        fn $fn_name(value: usize) -> usize {
            let prev;
            unsafe {
                core::arch::asm!(
                    concat!("csrrw {0}, ", stringify!($csr_number), ", {1}"),
                    out(reg) prev,
                    in(reg) value,
                );
            }
            prev
        }
    };
}

#[cfg(target_arch = "riscv64")]
mod machine {
    csr_swap_as!(swap_sstatus, 0x100);
    csr_swap_as!(swap_sie, 0x104);
    csr_swap_as!(swap_stvec, 0x105);
    csr_swap_as!(swap_sscratch, 0x140);
    csr_swap_as!(swap_sepc, 0x141);
    csr_swap_as!(swap_scause, 0x142);
    csr_swap_as!(swap_stval, 0x143);
    csr_swap_as!(swap_sip, 0x144);
    csr_swap_as!(swap_satp, 0x180);

    pub fn csr_swap(csr: u16, value: usize) -> usize {
        use crate::csrs::{
            CSR_SATP, CSR_SCAUSE, CSR_SEPC, CSR_SIE, CSR_SIP, CSR_SSCRATCH, CSR_SSTATUS,
            CSR_STVAL, CSR_STVEC,
        };

        match csr {
            CSR_SSTATUS => swap_sstatus(value),
            CSR_SIE => swap_sie(value),
            CSR_STVEC => swap_stvec(value),
            CSR_SSCRATCH => swap_sscratch(value),
            CSR_SEPC => swap_sepc(value),
            CSR_SCAUSE => swap_scause(value),
            CSR_STVAL => swap_stval(value),
            CSR_SIP => swap_sip(value),
            CSR_SATP => swap_satp(value),
            _ => panic!("csr_swap: unsupported CSR {csr:#05x}"),
        }
    }

    pub fn mip_read_clear(mask: usize) -> usize {
        let prev;
        unsafe {
            core::arch::asm!("csrrc {0}, mip, {1}", out(reg) prev, in(reg) mask);
        }
        prev
    }

    pub fn mip_set(bits: usize) {
        unsafe {
            core::arch::asm!("csrrs x0, mip, {0}", in(reg) bits);
        }
    }

    pub fn medeleg_read() -> usize {
        let value;
        unsafe {
            core::arch::asm!("csrr {0}, medeleg", out(reg) value);
        }
        value
    }

    pub fn medeleg_write(value: usize) {
        unsafe {
            core::arch::asm!("csrw medeleg, {0}", in(reg) value);
        }
    }

    pub fn mideleg_read() -> usize {
        let value;
        unsafe {
            core::arch::asm!("csrr {0}, mideleg", out(reg) value);
        }
        value
    }

    pub fn mideleg_write(value: usize) {
        unsafe {
            core::arch::asm!("csrw mideleg, {0}", in(reg) value);
        }
    }

    pub fn has_extension(ext: char) -> bool {
        riscv::register::misa::read()
            .map_or(false, |misa| misa.has_extension(ext))
    }
}

/// Hardware CSR backend for the switch engine and the WARL oracle.
#[derive(Debug, Default)]
pub struct MachineHw;

#[cfg(target_arch = "riscv64")]
impl SwitchHw for MachineHw {
    fn csr_swap(&mut self, csr: u16, val: usize) -> usize {
        machine::csr_swap(csr, val)
    }

    fn mip_read_clear(&mut self, mask: usize) -> usize {
        machine::mip_read_clear(mask)
    }

    fn mip_set(&mut self, bits: usize) {
        machine::mip_set(bits);
    }

    fn satp_swap(&mut self, val: usize) -> usize {
        machine::csr_swap(crate::csrs::CSR_SATP, val)
    }

    fn satp_write(&mut self, val: usize) {
        let _ = machine::csr_swap(crate::csrs::CSR_SATP, val);
    }

    fn fence_vma(&mut self) {
        local_fence_vma();
    }

    fn medeleg_read(&mut self) -> usize {
        machine::medeleg_read()
    }

    fn medeleg_write(&mut self, val: usize) {
        machine::medeleg_write(val);
    }

    fn mideleg_read(&mut self) -> usize {
        machine::mideleg_read()
    }

    fn mideleg_write(&mut self, val: usize) {
        machine::mideleg_write(val);
    }

    fn mcounteren_time(&mut self, enable: bool) {
        unsafe {
            if enable {
                riscv::register::mcounteren::set_tm();
            } else {
                riscv::register::mcounteren::clear_tm();
            }
        }
    }

    fn has_ext_f(&self) -> bool {
        machine::has_extension('F')
    }

    fn has_ext_v(&self) -> bool {
        machine::has_extension('V')
    }

    fn priv_version_1_10(&self) -> bool {
        state::priv_version_1_10()
    }
}

#[cfg(not(target_arch = "riscv64"))]
impl SwitchHw for MachineHw {
    fn csr_swap(&mut self, _csr: u16, _val: usize) -> usize {
        unimplemented!("CSR access outside riscv64")
    }

    fn mip_read_clear(&mut self, _mask: usize) -> usize {
        unimplemented!("CSR access outside riscv64")
    }

    fn mip_set(&mut self, _bits: usize) {
        unimplemented!("CSR access outside riscv64")
    }

    fn satp_swap(&mut self, _val: usize) -> usize {
        unimplemented!("CSR access outside riscv64")
    }

    fn satp_write(&mut self, _val: usize) {
        unimplemented!("CSR access outside riscv64")
    }

    fn fence_vma(&mut self) {
        local_fence_vma();
    }

    fn medeleg_read(&mut self) -> usize {
        unimplemented!("CSR access outside riscv64")
    }

    fn medeleg_write(&mut self, _val: usize) {
        unimplemented!("CSR access outside riscv64")
    }

    fn mideleg_read(&mut self) -> usize {
        unimplemented!("CSR access outside riscv64")
    }

    fn mideleg_write(&mut self, _val: usize) {
        unimplemented!("CSR access outside riscv64")
    }

    fn mcounteren_time(&mut self, _enable: bool) {
        unimplemented!("CSR access outside riscv64")
    }

    fn has_ext_f(&self) -> bool {
        unimplemented!("CSR access outside riscv64")
    }

    fn has_ext_v(&self) -> bool {
        unimplemented!("CSR access outside riscv64")
    }

    fn priv_version_1_10(&self) -> bool {
        state::priv_version_1_10()
    }
}

impl WarlOracle for MachineHw {
    fn sanitise(&mut self, csr: u16, candidate: usize) -> usize {
        // The HS-mode counterpart register is the oracle: feed it the
        // candidate, take what it kept, put the old value back.
        let saved = SwitchHw::csr_swap(self, csr, candidate);
        SwitchHw::csr_swap(self, csr, saved)
    }

    fn satp_write_through(&mut self, value: usize) {
        SwitchHw::satp_write(self, value);
        SwitchHw::fence_vma(self);
    }
}

/// S-mode read permission check installed by the firmware's PMP/domain
/// policy.
static DOMAIN_CHECK: Mutex<Option<fn(usize) -> bool>> = Mutex::new(None);

/// Install the root-domain permission check consulted before every
/// page-table load.
pub fn set_domain_check(check: fn(usize) -> bool) {
    *DOMAIN_CHECK.lock() = Some(check);
}

fn s_read_allowed(pa: usize) -> bool {
    DOMAIN_CHECK.lock().is_some_and(|check| check(pa))
}

/// Physical memory access for the page-table walker.
#[derive(Debug, Default)]
pub struct MachinePhys;

impl PhysAccess for MachinePhys {
    fn load_pte_word(&self, pa: usize) -> Result<usize, TrapInfo> {
        if !s_read_allowed(pa) {
            // This load would fail a PMP check.
            return Err(TrapInfo {
                cause: cause::LOAD_ACCESS,
                ..TrapInfo::default()
            });
        }

        #[cfg(target_arch = "riscv64")]
        {
            Ok(unsafe { core::ptr::read_volatile(pa as *const usize) })
        }

        #[cfg(not(target_arch = "riscv64"))]
        {
            unimplemented!("physical memory access outside riscv64")
        }
    }

    fn load_u8(&self, pa: usize) -> Result<u8, TrapInfo> {
        if !s_read_allowed(pa) {
            return Err(TrapInfo {
                cause: cause::LOAD_ACCESS,
                ..TrapInfo::default()
            });
        }

        #[cfg(target_arch = "riscv64")]
        {
            Ok(unsafe { core::ptr::read_volatile(pa as *const u8) })
        }

        #[cfg(not(target_arch = "riscv64"))]
        {
            unimplemented!("physical memory access outside riscv64")
        }
    }
}

/// Probe which of `mstatus.{TVM,TW,TSR}` the hardware implements, by
/// setting them and reading back.
#[cfg(target_arch = "riscv64")]
pub fn probe_mstatus_features() -> usize {
    use crate::csrs::mstatus;

    let try_bits = mstatus::TVM | mstatus::TW | mstatus::TSR;
    let probed;

    unsafe {
        let saved: usize;
        core::arch::asm!("csrrs {0}, mstatus, {1}", out(reg) saved, in(reg) try_bits);
        let set: usize;
        core::arch::asm!("csrr {0}, mstatus", out(reg) set);
        core::arch::asm!("csrw mstatus, {0}", in(reg) saved);
        probed = set & try_bits;
    }

    probed
}

/// See the riscv64 version.
#[cfg(not(target_arch = "riscv64"))]
pub fn probe_mstatus_features() -> usize {
    unimplemented!("CSR access outside riscv64")
}

/// Does the hart implement supervisor mode?
#[cfg(target_arch = "riscv64")]
#[must_use]
pub fn has_s_mode() -> bool {
    machine::has_extension('S')
}

/// See the riscv64 version.
#[cfg(not(target_arch = "riscv64"))]
#[must_use]
pub fn has_s_mode() -> bool {
    unimplemented!("CSR access outside riscv64")
}

/// Does the hart implement the hypervisor extension natively?
#[cfg(target_arch = "riscv64")]
#[must_use]
pub fn has_h_extension() -> bool {
    machine::has_extension('H')
}

/// See the riscv64 version.
#[cfg(not(target_arch = "riscv64"))]
#[must_use]
pub fn has_h_extension() -> bool {
    unimplemented!("CSR access outside riscv64")
}

/// Recognise the SiFive cores whose `mtval` is unreliable on instruction
/// page faults.
#[cfg(target_arch = "riscv64")]
#[must_use]
pub fn probe_errata_cip_453() -> bool {
    use riscv::register::{marchid, mimpid, mvendorid};

    let vendor = mvendorid::read().map_or(0, |id| id.bits());
    let arch = marchid::read().map_or(0, |id| id.bits());
    let imp = mimpid::read().map_or(0, |id| id.bits());

    vendor == 0x489
        && arch == 0x8000_0000_0000_0007
        && (0x2018_1004..=0x2019_1105).contains(&imp)
}

/// See the riscv64 version.
#[cfg(not(target_arch = "riscv64"))]
#[must_use]
pub fn probe_errata_cip_453() -> bool {
    unimplemented!("CSR access outside riscv64")
}
