//! Cold- and warm-boot initialization of the emulation.
//!
//! Initialization never takes the platform down: when emulation cannot be
//! offered (native H, missing `mstatus` trap bits, no memory to carve) the
//! firmware simply boots the next stage without `h` in the ISA string.

pub mod fdt_patch;

use fdt::Fdt;

use crate::constant::{MAX_HART_NUM, PT_ALIGN, PT_NODE_SIZE, PT_SPACE_SIZE};
use crate::csrs::mstatus;
use crate::error::{HextError, Result};
use crate::state;
use fdt_patch::FdtBlob;

/// `mstatus` bits probed at cold boot.
const MSTATUS_TRY_FEATURES: usize = mstatus::TVM | mstatus::TW | mstatus::TSR;
/// The probe must at least find these for the emulation to work.
const MSTATUS_NEED_FEATURES: usize = mstatus::TVM | mstatus::TSR;

/// Hart-independent facts the firmware's bring-up probes before calling
/// [`init_cold`]. See [`Platform::probe`].
#[derive(Debug, Clone, Copy)]
pub struct Platform {
    /// The hart implements S-mode.
    pub has_s_mode: bool,
    /// The hart implements the hypervisor extension natively.
    pub has_h_extension: bool,
    /// Which of `mstatus.{TVM,TW,TSR}` stick when written.
    pub mstatus_features: usize,
    /// The core corrupts `tval` on instruction page faults.
    pub errata_cip_453: bool,
    /// Privileged spec version is at least 1.10.
    pub priv_version_1_10: bool,
}

impl Platform {
    /// Probe the current hart. The privileged spec version is platform
    /// knowledge the firmware already has.
    #[cfg(target_arch = "riscv64")]
    #[must_use]
    pub fn probe(priv_version_1_10: bool) -> Self {
        Platform {
            has_s_mode: crate::hw::has_s_mode(),
            has_h_extension: crate::hw::has_h_extension(),
            mstatus_features: crate::hw::probe_mstatus_features(),
            errata_cip_453: crate::hw::probe_errata_cip_453(),
            priv_version_1_10,
        }
    }
}

/// Root-domain interface the init consumes to fence the shadow region off
/// from S-mode writes.
pub trait RootDomain {
    /// Register `[base, base + size)` as a read-only region of the root
    /// domain.
    ///
    /// # Errors
    ///
    /// Implementation-defined; a failure aborts the emulation setup.
    fn add_memregion(&mut self, base: usize, size: usize) -> Result<()>;
}

/// What cold boot decided.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum InitOutcome {
    /// Emulation not offered; the platform boots pass-through.
    Declined,
    /// Emulation enabled with the given shadow page-table carve-out.
    Enabled {
        /// Start of the carved region.
        pt_start: usize,
        /// Size of the carved region in bytes.
        pt_size: usize,
    },
}

/// Find the main memory node and return `(start, size)`.
fn find_main_memory(tree: &Fdt) -> Result<(usize, usize)> {
    let memory = tree
        .all_nodes()
        .find(|node| {
            node.property("device_type")
                .is_some_and(|prop| prop.value == b"memory\0")
        })
        .ok_or(HextError::NoDevice)?;

    let reg = memory.property("reg").ok_or(HextError::Failed)?.value;

    let root = tree.find_node("/").ok_or(HextError::Failed)?;
    let cells = |name: &str, default: usize| -> usize {
        root.property(name)
            .and_then(|prop| prop.value.try_into().ok())
            .map_or(default, |bytes: [u8; 4]| u32::from_be_bytes(bytes) as usize)
    };
    let address_cells = cells("#address-cells", 2);
    let size_cells = cells("#size-cells", 1);

    if reg.len() < (address_cells + size_cells) * 4 {
        return Err(HextError::Failed);
    }

    let read_cells = |bytes: &[u8]| -> usize {
        bytes.chunks_exact(4).fold(0usize, |acc, chunk| {
            (acc << 32) | u32::from_be_bytes(chunk.try_into().unwrap()) as usize
        })
    };

    let start = read_cells(&reg[..address_cells * 4]);
    let size = read_cells(&reg[address_cells * 4..(address_cells + size_cells) * 4]);

    Ok((start, size))
}

/// Mark every enabled cpu that has an MMU as available and return the
/// count.
fn scan_mmu_harts(tree: &Fdt) -> Result<usize> {
    let cpus = tree.find_node("/cpus").ok_or(HextError::NoDevice)?;
    let mut count = 0;

    for cpu in cpus.children() {
        if cpu
            .property("device_type")
            .map_or(true, |prop| prop.value != b"cpu\0")
        {
            continue;
        }

        if cpu
            .property("status")
            .is_some_and(|prop| prop.value.starts_with(b"disabled"))
        {
            continue;
        }

        if cpu.property("mmu-type").is_none() {
            continue;
        }

        let Some(reg) = cpu.property("reg") else {
            continue;
        };

        // cpu unit addresses are single-cell hart ids.
        let hart_id = reg
            .value
            .last_chunk::<4>()
            .map_or(usize::MAX, |bytes| u32::from_be_bytes(*bytes) as usize);

        if hart_id >= MAX_HART_NUM {
            crate::println!("hext init: hart {} beyond supported count, skipped", hart_id);
            continue;
        }

        state::hart_state(hart_id).lock().available = true;
        count += 1;
    }

    Ok(count)
}

/// Carve the shadow page-table region from the top of main memory.
///
/// Returns `None` (declining emulation) when memory is too small; the
/// caller treats that as a graceful pass-through boot.
fn carve_pt_space(
    tree: &Fdt,
    hart_count: usize,
    domain: &mut impl RootDomain,
) -> Result<Option<(usize, usize)>> {
    let (mem_start, mem_size) = find_main_memory(tree)?;

    let mem_end_aligned = (mem_start + mem_size) & !(PT_ALIGN - 1);
    let alloc_size = hart_count * PT_SPACE_SIZE;

    // A really conservative sanity check that the next stage keeps a
    // useful amount of memory.
    if mem_start + 3 * alloc_size > mem_end_aligned {
        crate::println!("hext init: no memory for shadow page tables");
        return Ok(None);
    }

    let pt_start = mem_end_aligned - alloc_size;
    domain.add_memregion(pt_start, alloc_size)?;

    Ok(Some((pt_start, alloc_size)))
}

/// Relocate an initrd that overlaps the carved region, rewriting the
/// `/chosen` properties.
fn relocate_initrd(blob: &mut FdtBlob, pt_start: usize) -> Result<()> {
    let read_initrd = |tree: &Fdt| -> Option<(usize, usize)> {
        let chosen = tree.find_node("/chosen")?;

        let read = |name: &str| -> Option<usize> {
            let value = chosen.property(name)?.value;
            Some(
                value
                    .iter()
                    .fold(0usize, |acc, byte| (acc << 8) | *byte as usize),
            )
        };

        Some((read("linux,initrd-start")?, read("linux,initrd-end")?))
    };

    let tree = Fdt::new(blob.data()).map_err(|_| HextError::Failed)?;
    let Some((initrd_start, initrd_end)) = read_initrd(&tree) else {
        return Ok(());
    };

    if initrd_end <= pt_start || initrd_end <= initrd_start {
        return Ok(());
    }

    let length = initrd_end - initrd_start;
    let new_start = (pt_start - length) & crate::constant::PAGE_MASK;

    crate::println!(
        "hext init: moving initrd {:#x} -> {:#x}",
        initrd_start,
        new_start
    );

    // The copy touches raw physical memory; hosted builds only exercise
    // the property rewrite.
    #[cfg(target_arch = "riscv64")]
    unsafe {
        core::ptr::copy(initrd_start as *const u8, new_start as *mut u8, length);
    }

    fdt_patch::set_initrd_range(blob, new_start, new_start + length)
}

/// Cold-boot initialization: probe, carve, patch the device tree, set up
/// the per-hart arenas.
///
/// # Errors
///
/// Fails only on malformed inputs (`Failed`, `NoDevice`) or when the
/// device tree buffer cannot grow (`NoMemory`). "This platform cannot host
/// the emulation" is not an error; it comes back as
/// [`InitOutcome::Declined`].
pub fn init_cold(
    platform: &Platform,
    fdt_buf: &mut [u8],
    domain: &mut impl RootDomain,
) -> Result<InitOutcome> {
    if !platform.has_s_mode {
        // No supervisor mode, nobody to host a guest for.
        return Ok(InitOutcome::Declined);
    }

    if platform.has_h_extension {
        crate::println!("hext init: native hypervisor extension available");
        return Ok(InitOutcome::Declined);
    }

    if platform.mstatus_features & MSTATUS_NEED_FEATURES != MSTATUS_NEED_FEATURES {
        crate::println!("hext init: no virtualization support in mstatus.{{TVM,TW,TSR}}");
        return Ok(InitOutcome::Declined);
    }

    state::set_mstatus_features(platform.mstatus_features & MSTATUS_TRY_FEATURES);
    state::set_errata_cip_453(platform.errata_cip_453);
    state::set_priv_version_1_10(platform.priv_version_1_10);

    let mut blob = FdtBlob::new(fdt_buf)?;

    let tree = Fdt::new(blob.data()).map_err(|_| HextError::Failed)?;
    let hart_count = scan_mmu_harts(&tree)?;

    if hart_count == 0 {
        crate::println!("hext init: no harts with an MMU");
        return Ok(InitOutcome::Declined);
    }

    let Some((pt_start, pt_size)) = carve_pt_space(&tree, hart_count, domain)? else {
        return Ok(InitOutcome::Declined);
    };

    relocate_initrd(&mut blob, pt_start)?;
    fdt_patch::patch_cpu_isa(&mut blob)?;
    fdt_patch::add_reserved_memory(&mut blob, pt_start, pt_size)?;

    let nodes_per_hart = pt_size / hart_count / PT_NODE_SIZE;
    let mut next_region = pt_start;

    for hart in 0..MAX_HART_NUM {
        let mut hext = state::hart_state(hart).lock();

        if !hext.available {
            continue;
        }

        // Arena setup writes into the carved region itself.
        #[cfg(target_arch = "riscv64")]
        hext.pt_area.init(next_region, nodes_per_hart);

        hext.reset();
        next_region += nodes_per_hart * PT_NODE_SIZE;
    }

    let _ = state::publish_pt_region(pt_start);

    crate::println!("hext init: hypervisor extension emulation enabled");

    Ok(InitOutcome::Enabled { pt_start, pt_size })
}

/// Warm-boot (secondary hart) initialization.
pub fn init_warm(hart_index: usize) {
    if !state::enabled() {
        return;
    }

    state::hart_state(hart_index).lock().reset();
}

#[cfg(test)]
mod tests {
    use super::*;
    use fdt_patch::tests::sample_dtb;
    use std::vec::Vec;

    struct RecordingDomain {
        regions: Vec<(usize, usize)>,
    }

    impl RootDomain for RecordingDomain {
        fn add_memregion(&mut self, base: usize, size: usize) -> Result<()> {
            self.regions.push((base, size));
            Ok(())
        }
    }

    fn full_platform() -> Platform {
        Platform {
            has_s_mode: true,
            has_h_extension: false,
            mstatus_features: MSTATUS_TRY_FEATURES,
            errata_cip_453: false,
            priv_version_1_10: true,
        }
    }

    #[test]
    fn cold_boot_enables_and_patches_the_tree() {
        let mut bytes = sample_dtb(2048);
        let mut domain = RecordingDomain {
            regions: Vec::new(),
        };

        let outcome = init_cold(&full_platform(), &mut bytes, &mut domain).unwrap();

        // Memory is [0x8000_0000, 0x9000_0000); two harts with MMUs carve
        // 2 * 4 MiB from the (aligned) top.
        let expected_start = 0x9000_0000 - 2 * PT_SPACE_SIZE;
        assert_eq!(
            outcome,
            InitOutcome::Enabled {
                pt_start: expected_start,
                pt_size: 2 * PT_SPACE_SIZE,
            }
        );
        assert_eq!(domain.regions, [(expected_start, 2 * PT_SPACE_SIZE)]);

        // Both harts marked available.
        assert!(state::hart_state(0).lock().available);
        assert!(state::hart_state(1).lock().available);

        // The next stage sees the H extension and the reservation.
        let tree = fdt::Fdt::new(&bytes[..]).unwrap();
        assert_eq!(
            tree.find_node("/cpus/cpu@0")
                .unwrap()
                .property("riscv,isa")
                .unwrap()
                .as_str(),
            Some("rv64imafdch")
        );
        assert!(tree.find_node("/reserved-memory/shadow-pt-resv").is_some());

        // The initrd ended below the carve-out and stayed put.
        let chosen = tree.find_node("/chosen").unwrap();
        let start = chosen.property("linux,initrd-start").unwrap().value;
        assert_eq!(u64::from_be_bytes(start.try_into().unwrap()), 0x8800_0000);
    }

    #[test]
    fn overlapping_initrd_is_relocated_below_the_carve_out() {
        let mut bytes = sample_dtb(512);
        let mut blob = FdtBlob::new(&mut bytes).unwrap();

        // Pretend the carve-out starts inside the initrd range.
        relocate_initrd(&mut blob, 0x8808_0000).unwrap();

        let tree = Fdt::new(blob.data()).unwrap();
        let chosen = tree.find_node("/chosen").unwrap();
        let start = chosen.property("linux,initrd-start").unwrap().value;
        let end = chosen.property("linux,initrd-end").unwrap().value;

        // 1 MiB initrd moved down, page aligned, ending at the carve-out.
        assert_eq!(u64::from_be_bytes(start.try_into().unwrap()), 0x87f8_0000);
        assert_eq!(u64::from_be_bytes(end.try_into().unwrap()), 0x8808_0000);
    }

    #[test]
    fn declined_without_needed_mstatus_bits() {
        let mut bytes = sample_dtb(2048);
        let mut domain = RecordingDomain {
            regions: Vec::new(),
        };

        let mut platform = full_platform();
        platform.mstatus_features = mstatus::TVM; // TSR missing

        let outcome = init_cold(&platform, &mut bytes, &mut domain).unwrap();

        assert_eq!(outcome, InitOutcome::Declined);
        assert!(domain.regions.is_empty());
    }

    #[test]
    fn declined_with_native_h() {
        let mut bytes = sample_dtb(2048);
        let mut domain = RecordingDomain {
            regions: Vec::new(),
        };

        let mut platform = full_platform();
        platform.has_h_extension = true;

        assert_eq!(
            init_cold(&platform, &mut bytes, &mut domain).unwrap(),
            InitOutcome::Declined
        );
    }

    #[test]
    fn main_memory_parse_reads_cells() {
        let mut bytes = sample_dtb(0);
        let blob = FdtBlob::new(&mut bytes).unwrap();
        let tree = Fdt::new(blob.data()).unwrap();

        assert_eq!(find_main_memory(&tree).unwrap(), (0x8000_0000, 0x1000_0000));
    }
}
