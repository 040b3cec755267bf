//! In-place device tree edits.
//!
//! The `fdt` crate only reads. The three edits the emulation needs — the
//! `h` letter in every cpu's `riscv,isa`, a reserved-memory node for the
//! shadow tables, and relocated initrd properties — are small structural
//! changes, done here directly on the flattened-tree bytes. The caller
//! hands in the blob inside a buffer with spare capacity for growth.

use crate::error::{HextError, Result};

const FDT_MAGIC: u32 = 0xd00d_feed;
const FDT_BEGIN_NODE: u32 = 0x1;
const FDT_END_NODE: u32 = 0x2;
const FDT_PROP: u32 = 0x3;
const FDT_NOP: u32 = 0x4;
const FDT_END: u32 = 0x9;

/// Header word offsets.
const OFF_TOTALSIZE: usize = 4;
const OFF_DT_STRUCT: usize = 8;
const OFF_DT_STRINGS: usize = 12;
const OFF_MEM_RSVMAP: usize = 16;
const OFF_SIZE_DT_STRINGS: usize = 32;
const OFF_SIZE_DT_STRUCT: usize = 36;

fn align4(value: usize) -> usize {
    (value + 3) & !3
}

/// A flattened device tree held in a growable buffer.
pub struct FdtBlob<'a> {
    buf: &'a mut [u8],
}

impl<'a> FdtBlob<'a> {
    /// Wrap a device tree blob. The slice must start with the blob and may
    /// carry spare capacity behind `totalsize` for the edits to grow into.
    ///
    /// # Errors
    ///
    /// `Failed` when the magic or the header geometry is wrong.
    pub fn new(buf: &'a mut [u8]) -> Result<FdtBlob<'a>> {
        if buf.len() < 40 {
            return Err(HextError::Failed);
        }

        let blob = FdtBlob { buf };

        if blob.u32_at(0) != FDT_MAGIC || blob.total_size() > blob.buf.len() {
            return Err(HextError::Failed);
        }

        let struct_end = blob.struct_start() + blob.u32_at(OFF_SIZE_DT_STRUCT) as usize;
        if struct_end > blob.total_size() || blob.u32_at(struct_end - 4) != FDT_END {
            return Err(HextError::Failed);
        }

        Ok(blob)
    }

    /// The current blob bytes.
    #[must_use]
    pub fn data(&self) -> &[u8] {
        &self.buf[..self.total_size()]
    }

    /// Current total size of the blob.
    #[must_use]
    pub fn total_size(&self) -> usize {
        self.u32_at(OFF_TOTALSIZE) as usize
    }

    fn u32_at(&self, offset: usize) -> u32 {
        u32::from_be_bytes(self.buf[offset..offset + 4].try_into().unwrap())
    }

    fn set_u32_at(&mut self, offset: usize, value: u32) {
        self.buf[offset..offset + 4].copy_from_slice(&value.to_be_bytes());
    }

    fn struct_start(&self) -> usize {
        self.u32_at(OFF_DT_STRUCT) as usize
    }

    fn strings_start(&self) -> usize {
        self.u32_at(OFF_DT_STRINGS) as usize
    }

    fn strings_size(&self) -> usize {
        self.u32_at(OFF_SIZE_DT_STRINGS) as usize
    }

    /// Open a gap of `extra` bytes at `at`, shifting the tail and fixing
    /// the header offsets and the size of the block containing the gap.
    fn insert_gap(&mut self, at: usize, extra: usize) -> Result<()> {
        let old_total = self.total_size();

        if old_total + extra > self.buf.len() {
            return Err(HextError::NoMemory);
        }

        let struct_start = self.struct_start();
        let struct_size = self.u32_at(OFF_SIZE_DT_STRUCT) as usize;
        let strings_start = self.strings_start();
        let strings_size = self.strings_size();

        self.buf.copy_within(at..old_total, at + extra);
        self.set_u32_at(OFF_TOTALSIZE, (old_total + extra) as u32);

        for header_off in [OFF_DT_STRUCT, OFF_DT_STRINGS, OFF_MEM_RSVMAP] {
            let block = self.u32_at(header_off) as usize;
            if block >= at {
                self.set_u32_at(header_off, (block + extra) as u32);
            }
        }

        if at > struct_start && at < struct_start + struct_size {
            self.set_u32_at(OFF_SIZE_DT_STRUCT, (struct_size + extra) as u32);
        } else if at > strings_start && at <= strings_start + strings_size {
            self.set_u32_at(OFF_SIZE_DT_STRINGS, (strings_size + extra) as u32);
        }

        Ok(())
    }

    /// Remove `shrink` bytes at `at`, the inverse of [`FdtBlob::insert_gap`].
    fn remove_gap(&mut self, at: usize, shrink: usize) {
        let old_total = self.total_size();
        let struct_start = self.struct_start();
        let struct_size = self.u32_at(OFF_SIZE_DT_STRUCT) as usize;

        self.buf.copy_within(at + shrink..old_total, at);
        self.set_u32_at(OFF_TOTALSIZE, (old_total - shrink) as u32);

        for header_off in [OFF_DT_STRUCT, OFF_DT_STRINGS, OFF_MEM_RSVMAP] {
            let block = self.u32_at(header_off) as usize;
            if block >= at + shrink {
                self.set_u32_at(header_off, (block - shrink) as u32);
            }
        }

        // Only property values shrink, and those live in the struct block.
        debug_assert!(at > struct_start && at + shrink < struct_start + struct_size);
        self.set_u32_at(OFF_SIZE_DT_STRUCT, (struct_size - shrink) as u32);
    }

    /// Node name bytes at a `FDT_BEGIN_NODE` offset.
    fn node_name(&self, node: usize) -> &[u8] {
        let start = node + 4;
        let end = self.buf[start..]
            .iter()
            .position(|byte| *byte == 0)
            .map_or(start, |len| start + len);
        &self.buf[start..end]
    }

    /// First offset inside a node, past its padded name.
    fn interior(&self, node: usize) -> usize {
        node + 4 + align4(self.node_name(node).len() + 1)
    }

    /// Offset just past a property token at `offset`.
    fn skip_prop(&self, offset: usize) -> usize {
        let len = self.u32_at(offset + 4) as usize;
        offset + 12 + align4(len)
    }

    /// Offset of this node's `FDT_END_NODE` token.
    fn node_end(&self, node: usize) -> usize {
        let mut offset = self.interior(node);
        let mut depth = 0usize;

        loop {
            match self.u32_at(offset) {
                FDT_PROP => offset = self.skip_prop(offset),
                FDT_NOP => offset += 4,
                FDT_BEGIN_NODE => {
                    depth += 1;
                    offset = self.interior(offset);
                }
                FDT_END_NODE if depth > 0 => {
                    depth -= 1;
                    offset += 4;
                }
                FDT_END_NODE => return offset,
                _ => panic!("malformed device tree structure"),
            }
        }
    }

    /// Does `name` match a path component, modulo the unit address?
    fn name_matches(name: &[u8], component: &[u8]) -> bool {
        name == component
            || (name.len() > component.len()
                && name.starts_with(component)
                && name[component.len()] == b'@')
    }

    /// `FDT_BEGIN_NODE` offset for an absolute path. Components match with
    /// or without a unit address.
    #[must_use]
    pub fn find_node(&self, path: &str) -> Option<usize> {
        let mut node = self.root_node()?;

        for component in path.split('/').filter(|component| !component.is_empty()) {
            node = self.child_by_name(node, component.as_bytes())?;
        }

        Some(node)
    }

    fn root_node(&self) -> Option<usize> {
        let mut offset = self.struct_start();

        loop {
            match self.u32_at(offset) {
                FDT_NOP => offset += 4,
                FDT_BEGIN_NODE => return Some(offset),
                _ => return None,
            }
        }
    }

    fn child_by_name(&self, parent: usize, component: &[u8]) -> Option<usize> {
        let mut child = self.first_child(parent);

        while let Some(offset) = child {
            if Self::name_matches(self.node_name(offset), component) {
                return Some(offset);
            }
            child = self.next_sibling(offset);
        }

        None
    }

    /// First subnode of `parent`, if any.
    #[must_use]
    pub fn first_child(&self, parent: usize) -> Option<usize> {
        let mut offset = self.interior(parent);

        loop {
            match self.u32_at(offset) {
                FDT_PROP => offset = self.skip_prop(offset),
                FDT_NOP => offset += 4,
                FDT_BEGIN_NODE => return Some(offset),
                _ => return None,
            }
        }
    }

    /// Next sibling of a subnode, if any.
    #[must_use]
    pub fn next_sibling(&self, node: usize) -> Option<usize> {
        let mut offset = self.node_end(node) + 4;

        loop {
            match self.u32_at(offset) {
                FDT_NOP => offset += 4,
                FDT_BEGIN_NODE => return Some(offset),
                _ => return None,
            }
        }
    }

    /// Property value within a node.
    #[must_use]
    pub fn prop(&self, node: usize, name: &str) -> Option<&[u8]> {
        let (value_off, len) = self.prop_location(node, name)?;
        Some(&self.buf[value_off..value_off + len])
    }

    fn prop_name_at(&self, nameoff: usize) -> &[u8] {
        let start = self.strings_start() + nameoff;
        let end = self.buf[start..]
            .iter()
            .position(|byte| *byte == 0)
            .map_or(start, |len| start + len);
        &self.buf[start..end]
    }

    /// (value offset, value length) of a property.
    fn prop_location(&self, node: usize, name: &str) -> Option<(usize, usize)> {
        let mut offset = self.interior(node);

        loop {
            match self.u32_at(offset) {
                FDT_PROP => {
                    let len = self.u32_at(offset + 4) as usize;
                    let nameoff = self.u32_at(offset + 8) as usize;

                    if self.prop_name_at(nameoff) == name.as_bytes() {
                        return Some((offset + 12, len));
                    }

                    offset = self.skip_prop(offset);
                }
                FDT_NOP => offset += 4,
                _ => return None,
            }
        }
    }

    /// Offset of `name` in the strings block, appending it if new.
    fn string_offset(&mut self, name: &str) -> Result<u32> {
        let start = self.strings_start();
        let size = self.strings_size();
        let strings = &self.buf[start..start + size];

        let mut offset = 0;
        while offset < size {
            let end = strings[offset..]
                .iter()
                .position(|byte| *byte == 0)
                .map_or(size, |len| offset + len);

            if &strings[offset..end] == name.as_bytes() {
                return Ok(offset as u32);
            }

            offset = end + 1;
        }

        // Append at the end of the block. No alignment requirement here.
        let append_at = start + size;
        self.insert_gap(append_at, name.len() + 1)?;

        self.buf[append_at..append_at + name.len()].copy_from_slice(name.as_bytes());
        self.buf[append_at + name.len()] = 0;

        Ok(size as u32)
    }

    /// Set a property, replacing an existing value or inserting the
    /// property at the front of the node.
    ///
    /// # Errors
    ///
    /// `NoMemory` when the buffer has no room left to grow.
    pub fn set_prop(&mut self, node: usize, name: &str, value: &[u8]) -> Result<()> {
        if let Some((value_off, old_len)) = self.prop_location(node, name) {
            let old_padded = align4(old_len);
            let new_padded = align4(value.len());

            if new_padded > old_padded {
                self.insert_gap(value_off + old_padded, new_padded - old_padded)?;
            } else if new_padded < old_padded {
                self.remove_gap(value_off + new_padded, old_padded - new_padded);
            }

            self.set_u32_at(value_off - 8, value.len() as u32);
            self.buf[value_off..value_off + value.len()].copy_from_slice(value);
            for pad in value_off + value.len()..value_off + new_padded {
                self.buf[pad] = 0;
            }

            return Ok(());
        }

        let nameoff = self.string_offset(name)?;
        // string_offset may move the node: offsets into the struct block
        // stay valid because the strings block sits behind it, but play it
        // safe against exotic layouts by re-resolving nothing and asserting.
        debug_assert!(self.strings_start() > node);

        let insert_at = self.interior(node);
        let padded = align4(value.len());
        self.insert_gap(insert_at, 12 + padded)?;

        self.set_u32_at(insert_at, FDT_PROP);
        self.set_u32_at(insert_at + 4, value.len() as u32);
        self.set_u32_at(insert_at + 8, nameoff);
        self.buf[insert_at + 12..insert_at + 12 + value.len()].copy_from_slice(value);
        for pad in insert_at + 12 + value.len()..insert_at + 12 + padded {
            self.buf[pad] = 0;
        }

        Ok(())
    }

    /// Add an empty subnode at the end of `parent`, returning its offset.
    ///
    /// # Errors
    ///
    /// `NoMemory` when the buffer has no room left to grow.
    pub fn add_subnode(&mut self, parent: usize, name: &str) -> Result<usize> {
        let insert_at = self.node_end(parent);
        let name_padded = align4(name.len() + 1);
        self.insert_gap(insert_at, 4 + name_padded + 4)?;

        self.set_u32_at(insert_at, FDT_BEGIN_NODE);
        self.buf[insert_at + 4..insert_at + 4 + name.len()].copy_from_slice(name.as_bytes());
        for pad in insert_at + 4 + name.len()..insert_at + 4 + name_padded {
            self.buf[pad] = 0;
        }
        self.set_u32_at(insert_at + 4 + name_padded, FDT_END_NODE);

        Ok(insert_at)
    }

    /// Root `#address-cells` / `#size-cells`, with the architectural
    /// defaults when absent.
    #[must_use]
    pub fn root_cells(&self) -> (usize, usize) {
        let root = self.root_node();

        let read = |name: &str, default: usize| -> usize {
            root.and_then(|node| self.prop(node, name))
                .and_then(|value| value.try_into().ok())
                .map_or(default, |bytes: [u8; 4]| u32::from_be_bytes(bytes) as usize)
        };

        (read("#address-cells", 2), read("#size-cells", 1))
    }
}

/// Encode a value into `cells` big-endian 32-bit cells.
fn encode_cells(buffer: &mut [u8], cells: usize, value: u64) {
    for cell in 0..cells {
        let shift = 32 * (cells - 1 - cell);
        let word = ((value >> shift) & 0xffff_ffff) as u32;
        buffer[cell * 4..cell * 4 + 4].copy_from_slice(&word.to_be_bytes());
    }
}

/// Append the `h` extension letter to every cpu's `riscv,isa` string:
/// `rv64imafdc` becomes `rv64imafdch`, `rv64imac_zicsr` becomes
/// `rv64imac_zicsr_h`.
///
/// # Errors
///
/// `NoDevice` without a `/cpus` node, `NoMemory` when the blob cannot grow.
pub fn patch_cpu_isa(blob: &mut FdtBlob) -> Result<()> {
    // Property edits move the offsets of everything behind them, so the
    // cpu list is re-walked by index after every edit.
    let mut index = 0;

    loop {
        let cpus = blob.find_node("/cpus").ok_or(HextError::NoDevice)?;

        let mut child = blob.first_child(cpus);
        for _ in 0..index {
            child = child.and_then(|node| blob.next_sibling(node));
        }

        let Some(cpu) = child else {
            return Ok(());
        };
        index += 1;

        if blob.prop(cpu, "device_type") != Some(b"cpu\0") {
            continue;
        }

        let Some(isa) = blob.prop(cpu, "riscv,isa") else {
            continue;
        };

        // Drop the trailing NUL, pick the separator style.
        let isa_len = isa.len().saturating_sub(1);
        let has_underscore = isa[..isa_len].contains(&b'_');

        let mut patched = [0u8; 128];
        if isa_len + 3 > patched.len() {
            return Err(HextError::Failed);
        }

        patched[..isa_len].copy_from_slice(&isa[..isa_len]);
        let new_len = if has_underscore {
            patched[isa_len] = b'_';
            patched[isa_len + 1] = b'h';
            isa_len + 3
        } else {
            patched[isa_len] = b'h';
            isa_len + 2
        };

        blob.set_prop(cpu, "riscv,isa", &patched[..new_len])?;
    }
}

/// Advertise the carved shadow-table region as reserved memory with
/// `no-map`, creating `/reserved-memory` if the tree has none.
///
/// # Errors
///
/// `NoMemory` when the blob cannot grow, `Failed` on a malformed tree.
pub fn add_reserved_memory(blob: &mut FdtBlob, addr: usize, size: usize) -> Result<()> {
    let (address_cells, size_cells) = blob.root_cells();

    let parent = match blob.find_node("/reserved-memory") {
        Some(node) => node,
        None => {
            let root = blob.find_node("/").ok_or(HextError::Failed)?;
            let node = blob.add_subnode(root, "reserved-memory")?;

            blob.set_prop(node, "ranges", &[])?;
            blob.set_prop(node, "#size-cells", &(size_cells as u32).to_be_bytes())?;
            blob.set_prop(node, "#address-cells", &(address_cells as u32).to_be_bytes())?;

            // set_prop inserts at the node front; the node offset itself
            // is unchanged by its own property edits.
            node
        }
    };

    let resv = blob.add_subnode(parent, "shadow-pt-resv")?;

    let mut reg = [0u8; 16];
    encode_cells(&mut reg[..address_cells * 4], address_cells, addr as u64);
    encode_cells(
        &mut reg[address_cells * 4..(address_cells + size_cells) * 4],
        size_cells,
        size as u64,
    );

    blob.set_prop(resv, "no-map", &[])?;
    blob.set_prop(resv, "reg", &reg[..(address_cells + size_cells) * 4])?;

    Ok(())
}

/// Rewrite the initrd range in `/chosen` after a relocation.
///
/// # Errors
///
/// `NoDevice` without a `/chosen` node, `NoMemory` when the blob cannot
/// grow.
pub fn set_initrd_range(blob: &mut FdtBlob, start: usize, end: usize) -> Result<()> {
    let chosen = blob.find_node("/chosen").ok_or(HextError::NoDevice)?;
    blob.set_prop(chosen, "linux,initrd-start", &(start as u64).to_be_bytes())?;

    let chosen = blob.find_node("/chosen").ok_or(HextError::NoDevice)?;
    blob.set_prop(chosen, "linux,initrd-end", &(end as u64).to_be_bytes())?;

    Ok(())
}

#[cfg(test)]
pub(crate) mod tests {
    use super::*;
    use std::vec::Vec;

    /// Minimal flattened-tree writer for test fixtures.
    pub struct DtbBuilder {
        struct_block: Vec<u8>,
        strings: Vec<u8>,
    }

    impl DtbBuilder {
        pub fn new() -> Self {
            DtbBuilder {
                struct_block: Vec::new(),
                strings: Vec::new(),
            }
        }

        fn push_u32(&mut self, value: u32) {
            self.struct_block.extend_from_slice(&value.to_be_bytes());
        }

        pub fn begin_node(&mut self, name: &str) -> &mut Self {
            self.push_u32(FDT_BEGIN_NODE);
            self.struct_block.extend_from_slice(name.as_bytes());
            self.struct_block.push(0);
            while self.struct_block.len() % 4 != 0 {
                self.struct_block.push(0);
            }
            self
        }

        pub fn end_node(&mut self) -> &mut Self {
            self.push_u32(FDT_END_NODE);
            self
        }

        fn string_offset(&mut self, name: &str) -> u32 {
            let mut offset = 0;
            while offset < self.strings.len() {
                let end = self.strings[offset..]
                    .iter()
                    .position(|byte| *byte == 0)
                    .map(|len| offset + len)
                    .unwrap_or(self.strings.len());
                if &self.strings[offset..end] == name.as_bytes() {
                    return offset as u32;
                }
                offset = end + 1;
            }

            let at = self.strings.len();
            self.strings.extend_from_slice(name.as_bytes());
            self.strings.push(0);
            at as u32
        }

        pub fn prop(&mut self, name: &str, value: &[u8]) -> &mut Self {
            let nameoff = self.string_offset(name);
            self.push_u32(FDT_PROP);
            self.push_u32(value.len() as u32);
            self.push_u32(nameoff);
            self.struct_block.extend_from_slice(value);
            while self.struct_block.len() % 4 != 0 {
                self.struct_block.push(0);
            }
            self
        }

        pub fn prop_u32(&mut self, name: &str, value: u32) -> &mut Self {
            self.prop(name, &value.to_be_bytes())
        }

        pub fn prop_str(&mut self, name: &str, value: &str) -> &mut Self {
            let mut bytes = Vec::from(value.as_bytes());
            bytes.push(0);
            self.prop(name, &bytes)
        }

        /// Serialise into a buffer with `spare` extra bytes of capacity.
        pub fn build(&mut self, spare: usize) -> Vec<u8> {
            self.push_u32(FDT_END);

            let header_len = 40;
            let rsvmap_len = 16;
            let off_struct = header_len + rsvmap_len;
            let off_strings = off_struct + self.struct_block.len();
            let total = off_strings + self.strings.len();

            let mut out = Vec::with_capacity(total + spare);
            for word in [
                FDT_MAGIC,
                total as u32,
                off_struct as u32,
                off_strings as u32,
                header_len as u32,
                17,
                16,
                0,
                self.strings.len() as u32,
                self.struct_block.len() as u32,
            ] {
                out.extend_from_slice(&word.to_be_bytes());
            }
            out.extend_from_slice(&[0u8; 16]);
            out.extend_from_slice(&self.struct_block);
            out.extend_from_slice(&self.strings);
            out.resize(total + spare, 0);
            out
        }
    }

    /// The fixture: memory, two cpus, chosen with an initrd.
    pub fn sample_dtb(spare: usize) -> Vec<u8> {
        let mut builder = DtbBuilder::new();
        builder.begin_node("");
        builder.prop_u32("#address-cells", 2);
        builder.prop_u32("#size-cells", 2);

        builder.begin_node("memory@80000000");
        builder.prop_str("device_type", "memory");
        let mut reg = [0u8; 16];
        encode_cells(&mut reg[..8], 2, 0x8000_0000);
        encode_cells(&mut reg[8..], 2, 0x1000_0000);
        builder.prop("reg", &reg);
        builder.end_node();

        builder.begin_node("cpus");
        builder.prop_u32("#address-cells", 1);
        builder.prop_u32("#size-cells", 0);

        builder.begin_node("cpu@0");
        builder.prop_str("device_type", "cpu");
        builder.prop_u32("reg", 0);
        builder.prop_str("riscv,isa", "rv64imafdc");
        builder.prop_str("mmu-type", "riscv,sv39");
        builder.end_node();

        builder.begin_node("cpu@1");
        builder.prop_str("device_type", "cpu");
        builder.prop_u32("reg", 1);
        builder.prop_str("riscv,isa", "rv64imac_zicsr");
        builder.prop_str("mmu-type", "riscv,sv39");
        builder.end_node();

        builder.end_node(); // cpus

        builder.begin_node("chosen");
        builder.prop("linux,initrd-start", &0x8800_0000u64.to_be_bytes());
        builder.prop("linux,initrd-end", &0x8810_0000u64.to_be_bytes());
        builder.end_node();

        builder.end_node(); // root
        builder.build(spare)
    }

    fn parse<'a>(blob: &'a FdtBlob<'a>) -> fdt::Fdt<'a> {
        fdt::Fdt::new(blob.data()).expect("patched blob must stay parseable")
    }

    #[test]
    fn finds_nodes_and_props() {
        let mut bytes = sample_dtb(0);
        let blob = FdtBlob::new(&mut bytes).unwrap();

        let memory = blob.find_node("/memory").expect("unit address tolerated");
        assert_eq!(blob.prop(memory, "device_type"), Some(&b"memory\0"[..]));

        let cpu0 = blob.find_node("/cpus/cpu@0").unwrap();
        assert_eq!(blob.prop(cpu0, "riscv,isa"), Some(&b"rv64imafdc\0"[..]));

        assert_eq!(blob.root_cells(), (2, 2));
        assert!(blob.find_node("/nonexistent").is_none());
    }

    #[test]
    fn isa_patch_appends_h_both_styles() {
        let mut bytes = sample_dtb(256);
        let mut blob = FdtBlob::new(&mut bytes).unwrap();

        patch_cpu_isa(&mut blob).unwrap();

        let tree = parse(&blob);
        let isa0 = tree
            .find_node("/cpus/cpu@0")
            .unwrap()
            .property("riscv,isa")
            .unwrap();
        assert_eq!(isa0.as_str(), Some("rv64imafdch"));

        let isa1 = tree
            .find_node("/cpus/cpu@1")
            .unwrap()
            .property("riscv,isa")
            .unwrap();
        assert_eq!(isa1.as_str(), Some("rv64imac_zicsr_h"));
    }

    #[test]
    fn isa_patch_fails_cleanly_without_room() {
        let mut bytes = sample_dtb(0);
        let mut blob = FdtBlob::new(&mut bytes).unwrap();

        assert_eq!(patch_cpu_isa(&mut blob), Err(HextError::NoMemory));
    }

    #[test]
    fn reserved_memory_node_is_created_with_no_map() {
        let mut bytes = sample_dtb(512);
        let mut blob = FdtBlob::new(&mut bytes).unwrap();

        add_reserved_memory(&mut blob, 0x8fc0_0000, 0x40_0000).unwrap();

        let tree = parse(&blob);
        let resv = tree
            .find_node("/reserved-memory/shadow-pt-resv")
            .expect("reserved node added");

        assert!(resv.property("no-map").is_some());
        let reg = resv.property("reg").unwrap().value;
        assert_eq!(reg.len(), 16);
        assert_eq!(
            u64::from_be_bytes(reg[..8].try_into().unwrap()),
            0x8fc0_0000
        );
        assert_eq!(u64::from_be_bytes(reg[8..].try_into().unwrap()), 0x40_0000);

        let parent = tree.find_node("/reserved-memory").unwrap();
        assert!(parent.property("ranges").is_some());
    }

    #[test]
    fn initrd_range_is_rewritten() {
        let mut bytes = sample_dtb(128);
        let mut blob = FdtBlob::new(&mut bytes).unwrap();

        set_initrd_range(&mut blob, 0x8f00_0000, 0x8f10_0000).unwrap();

        let tree = parse(&blob);
        let chosen = tree.find_node("/chosen").unwrap();
        let start = chosen.property("linux,initrd-start").unwrap().value;
        assert_eq!(
            u64::from_be_bytes(start.try_into().unwrap()),
            0x8f00_0000
        );
        let end = chosen.property("linux,initrd-end").unwrap().value;
        assert_eq!(u64::from_be_bytes(end.try_into().unwrap()), 0x8f10_0000);
    }

    #[test]
    fn patched_tree_survives_all_edits_together() {
        let mut bytes = sample_dtb(1024);
        let mut blob = FdtBlob::new(&mut bytes).unwrap();

        patch_cpu_isa(&mut blob).unwrap();
        add_reserved_memory(&mut blob, 0x8fc0_0000, 0x80_0000).unwrap();
        set_initrd_range(&mut blob, 0x8f00_0000, 0x8f10_0000).unwrap();

        let tree = parse(&blob);
        assert!(tree.find_node("/reserved-memory/shadow-pt-resv").is_some());
        assert_eq!(
            tree.find_node("/cpus/cpu@1")
                .unwrap()
                .property("riscv,isa")
                .unwrap()
                .as_str(),
            Some("rv64imac_zicsr_h")
        );
        let memory = tree
            .all_nodes()
            .find(|node| node.name.split('@').next() == Some("memory"))
            .expect("memory node survives");
        assert_eq!(
            memory.property("device_type").and_then(|prop| prop.as_str()),
            Some("memory")
        );
    }
}
