//! Emulation of the hypervisor extension surface: trapped CSR accesses,
//! trapped instructions, the world switch, and demand-filling of the shadow
//! page table.

pub mod csr;
pub mod insn;
pub mod page_fault;
pub mod switch;
