//! Address types and the shadow page-table machinery.

pub mod pt_arena;
pub mod ptw;
pub mod shadow_pt;

use core::fmt;
use core::ops::Add;

macro_rules! impl_address {
    ($name:ident, $doc:literal) => {
        #[doc = $doc]
        #[derive(Copy, Clone, Default, PartialEq, Eq, PartialOrd, Ord)]
        pub struct $name(pub usize);

        impl $name {
            /// Raw address value.
            #[must_use]
            pub const fn raw(self) -> usize {
                self.0
            }

            /// Offset within the page.
            #[must_use]
            pub const fn page_offset(self) -> usize {
                self.0 & (crate::constant::PAGE_SIZE - 1)
            }
        }

        impl Add<usize> for $name {
            type Output = $name;

            fn add(self, rhs: usize) -> Self::Output {
                $name(self.0 + rhs)
            }
        }

        impl fmt::Debug for $name {
            fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
                write!(f, concat!(stringify!($name), "({:#x})"), self.0)
            }
        }
    };
}

impl_address!(
    HostPhysicalAddress,
    "Address into real memory, usable by the machine-mode firmware as-is."
);
impl_address!(
    GuestPhysicalAddress,
    "Address as seen after VS-stage translation, before G-stage translation."
);
impl_address!(
    GuestVirtualAddress,
    "Address as issued by the guest, before VS-stage translation."
);
