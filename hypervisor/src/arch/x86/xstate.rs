// SPDX-License-Identifier: Apache-2.0

//! Extended state (XSAVE area) geometry of the host.

use crate::arch::x86::regs::XSTATE_LWP;
use crate::platform::Platform;

/// Leaf enumerating the extended state components.
pub const XSTATE_CPUID: u32 = 0xd;

/// Legacy FXSAVE region (512 bytes) plus the XSAVE header (64 bytes).
pub const XSTATE_AREA_MIN_SIZE: u32 = 512 + 64;

/// Number of state components which can be described by leaf 0xd.
pub const XSTATE_NR_COMPONENTS: usize = 63;

/// Size and standard-format offset of one state component.
#[derive(Debug, Default, Clone, Copy, PartialEq, Eq)]
pub struct XstateComponent {
    pub size: u32,
    pub offset: u32,
    /// The component is 64-byte aligned in the compacted format.
    pub align: bool,
}

/// Per component sizes and offsets, as reported by the hardware in
/// `CPUID[0xd, i]` for `i >= 2`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct XstateGeometry {
    components: [XstateComponent; XSTATE_NR_COMPONENTS],
}

impl Default for XstateGeometry {
    fn default() -> Self {
        XstateGeometry {
            components: [XstateComponent::default(); XSTATE_NR_COMPONENTS],
        }
    }
}

impl XstateGeometry {
    /// Reads the geometry of every component from leaf 0xd.
    pub fn probe(platform: &(impl Platform + ?Sized)) -> Self {
        let mut geometry = XstateGeometry::default();

        if platform.cpuid(0).eax < XSTATE_CPUID {
            return geometry;
        }

        for (i, component) in geometry.components.iter_mut().enumerate().skip(2) {
            let leaf = platform.cpuid_count(XSTATE_CPUID, i as u32);
            *component = XstateComponent {
                size: leaf.eax,
                offset: leaf.ebx,
                align: leaf.ecx & 0x2 != 0,
            };
        }

        geometry
    }

    /// The standard (non-compacted) layout documented in the Intel SDM and
    /// the AMD APM.
    pub fn architectural() -> Self {
        let mut geometry = XstateGeometry::default();
        let mut set = |index: usize, size: u32, offset: u32| {
            geometry.components[index] = XstateComponent {
                size,
                offset,
                align: false,
            };
        };

        set(2, 256, 576); // YMM_Hi128
        set(3, 64, 960); // BNDREGS
        set(4, 64, 1024); // BNDCSR
        set(5, 64, 1088); // Opmask
        set(6, 512, 1152); // ZMM_Hi256
        set(7, 1024, 1664); // Hi16_ZMM
        set(9, 8, 2688); // PKRU
        set(XSTATE_LWP.trailing_zeros() as usize, 128, 832); // LWP

        geometry
    }

    pub fn component(&self, index: usize) -> XstateComponent {
        self.components
            .get(index)
            .copied()
            .unwrap_or_default()
    }

    /// Mask of the components requiring 64-byte alignment when compacted.
    pub fn align_mask(&self) -> u64 {
        self.components
            .iter()
            .enumerate()
            .filter(|(_, c)| c.align)
            .fold(0, |mask, (i, _)| mask | (1 << i))
    }

    /// End of the component in the standard format. Saturates on bogus
    /// geometry instead of wrapping.
    pub fn end(&self, index: usize) -> u32 {
        let component = self.component(index);
        component.offset.saturating_add(component.size)
    }
}
