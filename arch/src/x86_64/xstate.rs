// SPDX-License-Identifier: Apache-2.0

use hypervisor::arch::x86::regs::{
    XSTATE_BNDCSR, XSTATE_BNDREGS, XSTATE_FP_SSE, XSTATE_HI_ZMM, XSTATE_LWP, XSTATE_OPMASK,
    XSTATE_PKRU, XSTATE_XSAVES_ONLY, XSTATE_YMM, XSTATE_ZMM,
};
use hypervisor::arch::x86::xstate::{XstateGeometry, XSTATE_AREA_MIN_SIZE, XSTATE_NR_COMPONENTS};
use hypervisor::arch::x86::CpuidLeaf;

use super::featureset::Feature;
use super::policy::{CpuidPolicy, CPUID_GUEST_NR_XSTATE};

// Feature gating each optional group of state components.
const OPTIONAL_COMPONENTS: &[(Feature, u64)] = &[
    (Feature::AVX, XSTATE_YMM),
    (Feature::MPX, XSTATE_BNDREGS | XSTATE_BNDCSR),
    (Feature::AVX512F, XSTATE_OPMASK | XSTATE_ZMM | XSTATE_HI_ZMM),
    (Feature::PKU, XSTATE_PKRU),
    (Feature::LWP, XSTATE_LWP),
];

// ECX flags of the per component subleaves.
const XSTATE_COMPONENT_XSS: u32 = 1 << 0;
const XSTATE_COMPONENT_ALIGN: u32 = 1 << 1;

/// Rebuilds the leaf 0xd subleaves of `p` from its feature flags.
///
/// Only the XSAVE feature bits in subleaf 1 `eax` survive. The result depends
/// on nothing but the feature flags of `p` and the host geometry.
pub fn recalculate_xstate(p: &mut CpuidPolicy, geometry: &XstateGeometry) {
    let xsave_features = p.xstate[1].eax;

    p.xstate = [CpuidLeaf::EMPTY; CPUID_GUEST_NR_XSTATE];

    if !p.has(Feature::XSAVE) {
        return;
    }

    let mut xstates = XSTATE_FP_SSE;
    let mut xstate_size = XSTATE_AREA_MIN_SIZE;

    for (feature, components) in OPTIONAL_COMPONENTS {
        if !p.has(*feature) {
            continue;
        }
        xstates |= components;
        // Groups are contiguous, so the highest component ends the group.
        let last = 63 - components.leading_zeros() as usize;
        xstate_size = xstate_size.max(geometry.end(last));
    }

    let xcr0 = xstates & !XSTATE_XSAVES_ONLY;
    p.xstate[0].eax = xcr0 as u32;
    p.xstate[0].ecx = xstate_size;
    p.xstate[0].edx = (xcr0 >> 32) as u32;

    p.xstate[1].eax = xsave_features;
    if p.has(Feature::XSAVES) {
        let xss = xstates & XSTATE_XSAVES_ONLY;
        p.xstate[1].ecx = xss as u32;
        p.xstate[1].edx = (xss >> 32) as u32;
    } else {
        xstates &= !XSTATE_XSAVES_ONLY;
    }

    let align = geometry.align_mask();
    for i in 2..CPUID_GUEST_NR_XSTATE.min(XSTATE_NR_COMPONENTS) {
        let bit = 1u64 << i;
        if xstates & bit == 0 {
            continue;
        }

        let component = geometry.component(i);
        let mut flags = 0;
        if XSTATE_XSAVES_ONLY & bit != 0 {
            flags |= XSTATE_COMPONENT_XSS;
        }
        if align & bit != 0 {
            flags |= XSTATE_COMPONENT_ALIGN;
        }
        p.xstate[i] = CpuidLeaf::new(component.size, component.offset, flags, 0);
    }
}
