// SPDX-License-Identifier: Apache-2.0

//! Answers the `cpuid` instructions executed by guests.
//!
//! Leaves 7 and 0xd are served straight from the structured policy. Every
//! other leaf takes the legacy path: toolstack overrides first, then the
//! hardware (privileged domains) or the stored policy, with guest type
//! specific adjustments on top. State which only exists while a vCPU is
//! running (its XSAVE area size, OSPKE) is only filled in for the vCPU
//! executing the instruction.

use hypervisor::arch::x86::regs::{
    CR0_PG, CR4_OSXSAVE, CR4_PAE, CR4_PKE, EFER_LMA, XSTATE_LWP,
};
use hypervisor::arch::x86::xstate::XSTATE_CPUID;
use hypervisor::arch::x86::Exception;
use hypervisor::{CpuVendor, CpuidLeaf, Platform};
use log::trace;
use once_cell::sync::Lazy;

use super::domain::DomainCpuid;
use super::featureset::{Feature, CPUID_COMMON_1D_FEATURES};
use super::policies::CpuidPolicies;
use super::policy::{
    CpuidPolicy, CPUID_EXTD_BASE, CPUID_FEAT_LEAF, CPUID_GUEST_NR_BASIC, CPUID_GUEST_NR_EXTD,
};

const HYPERVISOR_BASE: u32 = 0x4000_0000;
const HYPERVISOR_ALT_BASE: u32 = 0x4000_0100;
const HYPERVISOR_LAST: u32 = 0x4000_01ff;

// Highest architectural performance monitoring version emulated.
const VPMU_MAX_VERSION: u32 = 3;

/// Performance monitoring state of a vCPU.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct Vpmu {
    /// The Debug Store area is emulated.
    pub has_ds: bool,
}

/// Architectural state of the vCPU a query is made for.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct VcpuState {
    pub vcpu_id: u32,
    pub cr0: u64,
    pub cr4: u64,
    pub efer: u64,
    pub xcr0: u64,
    /// The virtual local APIC is enabled in its base MSR.
    pub apic_hw_enabled: bool,
    pub vpmu: Option<Vpmu>,
    /// The LWP_CFG MSR.
    pub lwp_cfg: u32,
}

impl VcpuState {
    fn paging_pae(&self) -> bool {
        self.cr0 & CR0_PG != 0 && self.cr4 & CR4_PAE != 0
    }

    fn long_mode(&self) -> bool {
        self.efer & EFER_LMA != 0
    }
}

/// Proof that the query comes from the vCPU currently executing on this
/// physical CPU, along with the state only such a vCPU has.
///
/// Must only be built by the code handling the guest's `cpuid` exit.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct LiveContext {
    /// Vector of the exception which brought the guest into the hypervisor.
    pub entry_vector: u8,
    /// The guest was running in kernel mode.
    pub guest_kernel_mode: bool,
    /// CR4 of the physical CPU.
    pub host_cr4: u64,
}

impl LiveContext {
    pub fn new(entry_vector: u8, guest_kernel_mode: bool, host_cr4: u64) -> Self {
        LiveContext {
            entry_vector,
            guest_kernel_mode,
            host_cr4,
        }
    }
}

/// Supplier of the hypervisor leaves, 0x40000000 to 0x400001ff.
pub trait HypervisorLeaves: Send + Sync {
    /// Hyper-V compatible leaves, at 0x40000000 for domains with Viridian
    /// enabled.
    fn viridian(&self, domain: &DomainCpuid, vcpu: &VcpuState, leaf: u32, subleaf: u32)
        -> CpuidLeaf;

    /// Native hypervisor leaves.
    fn hypervisor(
        &self,
        domain: &DomainCpuid,
        vcpu: &VcpuState,
        leaf: u32,
        subleaf: u32,
    ) -> CpuidLeaf;
}

fn signature_leaf(max_leaf: u32, signature: &[u8; 12]) -> CpuidLeaf {
    let word = |i: usize| {
        u32::from_le_bytes([
            signature[i],
            signature[i + 1],
            signature[i + 2],
            signature[i + 3],
        ])
    };
    CpuidLeaf::new(max_leaf, word(0), word(4), word(8))
}

/// Identification only: a signature and a version leaf, at both bases.
#[derive(Clone, Debug)]
pub struct DefaultHypervisorLeaves {
    pub signature: [u8; 12],
    pub version: (u16, u16),
}

impl Default for DefaultHypervisorLeaves {
    fn default() -> Self {
        DefaultHypervisorLeaves {
            signature: *b"CpuidPolicy\0",
            version: (
                env!("CARGO_PKG_VERSION_MAJOR").parse().unwrap_or(0),
                env!("CARGO_PKG_VERSION_MINOR").parse().unwrap_or(0),
            ),
        }
    }
}

impl HypervisorLeaves for DefaultHypervisorLeaves {
    fn viridian(
        &self,
        _domain: &DomainCpuid,
        _vcpu: &VcpuState,
        leaf: u32,
        _subleaf: u32,
    ) -> CpuidLeaf {
        match leaf - HYPERVISOR_BASE {
            0 => signature_leaf(HYPERVISOR_BASE + 6, b"Microsoft Hv"),
            // "Hv#1"
            1 => CpuidLeaf::new(0x3123_7648, 0, 0, 0),
            _ => CpuidLeaf::EMPTY,
        }
    }

    fn hypervisor(
        &self,
        _domain: &DomainCpuid,
        _vcpu: &VcpuState,
        leaf: u32,
        _subleaf: u32,
    ) -> CpuidLeaf {
        let base = if leaf >= HYPERVISOR_ALT_BASE {
            HYPERVISOR_ALT_BASE
        } else {
            HYPERVISOR_BASE
        };

        match leaf - base {
            0 => signature_leaf(base + 1, &self.signature),
            1 => CpuidLeaf::new(
                (u32::from(self.version.0) << 16) | u32::from(self.version.1),
                0,
                0,
                0,
            ),
            _ => CpuidLeaf::EMPTY,
        }
    }
}

static DEFAULT_HYPERVISOR_LEAVES: Lazy<DefaultHypervisorLeaves> =
    Lazy::new(DefaultHypervisorLeaves::default);

/// Dispatches guest `cpuid` queries.
pub struct GuestCpuid<'a> {
    policies: &'a CpuidPolicies,
    platform: &'a dyn Platform,
    hypervisor_leaves: &'a dyn HypervisorLeaves,
}

impl<'a> GuestCpuid<'a> {
    pub fn new(
        policies: &'a CpuidPolicies,
        platform: &'a dyn Platform,
        hypervisor_leaves: &'a dyn HypervisorLeaves,
    ) -> Self {
        GuestCpuid {
            policies,
            platform,
            hypervisor_leaves,
        }
    }

    /// The values `vcpu` of `domain` sees for `leaf` and `subleaf`.
    ///
    /// `live` must be `Some` only when `vcpu` is the vCPU currently running
    /// on this physical CPU.
    pub fn guest_cpuid(
        &self,
        domain: &DomainCpuid,
        vcpu: &VcpuState,
        live: Option<&LiveContext>,
        leaf: u32,
        subleaf: u32,
    ) -> CpuidLeaf {
        // Leaves beyond the policy's maxima stay empty, live or not.
        let res = match (self.static_leaf(domain, vcpu, live, leaf, subleaf), live) {
            (Some(res), Some(_)) => self.dynamic_leaf(domain.policy(), vcpu, leaf, subleaf, res),
            (Some(res), None) => res,
            (None, _) => CpuidLeaf::EMPTY,
        };

        trace!(
            "cpuid {:#x}:{:#x} vcpu {} -> {:x?}",
            leaf,
            subleaf,
            vcpu.vcpu_id,
            res
        );
        res
    }

    /// The first pass, or `None` when the leaf or subleaf lies outside what
    /// the policy describes.
    fn static_leaf(
        &self,
        domain: &DomainCpuid,
        vcpu: &VcpuState,
        live: Option<&LiveContext>,
        leaf: u32,
        subleaf: u32,
    ) -> Option<CpuidLeaf> {
        let p = domain.policy();

        match leaf {
            _ if (leaf as usize) < CPUID_GUEST_NR_BASIC => {
                if leaf > p.basic_max_leaf() {
                    return None;
                }

                match leaf {
                    CPUID_FEAT_LEAF => {
                        if subleaf > p.feat_max_subleaf() {
                            return None;
                        }
                        p.feat.get(subleaf as usize).copied()
                    }
                    XSTATE_CPUID => {
                        if !p.has(Feature::XSAVE) {
                            return None;
                        }
                        p.xstate.get(subleaf as usize).copied()
                    }
                    _ => Some(self.legacy_leaf(domain, vcpu, live, leaf, subleaf)),
                }
            }

            HYPERVISOR_BASE..=HYPERVISOR_LAST => {
                if let Some(entry) = p.find_override(leaf, subleaf) {
                    return Some(entry.value);
                }
                Some(if domain.config().viridian && leaf < HYPERVISOR_ALT_BASE {
                    self.hypervisor_leaves
                        .viridian(domain, vcpu, leaf, subleaf)
                } else {
                    self.hypervisor_leaves
                        .hypervisor(domain, vcpu, leaf, subleaf)
                })
            }

            CPUID_EXTD_BASE.. if leaf - CPUID_EXTD_BASE < CPUID_GUEST_NR_EXTD as u32 => {
                if leaf > p.extd_max_leaf() {
                    return None;
                }
                Some(self.legacy_leaf(domain, vcpu, live, leaf, subleaf))
            }

            _ => None,
        }
    }

    fn dynamic_leaf(
        &self,
        p: &CpuidPolicy,
        vcpu: &VcpuState,
        leaf: u32,
        subleaf: u32,
        mut res: CpuidLeaf,
    ) -> CpuidLeaf {
        match (leaf, subleaf) {
            (CPUID_FEAT_LEAF, 0) => {
                if vcpu.cr4 & CR4_PKE != 0 {
                    res.ecx |= Feature::OSPKE.mask();
                }
            }
            // The size of the enabled state follows XCR0 and XSS, which the
            // hardware holds with the guest's values while it runs.
            (XSTATE_CPUID, 0) if p.has(Feature::XSAVE) => {
                res.ebx = self.platform.cpuid_count(XSTATE_CPUID, 0).ebx;
            }
            (XSTATE_CPUID, 1) if p.has(Feature::XSAVES) => {
                res.ebx = self.platform.cpuid_count(XSTATE_CPUID, 1).ebx;
            }
            _ => {}
        }
        res
    }

    fn legacy_leaf(
        &self,
        domain: &DomainCpuid,
        vcpu: &VcpuState,
        live: Option<&LiveContext>,
        leaf: u32,
        subleaf: u32,
    ) -> CpuidLeaf {
        let p = domain.policy();

        let res = match p.find_override(leaf, subleaf) {
            Some(entry) => entry.value,
            None if domain.config().is_privileged() => self.platform.cpuid_count(leaf, subleaf),
            None => p.leaf(leaf, subleaf),
        };

        if domain.config().is_hvm() {
            self.hvm_leaf(domain, vcpu, leaf, res)
        } else {
            self.pv_leaf(domain, vcpu, live, leaf, res)
        }
    }

    fn has_host(&self, feature: Feature) -> bool {
        self.policies.host_info.has(feature)
    }

    fn vpmu_ds(&self, vcpu: &VcpuState, res: &mut CpuidLeaf) {
        if !vcpu.vpmu.is_some_and(|vpmu| vpmu.has_ds) {
            return;
        }

        res.edx |= Feature::DS.mask();
        if self.has_host(Feature::DTES64) {
            res.ecx |= Feature::DTES64.mask();
        }
        if self.has_host(Feature::DSCPL) {
            res.ecx |= Feature::DSCPL.mask();
        }
    }

    fn vpmu_leaf(&self, vcpu: &VcpuState, mut res: CpuidLeaf) -> CpuidLeaf {
        if self.policies.host_info.vendor != CpuVendor::Intel || vcpu.vpmu.is_none() {
            return CpuidLeaf::EMPTY;
        }

        if res.eax & 0xff > VPMU_MAX_VERSION {
            res.eax = (res.eax & !0xff) | VPMU_MAX_VERSION;
        }
        res
    }

    fn pv_leaf(
        &self,
        domain: &DomainCpuid,
        vcpu: &VcpuState,
        live: Option<&LiveContext>,
        leaf: u32,
        mut res: CpuidLeaf,
    ) -> CpuidLeaf {
        let p = domain.policy();
        let kernel_hardware_domain =
            domain.config().hardware_domain && live.is_some_and(|l| l.guest_kernel_mode);

        match leaf {
            0x1 => {
                res.ecx = p.basic[1].ecx;
                res.edx = p.basic[1].edx;

                // Kernels which emulate cpuid through #UD are told about the
                // host's OSXSAVE, as that is what xgetbv will honour.
                let host_osxsave = live.is_some_and(|l| {
                    l.entry_vector == Exception::UD.vector()
                        && l.guest_kernel_mode
                        && l.host_cr4 & CR4_OSXSAVE != 0
                });
                if vcpu.cr4 & CR4_OSXSAVE != 0 || host_osxsave {
                    res.ecx |= Feature::OSXSAVE.mask();
                }

                // The hardware domain drives power management and MTRRs
                // itself.
                if kernel_hardware_domain {
                    if self.has_host(Feature::MTRR) {
                        res.edx |= Feature::MTRR.mask();
                    }
                    if self.has_host(Feature::MONITOR)
                        && live.is_some_and(|l| l.entry_vector == Exception::GP.vector())
                    {
                        res.ecx |= Feature::MONITOR.mask();
                    }
                    if self.has_host(Feature::EIST) {
                        res.ecx |= Feature::EIST.mask();
                    }
                }

                self.vpmu_ds(vcpu, &mut res);
            }

            0xa => res = self.vpmu_leaf(vcpu, res),

            0x8000_0001 => {
                res.ecx = p.extd[1].ecx;
                res.edx = p.extd[1].edx;
                if p.vendor != CpuVendor::Amd {
                    res.edx &= !CPUID_COMMON_1D_FEATURES;
                }
                if kernel_hardware_domain && self.has_host(Feature::MTRR) {
                    res.edx |= Feature::MTRR.mask();
                }
            }

            0x8000_0007 => res.edx = p.extd[7].edx,

            0x8000_0008 => {
                let widths = self.policies.host_info.address_widths;
                res.eax = u32::from(widths.paddr_bits) | (u32::from(widths.vaddr_bits) << 8);
                res.ebx = p.extd[8].ebx;
            }

            // Power management, topology and SVM details of the host mean
            // nothing to a PV guest.
            0x5 | 0xb | 0x8000_000a | 0x8000_001b | 0x8000_001c | 0x8000_001e => {
                res = CpuidLeaf::EMPTY
            }

            CPUID_FEAT_LEAF | XSTATE_CPUID => {
                unreachable!("leaf {leaf:#x} is served from the structured policy")
            }

            _ => {}
        }

        res
    }

    fn hvm_leaf(
        &self,
        domain: &DomainCpuid,
        vcpu: &VcpuState,
        leaf: u32,
        mut res: CpuidLeaf,
    ) -> CpuidLeaf {
        let p = domain.policy();
        // 4M pages with 36-bit physical addresses are only architectural
        // with PAE or long mode paging, which shadow paging relies on.
        let hide_pse36 = !domain.config().hap && !(vcpu.paging_pae() || vcpu.long_mode());

        match leaf {
            0x1 => {
                // Initial APIC ID.
                res.ebx = (res.ebx & 0x00ff_ffff) | (vcpu.vcpu_id.wrapping_mul(2) << 24);

                res.ecx = p.basic[1].ecx;
                res.edx = p.basic[1].edx;

                if !vcpu.apic_hw_enabled {
                    res.edx &= !Feature::APIC.mask();
                }
                if vcpu.cr4 & CR4_OSXSAVE != 0 {
                    res.ecx |= Feature::OSXSAVE.mask();
                }
                if hide_pse36 {
                    res.edx &= !Feature::PSE36.mask();
                }

                self.vpmu_ds(vcpu, &mut res);
            }

            0xb => res.edx = vcpu.vcpu_id.wrapping_mul(2),

            0xa => res = self.vpmu_leaf(vcpu, res),

            0x8000_0001 => {
                res.ecx = p.extd[1].ecx;
                res.edx = p.extd[1].edx;

                if p.vendor != CpuVendor::Amd {
                    res.edx &= !CPUID_COMMON_1D_FEATURES;
                } else if !vcpu.apic_hw_enabled {
                    res.edx &= !Feature::APIC.mask();
                }
                if hide_pse36 {
                    res.edx &= !Feature::PSE36.mask();
                }
                // SYSCALL is only usable from long mode on Intel.
                if p.vendor == CpuVendor::Intel && !vcpu.long_mode() {
                    res.edx &= !Feature::SYSCALL.mask();
                }
            }

            0x8000_0007 => res.edx = p.extd[7].edx,

            0x8000_0008 => {
                let widths = self.policies.host_info.address_widths;
                let paddr_bits = u32::from(domain.config().paddr_bits.unwrap_or(widths.paddr_bits));

                res.eax &= 0xff;
                res.eax = res.eax.min(paddr_bits);
                let floor = if p.has(Feature::PAE) || p.has(Feature::PSE36) {
                    36
                } else {
                    32
                };
                res.eax = res.eax.max(floor);

                let vaddr_bits = if p.has(Feature::LM) {
                    u32::from(widths.vaddr_bits)
                } else {
                    32
                };
                res.eax |= vaddr_bits << 8;
                res.ebx = p.extd[8].ebx;
            }

            0x8000_001c => {
                if !self.has_host(Feature::SVM) {
                    return CpuidLeaf::EMPTY;
                }
                res.eax = if self.has_host(Feature::LWP) && vcpu.xcr0 & XSTATE_LWP != 0 {
                    // Bit 0 reports LWP as available.
                    (res.edx & vcpu.lwp_cfg) | 1
                } else {
                    0
                };
            }

            CPUID_FEAT_LEAF | XSTATE_CPUID => {
                unreachable!("leaf {leaf:#x} is served from the structured policy")
            }

            _ => {}
        }

        res
    }
}

/// Answers a guest `cpuid` with the default hypervisor leaves.
pub fn guest_cpuid(
    policies: &CpuidPolicies,
    platform: &dyn Platform,
    domain: &DomainCpuid,
    vcpu: &VcpuState,
    live: Option<&LiveContext>,
    leaf: u32,
    subleaf: u32,
) -> CpuidLeaf {
    GuestCpuid::new(policies, platform, &*DEFAULT_HYPERVISOR_LEAVES)
        .guest_cpuid(domain, vcpu, live, leaf, subleaf)
}
