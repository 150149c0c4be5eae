// SPDX-License-Identifier: Apache-2.0

//! The system wide policies, computed once at startup.

use hypervisor::arch::x86::xstate::{XstateGeometry, XSTATE_CPUID};
use hypervisor::{AddressWidths, CpuVendor, HvmCapabilities, Platform};
use log::{debug, info};
use once_cell::sync::OnceCell;

use super::featureset::{
    Feature, FeatureSet, HVM_HAP_FEATURES, HVM_SHADOW_FEATURES, PV_FEATURES,
};
use super::policy::{
    CpuidPolicy, CPUID_EXTD_BASE, CPUID_FEAT_LEAF, CPUID_GUEST_NR_BASIC, CPUID_GUEST_NR_EXTD,
    CPUID_GUEST_NR_FEAT, CPUID_GUEST_NR_XSTATE,
};
use super::sanitise::sanitise_featureset;
use super::xstate::recalculate_xstate;

/// What the policies need to know about the host beyond its CPUID leaves.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct HostInfo {
    pub vendor: CpuVendor,
    /// Capability words detected at boot, unsanitised.
    pub capabilities: FeatureSet,
    pub hvm: HvmCapabilities,
    pub address_widths: AddressWidths,
    pub xstate: XstateGeometry,
}

impl HostInfo {
    pub fn probe(platform: &dyn Platform) -> Self {
        HostInfo {
            vendor: platform.cpu_vendor(),
            capabilities: FeatureSet::from_words(platform.host_capabilities()),
            hvm: platform.hvm_capabilities(),
            address_widths: platform.address_widths(),
            xstate: platform.xstate_geometry(),
        }
    }

    pub fn has(&self, feature: Feature) -> bool {
        self.capabilities.contains(feature)
    }
}

#[derive(Clone, Debug)]
pub struct CpuidPolicies {
    /// What the hardware reports, truncated to the policy tables.
    pub raw: CpuidPolicy,
    /// What the hypervisor can offer at all.
    pub host: CpuidPolicy,
    /// Ceiling for PV guests.
    pub pv_max: CpuidPolicy,
    /// Ceiling for HVM guests. Left empty when HVM is unavailable.
    pub hvm_max: CpuidPolicy,
    pub host_info: HostInfo,
}

impl CpuidPolicies {
    pub fn calculate(platform: &dyn Platform) -> Self {
        let host_info = HostInfo::probe(platform);
        let raw = calculate_raw_policy(platform);
        let host = calculate_host_policy(&raw, &host_info);
        let pv_max = calculate_pv_max_policy(&host, &host_info);
        let hvm_max = calculate_hvm_max_policy(&raw, &host, &host_info);

        for (name, policy) in [
            ("raw", &raw),
            ("host", &host),
            ("pv_max", &pv_max),
            ("hvm_max", &hvm_max),
        ] {
            info!(
                "CPUID {} policy: vendor {:?}, basic max {:#x}, extended max {:#x}",
                name,
                policy.vendor,
                policy.basic_max_leaf(),
                policy.extd_max_leaf()
            );
        }

        CpuidPolicies {
            raw,
            host,
            pv_max,
            hvm_max,
            host_info,
        }
    }
}

static GUEST_CPUID_POLICIES: OnceCell<CpuidPolicies> = OnceCell::new();

/// Computes the system wide policies. Later calls return the policies from
/// the first one.
pub fn init_guest_cpuid(platform: &dyn Platform) -> &'static CpuidPolicies {
    GUEST_CPUID_POLICIES.get_or_init(|| CpuidPolicies::calculate(platform))
}

pub fn guest_cpuid_policies() -> Option<&'static CpuidPolicies> {
    GUEST_CPUID_POLICIES.get()
}

/// Reads every leaf the policy tables can hold from the hardware.
pub fn calculate_raw_policy(platform: &dyn Platform) -> CpuidPolicy {
    let mut p = CpuidPolicy::default();

    p.basic[0] = platform.cpuid(0);
    let nr_basic = (p.basic_max_leaf() as usize)
        .saturating_add(1)
        .min(CPUID_GUEST_NR_BASIC);
    for leaf in 1..nr_basic {
        match leaf as u32 {
            // Leaf 2 and 4 describe caches and are not kept. 7 and 0xd have
            // their own tables.
            0x2 | 0x4 | CPUID_FEAT_LEAF | XSTATE_CPUID => {}
            leaf => p.basic[leaf as usize] = platform.cpuid(leaf),
        }
    }

    if p.basic_max_leaf() >= CPUID_FEAT_LEAF {
        p.feat[0] = platform.cpuid_count(CPUID_FEAT_LEAF, 0);
        let nr_feat = (p.feat_max_subleaf() as usize)
            .saturating_add(1)
            .min(CPUID_GUEST_NR_FEAT);
        for subleaf in 1..nr_feat {
            p.feat[subleaf] = platform.cpuid_count(CPUID_FEAT_LEAF, subleaf as u32);
        }
    }

    if p.basic_max_leaf() >= XSTATE_CPUID {
        p.xstate[0] = platform.cpuid_count(XSTATE_CPUID, 0);
        p.xstate[1] = platform.cpuid_count(XSTATE_CPUID, 1);

        let components = p.xcr0() | p.xss();
        for i in 2..CPUID_GUEST_NR_XSTATE.min(63) {
            if components & (1 << i) != 0 {
                p.xstate[i] = platform.cpuid_count(XSTATE_CPUID, i as u32);
            }
        }
    }

    p.extd[0] = platform.cpuid(CPUID_EXTD_BASE);
    let nr_extd = match p.extd_max_leaf().checked_sub(CPUID_EXTD_BASE) {
        Some(max) => (max as usize).saturating_add(1).min(CPUID_GUEST_NR_EXTD),
        None => 1,
    };
    for i in 1..nr_extd {
        p.extd[i] = platform.cpuid(CPUID_EXTD_BASE + i as u32);
    }

    p.vendor = platform.cpu_vendor();

    debug!(
        "Raw CPUID policy: {} basic, {} extended leaves",
        nr_basic, nr_extd
    );

    p
}

/// Features the hypervisor provides whatever the hardware says.
fn synthesised_features(raw: &CpuidPolicy, host_info: &HostInfo) -> FeatureSet {
    let mut fs = FeatureSet::EMPTY
        .with(Feature::HYPERVISOR)
        .with(Feature::APIC);
    // Dropped from the boot capabilities on AMD, but still usable by HVM
    // guests.
    if host_info.vendor == CpuVendor::Amd && raw.has(Feature::SEP) {
        fs.set(Feature::SEP);
    }
    fs
}

pub fn calculate_host_policy(raw: &CpuidPolicy, host_info: &HostInfo) -> CpuidPolicy {
    let mut p = raw.clone();

    p.set_basic_max_leaf(p.basic_max_leaf().min(CPUID_GUEST_NR_BASIC as u32 - 1));
    p.set_feat_max_subleaf(p.feat_max_subleaf().min(CPUID_GUEST_NR_FEAT as u32 - 1));
    let extd_limit = CPUID_EXTD_BASE + CPUID_GUEST_NR_EXTD as u32 - 1;
    if p.extd_max_leaf() > extd_limit {
        p.set_extd_max_leaf(extd_limit);
    }

    let mut fs = host_info.capabilities | synthesised_features(raw, host_info);
    sanitise_featureset(&mut fs);
    p.apply_featureset(&fs);
    recalculate_xstate(&mut p, &host_info.xstate);

    p
}

pub fn calculate_pv_max_policy(host: &CpuidPolicy, host_info: &HostInfo) -> CpuidPolicy {
    let mut p = host.clone();
    let mut fs = host.featureset();

    fs.mask(&PV_FEATURES);
    // PV guests run in ring 3 of a long mode hypervisor, where AMD does not
    // implement SYSENTER.
    if host_info.vendor == CpuVendor::Amd {
        fs.clear(Feature::SEP);
    }
    fs.set(Feature::HYPERVISOR);

    sanitise_featureset(&mut fs);
    p.apply_featureset(&fs);
    recalculate_xstate(&mut p, &host_info.xstate);

    p
}

pub fn calculate_hvm_max_policy(
    raw: &CpuidPolicy,
    host: &CpuidPolicy,
    host_info: &HostInfo,
) -> CpuidPolicy {
    let hvm = &host_info.hvm;
    if !hvm.enabled {
        return CpuidPolicy::default();
    }

    let mut p = host.clone();
    let mut fs = host.featureset();

    fs.mask(if hvm.hap {
        &HVM_HAP_FEATURES
    } else {
        &HVM_SHADOW_FEATURES
    });

    fs.set(Feature::HYPERVISOR);
    // The local APIC is always emulated.
    fs.set(Feature::APIC);

    if host_info.vendor == CpuVendor::Amd && raw.has(Feature::SEP) {
        fs.set(Feature::SEP);
    }

    // VT-x needs entry/exit controls to switch these states.
    if hvm.vmx {
        if !hvm.vmx_mpx {
            fs.clear(Feature::MPX);
        }
        if !hvm.vmx_xsaves {
            fs.clear(Feature::XSAVES);
        }
    }

    sanitise_featureset(&mut fs);
    p.apply_featureset(&fs);
    recalculate_xstate(&mut p, &host_info.xstate);

    p
}

#[cfg(test)]
mod tests {
    use hypervisor::StaticPlatform;

    use super::*;
    use crate::test_util::{amd_platform, intel_dump, intel_platform, no_xsave_platform};
    use crate::x86_64::featureset::KNOWN_FEATURES;

    #[test]
    fn raw_policy_follows_hardware() {
        let platform = intel_platform();
        let raw = calculate_raw_policy(&platform);

        assert_eq!(raw.vendor, CpuVendor::Intel);
        assert_eq!(raw.basic_max_leaf(), 0x16);
        assert_eq!(raw.basic[1], platform.cpuid(1));
        assert_eq!(raw.feat[0], platform.cpuid_count(7, 0));
        // Cache descriptors are skipped.
        assert!(raw.basic[2].is_empty());
        assert!(raw.basic[4].is_empty());
        assert_eq!(raw.xstate[2], platform.cpuid_count(0xd, 2));
        // Supervisor components are probed too.
        assert_eq!(raw.xstate[8], platform.cpuid_count(0xd, 8));
        assert!(raw.xstate[10].is_empty());
        assert_eq!(raw.extd[8], platform.cpuid(0x8000_0008));
    }

    #[test]
    fn host_policy_is_clamped_and_sanitised() {
        let policies = CpuidPolicies::calculate(&intel_platform());
        let host = &policies.host;

        assert_eq!(host.basic_max_leaf(), 0xd);
        assert_eq!(host.feat_max_subleaf(), 0);
        assert_eq!(host.extd_max_leaf(), 0x8000_0008);
        assert!(host.featureset().is_subset(&KNOWN_FEATURES));
        assert!(host.has(Feature::HYPERVISOR));
        assert!(host.has(Feature::AVX512F));
        assert_eq!(host.xstate_max_size(), 2696);
    }

    #[test]
    fn bogus_xstate_geometry_does_not_overflow() {
        let mut dump = intel_dump();
        for entry in dump
            .entries
            .iter_mut()
            .filter(|e| e.leaf == 0xd && e.subleaf == 2)
        {
            entry.value.eax = u32::MAX;
            entry.value.ebx = 0x1000;
        }
        let policies = CpuidPolicies::calculate(&StaticPlatform::new(dump));

        assert!(policies.host.has(Feature::AVX));
        assert_eq!(policies.host.xstate_max_size(), u32::MAX);
    }

    #[test]
    fn max_policies_are_subsets_of_host() {
        for platform in [intel_platform(), amd_platform(), no_xsave_platform()] {
            let policies = CpuidPolicies::calculate(&platform);
            let host = policies.host.featureset();

            assert!(policies.pv_max.featureset().is_subset(&host));
            assert!(policies.hvm_max.featureset().is_subset(&host));
            assert!(policies.pv_max.featureset().is_subset(&PV_FEATURES));
        }
    }

    #[test]
    fn pv_max() {
        let policies = CpuidPolicies::calculate(&intel_platform());
        let pv = &policies.pv_max;

        assert!(pv.has(Feature::HYPERVISOR));
        assert!(pv.has(Feature::LM));
        assert!(!pv.has(Feature::PSE36));
        assert!(!pv.has(Feature::VMX));
        assert!(!pv.has(Feature::PCID));
        // Shared e1d bits only survive where leaf 1 has them.
        assert_eq!(
            pv.extd[1].edx & crate::x86_64::featureset::CPUID_COMMON_1D_FEATURES,
            pv.basic[1].edx & crate::x86_64::featureset::CPUID_COMMON_1D_FEATURES
        );
    }

    #[test]
    fn hvm_max() {
        let policies = CpuidPolicies::calculate(&intel_platform());
        let hvm = &policies.hvm_max;

        assert!(hvm.has(Feature::PCID));
        assert!(hvm.has(Feature::PSE36));
        assert!(hvm.has(Feature::APIC));
        // No VT-x MPX controls on the test host.
        assert!(!hvm.has(Feature::MPX));
        assert!(!hvm.has(Feature::XSAVES));
        assert!(hvm.xcr0() & hypervisor::arch::x86::regs::XSTATE_BNDREGS == 0);
    }

    #[test]
    fn amd_sep() {
        let policies = CpuidPolicies::calculate(&amd_platform());

        assert!(!policies.pv_max.has(Feature::SEP));
        assert!(policies.hvm_max.has(Feature::SEP));
        // Shadow paging only.
        assert!(!policies.hvm_max.has(Feature::PAGE1GB));
        assert!(policies.hvm_max.has(Feature::LWP));
    }

    #[test]
    fn no_hvm() {
        let mut dump = intel_dump();
        dump.hvm.enabled = false;
        let policies = CpuidPolicies::calculate(&StaticPlatform::new(dump));

        assert_eq!(policies.hvm_max, CpuidPolicy::default());
        assert!(policies.pv_max.has(Feature::LM));
    }

    #[test]
    fn global_policies() {
        let first = init_guest_cpuid(&intel_platform());
        let second = init_guest_cpuid(&amd_platform());

        assert!(std::ptr::eq(first, second));
        assert!(std::ptr::eq(guest_cpuid_policies().unwrap(), first));
    }
}
