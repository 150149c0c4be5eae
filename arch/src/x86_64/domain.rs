// SPDX-License-Identifier: Apache-2.0

//! Per-domain CPUID policies.

use std::alloc::{alloc, Layout};

use hypervisor::arch::x86::xstate::XSTATE_CPUID;
use hypervisor::{CpuVendor, CpuidLeaf};
use log::{debug, warn};
use serde::{Deserialize, Serialize};

use super::featureset::{Feature, HVM_SHADOW_FEATURES, SPECIAL_FEATURES};
use super::policies::CpuidPolicies;
use super::policy::{CpuidPolicy, OverrideLeaf, CPUID_INPUT_UNUSED};
use super::sanitise::sanitise_featureset;
use super::xstate::recalculate_xstate;
use crate::{Error, Result};

#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum GuestType {
    /// Paravirtualized.
    #[default]
    Pv,
    /// Fully virtualized.
    Hvm,
}

/// Domain properties the CPUID policy depends on.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct DomainConfig {
    pub guest_type: GuestType,
    /// The guest only runs 32-bit code.
    pub is_32bit: bool,
    /// HVM guest using hardware assisted paging.
    pub hap: bool,
    pub hardware_domain: bool,
    pub control_domain: bool,
    /// HVM guest with the Hyper-V enlightenments enabled.
    pub viridian: bool,
    pub disable_migrate: bool,
    /// TSC accesses are emulated.
    pub vtsc: bool,
    /// Guest physical address width. The host's when unset.
    pub paddr_bits: Option<u8>,
}

impl DomainConfig {
    pub fn is_hvm(&self) -> bool {
        self.guest_type == GuestType::Hvm
    }

    /// Privileged domains see the real hardware for leaves they did not
    /// override.
    pub fn is_privileged(&self) -> bool {
        self.hardware_domain || self.control_domain
    }
}

/// Allocation of per-domain policies. Allocation failure is reported rather
/// than aborting.
pub trait PolicyAllocator {
    fn allocate(&self, template: &CpuidPolicy) -> Option<Box<CpuidPolicy>>;
}

/// Allocates from the global heap.
pub struct HeapAllocator;

impl PolicyAllocator for HeapAllocator {
    fn allocate(&self, template: &CpuidPolicy) -> Option<Box<CpuidPolicy>> {
        let layout = Layout::new::<CpuidPolicy>();

        // SAFETY: CpuidPolicy is not zero sized.
        let ptr = unsafe { alloc(layout) } as *mut CpuidPolicy;
        if ptr.is_null() {
            return None;
        }

        // SAFETY: ptr is non null and was allocated with the layout of
        // CpuidPolicy, which is the layout Box deallocates with. It is
        // initialized before the Box takes ownership.
        unsafe {
            ptr.write(template.clone());
            Some(Box::from_raw(ptr))
        }
    }
}

/// Re-derives the structured parts of a domain policy after its features,
/// maxima or configuration changed.
pub fn recalculate_cpuid_policy(
    p: &mut CpuidPolicy,
    config: &DomainConfig,
    policies: &CpuidPolicies,
) {
    let max = match config.guest_type {
        GuestType::Pv => &policies.pv_max,
        GuestType::Hvm => &policies.hvm_max,
    };
    let host_info = &policies.host_info;
    let mut fs = p.featureset();
    let mut max_fs = max.featureset();

    p.set_basic_max_leaf(p.basic_max_leaf().min(max.basic_max_leaf()));
    p.set_feat_max_subleaf(p.feat_max_subleaf().min(max.feat_max_subleaf()));
    p.set_extd_max_leaf(p.extd_max_leaf().min(max.extd_max_leaf()));

    if config.is_hvm() && !config.hap {
        max_fs.mask(&HVM_SHADOW_FEATURES);
    }

    // Topology is left to the toolstack.
    max_fs.set(Feature::HTT);
    max_fs.set(Feature::X2APIC);
    max_fs.set(Feature::CMP_LEGACY);

    if config.is_32bit {
        max_fs.clear(Feature::LM);
        if host_info.vendor != CpuVendor::Amd {
            max_fs.clear(Feature::SYSCALL);
        }
    }

    // An invariant TSC is only safe to expose when the TSC cannot change
    // under the guest's feet.
    if host_info.has(Feature::ITSC) && (config.disable_migrate || config.vtsc) {
        max_fs.set(Feature::ITSC);
    }

    fs.mask(&max_fs);

    if p.basic_max_leaf() < XSTATE_CPUID {
        fs.clear(Feature::XSAVE);
    }

    sanitise_featureset(&mut fs);

    fs.remove(&SPECIAL_FEATURES);
    fs |= host_info.capabilities & SPECIAL_FEATURES;

    p.apply_featureset(&fs);
    recalculate_xstate(p, &host_info.xstate);
}

/// The CPUID state of one domain.
///
/// Only `&mut self` methods change the policy, so a policy is never read
/// while it is being recalculated.
#[derive(Debug)]
pub struct DomainCpuid {
    config: DomainConfig,
    policy: Box<CpuidPolicy>,
    generation: u64,
}

impl DomainCpuid {
    pub fn new(policies: &CpuidPolicies, config: DomainConfig) -> Result<Self> {
        Self::new_in(policies, config, &HeapAllocator)
    }

    /// Creates the policy of a new domain from the maximum policy of its
    /// guest type.
    pub fn new_in(
        policies: &CpuidPolicies,
        config: DomainConfig,
        allocator: &dyn PolicyAllocator,
    ) -> Result<Self> {
        let template = match config.guest_type {
            GuestType::Pv => &policies.pv_max,
            GuestType::Hvm => &policies.hvm_max,
        };

        let mut policy = allocator
            .allocate(template)
            .ok_or(Error::PolicyAllocation)?;
        recalculate_cpuid_policy(&mut policy, &config, policies);
        policy.clear_overrides();

        debug!("Created {:?} CPUID policy: {:?}", config.guest_type, config);

        Ok(DomainCpuid {
            config,
            policy,
            generation: 0,
        })
    }

    pub fn config(&self) -> &DomainConfig {
        &self.config
    }

    pub fn policy(&self) -> &CpuidPolicy {
        &self.policy
    }

    /// Bumped whenever the policy may have changed. Cached guest visible
    /// values older than this must be discarded.
    pub fn generation(&self) -> u64 {
        self.generation
    }

    pub fn recalculate(&mut self, policies: &CpuidPolicies) {
        recalculate_cpuid_policy(&mut self.policy, &self.config, policies);
        self.generation += 1;
        debug!(
            "Recalculated {:?} CPUID policy, generation {}",
            self.config.guest_type, self.generation
        );
    }

    /// Replaces the domain configuration. The guest type is fixed at creation.
    pub fn set_config(&mut self, policies: &CpuidPolicies, config: DomainConfig) -> Result<()> {
        if config.guest_type != self.config.guest_type {
            return Err(Error::GuestTypeChange);
        }

        self.config = config;
        self.recalculate(policies);
        Ok(())
    }

    /// Records a toolstack supplied leaf and folds it into the policy.
    ///
    /// `subleaf` of `None` matches every subleaf. Setting the same leaf and
    /// subleaf again replaces the previous value.
    pub fn set_leaf(
        &mut self,
        policies: &CpuidPolicies,
        leaf: u32,
        subleaf: Option<u32>,
        value: CpuidLeaf,
    ) -> Result<()> {
        if leaf == CPUID_INPUT_UNUSED || subleaf == Some(CPUID_INPUT_UNUSED) {
            return Err(Error::InvalidOverride(leaf));
        }

        let entry = OverrideLeaf::new(leaf, subleaf, value);
        let slot = self
            .policy
            .overrides
            .iter()
            .position(|o| o.leaf == entry.leaf && o.subleaf == entry.subleaf)
            .or_else(|| self.policy.overrides.iter().position(OverrideLeaf::is_unused));
        let Some(slot) = slot else {
            warn!("No free CPUID override slot for leaf {:#x}", leaf);
            return Err(Error::OverrideTableFull(leaf));
        };
        self.policy.overrides[slot] = entry;

        if let Some(stored) = self.policy.leaf_mut(leaf, subleaf.unwrap_or(0)) {
            *stored = value;
        }
        if leaf == 0 {
            self.policy.vendor = CpuVendor::from_signature(value.ebx, value.ecx, value.edx);
        }

        debug!(
            "CPUID override {:#x}:{:?} = {:x?}",
            leaf, subleaf, value
        );

        self.recalculate(policies);
        Ok(())
    }

    pub fn clear_overrides(&mut self) {
        self.policy.clear_overrides();
        self.generation += 1;
    }
}

#[cfg(test)]
mod tests {
    use hypervisor::arch::x86::regs::{XSTATE_FP_SSE, XSTATE_PKRU};

    use super::*;
    use crate::test_util::{amd_platform, intel_platform};
    use crate::x86_64::policy::MAX_CPUID_INPUT;

    struct FailingAllocator;

    impl PolicyAllocator for FailingAllocator {
        fn allocate(&self, _template: &CpuidPolicy) -> Option<Box<CpuidPolicy>> {
            None
        }
    }

    fn hvm(hap: bool) -> DomainConfig {
        DomainConfig {
            guest_type: GuestType::Hvm,
            hap,
            ..Default::default()
        }
    }

    #[test]
    fn config_from_json() {
        let config: DomainConfig =
            serde_json::from_str(r#"{ "guest_type": "hvm", "hap": true, "paddr_bits": 39 }"#)
                .unwrap();
        assert_eq!(
            config,
            DomainConfig {
                guest_type: GuestType::Hvm,
                hap: true,
                paddr_bits: Some(39),
                ..Default::default()
            }
        );

        let config: DomainConfig = serde_json::from_str("{}").unwrap();
        assert_eq!(config, DomainConfig::default());
        assert!(serde_json::from_str::<DomainConfig>(r#"{ "guest_type": "pvh" }"#).is_err());
    }

    #[test]
    fn new_pv_domain() {
        let policies = CpuidPolicies::calculate(&intel_platform());
        let domain = DomainCpuid::new(&policies, DomainConfig::default()).unwrap();
        let p = domain.policy();

        assert_eq!(domain.generation(), 0);
        assert!(p.overrides.iter().all(OverrideLeaf::is_unused));
        assert!(p.has(Feature::LM));
        assert!(p.has(Feature::HYPERVISOR));
        assert!(p
            .featureset()
            .is_subset(&(policies.pv_max.featureset() | policies.host.featureset())));
        assert!(!p.has(Feature::ITSC));
    }

    #[test]
    fn allocation_failure() {
        let policies = CpuidPolicies::calculate(&intel_platform());
        let err = DomainCpuid::new_in(&policies, DomainConfig::default(), &FailingAllocator)
            .unwrap_err();
        assert!(matches!(err, Error::PolicyAllocation));
    }

    #[test]
    fn bitness() {
        let config = DomainConfig {
            is_32bit: true,
            ..Default::default()
        };

        let intel = CpuidPolicies::calculate(&intel_platform());
        let p = DomainCpuid::new(&intel, config).unwrap();
        assert!(!p.policy().has(Feature::LM));
        assert!(!p.policy().has(Feature::SYSCALL));
        assert!(!p.policy().has(Feature::PCID));

        let amd = CpuidPolicies::calculate(&amd_platform());
        let p = DomainCpuid::new(&amd, config).unwrap();
        assert!(!p.policy().has(Feature::LM));
        assert!(p.policy().has(Feature::SYSCALL));
    }

    #[test]
    fn paging_modes() {
        let policies = CpuidPolicies::calculate(&intel_platform());

        let hap = DomainCpuid::new(&policies, hvm(true)).unwrap();
        assert!(hap.policy().has(Feature::PAGE1GB));
        assert!(hap.policy().has(Feature::INVPCID));

        let shadow = DomainCpuid::new(&policies, hvm(false)).unwrap();
        for feature in [Feature::PAGE1GB, Feature::PCID, Feature::INVPCID, Feature::PKU] {
            assert!(!shadow.policy().has(feature), "{feature:?}");
        }
        assert!(shadow.policy().has(Feature::PSE36));
    }

    #[test]
    fn invariant_tsc() {
        let policies = CpuidPolicies::calculate(&intel_platform());
        let itsc = CpuidLeaf::new(0, 0, 0, Feature::ITSC.mask());

        let mut migratable = DomainCpuid::new(&policies, DomainConfig::default()).unwrap();
        migratable
            .set_leaf(&policies, 0x8000_0007, None, itsc)
            .unwrap();
        assert!(!migratable.policy().has(Feature::ITSC));

        let mut pinned = DomainCpuid::new(&policies, DomainConfig::default()).unwrap();
        pinned
            .set_config(
                &policies,
                DomainConfig {
                    disable_migrate: true,
                    ..Default::default()
                },
            )
            .unwrap();
        assert_eq!(pinned.generation(), 1);
        pinned.set_leaf(&policies, 0x8000_0007, None, itsc).unwrap();
        assert!(pinned.policy().has(Feature::ITSC));

        assert!(matches!(
            pinned.set_config(&policies, hvm(true)),
            Err(Error::GuestTypeChange)
        ));
    }

    #[test]
    fn overrides_are_sanitised() {
        let policies = CpuidPolicies::calculate(&intel_platform());
        let mut domain = DomainCpuid::new(&policies, hvm(true)).unwrap();
        assert!(domain.policy().has(Feature::AVX2));

        let mut leaf1 = domain.policy().basic[1];
        leaf1.ecx &= !Feature::AVX.mask();
        domain.set_leaf(&policies, 1, None, leaf1).unwrap();

        let p = domain.policy();
        assert!(!p.has(Feature::AVX));
        assert!(!p.has(Feature::AVX2));
        assert!(!p.has(Feature::AVX512F));
        assert!(p.has(Feature::XSAVE));
        assert_eq!(p.xcr0(), XSTATE_FP_SSE | XSTATE_PKRU);
        assert_eq!(p.find_override(1, 5).unwrap().value, leaf1);
        assert_eq!(domain.generation(), 1);
    }

    #[test]
    fn special_features_follow_host() {
        let policies = CpuidPolicies::calculate(&intel_platform());
        let mut domain = DomainCpuid::new(&policies, DomainConfig::default()).unwrap();

        let mut leaf7 = domain.policy().feat[0];
        leaf7.ebx &= !(Feature::FDP_EXCP_ONLY.mask() | Feature::NO_FPU_SEL.mask());
        domain.set_leaf(&policies, 7, Some(0), leaf7).unwrap();

        assert!(domain.policy().has(Feature::FDP_EXCP_ONLY));
        assert!(domain.policy().has(Feature::NO_FPU_SEL));
    }

    #[test]
    fn lowering_max_leaf_drops_xsave() {
        let policies = CpuidPolicies::calculate(&intel_platform());
        let mut domain = DomainCpuid::new(&policies, DomainConfig::default()).unwrap();

        let mut leaf0 = domain.policy().basic[0];
        leaf0.eax = 0x6;
        domain.set_leaf(&policies, 0, None, leaf0).unwrap();

        let p = domain.policy();
        assert_eq!(p.basic_max_leaf(), 0x6);
        assert_eq!(p.vendor, CpuVendor::Intel);
        assert!(!p.has(Feature::XSAVE));
        assert!(!p.has(Feature::AVX));
        assert_eq!(p.xcr0(), 0);

        // Maxima can only shrink.
        leaf0.eax = 0x20;
        domain.set_leaf(&policies, 0, None, leaf0).unwrap();
        assert_eq!(domain.policy().basic_max_leaf(), 0xd);
    }

    #[test]
    fn override_table() {
        let policies = CpuidPolicies::calculate(&intel_platform());
        let mut domain = DomainCpuid::new(&policies, DomainConfig::default()).unwrap();
        let value = CpuidLeaf::new(1, 2, 3, 4);

        for i in 0..MAX_CPUID_INPUT as u32 {
            domain
                .set_leaf(&policies, 0x4000_0000, Some(i), value)
                .unwrap();
        }
        // Replacing an existing entry needs no new slot.
        domain
            .set_leaf(&policies, 0x4000_0000, Some(3), CpuidLeaf::EMPTY)
            .unwrap();
        assert!(domain.policy().find_override(0x4000_0000, 3).unwrap().value.is_empty());

        assert!(matches!(
            domain.set_leaf(&policies, 0x4000_0001, None, value),
            Err(Error::OverrideTableFull(0x4000_0001))
        ));
        assert!(matches!(
            domain.set_leaf(&policies, CPUID_INPUT_UNUSED, None, value),
            Err(Error::InvalidOverride(_))
        ));

        let generation = domain.generation();
        domain.clear_overrides();
        assert!(domain.policy().find_override(0x4000_0000, 0).is_none());
        assert!(domain.generation() > generation);
    }
}
