// SPDX-License-Identifier: Apache-2.0

// What guests of every configuration see on the recorded hosts.

#[path = "../src/test_util.rs"]
mod test_util;

use arch::x86_64::{
    guest_cpuid, lookup_deep_deps, sanitise_featureset, DomainConfig, DomainCpuid, Feature,
    GuestType, LiveContext, VcpuState, CPUID_GUEST_NR_XSTATE, DEEP_FEATURES, KNOWN_FEATURES,
    SPECIAL_FEATURES,
};
use arch::CpuidPolicies;
use hypervisor::arch::x86::regs::{CR0_PE, CR0_PG, CR4_PAE, CR4_PKE, EFER_LMA};
use hypervisor::{CpuidLeaf, Platform, StaticPlatform};
use proptest::prelude::*;
use test_util::{amd_platform, intel_platform, no_xsave_platform};

fn hosts() -> Vec<StaticPlatform> {
    vec![intel_platform(), amd_platform()]
}

fn domain_config() -> impl Strategy<Value = DomainConfig> {
    (
        prop_oneof![Just(GuestType::Pv), Just(GuestType::Hvm)],
        any::<[bool; 7]>(),
    )
        .prop_map(|(guest_type, flags)| DomainConfig {
            guest_type,
            is_32bit: flags[0],
            hap: flags[1],
            hardware_domain: flags[2],
            control_domain: flags[3],
            viridian: flags[4],
            disable_migrate: flags[5],
            vtsc: flags[6],
            paddr_bits: None,
        })
}

fn vcpu_state() -> impl Strategy<Value = VcpuState> {
    (0u32..64, any::<bool>(), any::<bool>(), any::<bool>()).prop_map(
        |(vcpu_id, paging, pae, long_mode)| VcpuState {
            vcpu_id,
            cr0: CR0_PE | if paging { CR0_PG } else { 0 },
            cr4: if pae { CR4_PAE } else { 0 } | CR4_PKE,
            efer: if long_mode { EFER_LMA } else { 0 },
            apic_hw_enabled: true,
            ..Default::default()
        },
    )
}

#[test]
fn max_policies_never_exceed_host() {
    let mut platforms = hosts();
    platforms.push(no_xsave_platform());

    for platform in &platforms {
        let policies = CpuidPolicies::calculate(platform);
        let host = policies.host.featureset();

        assert!(policies.pv_max.featureset().is_subset(&host));
        assert!(policies.hvm_max.featureset().is_subset(&host));
        assert!(host.is_subset(&KNOWN_FEATURES));

        let mut sanitised = host;
        sanitise_featureset(&mut sanitised);
        assert_eq!(sanitised, host);
    }
}

#[test]
fn shadow_paging_hides_pse36_outside_pae() {
    let platform = intel_platform();
    let policies = CpuidPolicies::calculate(&platform);
    let domain = DomainCpuid::new(
        &policies,
        DomainConfig {
            guest_type: GuestType::Hvm,
            hap: false,
            ..Default::default()
        },
    )
    .unwrap();

    for (cr0, cr4, efer) in [
        (0, 0, 0),
        (CR0_PE, 0, 0),
        (CR0_PE | CR0_PG, 0, 0),
        (CR0_PE, CR4_PAE, 0),
    ] {
        let vcpu = VcpuState {
            cr0,
            cr4,
            efer,
            ..Default::default()
        };
        for leaf in [0x1, 0x8000_0001] {
            let res = guest_cpuid(&policies, &platform, &domain, &vcpu, None, leaf, 0);
            assert_eq!(res.edx & Feature::PSE36.mask(), 0, "leaf {leaf:#x} cr0 {cr0:#x}");
        }
    }
}

#[test]
fn no_xsave_host_has_no_xstate_leaf() {
    let platform = no_xsave_platform();
    let policies = CpuidPolicies::calculate(&platform);
    assert!(!policies.host.has(Feature::XSAVE));
    assert!(!policies.host.has(Feature::AVX));

    for guest_type in [GuestType::Pv, GuestType::Hvm] {
        let domain = DomainCpuid::new(
            &policies,
            DomainConfig {
                guest_type,
                hap: true,
                ..Default::default()
            },
        )
        .unwrap();
        let live = LiveContext::new(0, true, 0);

        for subleaf in 0..=CPUID_GUEST_NR_XSTATE as u32 + 1 {
            for live in [None, Some(&live)] {
                let res = guest_cpuid(
                    &policies,
                    &platform,
                    &domain,
                    &VcpuState::default(),
                    live,
                    0xd,
                    subleaf,
                );
                assert!(res.is_empty(), "{guest_type:?} subleaf {subleaf}");
            }
        }
    }
}

#[test]
fn hypervisor_leaf_override_wins() {
    let value = CpuidLeaf::new(0x4000_0005, 0x1234_5678, 0x9abc_def0, 0x0fed_cba9);

    for platform in hosts() {
        let policies = CpuidPolicies::calculate(&platform);

        for viridian in [false, true] {
            let mut domain = DomainCpuid::new(
                &policies,
                DomainConfig {
                    guest_type: GuestType::Hvm,
                    hap: true,
                    viridian,
                    ..Default::default()
                },
            )
            .unwrap();
            let before = guest_cpuid(
                &policies,
                &platform,
                &domain,
                &VcpuState::default(),
                None,
                0x4000_0000,
                0,
            );
            assert_ne!(before, value);

            domain
                .set_leaf(&policies, 0x4000_0000, None, value)
                .unwrap();
            for subleaf in [0, 1, 0xffff] {
                let res = guest_cpuid(
                    &policies,
                    &platform,
                    &domain,
                    &VcpuState::default(),
                    None,
                    0x4000_0000,
                    subleaf,
                );
                assert_eq!(res, value);
            }
        }
    }
}

#[test]
fn overrides_are_clamped_to_the_max_policy() {
    let platform = intel_platform();
    let policies = CpuidPolicies::calculate(&platform);
    let mut domain = DomainCpuid::new(&policies, DomainConfig::default()).unwrap();

    // Asking for every leaf 1 feature only yields what PV guests may have.
    domain
        .set_leaf(
            &policies,
            0x1,
            None,
            CpuidLeaf::new(0, 0, u32::MAX, u32::MAX),
        )
        .unwrap();
    let allowed = policies
        .pv_max
        .featureset()
        .union(SPECIAL_FEATURES)
        .with(Feature::HTT)
        .with(Feature::X2APIC)
        .with(Feature::CMP_LEGACY);
    assert!(domain.policy().featureset().is_subset(&allowed));
    assert!(!domain.policy().has(Feature::VMX));

    // Hiding SSE takes everything built on it.
    let leaf1 = domain.policy().basic[1];
    domain
        .set_leaf(
            &policies,
            0x1,
            None,
            CpuidLeaf::new(
                leaf1.eax,
                leaf1.ebx,
                leaf1.ecx,
                leaf1.edx & !Feature::SSE.mask(),
            ),
        )
        .unwrap();
    for feature in [Feature::SSE2, Feature::SSE4_2, Feature::POPCNT, Feature::LM] {
        assert!(!domain.policy().has(feature), "{feature:?}");
    }
}

proptest! {
    #[test]
    fn thirty_two_bit_guests_never_see_long_mode(
        config in domain_config(),
        vcpu in vcpu_state(),
        amd in any::<bool>(),
    ) {
        let platform = if amd { amd_platform() } else { intel_platform() };
        let policies = CpuidPolicies::calculate(&platform);
        let domain = DomainCpuid::new(&policies, DomainConfig { is_32bit: true, ..config }).unwrap();

        prop_assert!(!domain.policy().has(Feature::LM));
        let res = guest_cpuid(&policies, &platform, &domain, &vcpu, None, 0x8000_0001, 0);
        prop_assert_eq!(res.edx & Feature::LM.mask(), 0);
    }

    #[test]
    fn domain_policies_are_sanitised(config in domain_config(), amd in any::<bool>()) {
        let platform = if amd { amd_platform() } else { intel_platform() };
        let policies = CpuidPolicies::calculate(&platform);
        let domain = DomainCpuid::new(&policies, config).unwrap();
        let fs = domain.policy().featureset();

        prop_assert!(fs.is_subset(&KNOWN_FEATURES));
        for feature in DEEP_FEATURES.iter().filter(|f| !fs.contains(*f)) {
            let deps = lookup_deep_deps(feature).unwrap();
            prop_assert!((fs & *deps).is_empty(), "{:?}", feature);
        }
    }

    #[test]
    fn leaves_beyond_the_maxima_are_empty(
        config in domain_config(),
        vcpu in vcpu_state(),
        max_leaf in prop::option::of(0u32..0xd),
        basic in 0u32..0x100,
        extd in 0u32..0x100,
        subleaf in 0u32..4,
    ) {
        let platform = intel_platform();
        let policies = CpuidPolicies::calculate(&platform);
        let mut domain = DomainCpuid::new(&policies, config).unwrap();
        if let Some(max_leaf) = max_leaf {
            let leaf0 = domain.policy().basic[0];
            domain
                .set_leaf(&policies, 0, None, CpuidLeaf::new(max_leaf, leaf0.ebx, leaf0.ecx, leaf0.edx))
                .unwrap();
        }
        let p = domain.policy();
        let live = LiveContext::new(0, true, 0);

        for live in [None, Some(&live)] {
            if basic > p.basic_max_leaf() {
                let res = guest_cpuid(&policies, &platform, &domain, &vcpu, live, basic, subleaf);
                prop_assert!(res.is_empty(), "{:#x}", basic);
            }
            let extd = 0x8000_0000 | extd;
            if extd > p.extd_max_leaf() {
                let res = guest_cpuid(&policies, &platform, &domain, &vcpu, live, extd, subleaf);
                prop_assert!(res.is_empty(), "{:#x}", extd);
            }
        }
    }

    #[test]
    fn only_the_running_vcpu_sees_live_state(
        config in domain_config(),
        vcpu in vcpu_state(),
        subleaf in 0u32..4,
    ) {
        let platform = intel_platform();
        let policies = CpuidPolicies::calculate(&platform);
        let domain = DomainCpuid::new(&policies, config).unwrap();
        let p = domain.policy();

        prop_assert_eq!(
            guest_cpuid(&policies, &platform, &domain, &vcpu, None, 0x7, 0),
            p.leaf(0x7, 0)
        );
        if p.has(Feature::XSAVE) {
            prop_assert_eq!(
                guest_cpuid(&policies, &platform, &domain, &vcpu, None, 0xd, subleaf),
                p.leaf(0xd, subleaf)
            );
        }

        let live = LiveContext::new(0, true, 0);
        let res = guest_cpuid(&policies, &platform, &domain, &vcpu, Some(&live), 0x7, 0);
        prop_assert_ne!(res.ecx & Feature::OSPKE.mask(), 0);
        if p.has(Feature::XSAVE) {
            let res = guest_cpuid(&policies, &platform, &domain, &vcpu, Some(&live), 0xd, 0);
            prop_assert_eq!(res.ebx, platform.cpuid_count(0xd, 0).ebx);
        }
    }
}
