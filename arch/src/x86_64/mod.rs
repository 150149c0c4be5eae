// Copyright © 2020, Oracle and/or its affiliates.
//
// Copyright 2018 Amazon.com, Inc. or its affiliates. All Rights Reserved.
// SPDX-License-Identifier: Apache-2.0

//! x86 CPUID policies: the feature sets guests may see, the system wide
//! policies derived from the host, the per-domain policies and the guest
//! `cpuid` dispatcher.

pub mod deep_deps;
pub mod domain;
pub mod featureset;
pub mod guest;
pub mod policies;
pub mod policy;
pub mod sanitise;
pub mod xstate;

pub use deep_deps::{lookup_deep_deps, DeepDependency, DEEP_FEATURES};
pub use domain::{
    recalculate_cpuid_policy, DomainConfig, DomainCpuid, GuestType, HeapAllocator,
    PolicyAllocator,
};
pub use featureset::{
    Feature, FeatureSet, CPUID_COMMON_1D_FEATURES, HVM_HAP_FEATURES, HVM_SHADOW_FEATURES,
    KNOWN_FEATURES, PV_FEATURES, SPECIAL_FEATURES,
};
pub use guest::{
    guest_cpuid, DefaultHypervisorLeaves, GuestCpuid, HypervisorLeaves, LiveContext, VcpuState,
    Vpmu,
};
pub use policies::{
    calculate_hvm_max_policy, calculate_host_policy, calculate_pv_max_policy,
    calculate_raw_policy, guest_cpuid_policies, init_guest_cpuid, CpuidPolicies, HostInfo,
};
pub use policy::{
    CpuidPolicy, OverrideLeaf, CPUID_GUEST_NR_BASIC, CPUID_GUEST_NR_EXTD, CPUID_GUEST_NR_FEAT,
    CPUID_GUEST_NR_XSTATE, CPUID_INPUT_UNUSED, MAX_CPUID_INPUT,
};
pub use sanitise::{closure_pass, reconcile_vendor_duplicates, sanitise_featureset};
pub use xstate::recalculate_xstate;
