// Copyright 2018 Amazon.com, Inc. or its affiliates. All Rights Reserved.
// SPDX-License-Identifier: Apache-2.0

use std::arch::x86_64::__cpuid_count;

use log::debug;

use crate::arch::x86::CpuidLeaf;
use crate::platform::{HvmCapabilities, Platform};

// CPUID.1:ECX.VMX
const VMX_BIT: u32 = 1 << 5;
// CPUID.80000001:ECX.SVM
const SVM_BIT: u32 = 1 << 2;
// CPUID.7.0:EBX.MPX
const MPX_BIT: u32 = 1 << 14;
// CPUID.D.1:EAX.XSAVES
const XSAVES_BIT: u32 = 1 << 3;

/// The CPU this process is running on.
///
/// The VMX/SVM capability MSRs are not readable from here, so the assists
/// are inferred from the feature leaves: any host advertising VMX or SVM is
/// assumed to also provide EPT/NPT and the MPX/XSS entry and exit controls
/// for features it reports.
pub struct NativePlatform {
    hvm: HvmCapabilities,
}

impl NativePlatform {
    pub fn new() -> Self {
        let mut platform = NativePlatform {
            hvm: HvmCapabilities::default(),
        };

        let max_basic = platform.cpuid(0).eax;
        let vmx = max_basic >= 1 && platform.cpuid(1).ecx & VMX_BIT != 0;
        let svm = platform.cpuid(0x8000_0000).eax >= 0x8000_0001
            && platform.cpuid(0x8000_0001).ecx & SVM_BIT != 0;
        let mpx = max_basic >= 7 && platform.cpuid_count(7, 0).ebx & MPX_BIT != 0;
        let xsaves = max_basic >= 0xd && platform.cpuid_count(0xd, 1).eax & XSAVES_BIT != 0;

        platform.hvm = HvmCapabilities {
            enabled: vmx || svm,
            hap: vmx || svm,
            vmx,
            vmx_mpx: vmx && mpx,
            vmx_xsaves: vmx && xsaves,
        };
        debug!("Native HVM capabilities: {:?}", platform.hvm);

        platform
    }
}

impl Default for NativePlatform {
    fn default() -> Self {
        Self::new()
    }
}

impl Platform for NativePlatform {
    fn cpuid_count(&self, leaf: u32, subleaf: u32) -> CpuidLeaf {
        // SAFETY: every x86_64 CPU implements the cpuid instruction.
        #[allow(unused_unsafe)]
        let result = unsafe { __cpuid_count(leaf, subleaf) };
        CpuidLeaf::new(result.eax, result.ebx, result.ecx, result.edx)
    }

    fn hvm_capabilities(&self) -> HvmCapabilities {
        self.hvm
    }
}
