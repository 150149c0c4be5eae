// Copyright © 2019 Intel Corporation
//
// SPDX-License-Identifier: Apache-2.0 OR BSD-3-Clause
//
// Copyright © 2020, Microsoft Corporation
//
// Copyright 2018-2019 CrowdStrike, Inc.
//
//

use std::path::PathBuf;

use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::arch::x86::xstate::XstateGeometry;
use crate::arch::x86::{
    CpuVendor, CpuidLeaf, FEATURESET_1C, FEATURESET_1D, FEATURESET_7B0, FEATURESET_7C0,
    FEATURESET_DA1, FEATURESET_E1C, FEATURESET_E1D, FEATURESET_E7D, FEATURESET_E8B, FSCAPINTS,
};

#[derive(Error, Debug)]
///
/// Enum for platform errors
pub enum PlatformError {
    ///
    /// Reading a recorded CPUID dump failed
    ///
    #[error("Failed to read CPUID dump from {1}")]
    ReadDump(#[source] std::io::Error, PathBuf),
    ///
    /// A recorded CPUID dump is malformed
    ///
    #[error("Failed to parse CPUID dump")]
    ParseDump(#[source] serde_json::Error),
    ///
    /// No native implementation for this architecture
    ///
    #[error("The cpuid instruction is not available on this architecture")]
    Unsupported,
}

/// Hardware virtualization support available to fully virtualized guests.
#[derive(Debug, Default, Clone, Copy, PartialEq, Eq, Deserialize, Serialize)]
pub struct HvmCapabilities {
    /// HVM guests can be created at all.
    pub enabled: bool,
    /// Hardware assisted paging (EPT/NPT) is available.
    pub hap: bool,
    /// VT-x is the assist in use.
    pub vmx: bool,
    /// VT-x can switch the MPX bound configuration on entry/exit.
    pub vmx_mpx: bool,
    /// VT-x can switch MSR_XSS on entry/exit.
    pub vmx_xsaves: bool,
}

/// Physical and linear address widths of the host.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize, Serialize)]
pub struct AddressWidths {
    pub paddr_bits: u8,
    pub vaddr_bits: u8,
}

impl Default for AddressWidths {
    fn default() -> Self {
        AddressWidths {
            paddr_bits: 36,
            vaddr_bits: 48,
        }
    }
}

///
/// Trait to represent the physical CPU the policies are derived from
///
/// Every method must be side effect free and return the same answer for the
/// lifetime of the process, except where noted.
///
pub trait Platform: Send + Sync {
    ///
    /// Execute `cpuid` with the given leaf and subleaf
    ///
    fn cpuid_count(&self, leaf: u32, subleaf: u32) -> CpuidLeaf;
    ///
    /// Execute `cpuid` for a leaf without subleaves
    ///
    fn cpuid(&self, leaf: u32) -> CpuidLeaf {
        self.cpuid_count(leaf, 0)
    }
    ///
    /// Vendor of the boot CPU
    ///
    fn cpu_vendor(&self) -> CpuVendor {
        let leaf = self.cpuid(0);
        CpuVendor::from_signature(leaf.ebx, leaf.ecx, leaf.edx)
    }
    ///
    /// Feature words the host actually supports, after boot time quirks
    ///
    fn host_capabilities(&self) -> [u32; FSCAPINTS] {
        capabilities_from_cpuid(self)
    }
    ///
    /// Hardware virtualization support
    ///
    fn hvm_capabilities(&self) -> HvmCapabilities;
    ///
    /// Address widths reported by leaf 0x80000008
    ///
    fn address_widths(&self) -> AddressWidths {
        address_widths_from_cpuid(self)
    }
    ///
    /// Sizes and offsets of the extended state components
    ///
    fn xstate_geometry(&self) -> XstateGeometry {
        XstateGeometry::probe(self)
    }
}

/// Reads the physical and virtual address widths from leaf 0x80000008.
pub fn address_widths_from_cpuid(platform: &(impl Platform + ?Sized)) -> AddressWidths {
    if platform.cpuid(0x8000_0000).eax < 0x8000_0008 {
        return AddressWidths::default();
    }
    let leaf = platform.cpuid(0x8000_0008);
    AddressWidths {
        paddr_bits: (leaf.eax & 0xff) as u8,
        vaddr_bits: ((leaf.eax >> 8) & 0xff) as u8,
    }
}

// SEP in CPUID.1:EDX.
const SEP_BIT: u32 = 1 << 11;

/// Builds the host capability words straight from the feature leaves.
///
/// SYSENTER cannot be used from long mode on AMD, so SEP is dropped there.
pub fn capabilities_from_cpuid(platform: &(impl Platform + ?Sized)) -> [u32; FSCAPINTS] {
    let mut words = [0u32; FSCAPINTS];
    let max_basic = platform.cpuid(0).eax;
    let max_extd = platform.cpuid(0x8000_0000).eax;

    if max_basic >= 0x1 {
        let leaf = platform.cpuid(0x1);
        words[FEATURESET_1D] = leaf.edx;
        words[FEATURESET_1C] = leaf.ecx;
    }
    if max_basic >= 0x7 {
        let leaf = platform.cpuid_count(0x7, 0);
        words[FEATURESET_7B0] = leaf.ebx;
        words[FEATURESET_7C0] = leaf.ecx;
    }
    if max_basic >= 0xd {
        words[FEATURESET_DA1] = platform.cpuid_count(0xd, 1).eax;
    }
    if max_extd >= 0x8000_0001 {
        let leaf = platform.cpuid(0x8000_0001);
        words[FEATURESET_E1D] = leaf.edx;
        words[FEATURESET_E1C] = leaf.ecx;
    }
    if max_extd >= 0x8000_0007 {
        words[FEATURESET_E7D] = platform.cpuid(0x8000_0007).edx;
    }
    if max_extd >= 0x8000_0008 {
        words[FEATURESET_E8B] = platform.cpuid(0x8000_0008).ebx;
    }

    if platform.cpu_vendor() == CpuVendor::Amd {
        words[FEATURESET_1D] &= !SEP_BIT;
    }

    words
}
