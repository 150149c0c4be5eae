// SPDX-License-Identifier: Apache-2.0

//! A platform replaying a recorded CPUID dump.
//!
//! Dumps are JSON documents listing `(leaf, subleaf, eax, ebx, ecx, edx)`
//! entries, optionally followed by the HVM assists and the host capability
//! words of the machine they were taken on. They let the policies of another
//! machine be computed (and tested) on any host.

use std::collections::BTreeMap;
use std::fs;
use std::path::Path;

use serde::{Deserialize, Serialize};

use crate::arch::x86::{deserialize_from_hex, serialize_as_hex, CpuidLeaf, FSCAPINTS};
use crate::platform::{
    address_widths_from_cpuid, capabilities_from_cpuid, AddressWidths, HvmCapabilities, Platform,
    PlatformError,
};

/// Leaves whose output depends on the subleaf in `ecx`. Everything else
/// ignores `ecx`, as the hardware does.
const SUBLEAF_INDEXED: &[u32] = &[
    0x4, 0x7, 0xb, 0xd, 0xf, 0x10, 0x12, 0x14, 0x17, 0x18, 0x1d, 0x1f, 0x8000_001d, 0x8000_0020,
];

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct DumpEntry {
    #[serde(serialize_with = "serialize_as_hex")]
    #[serde(deserialize_with = "deserialize_from_hex")]
    pub leaf: u32,
    #[serde(serialize_with = "serialize_as_hex")]
    #[serde(deserialize_with = "deserialize_from_hex")]
    pub subleaf: u32,
    #[serde(flatten)]
    pub value: CpuidLeaf,
}

#[derive(Debug, Default, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CpuidDump {
    pub entries: Vec<DumpEntry>,
    #[serde(default)]
    pub hvm: HvmCapabilities,
    /// Host capability words. Derived from the feature leaves when absent.
    #[serde(default)]
    pub capabilities: Option<Vec<u32>>,
    #[serde(default)]
    pub address_widths: Option<AddressWidths>,
}

pub struct StaticPlatform {
    leaves: BTreeMap<(u32, u32), CpuidLeaf>,
    hvm: HvmCapabilities,
    capabilities: Option<[u32; FSCAPINTS]>,
    address_widths: Option<AddressWidths>,
}

impl StaticPlatform {
    pub fn new(dump: CpuidDump) -> Self {
        let capabilities = dump.capabilities.map(|words| {
            let mut fixed = [0u32; FSCAPINTS];
            for (dst, src) in fixed.iter_mut().zip(words) {
                *dst = src;
            }
            fixed
        });

        StaticPlatform {
            leaves: dump
                .entries
                .into_iter()
                .map(|e| ((e.leaf, e.subleaf), e.value))
                .collect(),
            hvm: dump.hvm,
            capabilities,
            address_widths: dump.address_widths,
        }
    }

    pub fn from_json(json: &str) -> Result<Self, PlatformError> {
        let dump: CpuidDump = serde_json::from_str(json).map_err(PlatformError::ParseDump)?;
        Ok(Self::new(dump))
    }

    pub fn from_file(path: &Path) -> Result<Self, PlatformError> {
        let json = fs::read_to_string(path)
            .map_err(|e| PlatformError::ReadDump(e, path.to_path_buf()))?;
        Self::from_json(&json)
    }

    /// Records every leaf and subleaf reachable on `platform`.
    pub fn record(platform: &dyn Platform) -> CpuidDump {
        let mut entries = Vec::new();
        let mut push = |leaf: u32, subleaf: u32| {
            entries.push(DumpEntry {
                leaf,
                subleaf,
                value: platform.cpuid_count(leaf, subleaf),
            })
        };

        for base in [0u32, 0x8000_0000] {
            let max = platform.cpuid(base).eax;
            if max < base || max - base > 0xff {
                push(base, 0);
                continue;
            }
            for leaf in base..=max {
                if SUBLEAF_INDEXED.contains(&leaf) {
                    for subleaf in 0..64 {
                        push(leaf, subleaf);
                    }
                } else {
                    push(leaf, 0);
                }
            }
        }

        CpuidDump {
            entries,
            hvm: platform.hvm_capabilities(),
            capabilities: Some(platform.host_capabilities().to_vec()),
            address_widths: Some(platform.address_widths()),
        }
    }

}

impl Platform for StaticPlatform {
    fn cpuid_count(&self, leaf: u32, subleaf: u32) -> CpuidLeaf {
        let subleaf = if SUBLEAF_INDEXED.contains(&leaf) {
            subleaf
        } else {
            0
        };
        self.leaves
            .get(&(leaf, subleaf))
            .copied()
            .unwrap_or_default()
    }

    fn host_capabilities(&self) -> [u32; FSCAPINTS] {
        self.capabilities
            .unwrap_or_else(|| capabilities_from_cpuid(self))
    }

    fn hvm_capabilities(&self) -> HvmCapabilities {
        self.hvm
    }

    fn address_widths(&self) -> AddressWidths {
        self.address_widths
            .unwrap_or_else(|| address_widths_from_cpuid(self))
    }
}
