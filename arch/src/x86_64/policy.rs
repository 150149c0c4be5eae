// SPDX-License-Identifier: Apache-2.0

//! The CPUID policy: the leaves a guest is shown, held as fixed size tables.

use hypervisor::arch::x86::xstate::XSTATE_CPUID;
use hypervisor::arch::x86::{
    CpuVendor, CpuidLeaf, FEATURESET_1C, FEATURESET_1D, FEATURESET_7B0, FEATURESET_7C0,
    FEATURESET_DA1, FEATURESET_E1C, FEATURESET_E1D, FEATURESET_E7D, FEATURESET_E8B, FSCAPINTS,
};
use hypervisor::DumpEntry;
use serde::{Deserialize, Serialize};

use super::featureset::{Feature, FeatureSet};

pub const CPUID_GUEST_NR_BASIC: usize = 0xd + 1;
pub const CPUID_GUEST_NR_FEAT: usize = 1;
pub const CPUID_GUEST_NR_XSTATE: usize = 62 + 1;
pub const CPUID_GUEST_NR_EXTD: usize = 0x1c + 1;

pub const CPUID_EXTD_BASE: u32 = 0x8000_0000;
pub const CPUID_FEAT_LEAF: u32 = 0x7;

/// Number of toolstack override slots per domain.
pub const MAX_CPUID_INPUT: usize = 40;
/// Marks an unused override slot, or a subleaf wildcard.
pub const CPUID_INPUT_UNUSED: u32 = u32::MAX;

const PAGE_SIZE: usize = 4096;

/// A toolstack supplied value for one leaf, or one leaf and subleaf.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct OverrideLeaf {
    pub leaf: u32,
    /// `CPUID_INPUT_UNUSED` matches any subleaf.
    pub subleaf: u32,
    pub value: CpuidLeaf,
}

impl OverrideLeaf {
    pub const UNUSED: OverrideLeaf = OverrideLeaf {
        leaf: CPUID_INPUT_UNUSED,
        subleaf: CPUID_INPUT_UNUSED,
        value: CpuidLeaf::EMPTY,
    };

    pub fn new(leaf: u32, subleaf: Option<u32>, value: CpuidLeaf) -> Self {
        OverrideLeaf {
            leaf,
            subleaf: subleaf.unwrap_or(CPUID_INPUT_UNUSED),
            value,
        }
    }

    pub fn is_unused(&self) -> bool {
        self.leaf == CPUID_INPUT_UNUSED
    }

    pub fn subleaf(&self) -> Option<u32> {
        (self.subleaf != CPUID_INPUT_UNUSED).then_some(self.subleaf)
    }

    pub fn matches(&self, leaf: u32, subleaf: u32) -> bool {
        !self.is_unused()
            && self.leaf == leaf
            && (self.subleaf == CPUID_INPUT_UNUSED || self.subleaf == subleaf)
    }
}

#[derive(Clone, Debug, PartialEq, Eq)]
pub struct CpuidPolicy {
    /// Leaves 0 to 0xd. Leaves 7 and 0xd are kept in `feat` and `xstate`.
    pub basic: [CpuidLeaf; CPUID_GUEST_NR_BASIC],
    /// Subleaves of leaf 7.
    pub feat: [CpuidLeaf; CPUID_GUEST_NR_FEAT],
    /// Subleaves of leaf 0xd.
    pub xstate: [CpuidLeaf; CPUID_GUEST_NR_XSTATE],
    /// Leaves 0x80000000 to 0x8000001c.
    pub extd: [CpuidLeaf; CPUID_GUEST_NR_EXTD],
    pub vendor: CpuVendor,
    /// Only used on per-domain policies.
    pub overrides: [OverrideLeaf; MAX_CPUID_INPUT],
}

// A policy must fit in one page.
const _: () = assert!(std::mem::size_of::<CpuidPolicy>() <= PAGE_SIZE);

impl Default for CpuidPolicy {
    fn default() -> Self {
        CpuidPolicy {
            basic: [CpuidLeaf::EMPTY; CPUID_GUEST_NR_BASIC],
            feat: [CpuidLeaf::EMPTY; CPUID_GUEST_NR_FEAT],
            xstate: [CpuidLeaf::EMPTY; CPUID_GUEST_NR_XSTATE],
            extd: [CpuidLeaf::EMPTY; CPUID_GUEST_NR_EXTD],
            vendor: CpuVendor::Unknown,
            overrides: [OverrideLeaf::UNUSED; MAX_CPUID_INPUT],
        }
    }
}

impl CpuidPolicy {
    pub fn basic_max_leaf(&self) -> u32 {
        self.basic[0].eax
    }

    pub fn set_basic_max_leaf(&mut self, max: u32) {
        self.basic[0].eax = max;
    }

    pub fn feat_max_subleaf(&self) -> u32 {
        self.feat[0].eax
    }

    pub fn set_feat_max_subleaf(&mut self, max: u32) {
        self.feat[0].eax = max;
    }

    pub fn extd_max_leaf(&self) -> u32 {
        self.extd[0].eax
    }

    pub fn set_extd_max_leaf(&mut self, max: u32) {
        self.extd[0].eax = max;
    }

    /// Enabled state components, as reported in XCR0.
    pub fn xcr0(&self) -> u64 {
        (u64::from(self.xstate[0].edx) << 32) | u64::from(self.xstate[0].eax)
    }

    /// Enabled supervisor state components, as reported in IA32_XSS.
    pub fn xss(&self) -> u64 {
        (u64::from(self.xstate[1].edx) << 32) | u64::from(self.xstate[1].ecx)
    }

    /// Size of an XSAVE area holding every enabled component.
    pub fn xstate_max_size(&self) -> u32 {
        self.xstate[0].ecx
    }

    pub fn has(&self, feature: Feature) -> bool {
        self.feature_word(feature.word()) & feature.mask() != 0
    }

    pub fn set_feature(&mut self, feature: Feature, enabled: bool) {
        let word = self.feature_word(feature.word());
        let word = if enabled {
            word | feature.mask()
        } else {
            word & !feature.mask()
        };
        self.set_feature_word(feature.word(), word);
    }

    fn feature_reg(&self, word: usize) -> &u32 {
        match word {
            FEATURESET_1D => &self.basic[1].edx,
            FEATURESET_1C => &self.basic[1].ecx,
            FEATURESET_E1D => &self.extd[1].edx,
            FEATURESET_E1C => &self.extd[1].ecx,
            FEATURESET_DA1 => &self.xstate[1].eax,
            FEATURESET_7B0 => &self.feat[0].ebx,
            FEATURESET_7C0 => &self.feat[0].ecx,
            FEATURESET_E7D => &self.extd[7].edx,
            FEATURESET_E8B => &self.extd[8].ebx,
            _ => unreachable!("feature word {word} out of range"),
        }
    }

    fn feature_reg_mut(&mut self, word: usize) -> &mut u32 {
        match word {
            FEATURESET_1D => &mut self.basic[1].edx,
            FEATURESET_1C => &mut self.basic[1].ecx,
            FEATURESET_E1D => &mut self.extd[1].edx,
            FEATURESET_E1C => &mut self.extd[1].ecx,
            FEATURESET_DA1 => &mut self.xstate[1].eax,
            FEATURESET_7B0 => &mut self.feat[0].ebx,
            FEATURESET_7C0 => &mut self.feat[0].ecx,
            FEATURESET_E7D => &mut self.extd[7].edx,
            FEATURESET_E8B => &mut self.extd[8].ebx,
            _ => unreachable!("feature word {word} out of range"),
        }
    }

    pub fn feature_word(&self, word: usize) -> u32 {
        *self.feature_reg(word)
    }

    pub fn set_feature_word(&mut self, word: usize, value: u32) {
        *self.feature_reg_mut(word) = value;
    }

    /// Gathers the feature registers into a feature set.
    pub fn featureset(&self) -> FeatureSet {
        let mut words = [0u32; FSCAPINTS];
        for (word, value) in words.iter_mut().enumerate() {
            *value = self.feature_word(word);
        }
        FeatureSet::from_words(words)
    }

    /// Scatters a feature set back over the feature registers, leaving every
    /// other field alone.
    pub fn apply_featureset(&mut self, fs: &FeatureSet) {
        for (word, value) in fs.words().iter().enumerate() {
            self.set_feature_word(word, *value);
        }
    }

    /// The stored value of a leaf, ignoring the recorded maxima. Leaves
    /// outside the tables read as zero.
    pub fn leaf(&self, leaf: u32, subleaf: u32) -> CpuidLeaf {
        self.leaf_ref(leaf, subleaf).copied().unwrap_or_default()
    }

    fn leaf_ref(&self, leaf: u32, subleaf: u32) -> Option<&CpuidLeaf> {
        match leaf {
            CPUID_FEAT_LEAF => self.feat.get(subleaf as usize),
            XSTATE_CPUID => self.xstate.get(subleaf as usize),
            CPUID_EXTD_BASE.. => self.extd.get((leaf - CPUID_EXTD_BASE) as usize),
            _ => self.basic.get(leaf as usize),
        }
    }

    /// Mutable access to the stored value of a leaf, if the tables cover it.
    pub fn leaf_mut(&mut self, leaf: u32, subleaf: u32) -> Option<&mut CpuidLeaf> {
        match leaf {
            CPUID_FEAT_LEAF => self.feat.get_mut(subleaf as usize),
            XSTATE_CPUID => self.xstate.get_mut(subleaf as usize),
            CPUID_EXTD_BASE.. => self.extd.get_mut((leaf - CPUID_EXTD_BASE) as usize),
            _ => self.basic.get_mut(leaf as usize),
        }
    }

    /// The first override matching `leaf` and `subleaf`.
    pub fn find_override(&self, leaf: u32, subleaf: u32) -> Option<&OverrideLeaf> {
        self.overrides.iter().find(|o| o.matches(leaf, subleaf))
    }

    pub fn clear_overrides(&mut self) {
        self.overrides = [OverrideLeaf::UNUSED; MAX_CPUID_INPUT];
    }

    /// Every leaf a guest could observe, within the recorded maxima.
    pub fn entries(&self) -> Vec<DumpEntry> {
        let mut entries = Vec::new();
        let mut push = |leaf: u32, subleaf: u32, value: CpuidLeaf| {
            entries.push(DumpEntry {
                leaf,
                subleaf,
                value,
            })
        };

        let max_basic = (self.basic_max_leaf() as usize).min(CPUID_GUEST_NR_BASIC - 1);
        for leaf in 0..=max_basic as u32 {
            match leaf {
                CPUID_FEAT_LEAF => {
                    let max = (self.feat_max_subleaf() as usize).min(CPUID_GUEST_NR_FEAT - 1);
                    for subleaf in 0..=max {
                        push(leaf, subleaf as u32, self.feat[subleaf]);
                    }
                }
                XSTATE_CPUID => {
                    if !self.has(Feature::XSAVE) {
                        continue;
                    }
                    let components = self.xcr0() | self.xss();
                    for (subleaf, value) in self.xstate.iter().enumerate() {
                        if subleaf < 2 || components & (1 << subleaf) != 0 {
                            push(leaf, subleaf as u32, *value);
                        }
                    }
                }
                _ => push(leaf, 0, self.basic[leaf as usize]),
            }
        }

        if self.extd_max_leaf() >= CPUID_EXTD_BASE {
            let max = ((self.extd_max_leaf() - CPUID_EXTD_BASE) as usize).min(CPUID_GUEST_NR_EXTD - 1);
            for (i, value) in self.extd.iter().enumerate().take(max + 1) {
                push(CPUID_EXTD_BASE + i as u32, 0, *value);
            }
        }

        entries
    }
}
