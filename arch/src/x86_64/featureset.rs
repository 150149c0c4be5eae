// SPDX-License-Identifier: Apache-2.0

//! Feature sets: every architectural feature flag of the CPUID feature leaves,
//! flattened into one fixed width bit vector.

use std::fmt;
use std::ops::{BitAnd, BitAndAssign, BitOr, BitOrAssign, Not};

use hypervisor::arch::x86::{
    FEATURESET_1C, FEATURESET_1D, FEATURESET_7B0, FEATURESET_7C0, FEATURESET_DA1,
    FEATURESET_E1C, FEATURESET_E1D, FEATURESET_E7D, FEATURESET_E8B, FSCAPINTS,
};

/// One feature flag, identified by `word * 32 + bit`.
#[derive(Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct Feature(u32);

impl Feature {
    pub const fn new(word: usize, bit: u32) -> Self {
        assert!(word < FSCAPINTS && bit < 32);
        Feature(word as u32 * 32 + bit)
    }

    pub const fn index(self) -> u32 {
        self.0
    }

    pub const fn word(self) -> usize {
        (self.0 / 32) as usize
    }

    /// Mask of this feature within its register.
    pub const fn mask(self) -> u32 {
        1 << (self.0 % 32)
    }

    pub fn name(self) -> Option<&'static str> {
        FEATURES
            .iter()
            .find(|(f, _, _)| *f == self)
            .map(|(_, name, _)| *name)
    }
}

impl fmt::Debug for Feature {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        match self.name() {
            Some(name) => write!(f, "{}", name),
            None => write!(f, "Feature({}*32+{})", self.word(), self.0 % 32),
        }
    }
}

/// Which guests a feature may be offered to.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
enum Offer {
    /// Known, but never offered by default.
    No,
    /// PV and HVM guests.
    All,
    /// HVM guests, including shadow paging.
    Shadow,
    /// HVM guests with hardware assisted paging only.
    Hap,
}

macro_rules! feature_table {
    ($($name:ident = ($word:ident, $bit:literal, $offer:ident),)*) => {
        impl Feature {
            $(pub const $name: Feature = Feature::new($word, $bit);)*
        }

        const FEATURES: &[(Feature, &str, Offer)] = &[
            $((Feature::$name, stringify!($name), Offer::$offer),)*
        ];
    };
}

feature_table! {
    // CPUID.1:EDX
    FPU = (FEATURESET_1D, 0, All),
    VME = (FEATURESET_1D, 1, Shadow),
    DE = (FEATURESET_1D, 2, All),
    PSE = (FEATURESET_1D, 3, Shadow),
    TSC = (FEATURESET_1D, 4, All),
    MSR = (FEATURESET_1D, 5, All),
    PAE = (FEATURESET_1D, 6, All),
    MCE = (FEATURESET_1D, 7, All),
    CX8 = (FEATURESET_1D, 8, All),
    APIC = (FEATURESET_1D, 9, All),
    SEP = (FEATURESET_1D, 11, All),
    MTRR = (FEATURESET_1D, 12, Shadow),
    PGE = (FEATURESET_1D, 13, Shadow),
    MCA = (FEATURESET_1D, 14, All),
    CMOV = (FEATURESET_1D, 15, All),
    PAT = (FEATURESET_1D, 16, All),
    PSE36 = (FEATURESET_1D, 17, Shadow),
    CLFLUSH = (FEATURESET_1D, 19, All),
    DS = (FEATURESET_1D, 21, No),
    ACPI = (FEATURESET_1D, 22, All),
    MMX = (FEATURESET_1D, 23, All),
    FXSR = (FEATURESET_1D, 24, All),
    SSE = (FEATURESET_1D, 25, All),
    SSE2 = (FEATURESET_1D, 26, All),
    SS = (FEATURESET_1D, 27, All),
    HTT = (FEATURESET_1D, 28, No),
    TM1 = (FEATURESET_1D, 29, No),
    PBE = (FEATURESET_1D, 31, No),

    // CPUID.1:ECX
    SSE3 = (FEATURESET_1C, 0, All),
    PCLMULQDQ = (FEATURESET_1C, 1, All),
    DTES64 = (FEATURESET_1C, 2, No),
    MONITOR = (FEATURESET_1C, 3, No),
    DSCPL = (FEATURESET_1C, 4, No),
    VMX = (FEATURESET_1C, 5, No),
    SMX = (FEATURESET_1C, 6, No),
    EIST = (FEATURESET_1C, 7, No),
    TM2 = (FEATURESET_1C, 8, No),
    SSSE3 = (FEATURESET_1C, 9, All),
    FMA = (FEATURESET_1C, 12, All),
    CX16 = (FEATURESET_1C, 13, All),
    XTPR = (FEATURESET_1C, 14, No),
    PDCM = (FEATURESET_1C, 15, No),
    PCID = (FEATURESET_1C, 17, Hap),
    DCA = (FEATURESET_1C, 18, No),
    SSE4_1 = (FEATURESET_1C, 19, All),
    SSE4_2 = (FEATURESET_1C, 20, All),
    X2APIC = (FEATURESET_1C, 21, Shadow),
    MOVBE = (FEATURESET_1C, 22, All),
    POPCNT = (FEATURESET_1C, 23, All),
    TSC_DEADLINE = (FEATURESET_1C, 24, Shadow),
    AESNI = (FEATURESET_1C, 25, All),
    XSAVE = (FEATURESET_1C, 26, All),
    OSXSAVE = (FEATURESET_1C, 27, No),
    AVX = (FEATURESET_1C, 28, All),
    F16C = (FEATURESET_1C, 29, All),
    RDRAND = (FEATURESET_1C, 30, All),
    HYPERVISOR = (FEATURESET_1C, 31, All),

    // CPUID.80000001:EDX, on top of the bits shared with CPUID.1:EDX
    SYSCALL = (FEATURESET_E1D, 11, All),
    NX = (FEATURESET_E1D, 20, All),
    MMXEXT = (FEATURESET_E1D, 22, All),
    FFXSR = (FEATURESET_E1D, 25, All),
    PAGE1GB = (FEATURESET_E1D, 26, Hap),
    RDTSCP = (FEATURESET_E1D, 27, Shadow),
    LM = (FEATURESET_E1D, 29, All),
    AMD3DNOWEXT = (FEATURESET_E1D, 30, All),
    AMD3DNOW = (FEATURESET_E1D, 31, All),

    // CPUID.80000001:ECX
    LAHF_LM = (FEATURESET_E1C, 0, All),
    CMP_LEGACY = (FEATURESET_E1C, 1, All),
    SVM = (FEATURESET_E1C, 2, No),
    EXTAPIC = (FEATURESET_E1C, 3, No),
    CR8_LEGACY = (FEATURESET_E1C, 4, Shadow),
    ABM = (FEATURESET_E1C, 5, All),
    SSE4A = (FEATURESET_E1C, 6, All),
    MISALIGNSSE = (FEATURESET_E1C, 7, All),
    AMD3DNOWPREFETCH = (FEATURESET_E1C, 8, All),
    OSVW = (FEATURESET_E1C, 9, No),
    IBS = (FEATURESET_E1C, 10, No),
    XOP = (FEATURESET_E1C, 11, All),
    SKINIT = (FEATURESET_E1C, 12, No),
    WDT = (FEATURESET_E1C, 13, No),
    LWP = (FEATURESET_E1C, 15, Shadow),
    FMA4 = (FEATURESET_E1C, 16, All),
    NODEID_MSR = (FEATURESET_E1C, 19, No),
    TBM = (FEATURESET_E1C, 21, All),
    TOPOEXT = (FEATURESET_E1C, 22, No),
    DBEXT = (FEATURESET_E1C, 26, All),
    MONITORX = (FEATURESET_E1C, 29, No),

    // CPUID.D.1:EAX
    XSAVEOPT = (FEATURESET_DA1, 0, All),
    XSAVEC = (FEATURESET_DA1, 1, All),
    XGETBV1 = (FEATURESET_DA1, 2, All),
    XSAVES = (FEATURESET_DA1, 3, Shadow),

    // CPUID.7.0:EBX
    FSGSBASE = (FEATURESET_7B0, 0, All),
    TSC_ADJUST = (FEATURESET_7B0, 1, No),
    SGX = (FEATURESET_7B0, 2, No),
    BMI1 = (FEATURESET_7B0, 3, All),
    HLE = (FEATURESET_7B0, 4, All),
    AVX2 = (FEATURESET_7B0, 5, All),
    FDP_EXCP_ONLY = (FEATURESET_7B0, 6, All),
    SMEP = (FEATURESET_7B0, 7, Shadow),
    BMI2 = (FEATURESET_7B0, 8, All),
    ERMS = (FEATURESET_7B0, 9, All),
    INVPCID = (FEATURESET_7B0, 10, Hap),
    RTM = (FEATURESET_7B0, 11, All),
    PQM = (FEATURESET_7B0, 12, No),
    NO_FPU_SEL = (FEATURESET_7B0, 13, All),
    MPX = (FEATURESET_7B0, 14, Shadow),
    PQE = (FEATURESET_7B0, 15, No),
    AVX512F = (FEATURESET_7B0, 16, All),
    AVX512DQ = (FEATURESET_7B0, 17, All),
    RDSEED = (FEATURESET_7B0, 18, All),
    ADX = (FEATURESET_7B0, 19, All),
    SMAP = (FEATURESET_7B0, 20, Shadow),
    AVX512IFMA = (FEATURESET_7B0, 21, All),
    CLFLUSHOPT = (FEATURESET_7B0, 23, All),
    CLWB = (FEATURESET_7B0, 24, All),
    AVX512PF = (FEATURESET_7B0, 26, All),
    AVX512ER = (FEATURESET_7B0, 27, All),
    AVX512CD = (FEATURESET_7B0, 28, All),
    SHA = (FEATURESET_7B0, 29, All),
    AVX512BW = (FEATURESET_7B0, 30, All),
    AVX512VL = (FEATURESET_7B0, 31, All),

    // CPUID.7.0:ECX
    PREFETCHWT1 = (FEATURESET_7C0, 0, All),
    AVX512VBMI = (FEATURESET_7C0, 1, All),
    PKU = (FEATURESET_7C0, 3, Hap),
    OSPKE = (FEATURESET_7C0, 4, No),

    // CPUID.80000007:EDX
    ITSC = (FEATURESET_E7D, 8, No),
    EFRO = (FEATURESET_E7D, 10, No),

    // CPUID.80000008:EBX
    CLZERO = (FEATURESET_E8B, 0, All),
}

/// Bits of CPUID.1:EDX which AMD duplicates into CPUID.80000001:EDX and
/// Intel leaves clear there.
pub const CPUID_COMMON_1D_FEATURES: u32 = FeatureSet::EMPTY
    .with(Feature::FPU)
    .with(Feature::VME)
    .with(Feature::DE)
    .with(Feature::PSE)
    .with(Feature::TSC)
    .with(Feature::MSR)
    .with(Feature::PAE)
    .with(Feature::MCE)
    .with(Feature::CX8)
    .with(Feature::APIC)
    .with(Feature::MTRR)
    .with(Feature::PGE)
    .with(Feature::MCA)
    .with(Feature::CMOV)
    .with(Feature::PAT)
    .with(Feature::PSE36)
    .with(Feature::MMX)
    .with(Feature::FXSR)
    .word(FEATURESET_1D);

/// Every feature this engine knows about. Anything else is reserved.
pub const KNOWN_FEATURES: FeatureSet = offered(None);

/// Features offered to PV guests.
pub const PV_FEATURES: FeatureSet = offered(Some(Offer::All));

/// Features offered to HVM guests using shadow paging.
pub const HVM_SHADOW_FEATURES: FeatureSet = offered(Some(Offer::Shadow));

/// Features offered to HVM guests using hardware assisted paging.
pub const HVM_HAP_FEATURES: FeatureSet = offered(Some(Offer::Hap));

/// Erratum indicators a guest must always see with the host's value.
pub const SPECIAL_FEATURES: FeatureSet = FeatureSet::EMPTY
    .with(Feature::FDP_EXCP_ONLY)
    .with(Feature::NO_FPU_SEL);

// Offers are cumulative: HAP guests get everything shadow guests get, which
// get everything PV guests get.
const fn offer_level(offer: Offer) -> u32 {
    match offer {
        Offer::No => u32::MAX,
        Offer::All => 0,
        Offer::Shadow => 1,
        Offer::Hap => 2,
    }
}

const fn offered(level: Option<Offer>) -> FeatureSet {
    let mut fs = FeatureSet::EMPTY;
    let mut i = 0;

    while i < FEATURES.len() {
        let (feature, _, offer) = FEATURES[i];
        let include = match level {
            None => true,
            Some(level) => offer_level(offer) <= offer_level(level),
        };
        if include {
            fs = fs.with(feature);
        }
        i += 1;
    }

    // The shared bits of e1d follow their leaf 1 counterparts.
    let common = fs.0[FEATURESET_1D] & CPUID_COMMON_1D_FEATURES;
    fs.0[FEATURESET_E1D] |= match level {
        None => CPUID_COMMON_1D_FEATURES,
        Some(_) => common,
    };

    fs
}

/// A bit vector over all feature words.
#[derive(Clone, Copy, Default, PartialEq, Eq, Hash)]
pub struct FeatureSet([u32; FSCAPINTS]);

impl FeatureSet {
    pub const EMPTY: FeatureSet = FeatureSet([0; FSCAPINTS]);

    pub const fn from_words(words: [u32; FSCAPINTS]) -> Self {
        FeatureSet(words)
    }

    pub const fn words(&self) -> &[u32; FSCAPINTS] {
        &self.0
    }

    pub const fn word(&self, word: usize) -> u32 {
        self.0[word]
    }

    pub fn set_word(&mut self, word: usize, value: u32) {
        self.0[word] = value;
    }

    /// Builder form of [`Self::set`], usable in constant expressions.
    pub const fn with(mut self, feature: Feature) -> Self {
        self.0[feature.word()] |= feature.mask();
        self
    }

    pub const fn union(mut self, other: FeatureSet) -> Self {
        let mut i = 0;
        while i < FSCAPINTS {
            self.0[i] |= other.0[i];
            i += 1;
        }
        self
    }

    pub const fn contains(&self, feature: Feature) -> bool {
        self.0[feature.word()] & feature.mask() != 0
    }

    pub fn set(&mut self, feature: Feature) {
        self.0[feature.word()] |= feature.mask();
    }

    pub fn clear(&mut self, feature: Feature) {
        self.0[feature.word()] &= !feature.mask();
    }

    /// Word-wise AND with `mask`.
    pub fn mask(&mut self, mask: &FeatureSet) {
        *self &= *mask;
    }

    /// Clears every bit present in `other`.
    pub fn remove(&mut self, other: &FeatureSet) {
        *self &= !*other;
    }

    pub const fn is_subset(&self, other: &FeatureSet) -> bool {
        let mut i = 0;
        while i < FSCAPINTS {
            if self.0[i] & !other.0[i] != 0 {
                return false;
            }
            i += 1;
        }
        true
    }

    pub fn is_empty(&self) -> bool {
        self.0.iter().all(|w| *w == 0)
    }

    /// Iterates over the set features, in ascending order.
    pub fn iter(&self) -> impl Iterator<Item = Feature> + '_ {
        self.0.iter().enumerate().flat_map(|(word, bits)| {
            (0..32)
                .filter(move |bit| bits & (1 << bit) != 0)
                .map(move |bit| Feature::new(word, bit))
        })
    }
}

impl fmt::Debug for FeatureSet {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        f.debug_set().entries(self.iter()).finish()
    }
}

impl BitAnd for FeatureSet {
    type Output = FeatureSet;

    fn bitand(mut self, rhs: FeatureSet) -> FeatureSet {
        self &= rhs;
        self
    }
}

impl BitAndAssign for FeatureSet {
    fn bitand_assign(&mut self, rhs: FeatureSet) {
        for (dst, src) in self.0.iter_mut().zip(rhs.0) {
            *dst &= src;
        }
    }
}

impl BitOr for FeatureSet {
    type Output = FeatureSet;

    fn bitor(self, rhs: FeatureSet) -> FeatureSet {
        self.union(rhs)
    }
}

impl BitOrAssign for FeatureSet {
    fn bitor_assign(&mut self, rhs: FeatureSet) {
        *self = self.union(rhs);
    }
}

impl Not for FeatureSet {
    type Output = FeatureSet;

    fn not(mut self) -> FeatureSet {
        for word in self.0.iter_mut() {
            *word = !*word;
        }
        self
    }
}

impl FromIterator<Feature> for FeatureSet {
    fn from_iter<I: IntoIterator<Item = Feature>>(iter: I) -> Self {
        let mut fs = FeatureSet::EMPTY;
        for feature in iter {
            fs.set(feature);
        }
        fs
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn feature_positions() {
        assert_eq!(Feature::FPU.index(), 0);
        assert_eq!(Feature::HYPERVISOR.index(), 63);
        assert_eq!(Feature::LM.word(), FEATURESET_E1D);
        assert_eq!(Feature::LM.mask(), 1 << 29);
        assert_eq!(Feature::XSAVES.index(), 4 * 32 + 3);
        assert_eq!(Feature::CLZERO.index(), 8 * 32);
        assert_eq!(Feature::AVX512F.name(), Some("AVX512F"));
        assert_eq!(format!("{:?}", Feature::new(FEATURESET_1D, 10)), "Feature(0*32+10)");
        assert_eq!(CPUID_COMMON_1D_FEATURES, 0x0183_f3ff);
    }

    #[test]
    fn feature_table_is_unique() {
        for (i, (a, name_a, _)) in FEATURES.iter().enumerate() {
            for (b, name_b, _) in &FEATURES[i + 1..] {
                assert_ne!(a, b, "{name_a} and {name_b} share a bit");
            }
        }
    }

    #[test]
    fn offer_masks_are_nested() {
        assert!(PV_FEATURES.is_subset(&HVM_SHADOW_FEATURES));
        assert!(HVM_SHADOW_FEATURES.is_subset(&HVM_HAP_FEATURES));
        assert!(HVM_HAP_FEATURES.is_subset(&KNOWN_FEATURES));
        assert!(SPECIAL_FEATURES.is_subset(&KNOWN_FEATURES));

        assert!(PV_FEATURES.contains(Feature::LM));
        assert!(!PV_FEATURES.contains(Feature::PSE36));
        assert!(HVM_SHADOW_FEATURES.contains(Feature::PSE36));
        assert!(!HVM_SHADOW_FEATURES.contains(Feature::PAGE1GB));
        assert!(HVM_HAP_FEATURES.contains(Feature::PAGE1GB));
        assert!(!HVM_HAP_FEATURES.contains(Feature::ITSC));
        assert!(KNOWN_FEATURES.contains(Feature::ITSC));

        // The shared e1d bits follow the leaf 1 offers.
        let pse36_e1d = Feature::new(FEATURESET_E1D, Feature::PSE36.index() % 32);
        assert!(!PV_FEATURES.contains(pse36_e1d));
        assert!(HVM_SHADOW_FEATURES.contains(pse36_e1d));
        assert!(KNOWN_FEATURES.contains(pse36_e1d));
    }

    #[test]
    fn set_algebra() {
        let mut fs: FeatureSet = [Feature::SSE, Feature::LM, Feature::PKU].into_iter().collect();
        assert!(fs.contains(Feature::LM));
        assert_eq!(
            fs.iter().collect::<Vec<_>>(),
            vec![Feature::SSE, Feature::LM, Feature::PKU]
        );

        fs.clear(Feature::LM);
        assert!(!fs.contains(Feature::LM));

        let mut masked = fs;
        masked.mask(&FeatureSet::EMPTY.with(Feature::PKU));
        assert_eq!(masked, FeatureSet::EMPTY.with(Feature::PKU));

        fs.remove(&masked);
        assert_eq!(fs, FeatureSet::EMPTY.with(Feature::SSE));
        assert!(fs.is_subset(&KNOWN_FEATURES));
        assert!(!(!FeatureSet::EMPTY).is_subset(&KNOWN_FEATURES));
        assert!((fs & FeatureSet::EMPTY).is_empty());
        assert_eq!(fs | masked, FeatureSet::EMPTY.with(Feature::SSE).with(Feature::PKU));
    }
}
