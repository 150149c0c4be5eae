// SPDX-License-Identifier: Apache-2.0

//! Feature dependencies.
//!
//! Disabling a feature must also disable everything which builds on it: a
//! guest told AVX is absent must not be told AVX2 is present. The direct
//! dependencies are listed below and flattened to their transitive closure
//! at compile time.

use super::featureset::{Feature, FeatureSet, KNOWN_FEATURES};

#[derive(Clone, Copy, Debug)]
pub struct DeepDependency {
    pub feature: Feature,
    /// Everything that must be disabled along with `feature`.
    pub depends: FeatureSet,
}

// Sorted by feature index.
const DIRECT_DEPS: &[(Feature, &[Feature])] = &[
    (Feature::FPU, &[Feature::MMX]),
    (Feature::PSE, &[Feature::PSE36]),
    (Feature::PAE, &[Feature::LM, Feature::NX]),
    (Feature::APIC, &[Feature::X2APIC]),
    (Feature::MMX, &[Feature::MMXEXT, Feature::AMD3DNOW]),
    (Feature::FXSR, &[Feature::FFXSR, Feature::SSE]),
    (
        Feature::SSE,
        &[
            Feature::SSE2,
            Feature::SSE3,
            Feature::SSSE3,
            Feature::SSE4A,
            Feature::MISALIGNSSE,
        ],
    ),
    (Feature::SSE2, &[Feature::LM]),
    (Feature::SSE3, &[Feature::SSE4_1]),
    (Feature::SSSE3, &[Feature::SSE4_1]),
    (Feature::SSE4_1, &[Feature::SSE4_2]),
    (Feature::SSE4_2, &[Feature::POPCNT]),
    (
        Feature::XSAVE,
        &[
            Feature::XSAVEOPT,
            Feature::XSAVEC,
            Feature::XGETBV1,
            Feature::XSAVES,
            Feature::AVX,
            Feature::MPX,
            Feature::PKU,
            Feature::LWP,
        ],
    ),
    (
        Feature::AVX,
        &[
            Feature::FMA,
            Feature::FMA4,
            Feature::F16C,
            Feature::AVX2,
            Feature::XOP,
        ],
    ),
    (
        Feature::LM,
        &[
            Feature::CX16,
            Feature::PCID,
            Feature::LAHF_LM,
            Feature::PAGE1GB,
            Feature::PKU,
        ],
    ),
    (Feature::AMD3DNOW, &[Feature::AMD3DNOWEXT]),
    (Feature::AVX2, &[Feature::AVX512F]),
    (
        Feature::AVX512F,
        &[
            Feature::AVX512DQ,
            Feature::AVX512IFMA,
            Feature::AVX512PF,
            Feature::AVX512ER,
            Feature::AVX512CD,
            Feature::AVX512BW,
            Feature::AVX512VL,
            Feature::AVX512VBMI,
        ],
    ),
];

const NR_DEEP_DEPS: usize = DIRECT_DEPS.len();

// Binary search relies on the order, and every deep feature must be known to
// the sanitiser, or disabling it would never be noticed.
const _: () = {
    let mut i = 0;
    while i < NR_DEEP_DEPS {
        assert!(
            i == 0 || DIRECT_DEPS[i - 1].0.index() < DIRECT_DEPS[i].0.index(),
            "dependency table is not sorted"
        );
        assert!(
            KNOWN_FEATURES.contains(DIRECT_DEPS[i].0),
            "dependency table names an unknown feature"
        );
        i += 1;
    }
};

const fn flatten() -> [DeepDependency; NR_DEEP_DEPS] {
    let mut table = [DeepDependency {
        feature: Feature::FPU,
        depends: FeatureSet::EMPTY,
    }; NR_DEEP_DEPS];

    let mut i = 0;
    while i < NR_DEEP_DEPS {
        let (feature, direct) = DIRECT_DEPS[i];
        table[i].feature = feature;
        let mut j = 0;
        while j < direct.len() {
            table[i].depends = table[i].depends.with(direct[j]);
            j += 1;
        }
        i += 1;
    }

    // Chains are never longer than the table, so that many rounds reach the
    // fixed point.
    let mut round = 0;
    while round < NR_DEEP_DEPS {
        let mut i = 0;
        while i < NR_DEEP_DEPS {
            let mut j = 0;
            while j < NR_DEEP_DEPS {
                if table[i].depends.contains(table[j].feature) {
                    table[i].depends = table[i].depends.union(table[j].depends);
                }
                j += 1;
            }
            i += 1;
        }
        round += 1;
    }

    table
}

static DEEP_DEPS: [DeepDependency; NR_DEEP_DEPS] = flatten();

/// Features other features depend on.
pub const DEEP_FEATURES: FeatureSet = {
    let mut fs = FeatureSet::EMPTY;
    let mut i = 0;
    while i < NR_DEEP_DEPS {
        fs = fs.with(DIRECT_DEPS[i].0);
        i += 1;
    }
    fs
};

/// Everything which must be disabled along with `feature`, or `None` when
/// nothing depends on it.
pub fn lookup_deep_deps(feature: Feature) -> Option<&'static FeatureSet> {
    if !DEEP_FEATURES.contains(feature) {
        return None;
    }

    DEEP_DEPS
        .binary_search_by_key(&feature, |dep| dep.feature)
        .ok()
        .map(|i| &DEEP_DEPS[i].depends)
}

pub fn deep_deps_table() -> &'static [DeepDependency] {
    &DEEP_DEPS
}
