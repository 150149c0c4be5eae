// SPDX-License-Identifier: Apache-2.0

use hypervisor::arch::x86::{FEATURESET_1D, FEATURESET_E1D};

use super::deep_deps::{lookup_deep_deps, DEEP_FEATURES};
use super::featureset::{FeatureSet, CPUID_COMMON_1D_FEATURES, KNOWN_FEATURES};

/// Clears every dependent of a feature that is known but disabled in `fs`.
///
/// Only features disabled on entry are considered. The dependency table is
/// already transitively closed, so one pass is enough.
pub fn closure_pass(fs: &mut FeatureSet) {
    let disabled = KNOWN_FEATURES & !*fs & DEEP_FEATURES;

    for feature in disabled.iter() {
        let depends = lookup_deep_deps(feature)
            .expect("every deep feature has an entry in the dependency table");
        fs.remove(depends);
    }
}

/// Makes the leaf 0x80000001 copies of the shared leaf 1 bits match leaf 1.
pub fn reconcile_vendor_duplicates(fs: &mut FeatureSet) {
    let e1d = (fs.word(FEATURESET_1D) & CPUID_COMMON_1D_FEATURES)
        | (fs.word(FEATURESET_E1D) & !CPUID_COMMON_1D_FEATURES);
    fs.set_word(FEATURESET_E1D, e1d);
}

/// Reduces `fs` to a self consistent set of known features.
pub fn sanitise_featureset(fs: &mut FeatureSet) {
    fs.mask(&KNOWN_FEATURES);
    closure_pass(fs);
    reconcile_vendor_duplicates(fs);
}
