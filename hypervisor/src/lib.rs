// Copyright © 2019 Intel Corporation
//
// SPDX-License-Identifier: Apache-2.0 OR BSD-3-Clause
//
// Copyright © 2020, Microsoft Corporation
//
// Copyright 2018-2019 CrowdStrike, Inc.
//
//

//! A generic abstraction around the host CPU as seen by the CPUID policy engine
//!
//! This crate offers a trait abstraction for everything the policy engine
//! needs from the physical machine: raw `cpuid` probes, the vendor, the
//! capability words detected at boot, the hardware virtualization assists and
//! the extended state geometry.
//!
//! # Platform support
//!
//! - x86_64 (native `cpuid` instruction)
//! - any architecture, replaying a recorded CPUID dump
//!

/// Architecture specific definitions
pub mod arch;

#[cfg(target_arch = "x86_64")]
/// Native implementation backed by the `cpuid` instruction
pub mod native;

/// Platform related module
mod platform;

/// Recorded CPUID dump implementation
mod static_platform;

use std::sync::Arc;

pub use arch::x86::{CpuVendor, CpuidLeaf, FSCAPINTS};
#[cfg(target_arch = "x86_64")]
pub use native::NativePlatform;
pub use platform::{
    address_widths_from_cpuid, capabilities_from_cpuid, AddressWidths, HvmCapabilities, Platform,
    PlatformError,
};
pub use static_platform::{CpuidDump, DumpEntry, StaticPlatform};

pub fn new() -> std::result::Result<Arc<dyn Platform>, PlatformError> {
    #[cfg(target_arch = "x86_64")]
    {
        Ok(Arc::new(native::NativePlatform::new()))
    }

    #[cfg(not(target_arch = "x86_64"))]
    {
        Err(PlatformError::Unsupported)
    }
}
