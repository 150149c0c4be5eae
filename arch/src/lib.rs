// Copyright 2020 Arm Limited (or its affiliates). All rights reserved.
// Copyright © 2020, Oracle and/or its affiliates.
//
// Copyright 2018 Amazon.com, Inc. or its affiliates. All Rights Reserved.
// SPDX-License-Identifier: Apache-2.0

//! CPUID policy engine.
//!
//! Computes which CPU features and CPUID leaves each guest may observe, and
//! answers the `cpuid` instructions guests execute.

use std::result;

use thiserror::Error;

/// Type for returning error code.
#[derive(Debug, Error)]
pub enum Error {
    #[error("Failed to allocate a domain CPUID policy")]
    PolicyAllocation,
    #[error("No free CPUID override slot for leaf {0:#x}")]
    OverrideTableFull(u32),
    #[error("CPUID leaf {0:#x} cannot be overridden")]
    InvalidOverride(u32),
    #[error("The guest type of a domain cannot be changed")]
    GuestTypeChange,
}

/// Type for returning public functions outcome.
pub type Result<T> = result::Result<T, Error>;

pub mod x86_64;

pub use x86_64::{
    guest_cpuid, init_guest_cpuid, CpuidPolicies, CpuidPolicy, DomainConfig, DomainCpuid,
    Feature, FeatureSet, GuestCpuid, GuestType, LiveContext, VcpuState,
};

#[cfg(test)]
mod test_util;
