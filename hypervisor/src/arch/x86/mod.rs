// Copyright 2018 Amazon.com, Inc. or its affiliates. All Rights Reserved.
//
// Portions Copyright 2017 The Chromium OS Authors. All rights reserved.
// Use of this source code is governed by a BSD-style license that can be
// found in the LICENSE-BSD-3-Clause file.
//
// Copyright © 2019 Intel Corporation
//
// SPDX-License-Identifier: Apache-2.0 OR BSD-3-Clause
//
// Copyright © 2020, Microsoft Corporation
//

use std::io::Write;

use serde::{Deserialize, Deserializer, Serialize, Serializer};

pub mod regs;
pub mod xstate;

/// Number of 32-bit words making up a feature set.
pub const FSCAPINTS: usize = 9;

// Position of each CPUID feature register inside a feature set.
pub const FEATURESET_1D: usize = 0; // 0x00000001.edx
pub const FEATURESET_1C: usize = 1; // 0x00000001.ecx
pub const FEATURESET_E1D: usize = 2; // 0x80000001.edx
pub const FEATURESET_E1C: usize = 3; // 0x80000001.ecx
pub const FEATURESET_DA1: usize = 4; // 0x0000000d:1.eax
pub const FEATURESET_7B0: usize = 5; // 0x00000007:0.ebx
pub const FEATURESET_7C0: usize = 6; // 0x00000007:0.ecx
pub const FEATURESET_E7D: usize = 7; // 0x80000007.edx
pub const FEATURESET_E8B: usize = 8; // 0x80000008.ebx

// X86 Exceptions
#[allow(dead_code, clippy::upper_case_acronyms)]
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum Exception {
    DE = 0,  // Divide Error
    DB = 1,  // Debug Exception
    BP = 3,  // Breakpoint
    OF = 4,  // Overflow
    BR = 5,  // BOUND Range Exceeded
    UD = 6,  // Invalid/Undefined Opcode
    NM = 7,  // No Math Coprocessor
    DF = 8,  // Double Fault
    TS = 10, // Invalid TSS
    NP = 11, // Segment Not Present
    SS = 12, // Stack Segment Fault
    GP = 13, // General Protection
    PF = 14, // Page Fault
    MF = 16, // Math Fault
    AC = 17, // Alignment Check
    MC = 18, // Machine Check
    XM = 19, // SIMD Floating-Point Exception
    VE = 20, // Virtualization Exception
    CP = 21, // Control Protection Exception
}

impl Exception {
    pub fn vector(self) -> u8 {
        self as u8
    }
}

/// The four registers returned by one `cpuid` invocation.
#[repr(C)]
#[derive(Debug, Default, Copy, Clone, PartialEq, Eq, Hash, Deserialize, Serialize)]
pub struct CpuidLeaf {
    pub eax: u32,
    pub ebx: u32,
    pub ecx: u32,
    pub edx: u32,
}

impl CpuidLeaf {
    /// Architectural answer for an unsupported or out of range leaf.
    pub const EMPTY: CpuidLeaf = CpuidLeaf::new(0, 0, 0, 0);

    pub const fn new(eax: u32, ebx: u32, ecx: u32, edx: u32) -> Self {
        CpuidLeaf { eax, ebx, ecx, edx }
    }

    pub fn is_empty(&self) -> bool {
        *self == Self::EMPTY
    }
}

#[derive(Debug, Default, Clone, Copy, PartialEq, Eq, Hash, Deserialize, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum CpuVendor {
    #[default]
    Unknown,
    Intel,
    Amd,
}

impl CpuVendor {
    /// Decodes the vendor signature returned in leaf 0 (`ebx`, `edx`, `ecx` order).
    pub fn from_signature(ebx: u32, ecx: u32, edx: u32) -> Self {
        let mut signature = [0u8; 12];
        signature[0..4].copy_from_slice(&ebx.to_le_bytes());
        signature[4..8].copy_from_slice(&edx.to_le_bytes());
        signature[8..12].copy_from_slice(&ecx.to_le_bytes());

        match &signature {
            b"GenuineIntel" => CpuVendor::Intel,
            b"AuthenticAMD" => CpuVendor::Amd,
            _ => CpuVendor::Unknown,
        }
    }

    /// Inverse of [`Self::from_signature`], as `(ebx, ecx, edx)`.
    pub fn signature(self) -> Option<(u32, u32, u32)> {
        let signature: &[u8; 12] = match self {
            CpuVendor::Intel => b"GenuineIntel",
            CpuVendor::Amd => b"AuthenticAMD",
            CpuVendor::Unknown => return None,
        };
        let word = |i: usize| {
            u32::from_le_bytes([
                signature[i],
                signature[i + 1],
                signature[i + 2],
                signature[i + 3],
            ])
        };
        Some((word(0), word(8), word(4)))
    }
}

pub fn serialize_as_hex<S: Serializer>(input: &u32, serializer: S) -> Result<S::Ok, S::Error> {
    // two bytes for "0x" prefix and eight for the hex encoded number
    let mut buffer = [0_u8; 10];
    let _ = write!(&mut buffer[..], "{:#010x}", input);
    let str = core::str::from_utf8(&buffer[..])
        .expect("the buffer should be filled with valid UTF-8 bytes");
    serializer.serialize_str(str)
}

pub fn deserialize_from_hex<'de, D: Deserializer<'de>>(deserializer: D) -> Result<u32, D::Error> {
    let hex = <&'de str as Deserialize>::deserialize(deserializer)?;
    u32::from_str_radix(hex.strip_prefix("0x").unwrap_or(""), 16).map_err(|_| {
        <D::Error as serde::de::Error>::custom(format!("{hex} is not a hex encoded 32 bit integer"))
    })
}
