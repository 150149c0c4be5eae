//
// Copyright © 2020 Intel Corporation
//
// SPDX-License-Identifier: Apache-2.0
//

// EFER (technically not a register) bits
pub const EFER_LMA: u64 = 0x400;

// CR0 bits
pub const CR0_PE: u64 = 0x1;
pub const CR0_PG: u64 = 0x80000000;

// CR4 bits
pub const CR4_PAE: u64 = 0x20;
pub const CR4_OSXSAVE: u64 = 0x40000;
pub const CR4_PKE: u64 = 0x400000;

// XCR0 / XSS state component bits
pub const XSTATE_FP: u64 = 1 << 0;
pub const XSTATE_SSE: u64 = 1 << 1;
pub const XSTATE_YMM: u64 = 1 << 2;
pub const XSTATE_BNDREGS: u64 = 1 << 3;
pub const XSTATE_BNDCSR: u64 = 1 << 4;
pub const XSTATE_OPMASK: u64 = 1 << 5;
pub const XSTATE_ZMM: u64 = 1 << 6;
pub const XSTATE_HI_ZMM: u64 = 1 << 7;
pub const XSTATE_PT: u64 = 1 << 8;
pub const XSTATE_PKRU: u64 = 1 << 9;
pub const XSTATE_LWP: u64 = 1 << 62;

pub const XSTATE_FP_SSE: u64 = XSTATE_FP | XSTATE_SSE;

// Components which can only be managed through XSAVES/XRSTORS. None are
// offered to guests yet.
pub const XSTATE_XSAVES_ONLY: u64 = 0;
