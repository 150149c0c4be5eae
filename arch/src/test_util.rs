// SPDX-License-Identifier: Apache-2.0

// Recorded hosts for the policy tests. Only depends on the hypervisor crate
// so integration tests can include it as well.

#![allow(dead_code)]

use hypervisor::{CpuVendor, CpuidDump, CpuidLeaf, DumpEntry, HvmCapabilities, StaticPlatform};

fn entry(leaf: u32, subleaf: u32, eax: u32, ebx: u32, ecx: u32, edx: u32) -> DumpEntry {
    DumpEntry {
        leaf,
        subleaf,
        value: CpuidLeaf::new(eax, ebx, ecx, edx),
    }
}

fn signature(vendor: CpuVendor) -> (u32, u32, u32) {
    vendor.signature().unwrap()
}

/// A Skylake server with VT-x and EPT, but no MPX or XSAVES controls.
pub fn intel_dump() -> CpuidDump {
    let (ebx, ecx, edx) = signature(CpuVendor::Intel);

    CpuidDump {
        entries: vec![
            entry(0x0, 0, 0x16, ebx, ecx, edx),
            entry(0x1, 0, 0x0005_0654, 0x0010_0800, 0x7ffe_fbff, 0xbfeb_fbff),
            entry(0x2, 0, 0x7603_6301, 0x00f0_b5ff, 0, 0x00c3_0000),
            entry(0x4, 0, 0x1c00_4121, 0x01c0_003f, 0x3f, 0),
            entry(0x6, 0, 0x77, 0x2, 0x9, 0),
            entry(0x7, 0, 0, 0xd19f_fffb, 0x8, 0),
            entry(0xa, 0, 0x0730_0404, 0, 0, 0x603),
            entry(0xb, 0, 0x1, 0x2, 0x100, 0),
            entry(0xd, 0, 0x2ff, 0xa88, 0xa88, 0),
            entry(0xd, 1, 0xf, 0xa08, 0x100, 0),
            entry(0xd, 2, 256, 576, 0, 0),
            entry(0xd, 3, 64, 960, 0, 0),
            entry(0xd, 4, 64, 1024, 0, 0),
            entry(0xd, 5, 64, 1088, 0, 0),
            entry(0xd, 6, 512, 1152, 0, 0),
            entry(0xd, 7, 1024, 1664, 0, 0),
            entry(0xd, 8, 128, 0, 1, 0),
            entry(0xd, 9, 8, 2688, 0, 0),
            entry(0x16, 0, 0x834, 0xfa0, 0x64, 0),
            entry(0x8000_0000, 0, 0x8000_0008, 0, 0, 0),
            entry(0x8000_0001, 0, 0, 0, 0x121, 0x2c10_0800),
            entry(0x8000_0007, 0, 0, 0, 0, 0x100),
            entry(0x8000_0008, 0, 0x302e, 0, 0, 0),
        ],
        hvm: HvmCapabilities {
            enabled: true,
            hap: true,
            vmx: true,
            vmx_mpx: false,
            vmx_xsaves: false,
        },
        capabilities: None,
        address_widths: None,
    }
}

/// A Piledriver with SVM but no nested paging.
pub fn amd_dump() -> CpuidDump {
    let (ebx, ecx, edx) = signature(CpuVendor::Amd);

    CpuidDump {
        entries: vec![
            entry(0x0, 0, 0xd, ebx, ecx, edx),
            entry(0x1, 0, 0x0060_0f20, 0x0008_0800, 0x3e98_320b, 0x178b_fbff),
            entry(0x7, 0, 0, 0x8, 0, 0),
            entry(0xd, 0, 0x7, 0x340, 0x3c0, 0x4000_0000),
            entry(0xd, 1, 0x1, 0, 0, 0),
            entry(0xd, 2, 256, 576, 0, 0),
            entry(0xd, 62, 128, 832, 0, 0),
            entry(0x8000_0000, 0, 0x8000_001e, ebx, ecx, edx),
            entry(0x8000_0001, 0, 0x0060_0f20, 0, 0x0069_bfff, 0x2fd3_fbff),
            entry(0x8000_0007, 0, 0, 0, 0, 0x100),
            entry(0x8000_0008, 0, 0x3030, 0, 0x7, 0),
            entry(0x8000_001c, 0, 0, 0, 0, 0x8000_0007),
        ],
        hvm: HvmCapabilities {
            enabled: true,
            hap: false,
            vmx: false,
            vmx_mpx: false,
            vmx_xsaves: false,
        },
        capabilities: None,
        address_widths: None,
    }
}

pub fn intel_platform() -> StaticPlatform {
    StaticPlatform::new(intel_dump())
}

pub fn amd_platform() -> StaticPlatform {
    StaticPlatform::new(amd_dump())
}

/// The Intel host, with XSAVE hidden.
pub fn no_xsave_platform() -> StaticPlatform {
    let mut dump = intel_dump();
    for entry in dump.entries.iter_mut().filter(|e| e.leaf == 0x1) {
        entry.value.ecx &= !(1 << 26);
    }
    StaticPlatform::new(dump)
}
