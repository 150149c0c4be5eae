// Copyright © 2019 Intel Corporation
//
// SPDX-License-Identifier: Apache-2.0
//

//! Parsing of the `key=value,...` command line options.

use arch::x86_64::{DomainConfig, GuestType, LiveContext, VcpuState, Vpmu};
use hypervisor::CpuidLeaf;
use option_parser::{Hex, Hex64, HexList, OptionParser, OptionParserError, Toggle};
use thiserror::Error;

/// Errors associated with the command line options.
#[derive(Debug, Error)]
pub enum Error {
    /// Error parsing domain options
    #[error("Error parsing --domain")]
    ParseDomain(#[source] OptionParserError),
    /// Unknown guest type
    #[error("Unknown guest type {0}, expected pv or hvm")]
    ParseDomainType(String),
    /// Invalid guest bitness
    #[error("Invalid guest bitness {0}, expected 32 or 64")]
    ParseDomainBits(u8),
    /// Error parsing leaf options
    #[error("Error parsing --set-leaf")]
    ParseLeaf(#[source] OptionParserError),
    /// Missing leaf number
    #[error("Missing leaf number in --set-leaf")]
    ParseLeafMissing,
    /// Error parsing vCPU options
    #[error("Error parsing --vcpu")]
    ParseVcpu(#[source] OptionParserError),
    /// Unknown vPMU mode
    #[error("Unknown vPMU mode {0}, expected off, on or ds")]
    ParseVcpuVpmu(String),
    /// Exception vector out of range
    #[error("Invalid exception vector {0:#x}, expected at most 0xff")]
    ParseVcpuVector(u32),
    /// Error parsing query options
    #[error("Error parsing --query")]
    ParseQuery(#[source] OptionParserError),
}

pub type Result<T> = std::result::Result<T, Error>;

pub struct DomainOptions;

impl DomainOptions {
    pub const SYNTAX: &'static str = "Domain parameters \
        \"type=<pv|hvm>,bits=<32|64>,hap=on|off,hardware_domain=on|off,\
        control_domain=on|off,viridian=on|off,disable_migrate=on|off,vtsc=on|off,\
        paddr_bits=<guest_physical_address_width>\"";

    pub fn parse(domain: &str) -> Result<DomainConfig> {
        let mut parser = OptionParser::new();
        parser
            .add("type")
            .add("bits")
            .add("hap")
            .add("hardware_domain")
            .add("control_domain")
            .add("viridian")
            .add("disable_migrate")
            .add("vtsc")
            .add("paddr_bits");
        parser.parse(domain).map_err(Error::ParseDomain)?;

        let guest_type = match parser.get("type").as_deref() {
            None | Some("pv") => GuestType::Pv,
            Some("hvm") => GuestType::Hvm,
            Some(other) => return Err(Error::ParseDomainType(other.to_owned())),
        };
        let bits: u8 = parser
            .convert("bits")
            .map_err(Error::ParseDomain)?
            .unwrap_or(64);
        if bits != 32 && bits != 64 {
            return Err(Error::ParseDomainBits(bits));
        }
        let toggle = |name: &str, default: bool| -> Result<bool> {
            Ok(parser
                .convert::<Toggle>(name)
                .map_err(Error::ParseDomain)?
                .unwrap_or(Toggle(default))
                .0)
        };

        Ok(DomainConfig {
            guest_type,
            is_32bit: bits == 32,
            hap: toggle("hap", guest_type == GuestType::Hvm)?,
            hardware_domain: toggle("hardware_domain", false)?,
            control_domain: toggle("control_domain", false)?,
            viridian: toggle("viridian", false)?,
            disable_migrate: toggle("disable_migrate", false)?,
            vtsc: toggle("vtsc", false)?,
            paddr_bits: parser.convert("paddr_bits").map_err(Error::ParseDomain)?,
        })
    }
}

/// A toolstack override given on the command line.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct LeafOverride {
    pub leaf: u32,
    /// `None` applies to every subleaf.
    pub subleaf: Option<u32>,
    pub value: CpuidLeaf,
}

impl LeafOverride {
    pub const SYNTAX: &'static str = "Leaf override \
        \"leaf=<leaf>,subleaf=<subleaf>,eax=<eax>,ebx=<ebx>,ecx=<ecx>,edx=<edx>\", \
        omitting subleaf to match every subleaf";

    pub fn parse(leaf: &str) -> Result<Self> {
        let mut parser = OptionParser::new();
        parser
            .add("leaf")
            .add("subleaf")
            .add("eax")
            .add("ebx")
            .add("ecx")
            .add("edx");
        parser.parse(leaf).map_err(Error::ParseLeaf)?;

        let register = |name: &str| -> Result<u32> {
            Ok(parser
                .convert::<Hex>(name)
                .map_err(Error::ParseLeaf)?
                .unwrap_or(Hex(0))
                .0)
        };

        Ok(LeafOverride {
            leaf: parser
                .convert::<Hex>("leaf")
                .map_err(Error::ParseLeaf)?
                .ok_or(Error::ParseLeafMissing)?
                .0,
            subleaf: parser
                .convert::<Hex>("subleaf")
                .map_err(Error::ParseLeaf)?
                .map(|h| h.0),
            value: CpuidLeaf::new(
                register("eax")?,
                register("ebx")?,
                register("ecx")?,
                register("edx")?,
            ),
        })
    }
}

/// The vCPU queries are made for.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct VcpuOptions {
    pub state: VcpuState,
    /// Set when the vCPU is treated as the one currently running.
    pub live: Option<LiveContext>,
}

impl VcpuOptions {
    pub const SYNTAX: &'static str = "vCPU state \
        \"id=<vcpu_id>,cr0=<cr0>,cr4=<cr4>,efer=<efer>,xcr0=<xcr0>,apic=on|off,\
        vpmu=off|on|ds,lwp_cfg=<lwp_cfg>,live=on|off,vector=<entry_vector>,\
        kernel=on|off,host_cr4=<host_cr4>\"";

    pub fn parse(vcpu: &str) -> Result<Self> {
        let mut parser = OptionParser::new();
        parser
            .add("id")
            .add("cr0")
            .add("cr4")
            .add("efer")
            .add("xcr0")
            .add("apic")
            .add("vpmu")
            .add("lwp_cfg")
            .add("live")
            .add("vector")
            .add("kernel")
            .add("host_cr4");
        parser.parse(vcpu).map_err(Error::ParseVcpu)?;

        let hex = |name: &str| -> Result<u32> {
            Ok(parser
                .convert::<Hex>(name)
                .map_err(Error::ParseVcpu)?
                .unwrap_or(Hex(0))
                .0)
        };
        let register = |name: &str| -> Result<u64> {
            Ok(parser
                .convert::<Hex64>(name)
                .map_err(Error::ParseVcpu)?
                .unwrap_or(Hex64(0))
                .0)
        };
        let toggle = |name: &str, default: bool| -> Result<bool> {
            Ok(parser
                .convert::<Toggle>(name)
                .map_err(Error::ParseVcpu)?
                .unwrap_or(Toggle(default))
                .0)
        };

        let vpmu = match parser.get("vpmu").as_deref() {
            None | Some("off") => None,
            Some("on") => Some(Vpmu { has_ds: false }),
            Some("ds") => Some(Vpmu { has_ds: true }),
            Some(other) => return Err(Error::ParseVcpuVpmu(other.to_owned())),
        };

        let state = VcpuState {
            vcpu_id: hex("id")?,
            cr0: register("cr0")?,
            cr4: register("cr4")?,
            efer: register("efer")?,
            xcr0: register("xcr0")?,
            apic_hw_enabled: toggle("apic", true)?,
            vpmu,
            lwp_cfg: hex("lwp_cfg")?,
        };

        let live = if toggle("live", false)? {
            let vector = hex("vector")?;
            Some(LiveContext::new(
                u8::try_from(vector).map_err(|_| Error::ParseVcpuVector(vector))?,
                toggle("kernel", true)?,
                register("host_cr4")?,
            ))
        } else {
            None
        };

        Ok(VcpuOptions { state, live })
    }
}

/// Leaves and subleaves to query.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct QueryOptions {
    pub leaves: Vec<u32>,
    pub subleaves: Vec<u32>,
}

impl QueryOptions {
    pub const SYNTAX: &'static str = "Leaves to query \
        \"leaves=[<leaf>,<first>-<last>],subleaves=[<subleaf>,<first>-<last>]\"";

    pub fn parse(query: &str) -> Result<Self> {
        let mut parser = OptionParser::new();
        parser.add("leaves").add("subleaves");
        parser.parse(query).map_err(Error::ParseQuery)?;

        let list = |name: &str, default: Vec<u32>| -> Result<Vec<u32>> {
            Ok(parser
                .convert::<HexList>(name)
                .map_err(Error::ParseQuery)?
                .map(|list| list.0)
                .unwrap_or(default))
        };

        Ok(QueryOptions {
            leaves: list("leaves", Vec::new())?,
            subleaves: list("subleaves", vec![0])?,
        })
    }
}
