// Copyright © 2019 Intel Corporation
//
// SPDX-License-Identifier: Apache-2.0
//

#[cfg(test)]
mod test_util;

use std::io::{self, BufWriter, Write};
use std::path::PathBuf;
use std::process;
use std::sync::Arc;

use anyhow::{Context, Result};
use arch::x86_64::{guest_cpuid, init_guest_cpuid, CpuidPolicies, CpuidPolicy, DomainCpuid};
use clap::{Arg, ArgAction, ArgMatches, Command};
use cpuid_policy::cli_print_error_chain;
use cpuid_policy::config::{DomainOptions, LeafOverride, QueryOptions, VcpuOptions};
use hypervisor::{DumpEntry, Platform, StaticPlatform};
use log::{info, LevelFilter};
use serde::Serialize;

fn create_app() -> Command {
    Command::new("cpuid-policy")
        .version(env!("CARGO_PKG_VERSION"))
        .author(env!("CARGO_PKG_AUTHORS"))
        .about("Compute the CPUID policies of a host and the CPUID values its guests see.")
        .arg(
            Arg::new("domain")
                .long("domain")
                .help(DomainOptions::SYNTAX)
                .num_args(1)
                .default_value("type=pv"),
        )
        .arg(
            Arg::new("dump")
                .long("dump")
                .help("Replay a recorded CPUID dump instead of probing this host")
                .num_args(1)
                .value_parser(clap::value_parser!(PathBuf)),
        )
        .arg(
            Arg::new("policy")
                .long("policy")
                .help("Policy to print when no query is given")
                .num_args(1)
                .value_parser(["raw", "host", "pv_max", "hvm_max", "domain"])
                .default_value("domain"),
        )
        .arg(
            Arg::new("query")
                .long("query")
                .help(QueryOptions::SYNTAX)
                .num_args(1),
        )
        .arg(
            Arg::new("record")
                .long("record")
                .help("Print a CPUID dump of the platform and exit")
                .action(ArgAction::SetTrue)
                .conflicts_with_all(["policy", "query"]),
        )
        .arg(
            Arg::new("set-leaf")
                .long("set-leaf")
                .help(LeafOverride::SYNTAX)
                .num_args(1)
                .action(ArgAction::Append),
        )
        .arg(
            Arg::new("vcpu")
                .long("vcpu")
                .help(VcpuOptions::SYNTAX)
                .num_args(1)
                .default_value(""),
        )
        .arg(
            Arg::new("verbose")
                .short('v')
                .help("Sets the level of debugging output")
                .action(ArgAction::Count),
        )
}

fn init_logger(cmd_arguments: &ArgMatches) {
    let level = match cmd_arguments.get_count("verbose") {
        0 => LevelFilter::Warn,
        1 => LevelFilter::Info,
        2 => LevelFilter::Debug,
        _ => LevelFilter::Trace,
    };

    // RUST_LOG refines the level picked on the command line.
    env_logger::Builder::new()
        .filter_level(level)
        .parse_default_env()
        .init();
}

fn open_platform(cmd_arguments: &ArgMatches) -> Result<Arc<dyn Platform>> {
    match cmd_arguments.get_one::<PathBuf>("dump") {
        Some(path) => {
            info!("Replaying CPUID dump {}", path.display());
            let platform = StaticPlatform::from_file(path)
                .with_context(|| format!("Could not replay CPUID dump {}", path.display()))?;
            Ok(Arc::new(platform))
        }
        None => hypervisor::new().context("Could not probe the host CPU"),
    }
}

fn create_domain(policies: &CpuidPolicies, cmd_arguments: &ArgMatches) -> Result<DomainCpuid> {
    let domain = cmd_arguments
        .get_one::<String>("domain")
        .map(String::as_str)
        .unwrap_or_default();
    let config = DomainOptions::parse(domain)?;
    let mut domain =
        DomainCpuid::new(policies, config).context("Could not create the domain policy")?;

    for leaf in cmd_arguments
        .get_many::<String>("set-leaf")
        .unwrap_or_default()
    {
        let leaf = LeafOverride::parse(leaf)?;
        domain
            .set_leaf(policies, leaf.leaf, leaf.subleaf, leaf.value)
            .with_context(|| format!("Could not set CPUID leaf {:#x}", leaf.leaf))?;
    }

    Ok(domain)
}

fn query_domain(
    policies: &CpuidPolicies,
    platform: &dyn Platform,
    domain: &DomainCpuid,
    cmd_arguments: &ArgMatches,
    query: &QueryOptions,
) -> Result<Vec<DumpEntry>> {
    let vcpu = cmd_arguments
        .get_one::<String>("vcpu")
        .map(String::as_str)
        .unwrap_or_default();
    let vcpu = VcpuOptions::parse(vcpu)?;

    let mut entries = Vec::with_capacity(query.leaves.len() * query.subleaves.len());
    for &leaf in &query.leaves {
        for &subleaf in &query.subleaves {
            entries.push(DumpEntry {
                leaf,
                subleaf,
                value: guest_cpuid(
                    policies,
                    platform,
                    domain,
                    &vcpu.state,
                    vcpu.live.as_ref(),
                    leaf,
                    subleaf,
                ),
            });
        }
    }

    Ok(entries)
}

fn select_policy<'a>(
    policies: &'a CpuidPolicies,
    domain: &'a DomainCpuid,
    name: &str,
) -> &'a CpuidPolicy {
    match name {
        "raw" => &policies.raw,
        "host" => &policies.host,
        "pv_max" => &policies.pv_max,
        "hvm_max" => &policies.hvm_max,
        _ => domain.policy(),
    }
}

fn print_json<T: Serialize>(value: &T) -> Result<()> {
    let mut writer = BufWriter::new(io::stdout().lock());
    serde_json::to_writer_pretty(&mut writer, value).context("Could not serialize the output")?;
    writeln!(writer)?;
    writer.flush().context("Could not write the output")
}

fn start_cpuid_policy(cmd_arguments: &ArgMatches) -> Result<()> {
    let platform = open_platform(cmd_arguments)?;

    if cmd_arguments.get_flag("record") {
        return print_json(&StaticPlatform::record(platform.as_ref()));
    }

    let policies = init_guest_cpuid(platform.as_ref());
    let domain = create_domain(policies, cmd_arguments)?;

    match cmd_arguments.get_one::<String>("query") {
        Some(query) => {
            let query = QueryOptions::parse(query)?;
            let entries =
                query_domain(policies, platform.as_ref(), &domain, cmd_arguments, &query)?;
            print_json(&entries)
        }
        None => {
            let name = cmd_arguments
                .get_one::<String>("policy")
                .map(String::as_str)
                .unwrap_or("domain");
            print_json(&select_policy(policies, &domain, name).entries())
        }
    }
}

fn main() {
    let cmd_arguments = create_app().get_matches();
    init_logger(&cmd_arguments);

    if let Err(top_error) = start_cpuid_policy(&cmd_arguments) {
        cli_print_error_chain(top_error.as_ref(), "cpuid-policy");
        process::exit(1);
    }
}
