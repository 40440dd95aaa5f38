//! `cpm-verify`: verify a packet directory against its lockfile.
//!
//! Reports all three tiers (plan match, artifact hashes, frozen
//! determinism) and exits non-zero when any requested tier fails.

use anyhow::{bail, Result};
use clap::Parser;
use std::path::PathBuf;

use cpm::lockfile::{self, compute_plan, PlanInvocation};
use cpm::Config;

#[derive(Parser)]
#[command(name = "cpm-verify", about = "Verify a packet against its lockfile")]
struct Args {
    /// Packet directory containing the lockfile and artifacts
    packet_dir: PathBuf,
    /// Source tree the packet was built from
    source: PathBuf,
    /// Packet name
    #[arg(long)]
    name: String,
    /// Packet version
    #[arg(long, default_value = "0.1.0")]
    version: String,
    /// Build profile
    #[arg(long, default_value = "default")]
    profile: String,
    /// Also fail on any non_deterministic marker
    #[arg(long)]
    frozen: bool,
}

#[tokio::main]
async fn main() -> Result<()> {
    env_logger::init();
    let args = Args::parse();
    let config = Config::load()?;

    let lock_path = args.packet_dir.join(&config.cpm.lockfile_name);
    let lockfile = lockfile::read(&lock_path)?;

    let invocation = PlanInvocation {
        name: args.name.clone(),
        version: args.version.clone(),
        build_profile: args.profile.clone(),
        source: args.source.clone(),
        build: config.build.clone(),
        embeddings: config.embeddings.clone(),
    };
    let plan = compute_plan(&invocation)?;

    let report = lockfile::verify(&lockfile, &plan, &args.packet_dir, args.frozen)?;

    print_tier("plan match", report.plan_match.passed, &report.plan_match.mismatches);
    print_tier(
        "artifact hashes",
        report.artifact_match.passed,
        &report.artifact_match.mismatches,
    );
    print_tier(
        "frozen determinism",
        report.frozen_determinism.passed,
        &report.frozen_determinism.mismatches,
    );

    if !report.all_passed() {
        bail!("verification failed");
    }
    println!("OK: {}", lock_path.display());
    Ok(())
}

fn print_tier(label: &str, passed: bool, mismatches: &[String]) {
    println!("{}: {}", label, if passed { "pass" } else { "FAIL" });
    for mismatch in mismatches {
        println!("  - {}", mismatch);
    }
}
