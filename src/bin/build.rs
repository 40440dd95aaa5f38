//! `cpm-build`: build a packet from a source tree and keep the lockfile
//! in sync.
//!
//! Lockfile behaviour:
//! - absent lockfile or `--update-lock`: build, then write it
//! - present lockfile with a plan mismatch and no `--update-lock`: abort
//!   with the diff
//! - `--frozen-lockfile` with any non-deterministic marker: abort before
//!   touching disk

use anyhow::{bail, Context, Result};
use clap::Parser;
use std::path::PathBuf;

use cpm::build::{build, BuildRequest, SystemClock};
use cpm::embeddings::HttpEmbedder;
use cpm::lockfile::{self, compute_plan, PlanInvocation};
use cpm::Config;

#[derive(Parser)]
#[command(name = "cpm-build", about = "Build a context packet from a source tree")]
struct Args {
    /// Source tree to scan
    source: PathBuf,
    /// Packet directory to write
    dest: PathBuf,
    /// Packet name
    #[arg(long)]
    name: String,
    /// Packet version
    #[arg(long, default_value = "0.1.0")]
    version: String,
    /// Build profile
    #[arg(long, default_value = "default")]
    profile: String,
    /// Packet description
    #[arg(long, default_value = "")]
    description: String,
    /// Comma-separated tags
    #[arg(long, default_value = "")]
    tags: String,
    /// Comma-separated entrypoints
    #[arg(long, default_value = "")]
    entrypoints: String,
    /// Rewrite the lockfile even when the plan changed
    #[arg(long)]
    update_lock: bool,
    /// Refuse to build when any non-deterministic marker exists
    #[arg(long)]
    frozen_lockfile: bool,
}

fn csv(raw: &str) -> Vec<String> {
    raw.split(',')
        .map(str::trim)
        .filter(|s| !s.is_empty())
        .map(String::from)
        .collect()
}

#[tokio::main]
async fn main() -> Result<()> {
    env_logger::init();
    let args = Args::parse();
    let config = Config::load()?;

    let invocation = PlanInvocation {
        name: args.name.clone(),
        version: args.version.clone(),
        build_profile: args.profile.clone(),
        source: args.source.clone(),
        build: config.build.clone(),
        embeddings: config.embeddings.clone(),
    };
    let plan = compute_plan(&invocation).context("failed to compute build plan")?;

    let lock_path = args.dest.join(&config.cpm.lockfile_name);
    if lock_path.exists() {
        let lockfile = lockfile::read(&lock_path)?;

        if args.frozen_lockfile && lockfile::has_non_deterministic(&lockfile) {
            bail!(
                "frozen-lockfile violation: {} carries non_deterministic markers",
                lock_path.display()
            );
        }

        let report = lockfile::verify(&lockfile, &plan, &args.dest, args.frozen_lockfile)?;
        if !report.plan_match.passed && !args.update_lock {
            let mut message = String::from("lockfile does not match the current plan:\n");
            for mismatch in &report.plan_match.mismatches {
                message.push_str("  - ");
                message.push_str(mismatch);
                message.push('\n');
            }
            message.push_str("re-run with --update-lock to accept the new plan");
            bail!(message);
        }
        if !report.frozen_determinism.passed {
            bail!(
                "frozen-lockfile violation: {}",
                report.frozen_determinism.mismatches.join("; ")
            );
        }
    }

    let embedder = HttpEmbedder::from_config(&config.embeddings, None)?;
    let request = BuildRequest {
        source: args.source.clone(),
        dest: args.dest.clone(),
        name: args.name.clone(),
        version: args.version.clone(),
        description: args.description.clone(),
        tags: csv(&args.tags),
        entrypoints: csv(&args.entrypoints),
        build_profile: args.profile.clone(),
        allow_reuse: true,
    };

    let result = build(&request, &config.build, &embedder, &SystemClock).await?;

    // Artifact hashes changed with the build; the lockfile always follows.
    let lockfile = lockfile::render(&plan, &result.artifacts, chrono::Utc::now());
    lockfile::write(&lockfile, &lock_path)?;

    println!("built {} -> {}", args.name, args.dest.display());
    println!(
        "  chunks: {} (reused {}, embedded {}, removed {})",
        result.manifest.counts.docs,
        result.manifest.incremental.reused,
        result.manifest.incremental.embedded,
        result.manifest.incremental.removed
    );
    println!("  packet_id: {}", result.manifest.packet_id);
    println!("  lockfile: {}", lock_path.display());
    if let Some(archive) = result.archive_path {
        println!("  archive: {}", archive.display());
    }

    Ok(())
}
