//! `cpm-lookup`: metadata-only lookup of a packet reference. Fetches the
//! OCI manifest plus one small metadata blob; never downloads the payload.

use anyhow::Result;
use clap::Parser;

use cpm::cas::CpmRoot;
use cpm::oci::{HttpRegistryClient, PacketRef, Resolver};
use cpm::Config;

#[derive(Parser)]
#[command(name = "cpm-lookup", about = "Resolve and describe a packet without fetching it")]
struct Args {
    /// Packet reference (oci://... or name@version against the default registry)
    reference: String,
}

#[tokio::main]
async fn main() -> Result<()> {
    env_logger::init();
    let args = Args::parse();
    let config = Config::load()?;

    let packet_ref = PacketRef::resolve_input(&args.reference, config.registry.default.as_deref())?;
    let client = HttpRegistryClient::new(config.registry.clone())?;
    let resolver = Resolver::new(
        client,
        CpmRoot::new(config.cpm_root()),
        config.registry.clone(),
        config.trust.clone(),
    );

    let result = resolver.lookup_metadata(&packet_ref).await?;
    println!("pinned: {}", result.pinned_uri);
    println!("digest: {}", result.digest);
    println!("{}", serde_json::to_string_pretty(&result.metadata)?);

    Ok(())
}
