//! `cpm-fetch`: materialize a packet payload into the local CAS.

use anyhow::Result;
use clap::Parser;

use cpm::cas::CpmRoot;
use cpm::oci::{HttpRegistryClient, PacketRef, Resolver};
use cpm::Config;

#[derive(Parser)]
#[command(name = "cpm-fetch", about = "Fetch a packet payload into CPM_ROOT/cas")]
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

    let result = resolver.resolve_and_fetch(&packet_ref).await?;
    println!("pinned: {}", result.pinned_uri);
    println!("payload: {}", result.payload_dir.display());

    Ok(())
}
