pub mod build;
pub mod cas;
pub mod config;
pub mod embeddings;
pub mod error;
pub mod hash;
pub mod index;
pub mod lockfile;
pub mod mcp;
pub mod oci;
pub mod packet;
pub mod retrieval;

pub use config::Config;
pub use error::{BuildError, CpmError, EmbedError, LockfileError, OciError, Result};
