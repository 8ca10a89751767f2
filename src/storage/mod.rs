//! Durable artifact storage.
//!
//! Three pieces: the Reed–Solomon [`erasure`] coder, the shard-file
//! [`blob`] store whose `metadata.json` is the commit marker, and the
//! [`metadata`] store owning artifact records.

pub mod blob;
pub mod erasure;
pub mod metadata;

pub use blob::{BlobMetadata, BlobStore, IntegrityReport};
pub use erasure::ErasureCoder;
pub use metadata::{ArtifactRecord, MetadataStore, SledMetadataStore};

use sha2::{Digest, Sha256};

/// Lowercase-hex SHA-256, the platform's integrity hash.
pub fn sha256_hex(data: &[u8]) -> String {
    hex::encode(Sha256::digest(data))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn sha256_hex_known_vector() {
        assert_eq!(
            sha256_hex(b"abc"),
            "ba7816bf8f01cfea414140de5dae2223b00361a396177a9cb410ff61f20015ad"
        );
    }
}
