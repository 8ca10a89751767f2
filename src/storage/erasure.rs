//! Systematic Reed–Solomon coding over GF(2^8).
//!
//! An artifact of N bytes becomes k equal data shards of ⌈N/k⌉ bytes (the
//! last data shard zero-padded) plus m parity shards. Any k of the k+m
//! shards reconstruct the original. `m == 0` degenerates to plain slicing.

use reed_solomon_erasure::galois_8::ReedSolomon;

use crate::error::{DepotError, Result};

/// Reed–Solomon coder with fixed (k, m) parameters.
pub struct ErasureCoder {
    data_shards: usize,
    parity_shards: usize,
    /// Absent when `parity_shards == 0`; the underlying codec requires at
    /// least one parity shard.
    codec: Option<ReedSolomon>,
}

impl ErasureCoder {
    pub fn new(data_shards: usize, parity_shards: usize) -> Result<Self> {
        if data_shards == 0 {
            return Err(DepotError::Invalid(
                "erasure coder requires at least one data shard".into(),
            ));
        }
        let codec = if parity_shards > 0 {
            Some(
                ReedSolomon::new(data_shards, parity_shards).map_err(|e| {
                    DepotError::Invalid(format!("invalid erasure parameters: {e}"))
                })?,
            )
        } else {
            None
        };
        Ok(Self {
            data_shards,
            parity_shards,
            codec,
        })
    }

    pub fn data_shards(&self) -> usize {
        self.data_shards
    }

    pub fn parity_shards(&self) -> usize {
        self.parity_shards
    }

    pub fn total_shards(&self) -> usize {
        self.data_shards + self.parity_shards
    }

    /// Shard length for a payload of `len` bytes. Zero-length payloads
    /// still produce one-byte shards so the codec has material to work on.
    pub fn shard_size(&self, len: usize) -> usize {
        if len == 0 {
            1
        } else {
            len.div_ceil(self.data_shards)
        }
    }

    /// Split `data` into k+m shards.
    pub fn encode(&self, data: &[u8]) -> Result<Vec<Vec<u8>>> {
        let shard_size = self.shard_size(data.len());
        let mut shards = Vec::with_capacity(self.total_shards());
        for i in 0..self.data_shards {
            let start = (i * shard_size).min(data.len());
            let end = ((i + 1) * shard_size).min(data.len());
            let mut shard = data[start..end].to_vec();
            shard.resize(shard_size, 0);
            shards.push(shard);
        }
        for _ in 0..self.parity_shards {
            shards.push(vec![0u8; shard_size]);
        }

        if let Some(codec) = &self.codec {
            codec
                .encode(&mut shards)
                .map_err(|e| DepotError::InternalIO(format!("erasure encode: {e}")))?;
        }
        Ok(shards)
    }

    /// Reconstruct the original payload from shard slots, any up to m of
    /// which may be `None`. The reconstruction is verified before the data
    /// shards are concatenated and trimmed to `original_size`.
    pub fn decode(
        &self,
        mut shards: Vec<Option<Vec<u8>>>,
        original_size: usize,
    ) -> Result<Vec<u8>> {
        if shards.len() != self.total_shards() {
            return Err(DepotError::Invalid(format!(
                "expected {} shard slots, got {}",
                self.total_shards(),
                shards.len()
            )));
        }

        let available = shards.iter().filter(|s| s.is_some()).count();
        if available < self.data_shards {
            return Err(DepotError::InsufficientShards {
                available,
                required: self.data_shards,
            });
        }

        if shards.iter().any(|s| s.is_none()) {
            let codec = self.codec.as_ref().ok_or(DepotError::InsufficientShards {
                available,
                required: self.data_shards,
            })?;
            codec
                .reconstruct(&mut shards)
                .map_err(|e| DepotError::IntegrityFailure(format!("reconstruction: {e}")))?;
        }

        let full: Vec<Vec<u8>> = shards
            .into_iter()
            .map(|s| s.expect("all shards present after reconstruction"))
            .collect();

        if let Some(codec) = &self.codec {
            let ok = codec
                .verify(&full)
                .map_err(|e| DepotError::IntegrityFailure(format!("verification: {e}")))?;
            if !ok {
                return Err(DepotError::IntegrityFailure(
                    "reconstructed shards failed parity verification".into(),
                ));
            }
        }

        let mut out = Vec::with_capacity(original_size);
        for shard in full.iter().take(self.data_shards) {
            out.extend_from_slice(shard);
        }
        out.truncate(original_size);
        Ok(out)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use proptest::prelude::*;

    fn as_slots(shards: &[Vec<u8>]) -> Vec<Option<Vec<u8>>> {
        shards.iter().cloned().map(Some).collect()
    }

    #[test]
    fn round_trip_all_shards() {
        let coder = ErasureCoder::new(4, 2).unwrap();
        let data: Vec<u8> = (0..4096u32).map(|i| (i % 251) as u8).collect();
        let shards = coder.encode(&data).unwrap();
        assert_eq!(shards.len(), 6);
        assert!(shards.iter().all(|s| s.len() == 1024));
        let decoded = coder.decode(as_slots(&shards), data.len()).unwrap();
        assert_eq!(decoded, data);
    }

    #[test]
    fn recovers_up_to_m_losses() {
        let coder = ErasureCoder::new(4, 2).unwrap();
        let data = b"the quick brown fox jumps over the lazy dog".repeat(37);
        let shards = coder.encode(&data).unwrap();

        let mut slots = as_slots(&shards);
        slots[0] = None;
        slots[3] = None;
        let decoded = coder.decode(slots, data.len()).unwrap();
        assert_eq!(decoded, data);
    }

    #[test]
    fn fails_beyond_m_losses() {
        let coder = ErasureCoder::new(4, 2).unwrap();
        let data = vec![7u8; 1000];
        let shards = coder.encode(&data).unwrap();

        let mut slots = as_slots(&shards);
        slots[0] = None;
        slots[3] = None;
        slots[5] = None;
        let err = coder.decode(slots, data.len()).unwrap_err();
        assert!(matches!(
            err,
            DepotError::InsufficientShards {
                available: 3,
                required: 4
            }
        ));
    }

    #[test]
    fn zero_parity_is_plain_slicing() {
        let coder = ErasureCoder::new(3, 0).unwrap();
        let data = vec![42u8; 100];
        let shards = coder.encode(&data).unwrap();
        assert_eq!(shards.len(), 3);

        let decoded = coder.decode(as_slots(&shards), data.len()).unwrap();
        assert_eq!(decoded, data);

        let mut slots = as_slots(&shards);
        slots[1] = None;
        assert!(matches!(
            coder.decode(slots, data.len()),
            Err(DepotError::InsufficientShards { .. })
        ));
    }

    #[test]
    fn empty_payload_round_trips() {
        let coder = ErasureCoder::new(4, 2).unwrap();
        let shards = coder.encode(&[]).unwrap();
        assert!(shards.iter().all(|s| s.len() == 1));
        let decoded = coder.decode(as_slots(&shards), 0).unwrap();
        assert!(decoded.is_empty());
    }

    #[test]
    fn uneven_payload_pads_final_shard() {
        let coder = ErasureCoder::new(4, 1).unwrap();
        // 10 bytes over 4 shards: shard size 3, final data shard padded.
        let data: Vec<u8> = (1..=10).collect();
        let shards = coder.encode(&data).unwrap();
        assert!(shards.iter().all(|s| s.len() == 3));
        assert_eq!(shards[3], vec![10, 0, 0]);
        let decoded = coder.decode(as_slots(&shards), data.len()).unwrap();
        assert_eq!(decoded, data);
    }

    proptest! {
        #[test]
        fn prop_round_trip_with_losses(
            data in proptest::collection::vec(any::<u8>(), 0..8192),
            loss_a in 0usize..6,
            loss_b in 0usize..6,
        ) {
            let coder = ErasureCoder::new(4, 2).unwrap();
            let shards = coder.encode(&data).unwrap();
            let mut slots: Vec<Option<Vec<u8>>> =
                shards.iter().cloned().map(Some).collect();
            slots[loss_a] = None;
            slots[loss_b] = None;
            let decoded = coder.decode(slots, data.len()).unwrap();
            prop_assert_eq!(decoded, data);
        }
    }
}
