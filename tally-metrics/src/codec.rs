use std::io::{self, Read, Write};

use flate2::Compression;
use flate2::read::GzDecoder;
use flate2::write::GzEncoder;
use tally_auth::{SharedKey, Signature, VerifyError};

use crate::{Batch, Metric, MetricRecord, ParseMetricError};

/// Default upper bound for decompressed payloads.
pub const DEFAULT_DECOMPRESSED_LIMIT: usize = 10 * 1024 * 1024;

/// An error raised by [`encode`].
#[derive(Debug, thiserror::Error)]
pub enum EncodeError {
    /// Serializing the records failed.
    #[error("failed to serialize metrics")]
    Json(#[from] serde_json::Error),
    /// Compressing the payload failed.
    #[error("failed to compress metrics")]
    Compress(#[source] io::Error),
}

/// An error raised when verifying, decompressing or decoding a payload.
#[derive(Debug, thiserror::Error)]
pub enum DecodeError {
    /// The signature is missing or does not match the payload.
    #[error("signature verification failed")]
    Signature(#[from] VerifyError),
    /// The payload is not valid gzip.
    #[error("failed to decompress payload")]
    Decompress(#[source] io::Error),
    /// The decompressed payload exceeds the size limit.
    #[error("decompressed payload exceeds {0} bytes")]
    TooLarge(usize),
    /// The payload is not a valid JSON record or list of records.
    #[error("invalid json payload")]
    Json(#[from] serde_json::Error),
    /// A record does not describe a valid metric.
    #[error("invalid metric record")]
    InvalidRecord(#[from] ParseMetricError),
}

/// A compressed and optionally signed batch ready to be put on the wire.
#[derive(Clone, Debug)]
pub struct EncodedBatch {
    /// The gzip compressed JSON array of records.
    pub payload: Vec<u8>,
    /// HMAC-SHA256 over `payload`, present if a key was given.
    pub signature: Option<Signature>,
}

/// Serializes, compresses and signs a batch.
pub fn encode(batch: &[Metric], key: Option<&SharedKey>) -> Result<EncodedBatch, EncodeError> {
    let records = batch.iter().map(MetricRecord::from).collect::<Vec<_>>();
    let json = serde_json::to_vec(&records)?;

    let mut encoder = GzEncoder::new(Vec::new(), Compression::default());
    encoder.write_all(&json).map_err(EncodeError::Compress)?;
    let payload = encoder.finish().map_err(EncodeError::Compress)?;

    let signature = key.map(|key| key.sign(&payload));
    Ok(EncodedBatch { payload, signature })
}

/// Checks the signature of a raw payload.
///
/// Without a key, any signature is ignored. With a key, the signature must be present and match.
pub fn verify(
    payload: &[u8],
    signature: Option<&str>,
    key: Option<&SharedKey>,
) -> Result<(), VerifyError> {
    let Some(key) = key else {
        return Ok(());
    };

    let signature = signature.ok_or(VerifyError::MissingSignature)?;
    key.verify(payload, signature)
}

/// Decompresses a gzip payload, failing if the result exceeds `limit` bytes.
pub fn decompress(payload: &[u8], limit: usize) -> Result<Vec<u8>, DecodeError> {
    let mut decoded = Vec::new();
    GzDecoder::new(payload)
        .take(limit as u64 + 1)
        .read_to_end(&mut decoded)
        .map_err(DecodeError::Decompress)?;

    if decoded.len() > limit {
        return Err(DecodeError::TooLarge(limit));
    }

    Ok(decoded)
}

/// Parses a JSON array of records into a batch.
pub fn parse_batch(json: &[u8]) -> Result<Batch, DecodeError> {
    let records: Vec<MetricRecord> = serde_json::from_slice(json)?;
    let batch = records
        .into_iter()
        .map(Metric::try_from)
        .collect::<Result<_, _>>()?;
    Ok(batch)
}

/// Parses a single JSON record into a metric.
pub fn parse_record(json: &[u8]) -> Result<Metric, DecodeError> {
    let record: MetricRecord = serde_json::from_slice(json)?;
    Ok(Metric::try_from(record)?)
}

/// Verifies, decompresses and parses a payload produced by [`encode`].
pub fn decode(
    payload: &[u8],
    signature: Option<&str>,
    key: Option<&SharedKey>,
    limit: usize,
) -> Result<Batch, DecodeError> {
    verify(payload, signature, key)?;
    let json = decompress(payload, limit)?;
    parse_batch(&json)
}
