//! Request payload sources and their correctness checks.

use crate::error::{Error, Result};
use crate::runtime::{identity, ResponseFn};
use bytes::Bytes;
use rand::Rng;

/// Produces request bytes and judges the reply to them.
///
/// The server side of a run is configured with `response_fn`, so a provider
/// always knows what a correct reply looks like.
pub trait RequestProvider: Send + Sync {
    fn request(&self) -> Bytes;

    /// Whether `received` is an acceptable reply to `sent`.
    fn is_correct(&self, sent: &[u8], received: &[u8]) -> bool {
        sent.len() == received.len()
    }

    /// Transform the server applies to each received chunk.
    fn response_fn(&self) -> ResponseFn {
        identity()
    }
}

/// Fresh random bytes per request, length drawn from `[min, max)`.
#[derive(Debug, Clone)]
pub struct RandomPayload {
    min: usize,
    max: usize,
}

impl RandomPayload {
    /// Fails for a zero minimum: an empty request can never be answered.
    pub fn new(min: usize, max: usize) -> Result<Self> {
        check_min_len(min)?;
        // An empty range degrades to a fixed length
        let max = max.max(min + 1);
        Ok(Self { min, max })
    }
}

impl RequestProvider for RandomPayload {
    fn request(&self) -> Bytes {
        let mut rng = rand::thread_rng();
        let len = rng.gen_range(self.min..self.max);
        Bytes::from(random_bytes(&mut rng, len))
    }
}

/// One random payload generated up front and sent on every request.
#[derive(Debug, Clone)]
pub struct CachedPayload {
    payload: Bytes,
}

impl CachedPayload {
    pub fn new(min: usize, max: usize) -> Result<Self> {
        check_min_len(min)?;
        let mut rng = rand::thread_rng();
        let len = rng.gen_range(min..max.max(min + 1));
        Ok(Self {
            payload: Bytes::from(random_bytes(&mut rng, len)),
        })
    }

    pub fn payload_len(&self) -> usize {
        self.payload.len()
    }
}

impl RequestProvider for CachedPayload {
    fn request(&self) -> Bytes {
        // Bytes clones share the allocation
        self.payload.clone()
    }
}

fn check_min_len(min: usize) -> Result<()> {
    if min == 0 {
        return Err(Error::Config("payload length must be at least 1 byte".to_string()));
    }
    Ok(())
}

pub(crate) fn random_bytes<R: Rng>(rng: &mut R, len: usize) -> Vec<u8> {
    let mut buf = vec![0u8; len];
    rng.fill(&mut buf[..]);
    buf
}
