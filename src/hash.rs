use std::fmt;
use std::io::{copy, Read};

use crate::error::Error;

/// 256 bit content digest of a buffer.
///
/// Equality is constant time (inherited from `blake3::Hash`).
#[derive(PartialEq, Eq, Clone)]
pub struct Digest(blake3::Hash);

pub fn digest<R: Read>(data: &mut R) -> Result<Digest, Error> {
    let mut hash = blake3::Hasher::new();
    copy(data, &mut hash).map_err(Error::HashError)?;
    Ok(Digest(hash.finalize()))
}

impl Digest {
    pub fn to_hex(&self) -> String {
        hex::encode(self.0.as_bytes())
    }
}

/// Digest of a short in-memory value, for comparisons that must not leak
/// how much of it matched.
pub fn digest_of(data: &[u8]) -> Digest {
    Digest(blake3::hash(data))
}

impl fmt::Debug for Digest {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_tuple("Digest").field(&self.to_hex()).finish()
    }
}
