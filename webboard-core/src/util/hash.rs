use serde::Serialize;
use sha2::{Digest, Sha256};

pub fn sha256(content: &[u8]) -> String {
    hex::encode(Sha256::digest(content))
}

/// Hex SHA-256 over the JSON form of `value`, streamed into the hasher.
pub fn fingerprint<T: Serialize + ?Sized>(value: &T) -> Result<String, serde_json::Error> {
    let mut hasher = Sha256::new();
    serde_json::to_writer(&mut hasher, value)?;
    Ok(hex::encode(hasher.finalize()))
}
