//! Content fingerprints: hex SHA-256 over the stored bytes.

use futures::TryStreamExt;
use ring::digest::{Context, SHA256};

use crate::object_store::{ByteStream, ObjectStoreError};

pub fn of_bytes(data: &[u8]) -> String {
    hex::encode(ring::digest::digest(&SHA256, data))
}

/// Hash a stored object chunk by chunk, without holding it in memory.
pub async fn of_stream(mut stream: ByteStream) -> Result<String, ObjectStoreError> {
    let mut ctx = Context::new(&SHA256);
    while let Some(chunk) = stream.try_next().await? {
        ctx.update(&chunk);
    }
    Ok(hex::encode(ctx.finish()))
}
