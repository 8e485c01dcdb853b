//! Optional content transformation before bytes are persisted.

use async_trait::async_trait;
use bytes::Bytes;

use crate::error::Result;

#[derive(Debug, Clone)]
pub struct Prepared {
    pub data: Bytes,
    pub mime_type: String,
}

/// Runs between validation and quota reservation, so quota and bandwidth
/// see the post-processing size.
#[async_trait]
pub trait Preprocessor: Send + Sync {
    async fn prepare(&self, data: Bytes, mime_type: &str) -> Result<Prepared>;
}

pub struct Passthrough;

#[async_trait]
impl Preprocessor for Passthrough {
    async fn prepare(&self, data: Bytes, mime_type: &str) -> Result<Prepared> {
        Ok(Prepared {
            data,
            mime_type: mime_type.to_string(),
        })
    }
}
