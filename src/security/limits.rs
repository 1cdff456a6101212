//! Request body limits.
//!
//! `RequestBodyLimitLayer` turns away bodies whose declared length is too
//! large before routing. Bodies without a declared length (chunked) are
//! counted while being read here, and an overrun becomes `413`.

use std::error::Error as StdError;

use axum::body::Body;
use bytes::Bytes;
use http_body_util::{BodyExt, LengthLimitError, Limited};

#[derive(Debug, thiserror::Error)]
pub enum BodyError {
    #[error("request body exceeds {limit} bytes")]
    TooLarge { limit: usize },
    #[error("failed to read request body: {0}")]
    Read(String),
}

/// Read a whole request body, failing once more than `limit` bytes arrive.
pub async fn read_body(body: Body, limit: usize) -> Result<Bytes, BodyError> {
    match Limited::new(body, limit).collect().await {
        Ok(collected) => Ok(collected.to_bytes()),
        Err(e) if is_length_limit(e.as_ref()) => Err(BodyError::TooLarge { limit }),
        Err(e) => Err(BodyError::Read(e.to_string())),
    }
}

/// The limit may have been hit by an outer layer, so walk the source chain.
fn is_length_limit(mut err: &(dyn StdError + 'static)) -> bool {
    loop {
        if err.is::<LengthLimitError>() {
            return true;
        }
        match err.source() {
            Some(source) => err = source,
            None => return false,
        }
    }
}
