use crate::api::error::AppError;
use base64::{Engine as _, engine::general_purpose::STANDARD};

/// Decodes the transport encoding (standard padded base64). Surrounding
/// whitespace is ignored; anything else outside the alphabet is rejected.
pub fn decode(text: &str) -> Result<Vec<u8>, AppError> {
    STANDARD.decode(text.trim()).map_err(AppError::Decode)
}

pub fn encode(bytes: &[u8]) -> String {
    STANDARD.encode(bytes)
}
