//! HTTP-Redirect and HTTP-POST binding encodings.

use base64::{engine::general_purpose::STANDARD as BASE64, Engine};
use std::io::{Read, Write};

use crate::error::{SamlError, ValidationFailure};

/// Decoded messages larger than this are rejected, on either binding.
pub const MAX_MESSAGE_SIZE: usize = 256 * 1024;

/// Deflate and base64 encode for SAML redirect binding.
pub fn deflate_and_encode(xml: &str) -> Result<String, SamlError> {
    let mut encoder =
        flate2::write::DeflateEncoder::new(Vec::new(), flate2::Compression::default());
    encoder
        .write_all(xml.as_bytes())
        .map_err(|e| SamlError::Encoding(e.to_string()))?;
    let compressed = encoder
        .finish()
        .map_err(|e| SamlError::Encoding(e.to_string()))?;
    Ok(BASE64.encode(compressed))
}

/// Reverse of [`deflate_and_encode`] for messages arriving on the redirect binding.
pub fn decode_and_inflate(encoded: &str) -> Result<String, ValidationFailure> {
    let compressed = decode_base64(encoded)?;

    let mut xml = String::new();
    flate2::read::DeflateDecoder::new(compressed.as_slice())
        .take(MAX_MESSAGE_SIZE as u64 + 1)
        .read_to_string(&mut xml)
        .map_err(|e| ValidationFailure::Decode(format!("inflate failed: {e}")))?;

    if xml.len() > MAX_MESSAGE_SIZE {
        return Err(too_large());
    }
    Ok(xml)
}

/// Decode a POST-binding message.
pub fn decode_post(encoded: &str) -> Result<String, ValidationFailure> {
    // Rough bound before decoding. Line breaks add only a few percent.
    if encoded.len() / 4 * 3 > MAX_MESSAGE_SIZE * 2 {
        return Err(too_large());
    }
    let bytes = decode_base64(encoded)?;
    if bytes.len() > MAX_MESSAGE_SIZE {
        return Err(too_large());
    }
    String::from_utf8(bytes)
        .map_err(|_| ValidationFailure::Decode("SAML message is not valid UTF-8".to_string()))
}

fn too_large() -> ValidationFailure {
    ValidationFailure::Decode("message too large".to_string())
}

fn decode_base64(encoded: &str) -> Result<Vec<u8>, ValidationFailure> {
    let compact: String = encoded.chars().filter(|c| !c.is_whitespace()).collect();
    BASE64
        .decode(compact)
        .map_err(|e| ValidationFailure::Decode(format!("invalid base64: {e}")))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_redirect_encoding_reverses() {
        let xml = r#"<samlp:LogoutResponse ID="_1"/>"#;
        let encoded = deflate_and_encode(xml).unwrap();
        assert!(!encoded.contains('<'));
        assert_eq!(decode_and_inflate(&encoded).unwrap(), xml);
    }

    #[test]
    fn test_post_decoding_tolerates_line_breaks() {
        let encoded = BASE64.encode("<Response/>");
        let wrapped = format!("{}\n{}", &encoded[..4], &encoded[4..]);
        assert_eq!(decode_post(&wrapped).unwrap(), "<Response/>");
    }

    #[test]
    fn test_rejects_garbage() {
        assert!(matches!(
            decode_post("not base64!").unwrap_err(),
            ValidationFailure::Decode(_)
        ));
        assert!(decode_and_inflate(&BASE64.encode("plain, not deflated")).is_err());
        assert!(decode_post(&BASE64.encode([0xff, 0xfe])).is_err());
    }

    #[test]
    fn test_message_size_limit() {
        let fits = format!("<R>{}</R>", "x".repeat(MAX_MESSAGE_SIZE - 7));
        assert_eq!(decode_post(&BASE64.encode(&fits)).unwrap().len(), MAX_MESSAGE_SIZE);

        let oversized = format!("<R>{}</R>", "x".repeat(MAX_MESSAGE_SIZE));
        assert_eq!(
            decode_post(&BASE64.encode(&oversized)).unwrap_err(),
            ValidationFailure::Decode("message too large".to_string())
        );
        assert!(decode_and_inflate(&deflate_and_encode(&oversized).unwrap()).is_err());
        assert!(decode_post(&"A".repeat(4 * MAX_MESSAGE_SIZE)).is_err());
    }
}
