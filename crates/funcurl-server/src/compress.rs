//! Response compression.
//!
//! Only static and template responses are compressed, and only when the
//! content type compresses well, the client accepts an encoding and the body
//! is larger than the configured threshold.

use std::io::{self, Write};

use bytes::Bytes;
use flate2::Compression;
use flate2::write::{GzEncoder, ZlibEncoder};

/// A negotiated content encoding.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Encoding {
    /// `gzip`.
    Gzip,
    /// `deflate` (zlib stream).
    Deflate,
}

impl Encoding {
    /// Value of the `content-encoding` header.
    pub fn as_str(self) -> &'static str {
        match self {
            Encoding::Gzip => "gzip",
            Encoding::Deflate => "deflate",
        }
    }
}

/// Pick an encoding from an `accept-encoding` header; gzip wins.
pub fn negotiate(accept_encoding: Option<&str>) -> Option<Encoding> {
    let accept = accept_encoding?.to_ascii_lowercase();
    if accept.contains("gzip") {
        Some(Encoding::Gzip)
    } else if accept.contains("deflate") {
        Some(Encoding::Deflate)
    } else {
        None
    }
}

/// Compress `body` with `encoding`.
///
/// # Errors
///
/// Returns an I/O error if the encoder fails.
pub fn compress(body: &[u8], encoding: Encoding) -> io::Result<Bytes> {
    let out = match encoding {
        Encoding::Gzip => {
            let mut encoder = GzEncoder::new(Vec::new(), Compression::default());
            encoder.write_all(body)?;
            encoder.finish()?
        }
        Encoding::Deflate => {
            let mut encoder = ZlibEncoder::new(Vec::new(), Compression::default());
            encoder.write_all(body)?;
            encoder.finish()?
        }
    };
    Ok(Bytes::from(out))
}

/// Compression settings for one response.
#[derive(Debug, Clone, Copy)]
pub struct CompressPolicy<'a> {
    /// Compression enabled at all.
    pub enabled: bool,
    /// Bodies must be strictly larger than this.
    pub min_bytes: usize,
    /// The client's `accept-encoding` header.
    pub accept_encoding: Option<&'a str>,
}

/// Compress when the policy allows and the content is compressible.
///
/// Returns the (possibly unchanged) body and the applied encoding.
///
/// # Errors
///
/// Returns an I/O error if the encoder fails.
pub fn maybe_compress(
    body: Bytes,
    compressible: bool,
    policy: CompressPolicy<'_>,
) -> io::Result<(Bytes, Option<Encoding>)> {
    if !policy.enabled || !compressible || body.len() <= policy.min_bytes {
        return Ok((body, None));
    }
    match negotiate(policy.accept_encoding) {
        Some(encoding) => Ok((compress(&body, encoding)?, Some(encoding))),
        None => Ok((body, None)),
    }
}

#[cfg(test)]
mod tests {
    use std::io::Read;

    use flate2::read::{GzDecoder, ZlibDecoder};

    use super::*;

    fn policy(accept: Option<&str>) -> CompressPolicy<'_> {
        CompressPolicy {
            enabled: true,
            min_bytes: 1024,
            accept_encoding: accept,
        }
    }

    #[test]
    fn test_negotiate() {
        assert_eq!(negotiate(Some("br, GZIP")), Some(Encoding::Gzip));
        assert_eq!(negotiate(Some("deflate")), Some(Encoding::Deflate));
        assert_eq!(negotiate(Some("br")), None);
        assert_eq!(negotiate(None), None);
    }

    #[test]
    fn test_gzip_roundtrip() {
        let body = Bytes::from("a".repeat(2048));
        let (out, encoding) = maybe_compress(body.clone(), true, policy(Some("gzip"))).unwrap();
        assert_eq!(encoding, Some(Encoding::Gzip));
        assert!(out.len() < body.len());

        let mut decoded = String::new();
        GzDecoder::new(&out[..]).read_to_string(&mut decoded).unwrap();
        assert_eq!(decoded.as_bytes(), &body[..]);
    }

    #[test]
    fn test_deflate_is_zlib() {
        let body = Bytes::from("b".repeat(2048));
        let (out, encoding) = maybe_compress(body.clone(), true, policy(Some("deflate"))).unwrap();
        assert_eq!(encoding, Some(Encoding::Deflate));

        let mut decoded = Vec::new();
        ZlibDecoder::new(&out[..]).read_to_end(&mut decoded).unwrap();
        assert_eq!(decoded, body.to_vec());
    }

    #[test]
    fn test_pass_through_cases() {
        let small = Bytes::from("x".repeat(1024));
        assert_eq!(maybe_compress(small, true, policy(Some("gzip"))).unwrap().1, None);

        let big = Bytes::from("x".repeat(4096));
        assert_eq!(maybe_compress(big.clone(), false, policy(Some("gzip"))).unwrap().1, None);
        assert_eq!(maybe_compress(big.clone(), true, policy(None)).unwrap().1, None);

        let disabled = CompressPolicy {
            enabled: false,
            ..policy(Some("gzip"))
        };
        assert_eq!(maybe_compress(big, true, disabled).unwrap().1, None);
    }
}
