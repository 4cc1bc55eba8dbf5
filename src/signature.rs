//! Signed tokens binding a target URL to an HMAC tag.
//!
//! A token is `<tag>/<encoded url>` and is served under the proxy root as
//! `/<tag>/<encoded url>`:
//!
//! ```text
//! tag = encode(HMAC-SHA1(key, url))
//! ```
//!
//! Both parts use the same encoding, either URL-safe base64 without padding
//! or lowercase hex. Neither alphabet contains `/`, so the split is
//! unambiguous. The tag is compatible with existing camo clients.

use base64::engine::general_purpose::URL_SAFE_NO_PAD;
use base64::Engine;
use hmac::{Hmac, Mac};
use sha1::Sha1;

use crate::Error;

type HmacSha1 = Hmac<Sha1>;

/// Length of a hex-encoded SHA-1 tag.
const HEX_TAG_LEN: usize = 40;

/// Token alphabet.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub enum Encoding {
    /// URL-safe base64, no padding.
    #[default]
    Base64,
    /// Lowercase hexadecimal.
    Hex,
}

impl Encoding {
    fn encode(self, data: &[u8]) -> String {
        match self {
            Self::Base64 => URL_SAFE_NO_PAD.encode(data),
            Self::Hex => hex::encode(data),
        }
    }

    fn decode(self, part: &str, what: &str) -> Result<Vec<u8>, Error> {
        match self {
            // tolerate padding from clients that add it
            Self::Base64 => URL_SAFE_NO_PAD
                .decode(part.trim_end_matches('='))
                .map_err(|e| Error::malformed_token(format!("{} is not base64: {}", what, e))),
            Self::Hex => hex::decode(part)
                .map_err(|e| Error::malformed_token(format!("{} is not hex: {}", what, e))),
        }
    }

    /// Hex tags are exactly 40 hex digits; anything else is base64.
    fn detect(tag: &str) -> Self {
        if tag.len() == HEX_TAG_LEN && tag.bytes().all(|b| b.is_ascii_hexdigit()) {
            Self::Hex
        } else {
            Self::Base64
        }
    }
}

/// Encode `url` into a token signed with `key`.
///
/// # Example
///
/// ```rust
/// use media_jail::signature::{decode, encode, Encoding};
///
/// let token = encode(b"secret", "https://example.com/logo.png", Encoding::Base64);
/// assert_eq!(decode(b"secret", &token).unwrap(), "https://example.com/logo.png");
/// ```
pub fn encode(key: &[u8], url: &str, encoding: Encoding) -> String {
    let tag = compute_tag(key, url.as_bytes());
    format!("{}/{}", encoding.encode(&tag), encoding.encode(url.as_bytes()))
}

/// Encode `url` as a request path (`/<token>`).
pub fn encode_path(key: &[u8], url: &str, encoding: Encoding) -> String {
    format!("/{}", encode(key, url, encoding))
}

/// Decode a token and verify its tag.
///
/// A leading `/` is accepted so request paths can be passed directly.
///
/// # Errors
///
/// Returns [`Error::MalformedToken`] if the token is not two well-formed
/// parts or the URL is not UTF-8. These checks run before the tag is looked
/// at. Returns [`Error::InvalidSignature`] if the tag does not verify.
pub fn decode(key: &[u8], token: &str) -> Result<String, Error> {
    let token = token.strip_prefix('/').unwrap_or(token);

    let (tag_part, url_part) = token
        .split_once('/')
        .ok_or_else(|| Error::malformed_token("missing '/' between tag and url"))?;
    if tag_part.is_empty() || url_part.is_empty() {
        return Err(Error::malformed_token("empty tag or url"));
    }
    if url_part.contains('/') {
        return Err(Error::malformed_token("too many path segments"));
    }

    let encoding = Encoding::detect(tag_part);
    let tag = encoding.decode(tag_part, "tag")?;
    let url_bytes = encoding.decode(url_part, "url")?;

    let mut mac = new_mac(key);
    mac.update(&url_bytes);
    // constant-time comparison
    mac.verify_slice(&tag).map_err(|_| Error::InvalidSignature)?;

    String::from_utf8(url_bytes).map_err(|_| Error::malformed_token("url is not UTF-8"))
}

fn compute_tag(key: &[u8], message: &[u8]) -> Vec<u8> {
    let mut mac = new_mac(key);
    mac.update(message);
    mac.finalize().into_bytes().to_vec()
}

fn new_mac(key: &[u8]) -> HmacSha1 {
    HmacSha1::new_from_slice(key).expect("HMAC can take key of any size")
}

#[cfg(test)]
mod tests {
    use super::*;

    const KEY: &[u8] = b"0x24FEEDFACEDEADBEEFCAFE";
    const URL: &str = "http://www.example.com/images/srpr/logo11w.png";

    #[test]
    fn test_round_trip_base64() {
        let token = encode(KEY, URL, Encoding::Base64);
        assert_eq!(decode(KEY, &token).unwrap(), URL);
    }

    #[test]
    fn test_round_trip_hex() {
        let token = encode(KEY, URL, Encoding::Hex);
        assert_eq!(decode(KEY, &token).unwrap(), URL);
    }

    #[test]
    fn test_round_trip_awkward_urls() {
        for url in [
            "http://chart.apis.google.com/chart?chs=920x200&chxl=0:%7C2010-08-13%7C2010",
            "https://example.com/Screen%20Shot%202012-01-17%20at%203.42.32%20PM.png",
            "https://例え.jp/画像.png",
            "",
        ] {
            for encoding in [Encoding::Base64, Encoding::Hex] {
                let token = encode(KEY, url, encoding);
                if url.is_empty() {
                    assert!(decode(KEY, &token).is_err());
                } else {
                    assert_eq!(decode(KEY, &token).unwrap(), url);
                }
            }
        }
    }

    #[test]
    fn test_encode_is_deterministic() {
        assert_eq!(
            encode(KEY, URL, Encoding::Base64),
            encode(KEY, URL, Encoding::Base64)
        );
        assert_ne!(
            encode(KEY, URL, Encoding::Base64),
            encode(b"other key", URL, Encoding::Base64)
        );
    }

    #[test]
    fn test_token_is_path_safe() {
        let token = encode(KEY, "https://example.com/a?b=c&d=e#f", Encoding::Base64);
        assert_eq!(token.matches('/').count(), 1);
        assert!(token
            .bytes()
            .all(|b| b.is_ascii_alphanumeric() || b == b'-' || b == b'_' || b == b'/'));
    }

    #[test]
    fn test_encode_path_has_leading_slash() {
        let path = encode_path(KEY, URL, Encoding::Hex);
        assert!(path.starts_with('/'));
        assert_eq!(decode(KEY, &path).unwrap(), URL);
    }

    #[test]
    fn test_hex_tag_detected() {
        let token = encode(KEY, URL, Encoding::Hex);
        let (tag, _) = token.split_once('/').unwrap();
        assert_eq!(tag.len(), HEX_TAG_LEN);
        assert_eq!(Encoding::detect(tag), Encoding::Hex);
    }

    #[test]
    fn test_wrong_key_rejected() {
        let token = encode(KEY, URL, Encoding::Base64);
        assert!(matches!(
            decode(b"not the key", &token),
            Err(Error::InvalidSignature)
        ));
    }

    #[test]
    fn test_tampered_tag_rejected_at_every_position() {
        for encoding in [Encoding::Base64, Encoding::Hex] {
            let token = encode(KEY, URL, encoding);
            let tag_len = token.find('/').unwrap();

            for pos in 0..tag_len {
                let mut bytes = token.clone().into_bytes();
                bytes[pos] = if bytes[pos] == b'a' { b'b' } else { b'a' };
                let tampered = String::from_utf8(bytes).unwrap();

                let err = decode(KEY, &tampered).unwrap_err();
                assert_eq!(
                    err.kind(),
                    crate::ErrorKind::Signature,
                    "{:?} position {}",
                    encoding,
                    pos
                );
            }
        }
    }

    #[test]
    fn test_tampered_url_rejected() {
        let token = encode(KEY, URL, Encoding::Hex);
        let swapped = encode(KEY, "http://www.example.com/other.png", Encoding::Hex);
        let (tag, _) = token.split_once('/').unwrap();
        let (_, other_url) = swapped.split_once('/').unwrap();

        assert!(matches!(
            decode(KEY, &format!("{}/{}", tag, other_url)),
            Err(Error::InvalidSignature)
        ));
    }

    #[test]
    fn test_malformed_tokens() {
        for token in ["", "/", "onlyonepart", "abc/", "/abc", "a/b/c", "!!!!/@@@@"] {
            assert!(
                matches!(decode(KEY, token), Err(Error::MalformedToken { .. })),
                "token {:?}",
                token
            );
        }
    }

    #[test]
    fn test_base64_padding_tolerated() {
        let token = encode(KEY, URL, Encoding::Base64);
        let (tag, url) = token.split_once('/').unwrap();
        let padded = format!("{}=/{}==", tag, url);
        assert_eq!(decode(KEY, &padded).unwrap(), URL);
    }
}
