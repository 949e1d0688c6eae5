//! Cryptographic identities

use std::fmt;

use serde::{Deserialize, Serialize};

use crate::errors::{ProtocolError, Result};

/// Size of the encryption public key carried by an identity
pub const ENCRYPTION_KEY_LEN: usize = 32;

const URL_LEN_PREFIX: usize = 8;

/// A user identity: the server that hosts it plus its encryption public key.
///
/// Two identities are equal exactly when their canonical encodings are
/// byte-equal.
#[derive(Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct CryptoIdentity {
    server_url: String,
    encryption_key: [u8; ENCRYPTION_KEY_LEN],
}

impl CryptoIdentity {
    /// Build an identity from its parts.
    pub fn new(server_url: impl Into<String>, encryption_key: [u8; ENCRYPTION_KEY_LEN]) -> Self {
        Self { server_url: server_url.into(), encryption_key }
    }

    /// Server hosting this identity.
    pub fn server_url(&self) -> &str {
        &self.server_url
    }

    /// Compressed encryption public key.
    pub fn encryption_key(&self) -> &[u8; ENCRYPTION_KEY_LEN] {
        &self.encryption_key
    }

    /// Canonical encoding: `len(url) as u64 BE || url || key`.
    ///
    /// Self-delimiting and lossless for every url length, so it can prefix
    /// storage keys.
    pub fn encoded(&self) -> Vec<u8> {
        let url = self.server_url.as_bytes();
        let mut out = Vec::with_capacity(URL_LEN_PREFIX + url.len() + ENCRYPTION_KEY_LEN);
        out.extend_from_slice(&(url.len() as u64).to_be_bytes());
        out.extend_from_slice(url);
        out.extend_from_slice(&self.encryption_key);
        out
    }

    /// Decode [`Self::encoded`] output.
    pub fn from_encoded(bytes: &[u8]) -> Result<Self> {
        let Some((len_bytes, rest)) = bytes.split_first_chunk::<URL_LEN_PREFIX>() else {
            return Err(ProtocolError::MalformedIdentity("missing length prefix"));
        };
        let expected = usize::try_from(u64::from_be_bytes(*len_bytes))
            .ok()
            .and_then(|url_len| url_len.checked_add(ENCRYPTION_KEY_LEN));
        if expected != Some(rest.len()) {
            return Err(ProtocolError::MalformedIdentity("length mismatch"));
        }

        let (url, key) = rest.split_at(rest.len() - ENCRYPTION_KEY_LEN);
        let server_url = std::str::from_utf8(url)
            .map_err(|_| ProtocolError::MalformedIdentity("server url is not utf-8"))?;
        let mut encryption_key = [0u8; ENCRYPTION_KEY_LEN];
        encryption_key.copy_from_slice(key);
        Ok(Self::new(server_url, encryption_key))
    }
}

impl fmt::Debug for CryptoIdentity {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let k = &self.encryption_key;
        write!(f, "CryptoIdentity({}#{:02x}{:02x}{:02x}{:02x})", self.server_url, k[0], k[1], k[2], k[3])
    }
}

impl fmt::Display for CryptoIdentity {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        fmt::Debug::fmt(self, f)
    }
}

#[cfg(test)]
mod tests {
    use proptest::prelude::*;

    use super::*;

    #[test]
    fn truncated_encoding_is_rejected() {
        let identity = CryptoIdentity::new("https://server.example", [7; ENCRYPTION_KEY_LEN]);
        let encoded = identity.encoded();
        assert!(CryptoIdentity::from_encoded(&encoded[..encoded.len() - 1]).is_err());
        assert!(CryptoIdentity::from_encoded(&[0]).is_err());
    }

    #[test]
    fn encoding_prefixes_do_not_collide() {
        let a = CryptoIdentity::new("a", [0; ENCRYPTION_KEY_LEN]);
        let b = CryptoIdentity::new("ab", [0; ENCRYPTION_KEY_LEN]);
        assert!(!b.encoded().starts_with(&a.encoded()));
    }

    #[test]
    fn long_urls_are_encoded_in_full() {
        let base = "u".repeat(usize::from(u16::MAX));
        let a = CryptoIdentity::new(format!("{base}a"), [0; ENCRYPTION_KEY_LEN]);
        let b = CryptoIdentity::new(format!("{base}b"), [0; ENCRYPTION_KEY_LEN]);

        assert_ne!(a.encoded(), b.encoded());
        assert_eq!(CryptoIdentity::from_encoded(&a.encoded()).unwrap(), a);
    }

    #[test]
    fn oversized_length_prefix_is_rejected() {
        let mut encoded = u64::MAX.to_be_bytes().to_vec();
        encoded.extend_from_slice(&[0; ENCRYPTION_KEY_LEN]);
        assert!(CryptoIdentity::from_encoded(&encoded).is_err());
    }

    proptest! {
        #![proptest_config(ProptestConfig::with_cases(100))]

        #[test]
        fn prop_encoding_is_canonical(url in "[a-z:/.]{0,40}", key in any::<[u8; 32]>()) {
            let identity = CryptoIdentity::new(url, key);
            let decoded = CryptoIdentity::from_encoded(&identity.encoded()).unwrap();
            prop_assert_eq!(decoded.encoded(), identity.encoded());
            prop_assert_eq!(decoded, identity);
        }
    }
}
