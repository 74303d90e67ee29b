//! Deterministic X25519 key derivation for the simulated link.
//!
//! Every side of a run needs a keypair. A scenario may supply one explicitly
//! (hex, base64, or a `{path: ...}` reference to a file holding hex/base64
//! text) or leave it to be derived from the scenario seed via HKDF-SHA256,
//! with a canonical salt built from the two adapters' spec strings so the
//! derivation is stable regardless of which side is "left" or "right".

use hkdf::Hkdf;
use sha2::{Digest, Sha256};
use x25519_dalek::{PublicKey, StaticSecret};

use crate::errors::CryptoError;

/// Where a side's private key material came from.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Provenance {
    Scenario,
    Derived,
}

#[derive(Debug, Clone)]
pub struct SideKeys {
    pub private: [u8; 32],
    pub public: [u8; 32],
    pub provenance: Provenance,
}

/// A scenario-supplied key, as it appears in `scenario.crypto.{left,right}_priv`.
#[derive(Debug, Clone)]
pub enum SuppliedKey {
    Hex(String),
    Base64(String),
    Path(String),
}

/// Interpret a `scenario.crypto.{left,right}_priv` YAML value: a bare
/// string is hex-or-base64 text (the two are tried interchangeably by
/// [`parse_supplied_key`]); a `{path: ...}` mapping names a file to read.
pub fn supplied_key_from_yaml(value: &serde_yaml::Value) -> Option<SuppliedKey> {
    match value {
        serde_yaml::Value::String(s) => Some(SuppliedKey::Hex(s.clone())),
        serde_yaml::Value::Mapping(map) => map
            .get(serde_yaml::Value::String("path".to_string()))
            .and_then(|v| v.as_str())
            .map(|p| SuppliedKey::Path(p.to_string())),
        _ => None,
    }
}

fn hkdf_sha256(ikm: &[u8], salt: &[u8], info: &[u8], length: usize) -> Vec<u8> {
    let hk = Hkdf::<Sha256>::new(Some(salt), ikm);
    let mut okm = vec![0u8; length];
    hk.expand(info, &mut okm)
        .expect("HKDF-SHA256 output length within RFC 5869 bound");
    okm
}

fn decode_base64(s: &str) -> Option<Vec<u8>> {
    // Minimal standard-alphabet base64 decoder (with padding), matching the
    // forms the Python reference accepts; avoids pulling in a base64 crate
    // for one call site.
    const ALPHABET: &[u8] =
        b"ABCDEFGHIJKLMNOPQRSTUVWXYZabcdefghijklmnopqrstuvwxyz0123456789+/";
    let s = s.trim().trim_end_matches('=');
    let mut bits: u32 = 0;
    let mut nbits: u32 = 0;
    let mut out = Vec::new();
    for c in s.bytes() {
        let val = ALPHABET.iter().position(|&a| a == c)? as u32;
        bits = (bits << 6) | val;
        nbits += 6;
        if nbits >= 8 {
            nbits -= 8;
            out.push((bits >> nbits) as u8);
        }
    }
    Some(out)
}

fn priv_seed_from_bytes(raw: &[u8]) -> Result<[u8; 32], CryptoError> {
    match raw.len() {
        32 => {
            let mut out = [0u8; 32];
            out.copy_from_slice(raw);
            Ok(out)
        }
        64 => {
            let mut out = [0u8; 32];
            out.copy_from_slice(&raw[..32]);
            Ok(out)
        }
        other => Err(CryptoError::InvalidPrivateKeyLength { len: other }),
    }
}

/// Parse a scenario-supplied private key, accepting a raw path-resolved
/// content string as hex or base64 text.
pub fn parse_supplied_key(
    key: &SuppliedKey,
    read_path: impl FnOnce(&str) -> std::io::Result<String>,
) -> Result<[u8; 32], CryptoError> {
    let text = match key {
        SuppliedKey::Hex(s) => s.clone(),
        SuppliedKey::Base64(s) => s.clone(),
        SuppliedKey::Path(p) => read_path(p).map_err(|_| CryptoError::KeyFileUnreadable {
            path: p.clone(),
        })?,
    };
    let text = text.trim();

    if let Ok(raw) = hex::decode(text) {
        return priv_seed_from_bytes(&raw);
    }
    if let Some(raw) = decode_base64(text) {
        return priv_seed_from_bytes(&raw);
    }
    Err(CryptoError::InvalidPrivateKey {
        reason: "not valid hex or base64".to_string(),
    })
}

fn pub_from_priv_seed(priv32: &[u8; 32]) -> [u8; 32] {
    let secret = StaticSecret::from(*priv32);
    PublicKey::from(&secret).to_bytes()
}

/// Canonical HKDF salt: `sha256("DryBox.X25519.v1|" + min(a,b) + "|" + max(a,b))`
/// where `a`/`b` are the two adapter spec strings compared as raw UTF-8 bytes.
fn canonical_salt(left_spec: &str, right_spec: &str) -> [u8; 32] {
    let (aa, bb) = if left_spec.as_bytes() <= right_spec.as_bytes() {
        (left_spec, right_spec)
    } else {
        (right_spec, left_spec)
    };
    let mut hasher = Sha256::new();
    hasher.update(b"DryBox.X25519.v1|");
    hasher.update(aa.as_bytes());
    hasher.update(b"|");
    hasher.update(bb.as_bytes());
    hasher.finalize().into()
}

/// Derive a side's private-key seed from the scenario seed, the two
/// adapters' spec strings, and which side this is (`"left"` or `"right"`).
pub fn derive_priv_seed(seed: u64, left_spec: &str, right_spec: &str, side: &str) -> [u8; 32] {
    let ikm = seed.to_le_bytes();
    let salt = canonical_salt(left_spec, right_spec);
    let info = format!("side:{side}");
    let okm = hkdf_sha256(&ikm, &salt, info.as_bytes(), 32);
    let mut out = [0u8; 32];
    out.copy_from_slice(&okm);
    out
}

/// Resolve both sides' keypairs: scenario-supplied keys win when present,
/// otherwise each side's key is derived from the scenario seed.
pub fn resolve_keypairs(
    seed: u64,
    left_spec: &str,
    right_spec: &str,
    left_supplied: Option<&SuppliedKey>,
    right_supplied: Option<&SuppliedKey>,
    read_path: impl Fn(&str) -> std::io::Result<String>,
) -> Result<(SideKeys, SideKeys), CryptoError> {
    let left = match left_supplied {
        Some(k) => SideKeys {
            private: parse_supplied_key(k, &read_path)?,
            public: [0u8; 32], // filled below
            provenance: Provenance::Scenario,
        },
        None => SideKeys {
            private: derive_priv_seed(seed, left_spec, right_spec, "left"),
            public: [0u8; 32],
            provenance: Provenance::Derived,
        },
    };
    let right = match right_supplied {
        Some(k) => SideKeys {
            private: parse_supplied_key(k, &read_path)?,
            public: [0u8; 32],
            provenance: Provenance::Scenario,
        },
        None => SideKeys {
            private: derive_priv_seed(seed, left_spec, right_spec, "right"),
            public: [0u8; 32],
            provenance: Provenance::Derived,
        },
    };

    let left = SideKeys {
        public: pub_from_priv_seed(&left.private),
        ..left
    };
    let right = SideKeys {
        public: pub_from_priv_seed(&right.private),
        ..right
    };

    Ok((left, right))
}

/// Short identifier for a public key, for logs and the resolved-scenario
/// artifact: the first 8 hex characters of its SHA-256 digest.
pub fn key_id(public: &[u8; 32]) -> String {
    let digest = Sha256::digest(public);
    hex::encode(digest)[..8].to_string()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn derivation_is_deterministic() {
        let a = derive_priv_seed(42, "adapter:a", "adapter:b", "left");
        let b = derive_priv_seed(42, "adapter:a", "adapter:b", "left");
        assert_eq!(a, b);
    }

    #[test]
    fn salt_is_order_independent_of_side_labels() {
        let a = canonical_salt("adapter:a", "adapter:b");
        let b = canonical_salt("adapter:b", "adapter:a");
        assert_eq!(a, b);
    }

    #[test]
    fn left_and_right_derive_different_keys() {
        let left = derive_priv_seed(7, "adapter:a", "adapter:b", "left");
        let right = derive_priv_seed(7, "adapter:a", "adapter:b", "right");
        assert_ne!(left, right);
    }

    #[test]
    fn different_seeds_derive_different_keys() {
        let a = derive_priv_seed(1, "adapter:a", "adapter:b", "left");
        let b = derive_priv_seed(2, "adapter:a", "adapter:b", "left");
        assert_ne!(a, b);
    }

    #[test]
    fn hex_supplied_key_round_trips_to_32_bytes() {
        let hex_key = "ab".repeat(32);
        let key = SuppliedKey::Hex(hex_key);
        let parsed = parse_supplied_key(&key, |_| unreachable!()).unwrap();
        assert_eq!(parsed, [0xab; 32]);
    }

    #[test]
    fn sixty_four_byte_supplied_key_truncates_to_first_32() {
        let hex_key = "cd".repeat(64);
        let key = SuppliedKey::Hex(hex_key);
        let parsed = parse_supplied_key(&key, |_| unreachable!()).unwrap();
        assert_eq!(parsed, [0xcd; 32]);
    }

    #[test]
    fn malformed_supplied_key_is_an_error() {
        let key = SuppliedKey::Hex("not hex at all!!".to_string());
        assert!(parse_supplied_key(&key, |_| unreachable!()).is_err());
    }

    #[test]
    fn path_supplied_key_reads_through_callback() {
        let key = SuppliedKey::Path("keys/left.hex".to_string());
        let hex_content = "11".repeat(32);
        let parsed = parse_supplied_key(&key, |p| {
            assert_eq!(p, "keys/left.hex");
            Ok(hex_content.clone())
        })
        .unwrap();
        assert_eq!(parsed, [0x11; 32]);
    }

    #[test]
    fn key_id_is_stable_and_short() {
        let pubkey = [0x42u8; 32];
        let id = key_id(&pubkey);
        assert_eq!(id.len(), 8);
        assert_eq!(id, key_id(&pubkey));
    }

    #[test]
    fn supplied_key_from_yaml_reads_bare_string_as_hex_or_base64() {
        let value = serde_yaml::Value::String("ab".repeat(32));
        let key = supplied_key_from_yaml(&value).unwrap();
        let parsed = parse_supplied_key(&key, |_| unreachable!()).unwrap();
        assert_eq!(parsed, [0xab; 32]);
    }

    #[test]
    fn supplied_key_from_yaml_reads_path_mapping() {
        let value: serde_yaml::Value = serde_yaml::from_str("path: keys/left.hex").unwrap();
        let key = supplied_key_from_yaml(&value).unwrap();
        assert!(matches!(key, SuppliedKey::Path(p) if p == "keys/left.hex"));
    }

    #[test]
    fn resolve_keypairs_marks_provenance() {
        let (left, right) = resolve_keypairs(
            1,
            "adapter:a",
            "adapter:b",
            None,
            None,
            |_| unreachable!(),
        )
        .unwrap();
        assert_eq!(left.provenance, Provenance::Derived);
        assert_eq!(right.provenance, Provenance::Derived);
        assert_ne!(left.public, right.public);
    }
}
