use base64::Engine;
use md5::Md5;
use rand::{seq::SliceRandom, Rng};
use scriptbot_plugin_sdk::{OperationError, OperationErrorKind};
use sha1::Sha1;
use sha2::{Digest, Sha256};

/// The `helpers` module: randomness, encodings and digests.
#[derive(Debug, Default)]
pub struct HelpersNamespace;

impl HelpersNamespace {
    /// A random number in `0..max`; zero when `max` is zero.
    pub fn random(&self, max: u64) -> u64 {
        if max == 0 {
            return 0;
        }
        rand::thread_rng().gen_range(0..max)
    }

    /// The numbers `0..max` in random order.
    pub fn random_permutation(&self, max: usize) -> Vec<usize> {
        let mut items: Vec<usize> = (0..max).collect();
        items.shuffle(&mut rand::thread_rng());
        items
    }

    pub fn base64_encode(&self, data: impl AsRef<[u8]>) -> String {
        base64::engine::general_purpose::STANDARD.encode(data)
    }

    pub fn base64_decode(&self, encoded: &str) -> Result<Vec<u8>, OperationError> {
        base64::engine::general_purpose::STANDARD
            .decode(encoded.trim())
            .map_err(|err| OperationError::new(OperationErrorKind::Encoding, err.to_string()))
    }

    pub fn hex_encode(&self, data: impl AsRef<[u8]>) -> String {
        hex::encode(data)
    }

    pub fn hex_decode(&self, encoded: &str) -> Result<Vec<u8>, OperationError> {
        hex::decode(encoded.trim())
            .map_err(|err| OperationError::new(OperationErrorKind::Encoding, err.to_string()))
    }

    /// Hex MD5 digest.
    pub fn md5_sum(&self, data: impl AsRef<[u8]>) -> String {
        hex::encode(Md5::digest(data.as_ref()))
    }

    pub fn sha1_sum(&self, data: impl AsRef<[u8]>) -> String {
        hex::encode(Sha1::digest(data.as_ref()))
    }

    pub fn sha256_sum(&self, data: impl AsRef<[u8]>) -> String {
        hex::encode(Sha256::digest(data.as_ref()))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn random_stays_below_max() {
        let helpers = HelpersNamespace;
        assert_eq!(helpers.random(0), 0);
        for _ in 0..100 {
            assert!(helpers.random(5) < 5);
        }
    }

    #[test]
    fn permutation_contains_every_number_once() {
        let mut items = HelpersNamespace.random_permutation(10);
        items.sort_unstable();
        assert_eq!(items, (0..10).collect::<Vec<_>>());
    }

    #[test]
    fn digests_match_known_values() {
        let helpers = HelpersNamespace;
        assert_eq!(helpers.md5_sum("abc"), "900150983cd24fb0d6963f7d28e17f72");
        assert_eq!(helpers.sha1_sum("abc"), "a9993e364706816aba3e25717850c26c9cd0d89d");
        assert_eq!(
            helpers.sha256_sum("abc"),
            "ba7816bf8f01cfea414140de5dae2223b00361a396177a9cb410ff61f20015ad"
        );
    }

    #[test]
    fn malformed_input_is_an_encoding_error() {
        let helpers = HelpersNamespace;
        assert_eq!(helpers.base64_decode("aGk=").unwrap(), b"hi");
        assert_eq!(helpers.hex_decode("6869").unwrap(), b"hi");
        assert_eq!(
            helpers.base64_decode("***").unwrap_err().kind,
            OperationErrorKind::Encoding
        );
        assert_eq!(helpers.hex_decode("zz").unwrap_err().kind, OperationErrorKind::Encoding);
    }
}
