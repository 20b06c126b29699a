//! Static mapping from algorithm to the operations it supports.
//!
//! Algorithms fall into two disjoint families: AEAD ciphers support
//! `{ENCRYPT, DECRYPT}` and signature schemes support `{SIGN, VERIFY}`. The table
//! is checked for completeness when a [`crate::KeysetManager`] is constructed.

use std::{collections::HashMap, fmt, sync::LazyLock};

use serde::{Deserialize, Serialize};

use crate::{
    error::{KeysetError, KeysetResult},
    models::KeysetAlgorithm,
};

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Hash, PartialOrd, Ord)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum KeysetOperation {
    Encrypt,
    Decrypt,
    Sign,
    Verify,
}

impl KeysetOperation {
    pub fn as_str(&self) -> &'static str {
        match self {
            KeysetOperation::Encrypt => "ENCRYPT",
            KeysetOperation::Decrypt => "DECRYPT",
            KeysetOperation::Sign => "SIGN",
            KeysetOperation::Verify => "VERIFY",
        }
    }
}

impl fmt::Display for KeysetOperation {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum AlgorithmFamily {
    Aead,
    Signature,
}

impl AlgorithmFamily {
    pub fn operations(&self) -> &'static [KeysetOperation] {
        match self {
            AlgorithmFamily::Aead => &[KeysetOperation::Encrypt, KeysetOperation::Decrypt],
            AlgorithmFamily::Signature => &[KeysetOperation::Sign, KeysetOperation::Verify],
        }
    }
}

static CAPABILITIES: LazyLock<CapabilityTable> = LazyLock::new(|| {
    CapabilityTable::from_entries([
        (KeysetAlgorithm::Aes128Gcm, AlgorithmFamily::Aead),
        (KeysetAlgorithm::Aes256Gcm, AlgorithmFamily::Aead),
        (KeysetAlgorithm::ChaCha20Poly1305, AlgorithmFamily::Aead),
        (KeysetAlgorithm::XChaCha20Poly1305, AlgorithmFamily::Aead),
        (KeysetAlgorithm::EcdsaP256, AlgorithmFamily::Signature),
        (KeysetAlgorithm::EcdsaP384, AlgorithmFamily::Signature),
        (KeysetAlgorithm::Ed25519, AlgorithmFamily::Signature),
    ])
});

#[derive(Debug, Clone)]
pub struct CapabilityTable {
    families: HashMap<KeysetAlgorithm, AlgorithmFamily>,
}

impl CapabilityTable {
    /// The table every manager and gateway consults.
    pub fn global() -> &'static CapabilityTable {
        &CAPABILITIES
    }

    pub fn from_entries(
        entries: impl IntoIterator<Item = (KeysetAlgorithm, AlgorithmFamily)>,
    ) -> Self {
        Self {
            families: entries.into_iter().collect(),
        }
    }

    /// Fails if any known algorithm lacks an entry.
    pub fn validate(&self) -> KeysetResult<()> {
        let missing: Vec<&str> = KeysetAlgorithm::ALL
            .iter()
            .filter(|alg| !self.families.contains_key(alg))
            .map(|alg| alg.as_str())
            .collect();
        if missing.is_empty() {
            Ok(())
        } else {
            Err(KeysetError::crypto(format!(
                "capability table has no entry for {}",
                missing.join(", ")
            )))
        }
    }

    pub fn family(&self, algorithm: KeysetAlgorithm) -> KeysetResult<AlgorithmFamily> {
        self.families.get(&algorithm).copied().ok_or_else(|| {
            KeysetError::crypto(format!("no capability entry for algorithm {algorithm}"))
        })
    }

    pub fn supported(&self, algorithm: KeysetAlgorithm) -> KeysetResult<&'static [KeysetOperation]> {
        Ok(self.family(algorithm)?.operations())
    }

    pub fn supports(&self, algorithm: KeysetAlgorithm, operation: KeysetOperation) -> bool {
        self.supported(algorithm)
            .is_ok_and(|ops| ops.contains(&operation))
    }

    /// Rejects `operation` with `InvalidUsage` unless the algorithm supports it.
    pub fn ensure(&self, algorithm: KeysetAlgorithm, operation: KeysetOperation) -> KeysetResult<()> {
        let supported = self.supported(algorithm)?;
        if supported.contains(&operation) {
            return Ok(());
        }
        Err(KeysetError::InvalidUsage {
            operation,
            supported: supported.to_vec(),
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use test_case::test_case;

    #[test]
    fn global_table_is_complete() {
        CapabilityTable::global().validate().expect("complete table");
    }

    #[test]
    fn incomplete_table_fails_validation() {
        let table = CapabilityTable::from_entries([(KeysetAlgorithm::Aes256Gcm, AlgorithmFamily::Aead)]);
        let err = table.validate().unwrap_err();
        assert!(err.to_string().contains("ED25519"));
    }

    #[test_case(KeysetAlgorithm::Aes128Gcm, AlgorithmFamily::Aead)]
    #[test_case(KeysetAlgorithm::Aes256Gcm, AlgorithmFamily::Aead)]
    #[test_case(KeysetAlgorithm::ChaCha20Poly1305, AlgorithmFamily::Aead)]
    #[test_case(KeysetAlgorithm::XChaCha20Poly1305, AlgorithmFamily::Aead)]
    #[test_case(KeysetAlgorithm::EcdsaP256, AlgorithmFamily::Signature)]
    #[test_case(KeysetAlgorithm::EcdsaP384, AlgorithmFamily::Signature)]
    #[test_case(KeysetAlgorithm::Ed25519, AlgorithmFamily::Signature)]
    fn algorithm_family(algorithm: KeysetAlgorithm, expected: AlgorithmFamily) {
        assert_eq!(CapabilityTable::global().family(algorithm).unwrap(), expected);
    }

    #[test]
    fn families_are_disjoint() {
        let aead = AlgorithmFamily::Aead.operations();
        let sig = AlgorithmFamily::Signature.operations();
        assert!(aead.iter().all(|op| !sig.contains(op)));
    }

    #[test]
    fn ensure_reports_full_supported_set() {
        let err = CapabilityTable::global()
            .ensure(KeysetAlgorithm::Ed25519, KeysetOperation::Encrypt)
            .unwrap_err();
        match err {
            KeysetError::InvalidUsage {
                operation,
                supported,
            } => {
                assert_eq!(operation, KeysetOperation::Encrypt);
                assert_eq!(supported, vec![KeysetOperation::Sign, KeysetOperation::Verify]);
            }
            other => panic!("unexpected error {other:?}"),
        }
    }
}
