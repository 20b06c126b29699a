//! Contract between the lifecycle manager and the component that owns key material.

use std::fmt;

use sha2::{Digest, Sha256};

use crate::{error::KeysetResult, models::KeysetAlgorithm};

/// Internal handle for key material, derived from the keyset's namespace and name.
///
/// Never leaves the crate through the operation gateway.
#[derive(Clone, PartialEq, Eq, Hash)]
pub struct MaterialName(String);

impl MaterialName {
    pub fn derive(namespace: &str, name: &str) -> Self {
        let digest = Sha256::digest(format!("{namespace}/{name}").as_bytes());
        Self(format!("ks_{}", hex::encode(digest)))
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Debug for MaterialName {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str("MaterialName(..)")
    }
}

/// Creates, rotates, uses and destroys key material.
///
/// Failures caused by caller-supplied data (tampered ciphertext, wrong
/// associated data, bad signature) are reported as
/// [`crate::KeysetError::OperationFailed`]; everything else is a backend error.
pub trait CryptoEngine: Send + Sync {
    /// Materialize version 1 of a new keyset.
    fn create_keyset(&self, name: &MaterialName, algorithm: KeysetAlgorithm) -> KeysetResult<()>;
    /// Append a new primary version and return its number. Earlier versions stay usable.
    fn rotate(&self, name: &MaterialName) -> KeysetResult<u32>;
    /// Irreversibly destroy every version. Destroying absent material is not an error.
    fn destroy(&self, name: &MaterialName) -> KeysetResult<()>;
    fn exists(&self, name: &MaterialName) -> KeysetResult<bool>;
    fn version_count(&self, name: &MaterialName) -> KeysetResult<usize>;

    fn encrypt(&self, name: &MaterialName, plaintext: &[u8], aad: &[u8]) -> KeysetResult<Vec<u8>>;
    fn decrypt(&self, name: &MaterialName, ciphertext: &[u8], aad: &[u8]) -> KeysetResult<Vec<u8>>;
    fn sign(&self, name: &MaterialName, payload: &[u8]) -> KeysetResult<Vec<u8>>;
    fn verify(&self, name: &MaterialName, payload: &[u8], signature: &[u8]) -> KeysetResult<()>;
}
