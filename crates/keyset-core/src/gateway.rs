use std::sync::Arc;

use tracing::warn;

use crate::{
    capability::{CapabilityTable, KeysetOperation},
    engine::{CryptoEngine, MaterialName},
    error::KeysetResult,
    models::{KeysetId, KeysetMetadata},
};

/// Cryptographic operations bound to one active keyset.
///
/// Every call is checked against the keyset's capability set first. A rejected
/// call never reaches the crypto engine.
pub struct OperationGateway<C: CryptoEngine + ?Sized> {
    keyset: KeysetMetadata,
    material: MaterialName,
    engine: Arc<C>,
}

impl<C: CryptoEngine + ?Sized> OperationGateway<C> {
    pub(crate) fn new(keyset: KeysetMetadata, engine: Arc<C>) -> Self {
        let material = MaterialName::derive(&keyset.namespace, &keyset.name);
        Self {
            keyset,
            material,
            engine,
        }
    }

    /// Snapshot of the metadata the gateway was resolved against.
    pub fn keyset(&self) -> &KeysetMetadata {
        &self.keyset
    }

    pub fn keyset_id(&self) -> KeysetId {
        self.keyset.id
    }

    pub fn supported_operations(&self) -> KeysetResult<&'static [KeysetOperation]> {
        CapabilityTable::global().supported(self.keyset.algorithm)
    }

    pub fn encrypt(&self, plaintext: &[u8], aad: &[u8]) -> KeysetResult<Vec<u8>> {
        self.check(KeysetOperation::Encrypt)?;
        self.engine.encrypt(&self.material, plaintext, aad)
    }

    pub fn decrypt(&self, ciphertext: &[u8], aad: &[u8]) -> KeysetResult<Vec<u8>> {
        self.check(KeysetOperation::Decrypt)?;
        self.engine.decrypt(&self.material, ciphertext, aad)
    }

    pub fn sign(&self, payload: &[u8]) -> KeysetResult<Vec<u8>> {
        self.check(KeysetOperation::Sign)?;
        self.engine.sign(&self.material, payload)
    }

    pub fn verify(&self, payload: &[u8], signature: &[u8]) -> KeysetResult<()> {
        self.check(KeysetOperation::Verify)?;
        self.engine.verify(&self.material, payload, signature)
    }

    fn check(&self, operation: KeysetOperation) -> KeysetResult<()> {
        CapabilityTable::global()
            .ensure(self.keyset.algorithm, operation)
            .inspect_err(|_| {
                metrics::counter!("keyset_gateway_rejected_total", "operation" => operation.as_str())
                    .increment(1);
                warn!(
                    keyset = %self.keyset.id,
                    algorithm = %self.keyset.algorithm,
                    operation = %operation,
                    "rejected unsupported keyset operation"
                );
            })
    }
}
