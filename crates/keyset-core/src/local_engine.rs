//! In-process [`CryptoEngine`] backed by a [`MaterialVault`].
//!
//! Every key version is sealed at rest with AES-256-GCM under a master key and
//! authenticated with HMAC-SHA256 under a separate key. Ciphertexts and
//! signatures carry a five byte header (`0x01` followed by the big-endian
//! version number) so decrypt and verify can pick the version that produced them.

use std::{
    collections::HashMap,
    fs::{File, OpenOptions},
    io::{BufReader, BufWriter, Write},
    path::{Path, PathBuf},
    sync::Arc,
};

use aes_gcm::{
    Aes128Gcm, Aes256Gcm, Nonce,
    aead::{Aead, AeadCore, KeyInit, Payload},
};
use chacha20poly1305::{ChaCha20Poly1305, XChaCha20Poly1305};
use fs2::FileExt;
use hmac::{Hmac, Mac};
use p256::ecdsa::signature::{Signer, Verifier};
use parking_lot::{Mutex, RwLock};
use rand::{RngCore, rngs::OsRng};
use serde::{Deserialize, Serialize};
use sha2::Sha256;
use time::OffsetDateTime;
use tracing::{debug, info};
use zeroize::Zeroizing;

use crate::{
    engine::{CryptoEngine, MaterialName},
    error::{KeysetError, KeysetResult},
    fsutil,
    models::KeysetAlgorithm,
};

type HmacSha256 = Hmac<Sha256>;

const OUTPUT_PREFIX: u8 = 0x01;
const HEADER_LEN: usize = 5;

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SealedVersion {
    pub version: u32,
    pub nonce: Vec<u8>,
    pub ciphertext: Vec<u8>,
    pub hmac: Vec<u8>,
    #[serde(with = "time::serde::rfc3339")]
    pub created_at: OffsetDateTime,
}

/// All versions of one keyset's material, each sealed independently.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SealedKeyset {
    pub name: String,
    pub algorithm: KeysetAlgorithm,
    pub primary: u32,
    pub versions: Vec<SealedVersion>,
}

impl SealedKeyset {
    fn version(&self, version: u32) -> Option<&SealedVersion> {
        self.versions.iter().find(|v| v.version == version)
    }
}

pub trait MaterialVault: Send + Sync {
    fn load(&self, name: &MaterialName) -> KeysetResult<Option<SealedKeyset>>;
    fn save(&self, keyset: &SealedKeyset) -> KeysetResult<()>;
    /// Returns whether anything was removed.
    fn remove(&self, name: &MaterialName) -> KeysetResult<bool>;
}

#[derive(Default)]
pub struct MemoryMaterialVault {
    entries: RwLock<HashMap<String, SealedKeyset>>,
}

impl MemoryMaterialVault {
    pub fn new() -> Self {
        Self::default()
    }
}

impl MaterialVault for MemoryMaterialVault {
    fn load(&self, name: &MaterialName) -> KeysetResult<Option<SealedKeyset>> {
        Ok(self.entries.read().get(name.as_str()).cloned())
    }

    fn save(&self, keyset: &SealedKeyset) -> KeysetResult<()> {
        self.entries
            .write()
            .insert(keyset.name.clone(), keyset.clone());
        Ok(())
    }

    fn remove(&self, name: &MaterialName) -> KeysetResult<bool> {
        Ok(self.entries.write().remove(name.as_str()).is_some())
    }
}

/// One owner-only JSON file per keyset. Removal overwrites the file before unlinking it.
pub struct FileMaterialVault {
    dir: PathBuf,
}

impl FileMaterialVault {
    pub fn new<P: AsRef<Path>>(dir: P) -> KeysetResult<Self> {
        let dir = dir.as_ref().to_path_buf();
        fsutil::ensure_private_dir(&dir).map_err(KeysetError::storage)?;
        Ok(Self { dir })
    }

    fn path(&self, name: &MaterialName) -> PathBuf {
        self.dir.join(format!("{}.json", name.as_str()))
    }
}

impl MaterialVault for FileMaterialVault {
    fn load(&self, name: &MaterialName) -> KeysetResult<Option<SealedKeyset>> {
        let path = self.path(name);
        if !path.exists() {
            return Ok(None);
        }
        fsutil::tighten_permissions(&path).map_err(KeysetError::storage)?;
        let file = File::open(&path).map_err(KeysetError::storage)?;
        FileExt::lock_shared(&file).map_err(KeysetError::storage)?;
        let sealed = serde_json::from_reader(BufReader::new(&file)).map_err(KeysetError::storage)?;
        FileExt::unlock(&file).map_err(KeysetError::storage)?;
        Ok(Some(sealed))
    }

    fn save(&self, keyset: &SealedKeyset) -> KeysetResult<()> {
        let path = self.dir.join(format!("{}.json", keyset.name));
        let mut options = OpenOptions::new();
        options.create(true).write(true).truncate(true);
        let file = fsutil::open_private(&path, &mut options).map_err(KeysetError::storage)?;
        FileExt::lock_exclusive(&file).map_err(KeysetError::storage)?;
        let mut writer = BufWriter::new(&file);
        serde_json::to_writer_pretty(&mut writer, keyset).map_err(KeysetError::storage)?;
        writer.flush().map_err(KeysetError::storage)?;
        drop(writer);
        file.sync_all().map_err(KeysetError::storage)?;
        FileExt::unlock(&file).map_err(KeysetError::storage)?;
        Ok(())
    }

    fn remove(&self, name: &MaterialName) -> KeysetResult<bool> {
        let path = self.path(name);
        if !path.exists() {
            return Ok(false);
        }
        let overwritten = fsutil::shred(&path).map_err(KeysetError::storage)?;
        debug!(bytes = overwritten, "shredded sealed key material");
        Ok(true)
    }
}

pub struct LocalCryptoEngine {
    vault: Arc<dyn MaterialVault>,
    master_key: Zeroizing<[u8; 32]>,
    hmac_key: Zeroizing<[u8; 32]>,
    /// Serializes create, rotate and destroy so version appends never race.
    write_lock: Mutex<()>,
}

impl LocalCryptoEngine {
    pub fn new(vault: Arc<dyn MaterialVault>, master_key: [u8; 32], hmac_key: [u8; 32]) -> Self {
        Self {
            vault,
            master_key: Zeroizing::new(master_key),
            hmac_key: Zeroizing::new(hmac_key),
            write_lock: Mutex::new(()),
        }
    }

    /// Memory vault and random sealing keys; material does not outlive the process.
    pub fn ephemeral() -> Self {
        let mut master_key = [0u8; 32];
        let mut hmac_key = [0u8; 32];
        OsRng.fill_bytes(&mut master_key);
        OsRng.fill_bytes(&mut hmac_key);
        Self::new(Arc::new(MemoryMaterialVault::new()), master_key, hmac_key)
    }

    fn load(&self, name: &MaterialName) -> KeysetResult<SealedKeyset> {
        self.vault
            .load(name)?
            .ok_or_else(|| KeysetError::crypto("key material not found"))
    }

    fn seal_aad(name: &str, algorithm: KeysetAlgorithm, version: u32) -> Vec<u8> {
        format!("{name}:{algorithm}:{version}").into_bytes()
    }

    fn seal_version(
        &self,
        name: &str,
        algorithm: KeysetAlgorithm,
        version: u32,
        secret: &[u8],
    ) -> KeysetResult<SealedVersion> {
        let cipher = Aes256Gcm::new_from_slice(&self.master_key[..]).map_err(KeysetError::crypto)?;
        let mut nonce = vec![0u8; 12];
        OsRng.fill_bytes(&mut nonce);
        let aad = Self::seal_aad(name, algorithm, version);
        let ciphertext = cipher
            .encrypt(
                Nonce::from_slice(&nonce),
                Payload {
                    msg: secret,
                    aad: &aad,
                },
            )
            .map_err(KeysetError::crypto)?;
        let mut mac =
            <HmacSha256 as Mac>::new_from_slice(&self.hmac_key[..]).map_err(KeysetError::crypto)?;
        mac.update(&nonce);
        mac.update(&aad);
        mac.update(&ciphertext);
        Ok(SealedVersion {
            version,
            nonce,
            ciphertext,
            hmac: mac.finalize().into_bytes().to_vec(),
            created_at: OffsetDateTime::now_utc(),
        })
    }

    fn open_version(
        &self,
        sealed: &SealedKeyset,
        version: &SealedVersion,
    ) -> KeysetResult<Zeroizing<Vec<u8>>> {
        let aad = Self::seal_aad(&sealed.name, sealed.algorithm, version.version);
        let mut mac =
            <HmacSha256 as Mac>::new_from_slice(&self.hmac_key[..]).map_err(KeysetError::crypto)?;
        mac.update(&version.nonce);
        mac.update(&aad);
        mac.update(&version.ciphertext);
        mac.verify_slice(&version.hmac)
            .map_err(|_| KeysetError::TamperDetected(format!("{}/v{}", sealed.name, version.version)))?;

        if version.nonce.len() != 12 {
            return Err(KeysetError::TamperDetected(sealed.name.clone()));
        }
        let cipher = Aes256Gcm::new_from_slice(&self.master_key[..]).map_err(KeysetError::crypto)?;
        let secret = cipher
            .decrypt(
                Nonce::from_slice(&version.nonce),
                Payload {
                    msg: &version.ciphertext,
                    aad: &aad,
                },
            )
            .map_err(|_| KeysetError::TamperDetected(sealed.name.clone()))?;
        Ok(Zeroizing::new(secret))
    }

    fn primary_secret(&self, sealed: &SealedKeyset) -> KeysetResult<(u32, Zeroizing<Vec<u8>>)> {
        let version = sealed
            .version(sealed.primary)
            .ok_or_else(|| KeysetError::crypto("primary key version is missing"))?;
        Ok((version.version, self.open_version(sealed, version)?))
    }

    /// Split a versioned output into the version and the secret that produced it.
    fn resolve_output<'a>(
        &self,
        sealed: &SealedKeyset,
        data: &'a [u8],
    ) -> KeysetResult<(Zeroizing<Vec<u8>>, &'a [u8])> {
        let (version, body) = split_header(data)?;
        let sealed_version = sealed
            .version(version)
            .ok_or_else(|| KeysetError::OperationFailed(format!("unknown key version {version}")))?;
        Ok((self.open_version(sealed, sealed_version)?, body))
    }
}

impl CryptoEngine for LocalCryptoEngine {
    fn create_keyset(&self, name: &MaterialName, algorithm: KeysetAlgorithm) -> KeysetResult<()> {
        let _guard = self.write_lock.lock();
        if self.vault.load(name)?.is_some() {
            return Err(KeysetError::crypto("key material already exists"));
        }
        let secret = generate_secret(algorithm);
        let version = self.seal_version(name.as_str(), algorithm, 1, &secret)?;
        self.vault.save(&SealedKeyset {
            name: name.as_str().to_string(),
            algorithm,
            primary: 1,
            versions: vec![version],
        })?;
        info!(algorithm = %algorithm, "created key material");
        Ok(())
    }

    fn rotate(&self, name: &MaterialName) -> KeysetResult<u32> {
        let _guard = self.write_lock.lock();
        let mut sealed = self.load(name)?;
        let next = sealed
            .versions
            .iter()
            .map(|v| v.version)
            .max()
            .unwrap_or(0)
            .checked_add(1)
            .ok_or_else(|| KeysetError::crypto("key version space exhausted"))?;
        let secret = generate_secret(sealed.algorithm);
        let version = self.seal_version(&sealed.name, sealed.algorithm, next, &secret)?;
        sealed.versions.push(version);
        sealed.primary = next;
        self.vault.save(&sealed)?;
        info!(version = next, "rotated key material");
        Ok(next)
    }

    fn destroy(&self, name: &MaterialName) -> KeysetResult<()> {
        let _guard = self.write_lock.lock();
        if self.vault.remove(name)? {
            info!("destroyed key material");
        }
        Ok(())
    }

    fn exists(&self, name: &MaterialName) -> KeysetResult<bool> {
        Ok(self.vault.load(name)?.is_some())
    }

    fn version_count(&self, name: &MaterialName) -> KeysetResult<usize> {
        Ok(self.load(name)?.versions.len())
    }

    fn encrypt(&self, name: &MaterialName, plaintext: &[u8], aad: &[u8]) -> KeysetResult<Vec<u8>> {
        let sealed = self.load(name)?;
        let (version, secret) = self.primary_secret(&sealed)?;
        let body = match sealed.algorithm {
            KeysetAlgorithm::Aes128Gcm => aead_encrypt::<Aes128Gcm>(&secret, plaintext, aad)?,
            KeysetAlgorithm::Aes256Gcm => aead_encrypt::<Aes256Gcm>(&secret, plaintext, aad)?,
            KeysetAlgorithm::ChaCha20Poly1305 => {
                aead_encrypt::<ChaCha20Poly1305>(&secret, plaintext, aad)?
            }
            KeysetAlgorithm::XChaCha20Poly1305 => {
                aead_encrypt::<XChaCha20Poly1305>(&secret, plaintext, aad)?
            }
            other => return Err(not_supported(other, "encrypt")),
        };
        Ok(with_header(version, body))
    }

    fn decrypt(&self, name: &MaterialName, ciphertext: &[u8], aad: &[u8]) -> KeysetResult<Vec<u8>> {
        let sealed = self.load(name)?;
        let (secret, body) = self.resolve_output(&sealed, ciphertext)?;
        match sealed.algorithm {
            KeysetAlgorithm::Aes128Gcm => aead_decrypt::<Aes128Gcm>(&secret, body, aad),
            KeysetAlgorithm::Aes256Gcm => aead_decrypt::<Aes256Gcm>(&secret, body, aad),
            KeysetAlgorithm::ChaCha20Poly1305 => aead_decrypt::<ChaCha20Poly1305>(&secret, body, aad),
            KeysetAlgorithm::XChaCha20Poly1305 => {
                aead_decrypt::<XChaCha20Poly1305>(&secret, body, aad)
            }
            other => Err(not_supported(other, "decrypt")),
        }
    }

    fn sign(&self, name: &MaterialName, payload: &[u8]) -> KeysetResult<Vec<u8>> {
        let sealed = self.load(name)?;
        let (version, secret) = self.primary_secret(&sealed)?;
        let signature = match sealed.algorithm {
            KeysetAlgorithm::EcdsaP256 => {
                let key = p256::ecdsa::SigningKey::from_slice(&secret).map_err(KeysetError::crypto)?;
                let signature: p256::ecdsa::Signature = key.sign(payload);
                signature.to_bytes().to_vec()
            }
            KeysetAlgorithm::EcdsaP384 => {
                let key = p384::ecdsa::SigningKey::from_slice(&secret).map_err(KeysetError::crypto)?;
                let signature: p384::ecdsa::Signature = key.sign(payload);
                signature.to_bytes().to_vec()
            }
            KeysetAlgorithm::Ed25519 => {
                let key = ed25519_key(&secret)?;
                key.sign(payload).to_bytes().to_vec()
            }
            other => return Err(not_supported(other, "sign")),
        };
        Ok(with_header(version, signature))
    }

    fn verify(&self, name: &MaterialName, payload: &[u8], signature: &[u8]) -> KeysetResult<()> {
        let sealed = self.load(name)?;
        let (secret, body) = self.resolve_output(&sealed, signature)?;
        let verified = match sealed.algorithm {
            KeysetAlgorithm::EcdsaP256 => {
                let key = p256::ecdsa::SigningKey::from_slice(&secret).map_err(KeysetError::crypto)?;
                p256::ecdsa::Signature::from_slice(body)
                    .is_ok_and(|sig| key.verifying_key().verify(payload, &sig).is_ok())
            }
            KeysetAlgorithm::EcdsaP384 => {
                let key = p384::ecdsa::SigningKey::from_slice(&secret).map_err(KeysetError::crypto)?;
                p384::ecdsa::Signature::from_slice(body)
                    .is_ok_and(|sig| key.verifying_key().verify(payload, &sig).is_ok())
            }
            KeysetAlgorithm::Ed25519 => {
                let key = ed25519_key(&secret)?;
                ed25519_dalek::Signature::from_slice(body)
                    .is_ok_and(|sig| key.verifying_key().verify(payload, &sig).is_ok())
            }
            other => return Err(not_supported(other, "verify")),
        };
        if verified {
            Ok(())
        } else {
            Err(KeysetError::OperationFailed(
                "signature verification failed".into(),
            ))
        }
    }
}

fn generate_secret(algorithm: KeysetAlgorithm) -> Zeroizing<Vec<u8>> {
    match algorithm {
        KeysetAlgorithm::Aes128Gcm => random_bytes(16),
        KeysetAlgorithm::Aes256Gcm
        | KeysetAlgorithm::ChaCha20Poly1305
        | KeysetAlgorithm::XChaCha20Poly1305
        | KeysetAlgorithm::Ed25519 => random_bytes(32),
        KeysetAlgorithm::EcdsaP256 => {
            let key = p256::ecdsa::SigningKey::random(&mut OsRng);
            Zeroizing::new(key.to_bytes().to_vec())
        }
        KeysetAlgorithm::EcdsaP384 => {
            let key = p384::ecdsa::SigningKey::random(&mut OsRng);
            Zeroizing::new(key.to_bytes().to_vec())
        }
    }
}

fn random_bytes(len: usize) -> Zeroizing<Vec<u8>> {
    let mut bytes = Zeroizing::new(vec![0u8; len]);
    OsRng.fill_bytes(&mut bytes);
    bytes
}

fn ed25519_key(secret: &[u8]) -> KeysetResult<ed25519_dalek::SigningKey> {
    let bytes: &[u8; 32] = secret
        .try_into()
        .map_err(|_| KeysetError::crypto("ed25519 secret must be 32 bytes"))?;
    Ok(ed25519_dalek::SigningKey::from_bytes(bytes))
}

fn not_supported(algorithm: KeysetAlgorithm, operation: &str) -> KeysetError {
    KeysetError::crypto(format!("{algorithm} material cannot {operation}"))
}

fn with_header(version: u32, body: Vec<u8>) -> Vec<u8> {
    let mut out = Vec::with_capacity(HEADER_LEN + body.len());
    out.push(OUTPUT_PREFIX);
    out.extend_from_slice(&version.to_be_bytes());
    out.extend(body);
    out
}

fn split_header(data: &[u8]) -> KeysetResult<(u32, &[u8])> {
    if data.len() < HEADER_LEN || data[0] != OUTPUT_PREFIX {
        return Err(KeysetError::OperationFailed(
            "input is not a keyset output".into(),
        ));
    }
    let version = u32::from_be_bytes([data[1], data[2], data[3], data[4]]);
    Ok((version, &data[HEADER_LEN..]))
}

/// Output layout: nonce followed by ciphertext and tag.
fn aead_encrypt<A>(key: &[u8], plaintext: &[u8], aad: &[u8]) -> KeysetResult<Vec<u8>>
where
    A: Aead + AeadCore + KeyInit,
{
    let cipher = A::new_from_slice(key).map_err(KeysetError::crypto)?;
    let mut nonce = aes_gcm::aead::Nonce::<A>::default();
    OsRng.fill_bytes(nonce.as_mut_slice());
    let ciphertext = cipher
        .encrypt(&nonce, Payload { msg: plaintext, aad })
        .map_err(KeysetError::crypto)?;
    let mut out = nonce.to_vec();
    out.extend(ciphertext);
    Ok(out)
}

fn aead_decrypt<A>(key: &[u8], data: &[u8], aad: &[u8]) -> KeysetResult<Vec<u8>>
where
    A: Aead + AeadCore + KeyInit,
{
    let cipher = A::new_from_slice(key).map_err(KeysetError::crypto)?;
    let nonce_len = aes_gcm::aead::Nonce::<A>::default().len();
    if data.len() < nonce_len {
        return Err(KeysetError::OperationFailed("ciphertext is truncated".into()));
    }
    let (nonce, ciphertext) = data.split_at(nonce_len);
    cipher
        .decrypt(
            aes_gcm::aead::Nonce::<A>::from_slice(nonce),
            Payload {
                msg: ciphertext,
                aad,
            },
        )
        .map_err(|_| {
            KeysetError::OperationFailed(
                "ciphertext or associated data failed authentication".into(),
            )
        })
}
