use crate::config::Config;
use crate::db as dbmod;
use crate::errors::AppError;
use crate::external::ObjectStoreClient;
use crate::models::{Cek, EncryptedMaterial, Manifest, ManifestChunk};
use aes_gcm::aead::{Aead, KeyInit};
use aes_gcm::{Aes256Gcm, Key, Nonce};
use base64::{engine::general_purpose::STANDARD, Engine as _};
use hkdf::Hkdf;
use sha2::{Digest, Sha256};
use sqlx::{Pool, Postgres};
use uuid::Uuid;
use zeroize::Zeroize;

const KEY_LEN: usize = 32;
const NONCE_LEN: usize = 12;
const TAG_LEN: usize = 16;

/// Plaintext key material confined to a single invocation's stack; zeroed on drop.
struct PlainKey([u8; KEY_LEN]);

impl Drop for PlainKey {
    fn drop(&mut self) {
        self.0.zeroize();
    }
}

fn kek_bytes(config: &Config) -> Result<[u8; KEY_LEN], AppError> {
    let raw = STANDARD
        .decode(&config.kek_material_b64)
        .map_err(|e| AppError::Internal(format!("invalid KEK material: {e}")))?;
    raw.try_into().map_err(|_| AppError::Internal("KEK material must be 32 bytes".to_string()))
}

fn aes_encrypt(key: &[u8; KEY_LEN], nonce_bytes: &[u8; NONCE_LEN], plaintext: &[u8]) -> Result<Vec<u8>, AppError> {
    let cipher = Aes256Gcm::new(Key::<Aes256Gcm>::from_slice(key));
    let nonce = Nonce::from_slice(nonce_bytes);
    cipher
        .encrypt(nonce, plaintext)
        .map_err(|e| AppError::Internal(format!("encryption failed: {e}")))
}

fn aes_decrypt(key: &[u8; KEY_LEN], nonce_bytes: &[u8; NONCE_LEN], ciphertext_and_tag: &[u8]) -> Result<Vec<u8>, AppError> {
    let cipher = Aes256Gcm::new(Key::<Aes256Gcm>::from_slice(key));
    let nonce = Nonce::from_slice(nonce_bytes);
    cipher
        .decrypt(nonce, ciphertext_and_tag)
        .map_err(|e| AppError::Internal(format!("decryption failed: {e}")))
}

/// Wraps a freshly generated CEK under the current KEK. The wrapped form is
/// `base64(nonce || ciphertext || tag)`.
fn wrap_cek(config: &Config, cek: &[u8; KEY_LEN]) -> Result<String, AppError> {
    let kek = kek_bytes(config)?;
    let mut nonce_bytes = [0u8; NONCE_LEN];
    rand::Rng::fill(&mut rand::thread_rng(), &mut nonce_bytes);
    let sealed = aes_encrypt(&kek, &nonce_bytes, cek)?;

    let mut out = Vec::with_capacity(NONCE_LEN + sealed.len());
    out.extend_from_slice(&nonce_bytes);
    out.extend_from_slice(&sealed);
    Ok(STANDARD.encode(out))
}

fn unwrap_cek(config: &Config, wrapped: &str) -> Result<[u8; KEY_LEN], AppError> {
    let kek = kek_bytes(config)?;
    let raw = STANDARD
        .decode(wrapped)
        .map_err(|e| AppError::Internal(format!("invalid wrapped CEK: {e}")))?;
    if raw.len() < NONCE_LEN + TAG_LEN {
        return Err(AppError::Internal("wrapped CEK too short".to_string()));
    }
    let (nonce_bytes, sealed) = raw.split_at(NONCE_LEN);
    let nonce: [u8; NONCE_LEN] = nonce_bytes.try_into().unwrap();
    let plain = aes_decrypt(&kek, &nonce, sealed)?;
    plain.try_into().map_err(|_| AppError::Internal("unwrapped CEK has wrong length".to_string()))
}

/// `EnsureCEK(material) → CEK`. Returns the active CEK for a material, creating and
/// persisting a new one (wrapped under the current KEK) if absent.
pub async fn ensure_cek(pool: &Pool<Postgres>, config: &Config, material_id: Uuid) -> Result<Cek, AppError> {
    if let Some(cek) = dbmod::find_active_cek(pool, material_id).await? {
        return Ok(cek);
    }

    let mut raw = [0u8; KEY_LEN];
    rand::Rng::fill(&mut rand::thread_rng(), &mut raw);
    let wrapped = wrap_cek(config, &raw)?;
    raw.zeroize();

    let version = dbmod::next_cek_version(pool, material_id).await?;
    let cek = dbmod::insert_cek(pool, material_id, version, &wrapped, config.kek_version).await?;
    tracing::info!(%material_id, version, "issued new CEK");
    Ok(cek)
}

/// Derives the deterministic per-chunk nonce from `(material_id, cek_version, index)`
/// via HKDF over the CEK as IKM. Same inputs always yield the same IV, which is what
/// makes `EncryptMaterial` idempotent and satisfies invariant 6.
fn derive_chunk_nonce(cek: &[u8; KEY_LEN], material_id: Uuid, cek_version: i32, index: u32) -> [u8; NONCE_LEN] {
    let hk = Hkdf::<Sha256>::new(None, cek);
    let info = format!("{material_id}:{cek_version}:{index}");
    let mut nonce = [0u8; NONCE_LEN];
    hk.expand(info.as_bytes(), &mut nonce).expect("12 bytes is a valid HKDF output length");
    nonce
}

/// `EncryptMaterial(material, cek, sourceBytes) → (Manifest, encrypted_object_bytes)`.
/// Splits `source` into fixed-size plaintext chunks (last chunk may be short), encrypts
/// each with AES-256-GCM under a deterministically derived IV, and records a manifest
/// entry per chunk. The encrypted object is the concatenation of ciphertexts (tags are
/// kept in the manifest, not inline, so chunks remain exactly `length` bytes for
/// byte-range fetches).
pub fn encrypt_material(
    config: &Config,
    material_id: Uuid,
    cek: &Cek,
    source: &[u8],
) -> Result<(Manifest, Vec<u8>), AppError> {
    let key_bytes = unwrap_cek(config, &cek.wrapped_key)?;
    let key = PlainKey(key_bytes);

    let chunk_size = config.encryption_chunk_size;
    let mut per_chunk = Vec::new();
    let mut encrypted_object = Vec::with_capacity(source.len());
    let mut offset: i64 = 0;

    for (i, plaintext_chunk) in source.chunks(chunk_size).enumerate() {
        let nonce = derive_chunk_nonce(&key.0, material_id, cek.version, i as u32);
        let sealed = aes_encrypt(&key.0, &nonce, plaintext_chunk)?;
        let (ciphertext, tag) = sealed.split_at(sealed.len() - TAG_LEN);

        let mut hasher = Sha256::new();
        hasher.update(plaintext_chunk);
        let digest = hasher.finalize();

        per_chunk.push(ManifestChunk {
            index: i as i32,
            offset,
            length: ciphertext.len() as i64,
            iv: STANDARD.encode(nonce),
            tag: STANDARD.encode(tag),
            sha256: hex::encode(digest),
        });

        encrypted_object.extend_from_slice(ciphertext);
        offset += ciphertext.len() as i64;
    }

    let manifest = Manifest {
        chunk_count: per_chunk.len() as i32,
        chunk_size: chunk_size as i64,
        kek_version: config.kek_version,
        cek_version: cek.version,
        per_chunk,
    };

    Ok((manifest, encrypted_object))
}

/// Decrypts one chunk, for tests and for any server-side integrity verification pass.
pub fn decrypt_chunk(
    config: &Config,
    cek: &Cek,
    chunk: &ManifestChunk,
    ciphertext: &[u8],
) -> Result<Vec<u8>, AppError> {
    let key_bytes = unwrap_cek(config, &cek.wrapped_key)?;
    let key = PlainKey(key_bytes);

    let iv: [u8; NONCE_LEN] = STANDARD
        .decode(&chunk.iv)
        .map_err(|e| AppError::Internal(e.to_string()))?
        .try_into()
        .map_err(|_| AppError::Internal("malformed IV in manifest".to_string()))?;
    let tag = STANDARD.decode(&chunk.tag).map_err(|e| AppError::Internal(e.to_string()))?;

    let mut sealed = ciphertext.to_vec();
    sealed.extend_from_slice(&tag);

    aes_decrypt(&key.0, &iv, &sealed)
}

/// `UnwrapCEKFor(license) → key`. Resolves the material's currently-active CEK and
/// confirms it is actually linked to an `encrypted_materials` row before returning its
/// wrapped form. This does not track which CEK version a given license was issued
/// against (resolved Open Question 3) — every HTTP caller only ever issues against the
/// currently-active encrypted material, so that distinction does not arise yet.
pub async fn unwrap_cek_for_material(pool: &Pool<Postgres>, _config: &Config, material_id: Uuid) -> Result<String, AppError> {
    let cek = dbmod::find_active_cek(pool, material_id)
        .await?
        .ok_or_else(|| AppError::NotFound("cek".to_string()))?;
    dbmod::find_encrypted_material(pool, material_id, cek.id)
        .await?
        .ok_or_else(|| AppError::NotFound("encrypted material".to_string()))?;
    // Returned wrapped (still under the KEK) — the server never re-exposes plaintext CEKs
    // outside this module; callers ship the wrapped form to the device over the
    // license's device-bound channel, consistent with "decryption is the client's
    // responsibility" (§4.8).
    Ok(cek.wrapped_key)
}

/// `ProvisionMaterial(material, sourceBytes) → EncryptedMaterial` (§2's Offline data
/// flow): generate or reuse the material's CEK, chunk-encrypt the source into an
/// object, upload it to the object store, and record the manifest. This is the step
/// that must run before `Issue`/`Download` have anything to hand out.
pub async fn provision_material(
    pool: &Pool<Postgres>,
    config: &Config,
    object_store: &dyn ObjectStoreClient,
    material_id: Uuid,
    source: &[u8],
) -> Result<EncryptedMaterial, AppError> {
    let cek = ensure_cek(pool, config, material_id).await?;
    let (manifest, encrypted_object) = encrypt_material(config, material_id, &cek, source)?;

    let key = crate::external::encrypted_object_key(&material_id.to_string(), cek.version);
    object_store
        .put_bytes(&key, "application/octet-stream", encrypted_object)
        .await
        .map_err(|e| AppError::Unavailable(e.to_string()))?;

    let encrypted = dbmod::upsert_encrypted_material(pool, material_id, cek.id, &manifest, &key).await?;
    tracing::info!(%material_id, cek_version = cek.version, "provisioned encrypted material");
    Ok(encrypted)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn test_config() -> Config {
        let mut config = Config::load();
        config.kek_material_b64 = STANDARD.encode([7u8; KEY_LEN]);
        config.kek_version = 1;
        config.encryption_chunk_size = 16;
        config
    }

    #[test]
    fn wrap_and_unwrap_cek_round_trips() {
        let config = test_config();
        let raw = [9u8; KEY_LEN];
        let wrapped = wrap_cek(&config, &raw).unwrap();
        let unwrapped = unwrap_cek(&config, &wrapped).unwrap();
        assert_eq!(raw, unwrapped);
    }

    #[test]
    fn derive_chunk_nonce_is_deterministic() {
        let key = [1u8; KEY_LEN];
        let material_id = Uuid::new_v4();
        let a = derive_chunk_nonce(&key, material_id, 1, 0);
        let b = derive_chunk_nonce(&key, material_id, 1, 0);
        let c = derive_chunk_nonce(&key, material_id, 1, 1);
        assert_eq!(a, b);
        assert_ne!(a, c);
    }

    #[test]
    fn encrypt_material_is_deterministic_given_same_cek_and_plaintext() {
        let config = test_config();
        let material_id = Uuid::new_v4();
        let raw = [3u8; KEY_LEN];
        let wrapped = wrap_cek(&config, &raw).unwrap();
        let cek = Cek {
            id: Uuid::new_v4(),
            material_id,
            version: 1,
            wrapped_key: wrapped,
            kek_version: config.kek_version,
            created_at: chrono::Utc::now(),
            retired_at: None,
        };

        let source = b"hello world, this spans more than one sixteen byte chunk!".to_vec();
        let (manifest_a, object_a) = encrypt_material(&config, material_id, &cek, &source).unwrap();
        let (manifest_b, object_b) = encrypt_material(&config, material_id, &cek, &source).unwrap();

        assert_eq!(object_a, object_b, "re-encryption must be idempotent (invariant 6)");
        assert_eq!(manifest_a.per_chunk.len(), manifest_b.per_chunk.len());
        assert_eq!(manifest_a.chunk_count as usize, source.chunks(16).count());
    }

    #[test]
    fn manifest_sha256_matches_decrypted_chunk() {
        let config = test_config();
        let material_id = Uuid::new_v4();
        let raw = [5u8; KEY_LEN];
        let wrapped = wrap_cek(&config, &raw).unwrap();
        let cek = Cek {
            id: Uuid::new_v4(),
            material_id,
            version: 1,
            wrapped_key: wrapped,
            kek_version: config.kek_version,
            created_at: chrono::Utc::now(),
            retired_at: None,
        };

        let source = b"exactly sixteen!".to_vec();
        let (manifest, object) = encrypt_material(&config, material_id, &cek, &source).unwrap();
        let chunk = &manifest.per_chunk[0];
        let ciphertext = &object[chunk.offset as usize..(chunk.offset + chunk.length) as usize];
        let plaintext = decrypt_chunk(&config, &cek, chunk, ciphertext).unwrap();

        let mut hasher = Sha256::new();
        hasher.update(&plaintext);
        assert_eq!(hex::encode(hasher.finalize()), chunk.sha256);
        assert_eq!(plaintext, source);
    }
}
