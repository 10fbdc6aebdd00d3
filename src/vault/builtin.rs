use aes_gcm::{
    aead::{Aead, KeyInit, OsRng},
    Aes256Gcm, Nonce,
};
use rand::RngCore;
use zeroize::{Zeroize, Zeroizing};

/// Envelope-encrypted secret: a per-secret data key (DEK) wrapped by the
/// master key, plus the secret encrypted under that DEK.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SealedSecret {
    pub encrypted_dek: Vec<u8>,
    pub dek_nonce: Vec<u8>,
    pub encrypted_secret: Vec<u8>,
    pub secret_nonce: Vec<u8>,
}

#[derive(Debug, thiserror::Error)]
pub enum CryptoError {
    #[error("invalid master key: {0}")]
    InvalidMasterKey(String),
    #[error("encryption failed")]
    Encrypt,
    #[error("decryption failed")]
    Decrypt,
}

/// AES-256-GCM envelope encryption keyed by the process-wide master key.
pub struct VaultCrypto {
    kek: Zeroizing<[u8; 32]>,
}

impl VaultCrypto {
    pub fn new(master_key_hex: &str) -> Result<Self, CryptoError> {
        let kek = parse_master_key(master_key_hex)?;
        Ok(Self {
            kek: Zeroizing::new(kek),
        })
    }

    pub fn seal(&self, plaintext: &str) -> Result<SealedSecret, CryptoError> {
        // 1. Generate a random DEK
        let mut dek = Zeroizing::new([0u8; 32]);
        OsRng.fill_bytes(&mut dek[..]);

        // 2. Encrypt the secret with the DEK
        let secret_cipher =
            Aes256Gcm::new_from_slice(&dek[..]).map_err(|_| CryptoError::Encrypt)?;
        let secret_nonce = generate_nonce();
        let encrypted_secret = secret_cipher
            .encrypt(Nonce::from_slice(&secret_nonce), plaintext.as_bytes())
            .map_err(|_| CryptoError::Encrypt)?;

        // 3. Wrap the DEK with the master key
        let kek_cipher =
            Aes256Gcm::new_from_slice(&self.kek[..]).map_err(|_| CryptoError::Encrypt)?;
        let dek_nonce = generate_nonce();
        let encrypted_dek = kek_cipher
            .encrypt(Nonce::from_slice(&dek_nonce), &dek[..])
            .map_err(|_| CryptoError::Encrypt)?;

        Ok(SealedSecret {
            encrypted_dek,
            dek_nonce: dek_nonce.to_vec(),
            encrypted_secret,
            secret_nonce: secret_nonce.to_vec(),
        })
    }

    /// Fails with [`CryptoError::Decrypt`] when the blob was sealed under a
    /// different master key or has been tampered with.
    pub fn open(&self, sealed: &SealedSecret) -> Result<Zeroizing<String>, CryptoError> {
        if sealed.dek_nonce.len() != 12 || sealed.secret_nonce.len() != 12 {
            return Err(CryptoError::Decrypt);
        }

        // 1. Unwrap the DEK
        let kek_cipher =
            Aes256Gcm::new_from_slice(&self.kek[..]).map_err(|_| CryptoError::Decrypt)?;
        let mut dek_bytes = kek_cipher
            .decrypt(
                Nonce::from_slice(&sealed.dek_nonce),
                sealed.encrypted_dek.as_slice(),
            )
            .map_err(|_| CryptoError::Decrypt)?;
        if dek_bytes.len() != 32 {
            dek_bytes.zeroize();
            return Err(CryptoError::Decrypt);
        }

        let mut dek = Zeroizing::new([0u8; 32]);
        dek.copy_from_slice(&dek_bytes);
        dek_bytes.zeroize();

        // 2. Decrypt the secret
        let secret_cipher =
            Aes256Gcm::new_from_slice(&dek[..]).map_err(|_| CryptoError::Decrypt)?;
        let plaintext = secret_cipher
            .decrypt(
                Nonce::from_slice(&sealed.secret_nonce),
                sealed.encrypted_secret.as_slice(),
            )
            .map_err(|_| CryptoError::Decrypt)?;

        String::from_utf8(plaintext)
            .map(Zeroizing::new)
            .map_err(|e| {
                let mut bytes = e.into_bytes();
                bytes.zeroize();
                CryptoError::Decrypt
            })
    }
}

fn generate_nonce() -> [u8; 12] {
    let mut nonce = [0u8; 12];
    OsRng.fill_bytes(&mut nonce);
    nonce
}

pub fn parse_master_key(hex: &str) -> Result<[u8; 32], CryptoError> {
    let hex = hex.trim();
    if hex.len() != 64 {
        return Err(CryptoError::InvalidMasterKey(format!(
            "FORGE_MASTER_KEY must be 64 hex chars (32 bytes), got {} chars",
            hex.len()
        )));
    }
    let bytes = hex::decode(hex).map_err(|e| CryptoError::InvalidMasterKey(e.to_string()))?;
    let mut key = [0u8; 32];
    key.copy_from_slice(&bytes);
    Ok(key)
}
