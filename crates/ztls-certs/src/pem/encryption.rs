//! Legacy OpenSSL PEM encryption as described in RFC 1423.
//!
//! The key is derived from the password with the MD5 based `EVP_BytesToKey`
//! scheme, using the first eight bytes of the IV as salt. The payload is
//! encrypted in CBC mode with PKCS#7 padding.
use cbc::cipher::{
    BlockCipher, BlockDecryptMut, BlockEncryptMut, KeyInit, KeyIvInit, block_padding::Pkcs7,
};
use md5::{Digest, Md5};
use rand_core::{OsRng, RngCore};
use snafu::{OptionExt, ResultExt, Snafu, ensure};
use zeroize::Zeroizing;

#[derive(Debug, Snafu)]
pub enum Error {
    #[snafu(display("PEM block is not encrypted"))]
    NotEncrypted,

    #[snafu(display("encrypted PEM block has no DEK-Info header"))]
    MissingDekInfo,

    #[snafu(display("malformed DEK-Info header {value:?}"))]
    MalformedDekInfo { value: String },

    #[snafu(display("unsupported PEM cipher {cipher:?}"))]
    UnsupportedCipher { cipher: String },

    #[snafu(display("failed to decode IV from hex"))]
    DecodeIv { source: hex::FromHexError },

    #[snafu(display("invalid IV length {length}, expected {expected} bytes"))]
    InvalidIvLength { length: usize, expected: usize },

    #[snafu(display("invalid key or IV length for {cipher}"))]
    InvalidKeyLength { cipher: PemCipher },

    #[snafu(display("incorrect password or corrupt ciphertext"))]
    IncorrectPassword,
}

/// Ciphers supported for legacy PEM encryption.
#[derive(
    Clone, Copy, Debug, Default, PartialEq, Eq, strum::Display, strum::EnumString, strum::EnumIter,
)]
pub enum PemCipher {
    #[strum(serialize = "DES-CBC")]
    DesCbc,

    #[strum(serialize = "DES-EDE3-CBC")]
    DesEde3Cbc,

    #[strum(serialize = "AES-128-CBC")]
    Aes128Cbc,

    #[strum(serialize = "AES-192-CBC")]
    Aes192Cbc,

    #[default]
    #[strum(serialize = "AES-256-CBC")]
    Aes256Cbc,
}

impl PemCipher {
    fn key_size(self) -> usize {
        match self {
            PemCipher::DesCbc => 8,
            PemCipher::Aes128Cbc => 16,
            PemCipher::DesEde3Cbc | PemCipher::Aes192Cbc => 24,
            PemCipher::Aes256Cbc => 32,
        }
    }

    fn block_size(self) -> usize {
        match self {
            PemCipher::DesCbc | PemCipher::DesEde3Cbc => 8,
            PemCipher::Aes128Cbc | PemCipher::Aes192Cbc | PemCipher::Aes256Cbc => 16,
        }
    }
}

/// Encrypts `plaintext` and returns the `DEK-Info` header value alongside the
/// ciphertext.
pub(super) fn encrypt(
    plaintext: &[u8],
    password: &[u8],
    cipher: PemCipher,
) -> Result<(String, Vec<u8>), Error> {
    let mut iv = vec![0u8; cipher.block_size()];
    OsRng.fill_bytes(&mut iv);

    let key = derive_key(password, &iv[..8], cipher.key_size());
    let ciphertext = match cipher {
        PemCipher::DesCbc => cbc_encrypt::<des::Des>(&key, &iv, plaintext),
        PemCipher::DesEde3Cbc => cbc_encrypt::<des::TdesEde3>(&key, &iv, plaintext),
        PemCipher::Aes128Cbc => cbc_encrypt::<aes::Aes128>(&key, &iv, plaintext),
        PemCipher::Aes192Cbc => cbc_encrypt::<aes::Aes192>(&key, &iv, plaintext),
        PemCipher::Aes256Cbc => cbc_encrypt::<aes::Aes256>(&key, &iv, plaintext),
    }
    .context(InvalidKeyLengthSnafu { cipher })?;

    Ok((format!("{cipher},{}", hex::encode_upper(&iv)), ciphertext))
}

/// Decrypts `ciphertext` according to the `DEK-Info` header value.
pub(super) fn decrypt(
    dek_info: Option<&str>,
    encrypted: bool,
    ciphertext: &[u8],
    password: &[u8],
) -> Result<Zeroizing<Vec<u8>>, Error> {
    ensure!(encrypted, NotEncryptedSnafu);
    let dek_info = dek_info.context(MissingDekInfoSnafu)?;

    let (cipher, iv) = dek_info
        .split_once(',')
        .context(MalformedDekInfoSnafu { value: dek_info })?;
    let cipher: PemCipher = cipher
        .trim()
        .parse()
        .ok()
        .context(UnsupportedCipherSnafu { cipher })?;
    let iv = hex::decode(iv.trim()).context(DecodeIvSnafu)?;

    ensure!(iv.len() == cipher.block_size(), InvalidIvLengthSnafu {
        length: iv.len(),
        expected: cipher.block_size(),
    });

    let key = derive_key(password, &iv[..8], cipher.key_size());
    let plaintext = match cipher {
        PemCipher::DesCbc => cbc_decrypt::<des::Des>(&key, &iv, ciphertext),
        PemCipher::DesEde3Cbc => cbc_decrypt::<des::TdesEde3>(&key, &iv, ciphertext),
        PemCipher::Aes128Cbc => cbc_decrypt::<aes::Aes128>(&key, &iv, ciphertext),
        PemCipher::Aes192Cbc => cbc_decrypt::<aes::Aes192>(&key, &iv, ciphertext),
        PemCipher::Aes256Cbc => cbc_decrypt::<aes::Aes256>(&key, &iv, ciphertext),
    }
    .context(InvalidKeyLengthSnafu { cipher })?;

    // A wrong password almost always results in broken padding
    plaintext.map(Zeroizing::new).context(IncorrectPasswordSnafu)
}

/// OpenSSL's `EVP_BytesToKey` with MD5 and a single iteration.
fn derive_key(password: &[u8], salt: &[u8], key_size: usize) -> Zeroizing<Vec<u8>> {
    let mut key = Zeroizing::new(Vec::with_capacity(key_size + 16));
    let mut previous: Option<Vec<u8>> = None;

    while key.len() < key_size {
        let mut hasher = Md5::new();
        if let Some(previous) = &previous {
            hasher.update(previous);
        }
        hasher.update(password);
        hasher.update(salt);

        let digest = hasher.finalize().to_vec();
        key.extend_from_slice(&digest);
        previous = Some(digest);
    }

    key.truncate(key_size);
    key
}

/// Returns [`None`] if the key or IV have the wrong length.
fn cbc_encrypt<C>(key: &[u8], iv: &[u8], plaintext: &[u8]) -> Option<Vec<u8>>
where
    C: BlockCipher + BlockEncryptMut + KeyInit,
{
    let encryptor = cbc::Encryptor::<C>::new_from_slices(key, iv).ok()?;
    Some(encryptor.encrypt_padded_vec_mut::<Pkcs7>(plaintext))
}

/// Returns [`None`] if the key or IV have the wrong length and `Some(None)`
/// if the padding is invalid after decryption.
fn cbc_decrypt<C>(key: &[u8], iv: &[u8], ciphertext: &[u8]) -> Option<Option<Vec<u8>>>
where
    C: BlockCipher + BlockDecryptMut + KeyInit,
{
    let decryptor = cbc::Decryptor::<C>::new_from_slices(key, iv).ok()?;
    Some(decryptor.decrypt_padded_vec_mut::<Pkcs7>(ciphertext).ok())
}
