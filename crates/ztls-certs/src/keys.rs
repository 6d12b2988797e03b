//! Abstraction layer around the [`rsa`] crate. This module provides the
//! [`SigningKey`] type, which is used to sign CSRs, the root CA and all leaf
//! certificates. Keys are exchanged as PKCS#1 PEM blocks, optionally
//! encrypted with a password.
use rand_core::{CryptoRngCore, OsRng};
use rsa::{
    RsaPrivateKey, RsaPublicKey,
    pkcs1::{DecodeRsaPrivateKey, EncodeRsaPrivateKey},
    pkcs8::{DecodePublicKey, EncodePublicKey},
    traits::PublicKeyParts,
};
use sha2::Sha256;
use signature::Keypair;
use snafu::{ResultExt, Snafu, ensure};
use tracing::instrument;
use x509_cert::{
    Certificate,
    der::{Decode, Encode},
    spki::SubjectPublicKeyInfoOwned,
};

use crate::{
    ErrorKind,
    pem::{self, PemCipher, RSA_PRIVATE_KEY_LABEL},
};

/// The smallest accepted key size in bits.
pub const MIN_KEY_SIZE: usize = 2048;

/// The key size used when nothing else is requested.
pub const DEFAULT_KEY_SIZE: usize = 4096;

pub type Result<T, E = Error> = std::result::Result<T, E>;

#[derive(Debug, Snafu)]
pub enum Error {
    #[snafu(display("key size of {bits} bits is too small, at least {MIN_KEY_SIZE} bits are required"))]
    KeySizeTooSmall { bits: usize },

    #[snafu(display("failed to create RSA key"))]
    CreateKey { source: rsa::Error },

    #[snafu(display("failed to decode private key PEM block"))]
    DecodePem { source: pem::Error },

    #[snafu(display("failed to deserialize the signing (private) key from PKCS1 DER"))]
    DeserializeSigningKey { source: rsa::pkcs1::Error },

    #[snafu(display("failed to serialize the signing (private) key as PKCS1 DER"))]
    SerializeSigningKey { source: rsa::pkcs1::Error },

    #[snafu(display("failed to encrypt the signing (private) key"))]
    EncryptSigningKey { source: pem::Error },

    #[snafu(display("failed to serialize public key as DER"))]
    SerializePublicKey { source: x509_cert::spki::Error },

    #[snafu(display("failed to decode SPKI from DER"))]
    DecodeSpki { source: x509_cert::der::Error },
}

impl Error {
    pub fn kind(&self) -> ErrorKind {
        match self {
            Error::KeySizeTooSmall { .. } | Error::CreateKey { .. } => ErrorKind::KeyGenError,
            Error::DecodePem { source } => match source.kind() {
                // Anything but a decryption failure means the key block itself is unusable
                ErrorKind::DecryptionError => ErrorKind::DecryptionError,
                _ => ErrorKind::InvalidKey,
            },
            Error::DeserializeSigningKey { .. } => ErrorKind::InvalidKey,
            Error::SerializeSigningKey { .. }
            | Error::EncryptSigningKey { .. }
            | Error::SerializePublicKey { .. }
            | Error::DecodeSpki { .. } => ErrorKind::Internal,
        }
    }
}

/// An RSA private key together with its PKCS#1 v1.5 SHA-256 signer.
#[derive(Clone)]
pub struct SigningKey {
    private_key: RsaPrivateKey,
    signing_key: rsa::pkcs1v15::SigningKey<Sha256>,
}

impl SigningKey {
    /// Generates a new RSA key with `bits` bits and the default random-number
    /// generator [`OsRng`].
    ///
    /// It should be noted that the generation of the key takes longer for
    /// larger key sizes. The generation of an RSA key with a key size of
    /// `4096` can take up to multiple seconds.
    #[instrument(name = "create_rsa_signing_key")]
    pub fn new(bits: usize) -> Result<Self> {
        let mut csprng = OsRng;
        Self::new_with_rng(&mut csprng, bits)
    }

    /// Generates a new RSA key with a custom random-number generator.
    #[instrument(name = "create_rsa_signing_key_custom_rng", skip(rng))]
    pub fn new_with_rng<Rng>(rng: &mut Rng, bits: usize) -> Result<Self>
    where
        Rng: CryptoRngCore + ?Sized,
    {
        ensure!(bits >= MIN_KEY_SIZE, KeySizeTooSmallSnafu { bits });

        let private_key = RsaPrivateKey::new(rng, bits).context(CreateKeySnafu)?;
        Ok(Self::from(private_key))
    }

    /// Decodes a PKCS#1 `RSA PRIVATE KEY` PEM block, decrypting it first when
    /// a non-empty `password` is provided.
    #[instrument(name = "create_rsa_signing_key_from_pkcs1_pem", skip_all)]
    pub fn from_pem(input: &[u8], password: Option<&[u8]>) -> Result<Self> {
        let der = pem::decode(input, RSA_PRIVATE_KEY_LABEL, password).context(DecodePemSnafu)?;
        let private_key = RsaPrivateKey::from_pkcs1_der(&der).context(DeserializeSigningKeySnafu)?;

        Ok(Self::from(private_key))
    }

    /// Encodes the key as an unencrypted PKCS#1 PEM block.
    pub fn to_pem(&self) -> Result<String> {
        let der = self
            .private_key
            .to_pkcs1_der()
            .context(SerializeSigningKeySnafu)?;

        Ok(pem::encode(RSA_PRIVATE_KEY_LABEL, der.as_bytes()))
    }

    /// Encodes the key as a password protected PKCS#1 PEM block.
    pub fn to_encrypted_pem(&self, password: &[u8], cipher: PemCipher) -> Result<String> {
        let der = self
            .private_key
            .to_pkcs1_der()
            .context(SerializeSigningKeySnafu)?;

        pem::encrypt(RSA_PRIVATE_KEY_LABEL, der.as_bytes(), password, cipher)
            .context(EncryptSigningKeySnafu)
    }

    /// Returns the PKCS#1 DER encoding of the private key.
    pub fn to_pkcs1_der(&self) -> Result<Vec<u8>> {
        let der = self
            .private_key
            .to_pkcs1_der()
            .context(SerializeSigningKeySnafu)?;

        Ok(der.as_bytes().to_vec())
    }

    pub fn signing_key(&self) -> &rsa::pkcs1v15::SigningKey<Sha256> {
        &self.signing_key
    }

    pub fn verifying_key(&self) -> rsa::pkcs1v15::VerifyingKey<Sha256> {
        self.signing_key.verifying_key()
    }

    pub fn public_key(&self) -> RsaPublicKey {
        self.private_key.to_public_key()
    }

    /// Returns the size of the modulus in bits.
    pub fn key_size(&self) -> usize {
        self.private_key.size() * 8
    }

    /// Returns the public key as a [`SubjectPublicKeyInfoOwned`].
    pub fn subject_public_key_info(&self) -> Result<SubjectPublicKeyInfoOwned> {
        let spki_der = self
            .verifying_key()
            .to_public_key_der()
            .context(SerializePublicKeySnafu)?;

        SubjectPublicKeyInfoOwned::from_der(spki_der.as_bytes()).context(DecodeSpkiSnafu)
    }

    /// Returns `true` if `certificate` carries the public half of this key.
    pub fn matches_certificate(&self, certificate: &Certificate) -> bool {
        let Ok(spki_der) = certificate
            .tbs_certificate
            .subject_public_key_info
            .to_der()
        else {
            return false;
        };

        RsaPublicKey::from_public_key_der(&spki_der)
            .is_ok_and(|public_key| public_key == self.private_key.to_public_key())
    }
}

impl std::fmt::Debug for SigningKey {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SigningKey")
            .field("key_size", &self.key_size())
            .finish_non_exhaustive()
    }
}

impl From<RsaPrivateKey> for SigningKey {
    fn from(private_key: RsaPrivateKey) -> Self {
        let signing_key = rsa::pkcs1v15::SigningKey::<Sha256>::new(private_key.clone());

        Self {
            private_key,
            signing_key,
        }
    }
}

/// Generates a fresh RSA key of `bits` bits and returns it as a PKCS#1 PEM
/// block.
pub fn new_key_pem(bits: usize) -> Result<String> {
    SigningKey::new(bits)?.to_pem()
}
