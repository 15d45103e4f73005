//! Session crypto: RSA-OAEP bootstrap of the pair key and the AES-CFB data
//! path.
//!
//! RSA only identifies the certificate holder and carries the 32-byte pair
//! key; everything after that is AES-256-CFB with a fresh IV prepended to
//! each message. CFB authenticates nothing by itself — an on-path relay can
//! drop or reorder without detection — which is why the per-pair chain
//! exists as an opt-in layer on top.

use aes::Aes256;

use cfb_mode::{
    Decryptor, Encryptor,
    cipher::{AsyncStreamCipher, KeyIvInit},
};

use rand::Rng;

use rsa::{
    Oaep, RsaPrivateKey, RsaPublicKey,
    pkcs1::DecodeRsaPrivateKey,
    pkcs8::{DecodePrivateKey, DecodePublicKey},
};

use sha2::Sha512;
use x509_parser::prelude::*;

use crate::Error;

/// Size of the per-pair symmetric key.
pub const KEY_SIZE: usize = 32;

/// Size of the IV prepended to every sealed message.
pub const IV_SIZE: usize = 16;

/// Load the DER body of the first certificate in a PEM file.
pub fn load_certificate(path: &str) -> Result<Vec<u8>, Error> {
    use tokio_rustls::rustls::pki_types::{CertificateDer, pem::PemObject};

    Ok(CertificateDer::from_pem_file(path)
        .map_err(|_| Error::BadCertificate)?
        .as_ref()
        .to_vec())
}

/// Load an RSA private key from a PEM file, accepting both PKCS#1 and
/// PKCS#8 encodings.
pub fn load_private_key(path: &str) -> Result<RsaPrivateKey, Error> {
    let pem = std::fs::read_to_string(path)?;

    RsaPrivateKey::from_pkcs1_pem(&pem)
        .or_else(|_| RsaPrivateKey::from_pkcs8_pem(&pem))
        .map_err(|_| Error::CryptoFailed)
}

/// Draw a fresh uniformly random pair key.
pub fn generate_key() -> [u8; KEY_SIZE] {
    let mut key = [0u8; KEY_SIZE];
    rand::thread_rng().fill(&mut key[..]);
    key
}

/// Encrypt a pair key under the public key of the given DER certificate,
/// OAEP over SHA-512.
pub fn wrap_key(key: &[u8; KEY_SIZE], cert_der: &[u8]) -> Result<Vec<u8>, Error> {
    let (_, cert) = X509Certificate::from_der(cert_der).map_err(|_| Error::BadCertificate)?;
    let public = RsaPublicKey::from_public_key_der(cert.public_key().raw)
        .map_err(|_| Error::BadCertificate)?;

    public
        .encrypt(&mut rand::thread_rng(), Oaep::new::<Sha512>(), key)
        .map_err(|_| Error::CryptoFailed)
}

/// Recover a pair key that was wrapped for us.
pub fn unwrap_key(ciphertext: &[u8], key: &RsaPrivateKey) -> Result<[u8; KEY_SIZE], Error> {
    let plain = key
        .decrypt(Oaep::new::<Sha512>(), ciphertext)
        .map_err(|_| Error::CryptoFailed)?;

    plain.as_slice().try_into().map_err(|_| Error::CryptoFailed)
}

/// Encrypt with AES-256-CFB under a fresh IV; the IV travels in front of
/// the ciphertext.
pub fn seal(plaintext: &[u8], key: &[u8; KEY_SIZE]) -> Vec<u8> {
    let mut iv = [0u8; IV_SIZE];
    rand::thread_rng().fill(&mut iv);

    let mut sealed = Vec::with_capacity(IV_SIZE + plaintext.len());
    sealed.extend_from_slice(&iv);
    sealed.extend_from_slice(plaintext);
    Encryptor::<Aes256>::new(key.into(), (&iv).into()).encrypt(&mut sealed[IV_SIZE..]);
    sealed
}

/// Decrypt an IV-prefixed AES-256-CFB message.
pub fn open(sealed: &[u8], key: &[u8; KEY_SIZE]) -> Result<Vec<u8>, Error> {
    if sealed.len() < IV_SIZE {
        return Err(Error::InvalidInput);
    }

    let (iv, ciphertext) = sealed.split_at(IV_SIZE);
    let iv: [u8; IV_SIZE] = iv.try_into().map_err(|_| Error::InvalidInput)?;

    let mut plain = ciphertext.to_vec();
    Decryptor::<Aes256>::new(key.into(), (&iv).into()).decrypt(&mut plain);
    Ok(plain)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn aes_cfb_round_trip() {
        let key = generate_key();

        for size in [0usize, 1, 16, 31, 1024] {
            let plaintext: Vec<u8> = (0..size).map(|i| i as u8).collect();

            let sealed = seal(&plaintext, &key);
            assert_eq!(sealed.len(), IV_SIZE + plaintext.len());
            if size > 0 {
                assert_ne!(&sealed[IV_SIZE..], &plaintext[..]);
            }

            assert_eq!(open(&sealed, &key).unwrap(), plaintext);
        }
    }

    #[test]
    fn seal_draws_a_fresh_iv() {
        let key = generate_key();
        let first = seal(b"same message", &key);
        let second = seal(b"same message", &key);

        assert_ne!(first[..IV_SIZE], second[..IV_SIZE]);
        assert_ne!(first, second);
    }

    #[test]
    fn open_with_the_wrong_key_scrambles() {
        let sealed = seal(b"secret", &generate_key());
        let plain = open(&sealed, &generate_key()).unwrap();

        assert_ne!(plain, b"secret");
    }

    #[test]
    fn open_rejects_truncated_input() {
        assert!(open(&[0u8; 8], &generate_key()).is_err());
    }

    #[test]
    fn oaep_wrap_round_trip() {
        let mut rng = rand::thread_rng();
        let private = RsaPrivateKey::new(&mut rng, 2048).unwrap();
        let public = RsaPublicKey::from(&private);

        let key = generate_key();
        let wrapped = public
            .encrypt(&mut rng, Oaep::new::<Sha512>(), &key[..])
            .unwrap();

        assert_ne!(wrapped, key);
        assert_eq!(unwrap_key(&wrapped, &private).unwrap(), key);
    }
}
