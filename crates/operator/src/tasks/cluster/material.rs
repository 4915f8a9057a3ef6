//! Random secrets and self-signed TLS material.
//!
//! Material is produced only when the convergence engine finds the target
//! secret missing; nothing here checks for existing objects.

use crate::tasks::types::{Error, Result};
use base64::engine::general_purpose::URL_SAFE_NO_PAD;
use base64::Engine;
use rand::rngs::OsRng;
use rand::RngCore;
use rcgen::{
    CertificateParams, DnType, ExtendedKeyUsagePurpose, KeyPair, KeyUsagePurpose, SerialNumber,
};
use rsa::pkcs1::EncodeRsaPrivateKey;
use rsa::pkcs8::{EncodePrivateKey, LineEnding};
use rsa::RsaPrivateKey;
use std::collections::BTreeMap;
use time::{Duration, OffsetDateTime};

pub const JWT_SECRET_KEY: &str = "jwtSecret";
pub const DATABASE_PASSWORD_KEY: &str = "databasePassword";
pub const REDIS_PASSWORD_KEY: &str = "redisPassword";

const JWT_SECRET_BYTES: usize = 32;
const PASSWORD_BYTES: usize = 24;
const RSA_KEY_BITS: usize = 2048;
const CERT_BACKDATE_MINUTES: i64 = 5;
const CERT_VALIDITY_DAYS: i64 = 365;

/// PEM-encoded certificate and its PKCS#1 private key
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TlsMaterial {
    pub cert_pem: String,
    pub key_pem: String,
}

#[cfg_attr(test, mockall::automock)]
pub trait MaterialGenerator: Send + Sync {
    /// Data of the core secret: `jwtSecret`, `databasePassword`, `redisPassword`
    fn core_secret_data(&self) -> Result<BTreeMap<String, String>>;

    /// Self-signed server certificate whose SANs are `dns_names` and whose
    /// CN is `common_name`, or the first DNS name when that is empty
    fn self_signed(&self, common_name: &str, dns_names: &[String]) -> Result<TlsMaterial>;
}

/// Generator backed by the operating system RNG
#[derive(Debug, Default, Clone, Copy)]
pub struct SystemMaterialGenerator;

impl SystemMaterialGenerator {
    fn random_token(len: usize) -> Result<String> {
        let mut bytes = vec![0u8; len];
        OsRng
            .try_fill_bytes(&mut bytes)
            .map_err(|e| Error::CryptoError(format!("random source unavailable: {e}")))?;
        Ok(URL_SAFE_NO_PAD.encode(bytes))
    }
}

impl MaterialGenerator for SystemMaterialGenerator {
    fn core_secret_data(&self) -> Result<BTreeMap<String, String>> {
        let mut data = BTreeMap::new();
        data.insert(
            JWT_SECRET_KEY.to_string(),
            Self::random_token(JWT_SECRET_BYTES)?,
        );
        data.insert(
            DATABASE_PASSWORD_KEY.to_string(),
            Self::random_token(PASSWORD_BYTES)?,
        );
        data.insert(
            REDIS_PASSWORD_KEY.to_string(),
            Self::random_token(PASSWORD_BYTES)?,
        );
        Ok(data)
    }

    fn self_signed(&self, common_name: &str, dns_names: &[String]) -> Result<TlsMaterial> {
        let common_name = Some(common_name.trim())
            .filter(|cn| !cn.is_empty())
            .or_else(|| dns_names.first().map(String::as_str))
            .ok_or_else(|| {
                Error::CryptoError("certificate needs a common name or DNS name".to_string())
            })?;

        let private_key = RsaPrivateKey::new(&mut OsRng, RSA_KEY_BITS)
            .map_err(|e| Error::CryptoError(format!("RSA key generation failed: {e}")))?;
        let key_pem = private_key
            .to_pkcs1_pem(LineEnding::LF)
            .map_err(|e| Error::CryptoError(format!("private key encoding failed: {e}")))?;
        let pkcs8_pem = private_key
            .to_pkcs8_pem(LineEnding::LF)
            .map_err(|e| Error::CryptoError(format!("private key encoding failed: {e}")))?;
        let key_pair = KeyPair::from_pem_and_sign_algo(&pkcs8_pem, &rcgen::PKCS_RSA_SHA256)
            .map_err(|e| Error::CryptoError(format!("signing key rejected: {e}")))?;

        let mut params = CertificateParams::new(dns_names.to_vec())
            .map_err(|e| Error::CryptoError(format!("invalid DNS name: {e}")))?;
        params
            .distinguished_name
            .push(DnType::CommonName, common_name);

        let now = OffsetDateTime::now_utc();
        params.not_before = now - Duration::minutes(CERT_BACKDATE_MINUTES);
        params.not_after = now + Duration::days(CERT_VALIDITY_DAYS);
        params.key_usages = vec![
            KeyUsagePurpose::DigitalSignature,
            KeyUsagePurpose::KeyEncipherment,
        ];
        params.extended_key_usages = vec![ExtendedKeyUsagePurpose::ServerAuth];

        let mut serial = [0u8; 16];
        OsRng
            .try_fill_bytes(&mut serial)
            .map_err(|e| Error::CryptoError(format!("random source unavailable: {e}")))?;
        // Positive DER integer
        serial[0] &= 0x7f;
        params.serial_number = Some(SerialNumber::from_slice(&serial));

        let cert = params
            .self_signed(&key_pair)
            .map_err(|e| Error::CryptoError(format!("certificate signing failed: {e}")))?;

        Ok(TlsMaterial {
            cert_pem: cert.pem(),
            key_pem: key_pem.to_string(),
        })
    }
}
