//! RSA signing key lifecycle.
//!
//! Generates the tool's RS256 keypairs, renders the public half as a JWK for
//! the published key set, and signs JWTs with a `kid` header so platforms can
//! pick the right verification key.

use anyhow::{Context, anyhow};
use base64::{Engine, engine::general_purpose::URL_SAFE_NO_PAD as BASE64_URL};
use jsonwebtoken::{Algorithm, EncodingKey, Header};
use rsa::{
    RsaPrivateKey, RsaPublicKey,
    pkcs8::{EncodePrivateKey, LineEnding},
    traits::PublicKeyParts,
};
use serde::Serialize;
use serde_json::{Value, json};
use uuid::Uuid;

use crate::models::RsaKey;
use crate::services::error::ServiceError;

const RSA_KEY_BITS: usize = 2048;

/// Freshly generated key material, before it has been persisted.
pub struct GeneratedKey {
    pub kid: Uuid,
    pub public_jwk: Value,
    pub private_pem: String,
}

/// Generate a new 2048-bit RSA keypair.
pub fn generate_key() -> Result<GeneratedKey, ServiceError> {
    let mut rng = rand::thread_rng();
    let private = RsaPrivateKey::new(&mut rng, RSA_KEY_BITS)
        .context("failed to generate RSA keypair")?;
    let public = RsaPublicKey::from(&private);

    let kid = Uuid::new_v4();
    let private_pem = private
        .to_pkcs8_pem(LineEnding::LF)
        .context("failed to encode private key as PEM")?
        .to_string();

    Ok(GeneratedKey {
        kid,
        public_jwk: public_key_to_jwk(&public, kid),
        private_pem,
    })
}

/// Render a public key as an RS256 JWK.
fn public_key_to_jwk(public: &RsaPublicKey, kid: Uuid) -> Value {
    json!({
        "kty": "RSA",
        "alg": "RS256",
        "use": "sig",
        "kid": kid.to_string(),
        "n": BASE64_URL.encode(public.n().to_bytes_be()),
        "e": BASE64_URL.encode(public.e().to_bytes_be()),
    })
}

/// The tool's published key set: every key, active or retired, so platforms
/// can still verify assertions signed before a rotation.
pub fn jwks_document(keys: &[RsaKey]) -> Value {
    let jwks: Vec<&Value> = keys.iter().map(|k| &k.public_jwk).collect();
    json!({ "keys": jwks })
}

/// Sign `claims` as an RS256 JWT using `key`, with the key's id in the header.
pub fn sign_rs256<T: Serialize>(key: &RsaKey, claims: &T) -> Result<String, ServiceError> {
    let mut header = Header::new(Algorithm::RS256);
    header.kid = Some(key.kid.to_string());

    let encoding_key = EncodingKey::from_rsa_pem(key.private_pem.as_bytes())
        .map_err(|e| anyhow!("failed to parse signing key {}: {}", key.kid, e))?;

    jsonwebtoken::encode(&header, claims, &encoding_key)
        .map_err(|e| ServiceError::Internal(anyhow!("failed to sign JWT: {}", e)))
}
