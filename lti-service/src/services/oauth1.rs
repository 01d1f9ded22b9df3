//! OAuth 1.0a HMAC-SHA1 signing and verification.
//!
//! Covers both directions: verifying inbound LTI 1.1 launch posts and signing
//! outbound LIS outcomes posts (with `oauth_body_hash` for XML bodies).

use base64::{Engine, engine::general_purpose::STANDARD as BASE64};
use hmac::{Hmac, Mac};
use rand::Rng;
use sha1::{Digest, Sha1};
use subtle::ConstantTimeEq;

use crate::services::error::ServiceError;

type HmacSha1 = Hmac<Sha1>;

/// Percent-encode per RFC 5849 §3.6 (RFC 3986 unreserved set only).
pub fn percent_encode(value: &str) -> String {
    urlencoding::encode(value).into_owned()
}

/// Build the signature base string for a request.
///
/// `params` must contain every oauth_* and body/query parameter except
/// `oauth_signature`. The URI must already be in canonical form (lowercase
/// scheme/host, default port dropped, no query string).
pub fn signature_base_string(method: &str, uri: &str, params: &[(String, String)]) -> String {
    let mut encoded: Vec<(String, String)> = params
        .iter()
        .filter(|(k, _)| k != "oauth_signature")
        .map(|(k, v)| (percent_encode(k), percent_encode(v)))
        .collect();
    encoded.sort();

    let normalized = encoded
        .iter()
        .map(|(k, v)| format!("{}={}", k, v))
        .collect::<Vec<_>>()
        .join("&");

    format!(
        "{}&{}&{}",
        method.to_uppercase(),
        percent_encode(uri),
        percent_encode(&normalized)
    )
}

/// HMAC-SHA1 over the base string, keyed with `consumer_secret&token_secret`.
pub fn sign_base_string(base: &str, consumer_secret: &str, token_secret: &str) -> String {
    let key = format!(
        "{}&{}",
        percent_encode(consumer_secret),
        percent_encode(token_secret)
    );
    // HMAC accepts keys of any length.
    let mut mac =
        HmacSha1::new_from_slice(key.as_bytes()).expect("HMAC-SHA1 accepts any key length");
    mac.update(base.as_bytes());
    BASE64.encode(mac.finalize().into_bytes())
}

/// Compute the `oauth_signature` for a request.
pub fn compute_signature(
    method: &str,
    uri: &str,
    params: &[(String, String)],
    consumer_secret: &str,
) -> String {
    let base = signature_base_string(method, uri, params);
    sign_base_string(&base, consumer_secret, "")
}

/// Verify a supplied signature in constant time.
pub fn verify_signature(
    method: &str,
    uri: &str,
    params: &[(String, String)],
    consumer_secret: &str,
    supplied_signature: &str,
) -> Result<(), ServiceError> {
    let expected = compute_signature(method, uri, params, consumer_secret);

    let expected_bytes = expected.as_bytes();
    let supplied_bytes = supplied_signature.as_bytes();
    if expected_bytes.len() != supplied_bytes.len() {
        return Err(ServiceError::BadSignature);
    }
    if bool::from(expected_bytes.ct_eq(supplied_bytes)) {
        Ok(())
    } else {
        Err(ServiceError::BadSignature)
    }
}

/// `oauth_body_hash` for non-form bodies: base64(sha1(body)).
pub fn body_hash(body: &str) -> String {
    BASE64.encode(Sha1::digest(body.as_bytes()))
}

/// Fresh random nonce for outbound requests.
pub fn generate_nonce() -> String {
    let mut rng = rand::thread_rng();
    let bytes: [u8; 16] = rng.r#gen();
    hex::encode(bytes)
}

/// Build an OAuth 1.0a `Authorization` header for a signed body POST.
///
/// Used by the LIS outcomes client: the XML body is folded into the signature
/// through `oauth_body_hash` rather than as form parameters.
pub fn authorization_header(
    method: &str,
    uri: &str,
    consumer_key: &str,
    consumer_secret: &str,
    body: &str,
) -> String {
    let timestamp = chrono::Utc::now().timestamp().to_string();
    let nonce = generate_nonce();
    let hash = body_hash(body);

    let mut params: Vec<(String, String)> = vec![
        ("oauth_version".to_string(), "1.0".to_string()),
        ("oauth_consumer_key".to_string(), consumer_key.to_string()),
        (
            "oauth_signature_method".to_string(),
            "HMAC-SHA1".to_string(),
        ),
        ("oauth_timestamp".to_string(), timestamp),
        ("oauth_nonce".to_string(), nonce),
        ("oauth_body_hash".to_string(), hash),
    ];
    let signature = compute_signature(method, uri, &params, consumer_secret);
    params.push(("oauth_signature".to_string(), signature));

    let fields = params
        .iter()
        .map(|(k, v)| format!(r#"{}="{}""#, percent_encode(k), percent_encode(v)))
        .collect::<Vec<_>>()
        .join(", ");
    format!("OAuth {}", fields)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn launch_params(signature: Option<&str>) -> Vec<(String, String)> {
        let mut params = vec![
            ("oauth_consumer_key".to_string(), "k1".to_string()),
            ("oauth_nonce".to_string(), "abc123".to_string()),
            (
                "oauth_signature_method".to_string(),
                "HMAC-SHA1".to_string(),
            ),
            ("oauth_timestamp".to_string(), "1700000000".to_string()),
            ("oauth_version".to_string(), "1.0".to_string()),
            ("lti_version".to_string(), "LTI-1p0".to_string()),
            ("user_id".to_string(), "u1".to_string()),
        ];
        if let Some(sig) = signature {
            params.push(("oauth_signature".to_string(), sig.to_string()));
        }
        params
    }

    #[test]
    fn base_string_sorts_and_encodes_params() {
        let base = signature_base_string(
            "post",
            "http://tool/lti_launches",
            &[
                ("b".to_string(), "2 2".to_string()),
                ("a".to_string(), "1".to_string()),
            ],
        );
        assert_eq!(
            base,
            "POST&http%3A%2F%2Ftool%2Flti_launches&a%3D1%26b%3D2%25202"
        );
    }

    #[test]
    fn base_string_excludes_the_signature_itself() {
        let with = signature_base_string(
            "POST",
            "http://tool/lti_launches",
            &launch_params(Some("sig")),
        );
        let without =
            signature_base_string("POST", "http://tool/lti_launches", &launch_params(None));
        assert_eq!(with, without);
    }

    #[test]
    fn round_trip_sign_then_verify() {
        let params = launch_params(None);
        let sig = compute_signature("POST", "http://tool/lti_launches", &params, "s1");
        assert!(
            verify_signature("POST", "http://tool/lti_launches", &params, "s1", &sig).is_ok()
        );
    }

    #[test]
    fn wrong_secret_fails_verification() {
        let params = launch_params(None);
        let sig = compute_signature("POST", "http://tool/lti_launches", &params, "s1");
        assert!(matches!(
            verify_signature("POST", "http://tool/lti_launches", &params, "other", &sig),
            Err(ServiceError::BadSignature)
        ));
    }

    #[test]
    fn tampered_param_fails_verification() {
        let params = launch_params(None);
        let sig = compute_signature("POST", "http://tool/lti_launches", &params, "s1");
        let mut tampered = params.clone();
        tampered.retain(|(k, _)| k != "user_id");
        tampered.push(("user_id".to_string(), "mallory".to_string()));
        assert!(matches!(
            verify_signature("POST", "http://tool/lti_launches", &tampered, "s1", &sig),
            Err(ServiceError::BadSignature)
        ));
    }

    #[test]
    fn body_hash_is_base64_sha1() {
        // sha1("") = da39a3ee5e6b4b0d3255bfef95601890afd80709
        assert_eq!(body_hash(""), "2jmj7l5rSw0yVb/vlWAYkK/YBwk=");
    }

    #[test]
    fn authorization_header_carries_all_oauth_fields() {
        let header = authorization_header("POST", "http://lms/outcomes", "k1", "s1", "<xml/>");
        assert!(header.starts_with("OAuth "));
        for field in [
            "oauth_consumer_key=",
            "oauth_signature_method=",
            "oauth_timestamp=",
            "oauth_nonce=",
            "oauth_body_hash=",
            "oauth_signature=",
        ] {
            assert!(header.contains(field), "missing {}", field);
        }
    }
}
