use hmac::{Hmac, Mac};
use sha2::Sha256;
use subtle::ConstantTimeEq;

type HmacSha256 = Hmac<Sha256>;

/// Verify a hex-encoded HMAC-SHA256 of `body` keyed with `secret`.
///
/// `prefix` is stripped first (GitHub and Bitbucket send `sha256=<hex>`,
/// Gitea sends bare hex). The MAC comparison is constant-time.
pub fn verify_hmac_sha256(secret: &[u8], body: &[u8], signature_header: &str, prefix: &str) -> bool {
    let Some(expected_hex) = signature_header.trim().strip_prefix(prefix) else {
        return false;
    };
    let Ok(expected) = hex::decode(expected_hex) else {
        return false;
    };

    let mut mac = match HmacSha256::new_from_slice(secret) {
        Ok(m) => m,
        Err(_) => return false,
    };
    mac.update(body);
    mac.verify_slice(&expected).is_ok()
}

/// Verify a shared-secret header value matches the secret exactly.
pub fn verify_token(secret: &[u8], header_value: &str) -> bool {
    header_value.as_bytes().ct_eq(secret).into()
}

/// Verify an `Authorization: Bearer <secret>` header.
pub fn verify_bearer(secret: &[u8], authorization: &str) -> bool {
    let Some((scheme, token)) = authorization.trim().split_once(' ') else {
        return false;
    };
    scheme.eq_ignore_ascii_case("bearer") && verify_token(secret, token.trim())
}

/// Hex HMAC-SHA256 signature, as sent by the providers above.
pub fn sign_hmac_sha256(secret: &[u8], body: &[u8]) -> String {
    let mut mac = HmacSha256::new_from_slice(secret).expect("HMAC accepts keys of any length");
    mac.update(body);
    hex::encode(mac.finalize().into_bytes())
}
