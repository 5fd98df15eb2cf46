use once_cell::sync::Lazy;
use regex::Regex;
use sha2::{Digest, Sha256};

const HASH_SCHEME: &str = "sha256";
const HASH_ROUNDS: u32 = 10_000;
const SALT_LEN: usize = 16;
const MIN_PASSWORD_LEN: usize = 6;
const MAX_NAME_LEN: usize = 80;

/// Session lifetime in seconds.
pub const SESSION_TTL_SECS: i64 = 60 * 60;

static USERNAME_RE: Lazy<Regex> = Lazy::new(|| Regex::new(r"^[A-Za-z0-9_.-]{3,80}$").unwrap());

// ── Passwords ────────────────────────────────────────────────────────────────

/// Hash a password as `sha256$<salt>$<digest>`, both parts hex encoded.
pub fn hash_password(password: &str) -> String {
    let salt: [u8; SALT_LEN] = rand::random();
    let digest = derive_key(password, &salt);
    format!("{}${}${}", HASH_SCHEME, hex::encode(salt), hex::encode(digest))
}

pub fn verify_password(password: &str, stored: &str) -> bool {
    let mut parts = stored.splitn(3, '$');
    let (salt, expected) = match (parts.next(), parts.next(), parts.next()) {
        (Some(HASH_SCHEME), Some(salt), Some(digest)) => (salt, digest),
        _ => return false,
    };
    let (Ok(salt), Ok(expected)) = (hex::decode(salt), hex::decode(expected)) else {
        return false;
    };
    constant_time_eq(&derive_key(password, &salt), &expected)
}

fn derive_key(password: &str, salt: &[u8]) -> [u8; 32] {
    let mut digest: [u8; 32] = Sha256::new()
        .chain_update(salt)
        .chain_update(password.as_bytes())
        .finalize()
        .into();
    for _ in 1..HASH_ROUNDS {
        digest = Sha256::new()
            .chain_update(salt)
            .chain_update(digest)
            .finalize()
            .into();
    }
    digest
}

fn constant_time_eq(a: &[u8], b: &[u8]) -> bool {
    if a.len() != b.len() {
        return false;
    }
    a.iter().zip(b).fold(0u8, |acc, (x, y)| acc | (x ^ y)) == 0
}

// ── Session tokens ───────────────────────────────────────────────────────────

/// Opaque 256-bit bearer token, hex encoded.
pub fn new_token() -> String {
    hex::encode(rand::random::<[u8; 32]>())
}

/// Pull the token out of an `Authorization: Bearer <token>` header value.
pub fn bearer_token(header: &str) -> Option<&str> {
    let (scheme, token) = header.trim().split_once(' ')?;
    if !scheme.eq_ignore_ascii_case("bearer") {
        return None;
    }
    let token = token.trim();
    (!token.is_empty()).then_some(token)
}

// ── Registration rules ───────────────────────────────────────────────────────

pub fn validate_registration(name: &str, username: &str, password: &str) -> Result<(), String> {
    let name = name.trim();
    if name.is_empty() || name.chars().count() > MAX_NAME_LEN {
        return Err(format!("Name must be 1 to {} characters", MAX_NAME_LEN));
    }
    if !USERNAME_RE.is_match(username) {
        return Err(
            "Username must be 3 to 80 letters, digits, dots, dashes or underscores".to_string(),
        );
    }
    if password.chars().count() < MIN_PASSWORD_LEN {
        return Err(format!(
            "Password must be at least {} characters",
            MIN_PASSWORD_LEN
        ));
    }
    Ok(())
}
