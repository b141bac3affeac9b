//! Salted password hashes in the `<method>$<salt>$<hex digest>` layout.
//!
//! New hashes are `pbkdf2:sha256:<iterations>`. Verification also reads
//! `pbkdf2:sha512:<iterations>` and `scrypt:<n>:<r>:<p>`, so hashes written
//! by earlier deployments of the service keep verifying.

use pbkdf2::pbkdf2_hmac;
use rand::Rng;
use rand::distr::Alphanumeric;
use sha2::{Sha256, Sha512};
use subtle::ConstantTimeEq;
use tracing::warn;

pub const DEFAULT_ITERATIONS: u32 = 600_000;
const SALT_LEN: usize = 16;
const SCRYPT_DEFAULT_N: u64 = 1 << 15;
const SCRYPT_DEFAULT_R: u32 = 8;
const SCRYPT_DEFAULT_P: u32 = 1;
const SCRYPT_DIGEST_LEN: usize = 64;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Method {
    Pbkdf2Sha256 { iterations: u32 },
    Pbkdf2Sha512 { iterations: u32 },
    Scrypt { log_n: u8, r: u32, p: u32 },
}

pub fn hash_password(password: &str, iterations: u32) -> String {
    let iterations = iterations.max(1);
    let salt: String = rand::rng()
        .sample_iter(Alphanumeric)
        .take(SALT_LEN)
        .map(char::from)
        .collect();
    let digest = derive(Method::Pbkdf2Sha256 { iterations }, password, &salt)
        .unwrap_or_default();
    format!("pbkdf2:sha256:{iterations}${salt}${}", hex::encode(digest))
}

/// False for a wrong password and for any hash this module cannot read.
pub fn verify_password(stored: &str, password: &str) -> bool {
    let Some((method, salt, expected_hex)) = split_hash(stored) else {
        warn!("stored password hash is malformed");
        return false;
    };
    let Some(parsed) = parse_method(method) else {
        warn!(method, "unsupported password hash method");
        return false;
    };
    let Ok(expected) = hex::decode(expected_hex) else {
        warn!("stored password digest is not hex");
        return false;
    };
    let Some(actual) = derive(parsed, password, salt) else {
        warn!(method, "password hash parameters rejected");
        return false;
    };
    bool::from(actual.as_slice().ct_eq(expected.as_slice()))
}

fn split_hash(stored: &str) -> Option<(&str, &str, &str)> {
    let mut parts = stored.splitn(3, '$');
    Some((parts.next()?, parts.next()?, parts.next()?))
}

fn parse_method(method: &str) -> Option<Method> {
    let mut parts = method.split(':');
    let method = match (parts.next()?, parts.next()) {
        ("pbkdf2", Some("sha256")) => Method::Pbkdf2Sha256 {
            iterations: parse_iterations(parts.next())?,
        },
        ("pbkdf2", Some("sha512")) => Method::Pbkdf2Sha512 {
            iterations: parse_iterations(parts.next())?,
        },
        ("scrypt", n) => {
            let n = n.map_or(Some(SCRYPT_DEFAULT_N), |v| v.parse().ok())?;
            let r = parts.next().map_or(Some(SCRYPT_DEFAULT_R), |v| v.parse().ok())?;
            let p = parts.next().map_or(Some(SCRYPT_DEFAULT_P), |v| v.parse().ok())?;
            if !n.is_power_of_two() || n < 2 {
                return None;
            }
            Method::Scrypt {
                log_n: u8::try_from(n.trailing_zeros()).ok()?,
                r,
                p,
            }
        }
        _ => return None,
    };
    if parts.next().is_some() {
        return None;
    }
    Some(method)
}

fn parse_iterations(part: Option<&str>) -> Option<u32> {
    match part {
        None => Some(DEFAULT_ITERATIONS),
        Some(n) => n.parse().ok().filter(|n| *n > 0),
    }
}

fn derive(method: Method, password: &str, salt: &str) -> Option<Vec<u8>> {
    let (password, salt) = (password.as_bytes(), salt.as_bytes());
    match method {
        Method::Pbkdf2Sha256 { iterations } => {
            let mut out = vec![0u8; 32];
            pbkdf2_hmac::<Sha256>(password, salt, iterations, &mut out);
            Some(out)
        }
        Method::Pbkdf2Sha512 { iterations } => {
            let mut out = vec![0u8; 64];
            pbkdf2_hmac::<Sha512>(password, salt, iterations, &mut out);
            Some(out)
        }
        Method::Scrypt { log_n, r, p } => {
            let params = scrypt::Params::new(log_n, r, p, SCRYPT_DIGEST_LEN).ok()?;
            let mut out = vec![0u8; SCRYPT_DIGEST_LEN];
            scrypt::scrypt(password, salt, &params, &mut out).ok()?;
            Some(out)
        }
    }
}
