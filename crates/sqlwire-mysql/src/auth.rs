//! MySQL authentication scrambles.
//!
//! - `mysql_native_password`: SHA1 challenge-response used by 4.1+ servers
//! - `mysql_old_password`: the pre-4.1 "323" scramble, only reached through
//!   the legacy fallback of the handshake
//!
//! # mysql_native_password
//!
//! ```text
//! SHA1(password) XOR SHA1(seed + SHA1(SHA1(password)))
//! ```

use sha1::{Digest, Sha1};

/// Well-known authentication plugin names.
pub mod plugins {
    /// SHA1-based authentication
    pub const MYSQL_NATIVE_PASSWORD: &str = "mysql_native_password";
    /// Pre-4.1 authentication
    pub const MYSQL_OLD_PASSWORD: &str = "mysql_old_password";
}

/// Number of salt bytes the legacy scramble consumes.
pub const SCRAMBLE_LENGTH_323: usize = 8;

/// Compute the mysql_native_password response.
///
/// Only the first 20 bytes of `salt` are used. An empty password yields an
/// empty response.
pub fn scramble_native(password: &[u8], salt: &[u8]) -> Vec<u8> {
    if password.is_empty() {
        return vec![];
    }

    let seed = if salt.len() > 20 { &salt[..20] } else { salt };

    // Stage 1: SHA1(password)
    let stage1: [u8; 20] = Sha1::digest(password).into();

    // Stage 2: SHA1(SHA1(password))
    let stage2: [u8; 20] = Sha1::digest(stage1).into();

    // Stage 3: SHA1(seed + stage2)
    let mut hasher = Sha1::new();
    hasher.update(seed);
    hasher.update(stage2);
    let stage3: [u8; 20] = hasher.finalize().into();

    xor_bytes(&stage1, &stage3)
}

/// Compute the pre-4.1 ("323") scramble.
///
/// Uses at most [`SCRAMBLE_LENGTH_323`] bytes of `salt`; the output has one
/// byte per salt byte used. An empty password yields an empty response.
pub fn scramble_323(password: &[u8], salt: &[u8]) -> Vec<u8> {
    if password.is_empty() {
        return vec![];
    }

    let message = &salt[..salt.len().min(SCRAMBLE_LENGTH_323)];
    let hash_pass = hash_password_323(password);
    let hash_message = hash_password_323(message);

    let mut rng = Rand323::new(hash_pass[0] ^ hash_message[0], hash_pass[1] ^ hash_message[1]);

    let mut out: Vec<u8> = (0..message.len())
        .map(|_| scaled(rng.next_f64()) + 64)
        .collect();
    let extra = scaled(rng.next_f64());
    for b in &mut out {
        *b ^= extra;
    }
    out
}

#[allow(clippy::cast_possible_truncation)]
fn scaled(r: f64) -> u8 {
    (r * 31.0) as u8
}

/// The legacy password hash: two 31-bit words. Spaces and tabs are ignored.
pub fn hash_password_323(password: &[u8]) -> [u32; 2] {
    let mut nr: u32 = 1_345_345_333;
    let mut add: u32 = 7;
    let mut nr2: u32 = 0x1234_5671;

    for &c in password.iter().filter(|&&c| c != b' ' && c != b'\t') {
        let c = u32::from(c);
        nr ^= ((nr & 63).wrapping_add(add))
            .wrapping_mul(c)
            .wrapping_add(nr << 8);
        nr2 = nr2.wrapping_add((nr2 << 8) ^ nr);
        add = add.wrapping_add(c);
    }

    [nr & 0x7FFF_FFFF, nr2 & 0x7FFF_FFFF]
}

/// Random generator of the legacy scramble.
struct Rand323 {
    seed1: u64,
    seed2: u64,
}

impl Rand323 {
    const MAX_VALUE: u64 = 0x3FFF_FFFF;

    fn new(seed1: u32, seed2: u32) -> Self {
        Self {
            seed1: u64::from(seed1) % Self::MAX_VALUE,
            seed2: u64::from(seed2) % Self::MAX_VALUE,
        }
    }

    #[allow(clippy::cast_precision_loss)]
    fn next_f64(&mut self) -> f64 {
        self.seed1 = (self.seed1 * 3 + self.seed2) % Self::MAX_VALUE;
        self.seed2 = (self.seed1 + self.seed2 + 33) % Self::MAX_VALUE;
        self.seed1 as f64 / Self::MAX_VALUE as f64
    }
}

fn xor_bytes(a: &[u8], b: &[u8]) -> Vec<u8> {
    a.iter().zip(b.iter()).map(|(x, y)| x ^ y).collect()
}

#[cfg(test)]
mod tests {
    use super::*;

    fn hex(bytes: &[u8]) -> String {
        bytes.iter().map(|b| format!("{b:02x}")).collect()
    }

    #[test]
    fn test_native_empty_password() {
        assert!(scramble_native(b"", &[0; 20]).is_empty());
    }

    #[test]
    fn test_native_known_vector() {
        let salt: Vec<u8> = (1..=20).collect();
        let result = scramble_native(b"secret", &salt);
        assert_eq!(hex(&result), "b32bb3a583e1340c0a1108d58b1be49781ad8c2f");
    }

    #[test]
    fn test_native_ignores_salt_tail() {
        let mut salt: Vec<u8> = (1..=20).collect();
        let base = scramble_native(b"secret", &salt);
        salt.push(0);
        assert_eq!(scramble_native(b"secret", &salt), base);
        assert_ne!(scramble_native(b"other", &salt), base);
    }

    #[test]
    fn test_hash_password_323_matches_old_password() {
        // OLD_PASSWORD('password') = 5d2e19393cc5ef67
        assert_eq!(hash_password_323(b"password"), [0x5d2e_1939, 0x3cc5_ef67]);
        assert_eq!(
            hash_password_323(b"pass word"),
            hash_password_323(b"password")
        );
    }

    #[test]
    fn test_scramble_323_known_vector() {
        let result = scramble_323(b"secret", b"abcdefgh");
        assert_eq!(result, b"TLTVQOT]".to_vec());
    }

    #[test]
    fn test_scramble_323_uses_first_eight_salt_bytes() {
        let short = scramble_323(b"secret", b"abcdefgh");
        let long = scramble_323(b"secret", b"abcdefghijklmnopqrst");
        assert_eq!(short, long);
        assert_eq!(long.len(), SCRAMBLE_LENGTH_323);
        assert!(long.iter().all(|b| (64..=95).contains(b)));
        assert!(scramble_323(b"", b"abcdefgh").is_empty());
    }
}
