//! Random passwords and tokens.

use base64::engine::general_purpose::URL_SAFE_NO_PAD;
use base64::Engine;
use rand::seq::SliceRandom;
use rand::{CryptoRng, Rng, RngCore};

use crate::registry::Complexity;

const LOWER: &[u8] = b"abcdefghijklmnopqrstuvwxyz";
const UPPER: &[u8] = b"ABCDEFGHIJKLMNOPQRSTUVWXYZ";
const DIGITS: &[u8] = b"0123456789";
const MEDIUM_SYMBOLS: &[u8] = b"-_.";
const HIGH_SYMBOLS: &[u8] = b"!@#$%^&*";

/// Character classes of the alphabet for `complexity`.
pub fn character_classes(complexity: Complexity) -> Vec<&'static [u8]> {
    match complexity {
        Complexity::Low => vec![LOWER, UPPER, DIGITS],
        Complexity::Medium => vec![LOWER, UPPER, DIGITS, MEDIUM_SYMBOLS],
        Complexity::High => vec![LOWER, UPPER, DIGITS, HIGH_SYMBOLS],
    }
}

/// Random password of `length` characters with at least one character from
/// every class of the alphabet (when `length` allows it).
pub fn generate_password<R: RngCore + CryptoRng>(rng: &mut R, length: usize, complexity: Complexity) -> String {
    let classes = character_classes(complexity);
    let alphabet: Vec<u8> = classes.concat();

    let mut chars: Vec<u8> = classes.iter().map(|class| class[rng.gen_range(0..class.len())]).collect();
    while chars.len() < length {
        chars.push(alphabet[rng.gen_range(0..alphabet.len())]);
    }
    chars.shuffle(rng);
    chars.truncate(length);

    chars.into_iter().map(char::from).collect()
}

/// Entropy of generated tokens, in bytes.
pub fn token_bytes(complexity: Complexity) -> usize {
    match complexity {
        Complexity::Low => 16,
        Complexity::Medium => 32,
        Complexity::High => 48,
    }
}

/// URL-safe token, `<prefix>_<base64>` when a prefix is given.
pub fn generate_token<R: RngCore + CryptoRng>(rng: &mut R, complexity: Complexity, prefix: Option<&str>) -> String {
    let mut bytes = vec![0u8; token_bytes(complexity)];
    rng.fill_bytes(&mut bytes);
    let encoded = URL_SAFE_NO_PAD.encode(&bytes);
    match prefix {
        Some(prefix) => format!("{}_{}", prefix, encoded),
        None => encoded,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use proptest::prelude::*;
    use rand::rngs::OsRng;

    #[test]
    fn test_low_complexity_is_alphanumeric() {
        let password = generate_password(&mut OsRng, 64, Complexity::Low);
        assert_eq!(password.len(), 64);
        assert!(password.chars().all(|c| c.is_ascii_alphanumeric()));
    }

    #[test]
    fn test_token_sizes() {
        // 32 bytes -> 43 base64 characters without padding
        assert_eq!(generate_token(&mut OsRng, Complexity::Medium, None).len(), 43);
        assert_eq!(generate_token(&mut OsRng, Complexity::Low, None).len(), 22);
        assert_eq!(generate_token(&mut OsRng, Complexity::High, None).len(), 64);

        let token = generate_token(&mut OsRng, Complexity::Medium, Some("api"));
        assert!(token.starts_with("api_"));
        assert!(token[4..].chars().all(|c| c.is_ascii_alphanumeric() || c == '-' || c == '_'));
    }

    #[test]
    fn test_passwords_differ() {
        let a = generate_password(&mut OsRng, 32, Complexity::Medium);
        let b = generate_password(&mut OsRng, 32, Complexity::Medium);
        assert_ne!(a, b);
    }

    fn complexity() -> impl Strategy<Value = Complexity> {
        prop_oneof![Just(Complexity::Low), Just(Complexity::Medium), Just(Complexity::High)]
    }

    proptest! {
        #[test]
        fn every_class_is_represented(length in 8usize..128, complexity in complexity()) {
            let password = generate_password(&mut OsRng, length, complexity);
            prop_assert_eq!(password.len(), length);

            let classes = character_classes(complexity);
            let alphabet: Vec<u8> = classes.concat();
            prop_assert!(password.bytes().all(|b| alphabet.contains(&b)));
            for class in classes {
                prop_assert!(password.bytes().any(|b| class.contains(&b)));
            }
        }
    }
}
