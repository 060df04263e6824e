//! Passcodes and Identifiers
//!
//! The host hands out a 6-decimal-digit passcode derived from 3 random
//! bytes. Processes created without an explicit identifier get a short
//! pronounceable mnemonic so humans can tell sessions apart.

use rand::seq::SliceRandom;
use rand::RngCore;

/// Generate the session passcode: 3 random bytes reduced to 6 decimal
/// digits, zero-padded.
pub fn generate_passcode() -> String {
    let mut bytes = [0u8; 3];
    rand::rngs::OsRng.fill_bytes(&mut bytes);
    let n = u32::from_be_bytes([0, bytes[0], bytes[1], bytes[2]]) % 1_000_000;
    format!("{n:06}")
}

const ONSETS: &[&str] = &[
    "b", "bl", "br", "cl", "d", "fl", "fr", "g", "gl", "gr", "k", "pl", "pr", "sk", "sl", "sn",
    "st", "tr", "v", "z",
];
const VOWELS: &[&str] = &["a", "e", "i", "o", "u", "oo"];
const CODAS: &[&str] = &[
    "b", "ck", "ft", "lf", "lk", "lp", "m", "nd", "ng", "nk", "p", "rk", "rn", "rp", "sh", "st",
    "t", "x",
];

fn syllable() -> String {
    let mut rng = rand::rngs::OsRng;
    let onset = ONSETS.choose(&mut rng).unwrap();
    let vowel = VOWELS.choose(&mut rng).unwrap();
    let coda = CODAS.choose(&mut rng).unwrap();
    format!("{onset}{vowel}{coda}")
}

/// Random mnemonic identifier, e.g. `blorp-glork`
pub fn mnemonic() -> String {
    format!("{}-{}", syllable(), syllable())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_passcode_shape() {
        for _ in 0..100 {
            let code = generate_passcode();
            assert_eq!(code.len(), 6);
            assert!(code.chars().all(|c| c.is_ascii_digit()));
        }
    }

    #[test]
    fn test_mnemonic_shape() {
        let id = mnemonic();
        let parts: Vec<&str> = id.split('-').collect();
        assert_eq!(parts.len(), 2);
        assert!(parts.iter().all(|p| !p.is_empty()));
    }
}
