//! Minting of client/room ids and session tokens.

use rand::Rng;

use crate::limits::ID_LEN;

/// `0` and `O` read alike, so the digit zero is excluded.
const ID_ALPHABET: &[u8] = b"ABCDEFGHIJKLMNOPQRSTUVWXYZ123456789";

/// Reserved client id; doubles as the host sentinel for server-owned rooms.
pub const SERVER_ID: &str = "server";

/// Mint a six-character id over `A-Z 1-9`.
pub fn mint_id() -> String {
    let mut rng = rand::rng();
    (0..ID_LEN)
        .map(|_| ID_ALPHABET[rng.random_range(0..ID_ALPHABET.len())] as char)
        .collect()
}

/// Mint a 16-character lowercase hex session token.
pub fn mint_session_token() -> String {
    let bytes: [u8; 8] = rand::rng().random();
    bytes.iter().map(|b| format!("{b:02x}")).collect()
}

/// Constant-time token comparison.
pub fn token_matches(expected: &str, supplied: &str) -> bool {
    let (a, b) = (expected.as_bytes(), supplied.as_bytes());
    if a.len() != b.len() {
        return false;
    }
    a.iter().zip(b).fold(0u8, |acc, (x, y)| acc | (x ^ y)) == 0
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_minted_id_shape() {
        for _ in 0..100 {
            let id = mint_id();
            assert_eq!(id.len(), ID_LEN);
            assert!(id.bytes().all(|b| ID_ALPHABET.contains(&b)));
            assert!(!id.contains('0'));
        }
    }

    #[test]
    fn test_session_token_shape() {
        let token = mint_session_token();
        assert_eq!(token.len(), 16);
        assert!(token.bytes().all(|b| b.is_ascii_hexdigit() && !b.is_ascii_uppercase()));
    }

    #[test]
    fn test_token_matches() {
        let token = mint_session_token();
        assert!(token_matches(&token, &token.clone()));
        assert!(!token_matches(&token, "0000000000000000"));
        assert!(!token_matches(&token, "short"));
    }
}
