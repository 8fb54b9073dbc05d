// ID and token generation.

/// Alphanumeric alphabet for gift tokens (no ambiguity-prone symbols).
const TOKEN_ALPHABET: [char; 36] = [
    '0', '1', '2', '3', '4', '5', '6', '7', '8', '9', 'a', 'b', 'c', 'd', 'e', 'f', 'g', 'h', 'i',
    'j', 'k', 'l', 'm', 'n', 'o', 'p', 'q', 'r', 's', 't', 'u', 'v', 'w', 'x', 'y', 'z',
];

/// Generate a unique record ID (nanoid, 21 characters).
pub fn generate_id() -> String {
    nanoid::nanoid!()
}

/// Generate an unguessable 32-character gift token.
///
/// Lowercase alphanumeric so it survives URL embedding and chat deep-links
/// without escaping.
pub fn generate_gift_token() -> String {
    nanoid::nanoid!(32, &TOKEN_ALPHABET)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn ids_are_unique() {
        assert_ne!(generate_id(), generate_id());
    }

    #[test]
    fn gift_token_shape() {
        let token = generate_gift_token();
        assert_eq!(token.len(), 32);
        assert!(token.chars().all(|c| c.is_ascii_lowercase() || c.is_ascii_digit()));
    }

    #[test]
    fn gift_tokens_are_unique() {
        assert_ne!(generate_gift_token(), generate_gift_token());
    }
}
