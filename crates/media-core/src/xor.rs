//! Lightweight stream obfuscation shared with peer border elements.
//!
//! Each byte is XORed with a two byte key in turn. When the buffer length is
//! odd the last byte uses the second key byte. Applying the cipher twice gives
//! back the original bytes.

pub const DEFAULT_XOR_KEY: &str = "GS";

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct XorCipher {
    key: [u8; 2],
}

impl Default for XorCipher {
    fn default() -> Self {
        Self {
            key: [b'G', b'S'],
        }
    }
}

impl XorCipher {
    pub fn new(key: [u8; 2]) -> Self {
        Self { key }
    }

    /// Build from a configured key; anything but two bytes falls back to the default
    pub fn from_key_str(key: &str) -> Self {
        match key.as_bytes() {
            [a, b] => Self::new([*a, *b]),
            _ => {
                tracing::warn!(key, "XOR key must be two bytes, using default");
                Self::default()
            }
        }
    }

    pub fn apply(&self, buf: &mut [u8]) {
        let len = buf.len();
        for (i, byte) in buf.iter_mut().enumerate() {
            let k = if len % 2 == 1 && i == len - 1 {
                self.key[1]
            } else {
                self.key[i % 2]
            };
            *byte ^= k;
        }
    }

    pub fn encrypt(&self, buf: &mut [u8]) {
        self.apply(buf);
    }

    pub fn decrypt(&self, buf: &mut [u8]) {
        self.apply(buf);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_even_length() {
        let cipher = XorCipher::default();
        let mut buf = vec![0u8; 4];
        cipher.encrypt(&mut buf);
        assert_eq!(buf, vec![b'G', b'S', b'G', b'S']);
    }

    #[test]
    fn test_odd_length_last_byte_uses_second_key() {
        let cipher = XorCipher::default();
        let mut buf = vec![0u8; 3];
        cipher.encrypt(&mut buf);
        assert_eq!(buf, vec![b'G', b'S', b'S']);
    }

    #[test]
    fn test_symmetric() {
        let cipher = XorCipher::new([0x5a, 0xa5]);
        let original: Vec<u8> = (0..=200u8).collect();
        let mut buf = original.clone();
        cipher.encrypt(&mut buf);
        assert_ne!(buf, original);
        cipher.decrypt(&mut buf);
        assert_eq!(buf, original);
    }

    #[test]
    fn test_obfuscated_rtp_fails_validation() {
        let cipher = XorCipher::default();
        let mut buf = vec![0x80, 0x00, 0x00, 0x01];
        cipher.encrypt(&mut buf);
        assert!(!crate::packet::validate_buffer(&buf));
    }

    #[test]
    fn test_bad_key_falls_back() {
        assert_eq!(XorCipher::from_key_str("toolong"), XorCipher::default());
        assert_eq!(XorCipher::from_key_str("ab"), XorCipher::new([b'a', b'b']));
    }
}
