//! AES-128 contexts for the two lock channels
//!
//! The secure channel is plain ECB. The session channel is CBC with a zero IV
//! whose chaining state carries over from one command to the next, in each
//! direction independently, until the channel is rekeyed. The lock keeps the
//! same state, so a context must never be recreated between messages.

use aes::Aes128;
use aes::cipher::generic_array::GenericArray;
use aes::cipher::{BlockDecrypt, BlockDecryptMut, BlockEncrypt, BlockEncryptMut, KeyInit, KeyIvInit};

use augustctl_proto::CIPHER_LEN;

type CbcEncryptor = cbc::Encryptor<Aes128>;
type CbcDecryptor = cbc::Decryptor<Aes128>;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ChannelMode {
    /// Key exchange and terminate, AES-128-ECB
    Secure,
    /// Routine commands, AES-128-CBC
    Session,
}

impl ChannelMode {
    pub fn is_secure(&self) -> bool {
        matches!(self, ChannelMode::Secure)
    }
}

/// Encrypt and decrypt contexts for one key
pub enum Cipher {
    Ecb(Aes128),
    Cbc {
        encryptor: CbcEncryptor,
        decryptor: CbcDecryptor,
    },
}

impl Cipher {
    pub fn new(mode: ChannelMode, key: &[u8; 16]) -> Self {
        let key = GenericArray::from_slice(key);
        match mode {
            ChannelMode::Secure => Cipher::Ecb(Aes128::new(key)),
            ChannelMode::Session => {
                let iv = GenericArray::from_slice(&[0u8; CIPHER_LEN]);
                Cipher::Cbc {
                    encryptor: CbcEncryptor::new(key, iv),
                    decryptor: CbcDecryptor::new(key, iv),
                }
            }
        }
    }

    pub fn encrypt(&mut self, block: &mut [u8; CIPHER_LEN]) {
        let block = GenericArray::from_mut_slice(block);
        match self {
            Cipher::Ecb(aes) => aes.encrypt_block(block),
            Cipher::Cbc { encryptor, .. } => encryptor.encrypt_block_mut(block),
        }
    }

    pub fn decrypt(&mut self, block: &mut [u8; CIPHER_LEN]) {
        let block = GenericArray::from_mut_slice(block);
        match self {
            Cipher::Ecb(aes) => aes.decrypt_block(block),
            Cipher::Cbc { decryptor, .. } => decryptor.decrypt_block_mut(block),
        }
    }
}

impl std::fmt::Debug for Cipher {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Cipher::Ecb(_) => f.write_str("Cipher::Ecb"),
            Cipher::Cbc { .. } => f.write_str("Cipher::Cbc"),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use proptest::prelude::*;

    const KEY: [u8; 16] = [
        0x01, 0x23, 0x45, 0x67, 0x89, 0xab, 0xcd, 0xef, 0x01, 0x23, 0x45, 0x67, 0x89, 0xab, 0xcd,
        0xef,
    ];

    #[test]
    fn ecb_is_stateless() {
        let mut cipher = Cipher::new(ChannelMode::Secure, &KEY);
        let mut a = [7u8; 16];
        let mut b = [7u8; 16];
        cipher.encrypt(&mut a);
        cipher.encrypt(&mut b);
        assert_eq!(a, b);
        assert_ne!(a, [7u8; 16]);
    }

    #[test]
    fn cbc_chains_across_messages() {
        let mut cipher = Cipher::new(ChannelMode::Session, &KEY);
        let mut a = [7u8; 16];
        let mut b = [7u8; 16];
        cipher.encrypt(&mut a);
        cipher.encrypt(&mut b);
        assert_ne!(a, b);

        // a fresh context on the receiving side follows the same chain
        let mut peer = Cipher::new(ChannelMode::Session, &KEY);
        peer.decrypt(&mut a);
        peer.decrypt(&mut b);
        assert_eq!(a, [7u8; 16]);
        assert_eq!(b, [7u8; 16]);
    }

    #[test]
    fn first_cbc_block_equals_ecb_of_plaintext() {
        // zero IV: the first CBC block is AES(p ^ 0)
        let mut cbc = Cipher::new(ChannelMode::Session, &KEY);
        let mut ecb = Cipher::new(ChannelMode::Secure, &KEY);
        let mut a = [0x42u8; 16];
        let mut b = [0x42u8; 16];
        cbc.encrypt(&mut a);
        ecb.encrypt(&mut b);
        assert_eq!(a, b);
    }

    proptest! {
        #[test]
        fn round_trip_both_modes(key in any::<[u8; 16]>(), blocks in prop::collection::vec(any::<[u8; 16]>(), 1..6)) {
            for mode in [ChannelMode::Secure, ChannelMode::Session] {
                let mut sender = Cipher::new(mode, &key);
                let mut receiver = Cipher::new(mode, &key);
                for plain in &blocks {
                    let mut block = *plain;
                    sender.encrypt(&mut block);
                    receiver.decrypt(&mut block);
                    prop_assert_eq!(&block, plain);
                }
            }
        }
    }
}
