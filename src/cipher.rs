//! The symmetric cipher is kept as an external collaborator: the relay
//! core only ever calls `encrypt`/`decrypt` on a `StreamCipher` and
//! never inspects key material itself. `TableCipher` is the simplest
//! concrete implementation that satisfies the contract so the crate
//! links and its tests exercise a real encrypt/decrypt round trip.

use ring::digest;

/// Narrow contract the relay core consumes: stateful, per-direction
/// streaming encrypt/decrypt. Initial encrypted bytes may embed an IV
/// — that is the cipher's responsibility, not the core's.
pub trait StreamCipher: Send {
    fn encrypt(&mut self, data: &[u8]) -> Vec<u8>;
    fn decrypt(&mut self, data: &[u8]) -> Vec<u8>;
}

/// A keyed byte-substitution stream cipher: the simplest non-AEAD
/// table method. `encrypt`/`decrypt` advance independent position
/// counters, the way the original's `encrypt.py` keeps separate
/// `cipher`/`decipher` objects — a handler in `Stage::Stream` both
/// encrypts one direction and decrypts the other through the same
/// `TableCipher`, and those two directions must not perturb each
/// other's keystream.
pub struct TableCipher {
    key: [u8; 32],
    encrypt_position: u64,
    decrypt_position: u64,
}

impl TableCipher {
    pub fn new(password: &[u8]) -> Self {
        let digest = digest::digest(&digest::SHA256, password);
        let mut key = [0u8; 32];
        key.copy_from_slice(digest.as_ref());
        TableCipher {
            key,
            encrypt_position: 0,
            decrypt_position: 0,
        }
    }

    fn transform(&self, data: &[u8], position: &mut u64) -> Vec<u8> {
        let mut out = Vec::with_capacity(data.len());
        for &b in data {
            let k = self.key[(*position % self.key.len() as u64) as usize];
            out.push(b ^ k);
            *position = position.wrapping_add(1);
        }
        out
    }
}

impl StreamCipher for TableCipher {
    fn encrypt(&mut self, data: &[u8]) -> Vec<u8> {
        let mut position = self.encrypt_position;
        let out = self.transform(data, &mut position);
        self.encrypt_position = position;
        out
    }

    fn decrypt(&mut self, data: &[u8]) -> Vec<u8> {
        let mut position = self.decrypt_position;
        let out = self.transform(data, &mut position);
        self.decrypt_position = position;
        out
    }
}
