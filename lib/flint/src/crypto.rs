//! Thin boundary over libsodium. Everything here exists for one of three callers: session key
//! material (random bytes, constant-time compare), log-safe identifiers (blake2 digests) and
//! the sealed session ticket (authenticated encryption bound to a context).

use std::os::raw::c_ulonglong;
use std::ptr;
use std::sync::Once;

/// Size of the shared secrets accepted by `seal`/`open`.
pub const SECRET_SIZE: usize = 32;

const TAG_SIZE: usize = libsodium_sys::crypto_aead_chacha20poly1305_IETF_ABYTES as usize;
const NONCE_BYTES: usize = libsodium_sys::crypto_aead_chacha20poly1305_IETF_NPUBBYTES as usize;

static SODIUM_INIT: Once = Once::new();

/// Sodium requires one global initialization before any primitive is touched. Every public
/// entry point funnels through here, so callers never have to think about ordering.
fn ensure_init() {
    SODIUM_INIT.call_once(|| unsafe {
        if libsodium_sys::sodium_init() < 0 {
            panic!("Cryptography initialization failed")
        }
    });
}

/// Widens a message counter into the wire nonce. The counter occupies the leading bytes; the
/// remainder stays zero. Both sides derive the same nonce from the same counter.
#[inline]
fn expand_nonce(counter: u64) -> [u8; NONCE_BYTES] {
    let mut nonce = [0u8; NONCE_BYTES];
    nonce[..8].copy_from_slice(&counter.to_be_bytes());
    nonce
}

/// Encrypts a payload under the shared secret, binding it to `context`. The returned buffer is
/// the ciphertext with the authentication tag appended; `open` with the same secret, counter
/// and context is the only way back.
pub fn seal(plain: &[u8], context: &[u8], counter: u64, secret: &[u8; SECRET_SIZE]) -> Vec<u8> {
    ensure_init();

    let nonce = expand_nonce(counter);
    let mut cipher = vec![0u8; plain.len() + TAG_SIZE];
    let mut cipher_len: c_ulonglong = 0;

    let result = unsafe {
        libsodium_sys::crypto_aead_chacha20poly1305_ietf_encrypt(
            cipher.as_mut_ptr(),
            &mut cipher_len,
            plain.as_ptr(),
            plain.len() as c_ulonglong,
            context.as_ptr(),
            context.len() as c_ulonglong,
            ptr::null(),
            nonce.as_ptr(),
            secret.as_ptr(),
        )
    };

    // Sealing only fails on argument misuse, never on data
    if result != 0 {
        panic!("Aead seal failed")
    }

    cipher.truncate(cipher_len as usize);
    cipher
}

/// Reverses `seal`. Returns `None` for a wrong secret, counter or context, a clipped tag, or
/// any tampering with the ciphertext.
pub fn open(cipher: &[u8], context: &[u8], counter: u64, secret: &[u8; SECRET_SIZE]) -> Option<Vec<u8>> {
    ensure_init();

    if cipher.len() < TAG_SIZE {
        return None;
    }

    let nonce = expand_nonce(counter);
    let mut plain = vec![0u8; cipher.len() - TAG_SIZE];
    let mut plain_len: c_ulonglong = 0;

    let result = unsafe {
        libsodium_sys::crypto_aead_chacha20poly1305_ietf_decrypt(
            plain.as_mut_ptr(),
            &mut plain_len,
            ptr::null_mut(),
            cipher.as_ptr(),
            cipher.len() as c_ulonglong,
            context.as_ptr(),
            context.len() as c_ulonglong,
            nonce.as_ptr(),
            secret.as_ptr(),
        )
    };

    if result != 0 {
        return None;
    }

    plain.truncate(plain_len as usize);
    Some(plain)
}

/// Fills the provided buffer with cryptographically secure random bytes.
#[inline]
pub fn random_bytes(out: &mut [u8]) {
    ensure_init();

    unsafe {
        libsodium_sys::randombytes_buf(out.as_mut_ptr() as *mut ::std::ffi::c_void, out.len());
    }
}

/// Compares two byte slices in constant time. Slices of unequal length compare unequal without
/// touching the contents.
#[inline]
pub fn constant_time_eq(lhs: &[u8], rhs: &[u8]) -> bool {
    ensure_init();

    if lhs.len() != rhs.len() {
        return false;
    }

    unsafe {
        libsodium_sys::sodium_memcmp(
            lhs.as_ptr() as *const ::std::ffi::c_void,
            rhs.as_ptr() as *const ::std::ffi::c_void,
            lhs.len(),
        ) == 0
    }
}

/// Computes an unkeyed 32 byte blake2b digest of the input.
#[inline]
pub fn digest(data: &[u8]) -> [u8; 32] {
    ensure_init();

    let mut out = [0u8; 32];

    unsafe {
        libsodium_sys::crypto_generichash(
            out.as_mut_ptr(),
            out.len(),
            data.as_ptr(),
            data.len() as c_ulonglong,
            ptr::null(),
            0,
        );
    }

    out
}

/// Short hex fingerprint of sensitive material, safe to emit in logs.
#[inline]
pub fn fingerprint(data: &[u8]) -> String {
    let hash = digest(data);

    hash[..8].iter().map(|byte| format!("{:02x}", byte)).collect()
}

/// Folds a digest of the input down to a stable 64 bit seed.
#[inline]
pub fn seed64(data: &[u8]) -> u64 {
    let hash = digest(data);

    let mut word = [0u8; 8];
    word.copy_from_slice(&hash[..8]);
    u64::from_le_bytes(word)
}

#[cfg(test)]
mod tests {
    use super::*;

    const SECRET: [u8; SECRET_SIZE] = [7u8; SECRET_SIZE];

    #[test]
    fn test_seal_open_roundtrip() {
        let cipher = seal(b"boundary handoff payload", b"ctx", 42, &SECRET);

        assert_eq!(cipher.len(), b"boundary handoff payload".len() + TAG_SIZE);
        assert_eq!(
            open(&cipher, b"ctx", 42, &SECRET).unwrap(),
            b"boundary handoff payload".to_vec()
        );
    }

    #[test]
    fn test_open_rejects_wrong_counter() {
        let cipher = seal(b"payload", b"ctx", 42, &SECRET);

        assert!(open(&cipher, b"ctx", 43, &SECRET).is_none());
    }

    #[test]
    fn test_open_rejects_wrong_context() {
        let cipher = seal(b"payload", b"ctx-a", 42, &SECRET);

        assert!(open(&cipher, b"ctx-b", 42, &SECRET).is_none());
    }

    #[test]
    fn test_open_rejects_wrong_secret() {
        let cipher = seal(b"payload", b"ctx", 42, &SECRET);

        assert!(open(&cipher, b"ctx", 42, &[8u8; SECRET_SIZE]).is_none());
    }

    #[test]
    fn test_open_rejects_tampering_and_clipping() {
        let mut cipher = seal(b"payload", b"ctx", 42, &SECRET);

        cipher[0] ^= 1;
        assert!(open(&cipher, b"ctx", 42, &SECRET).is_none());

        // Shorter than the tag alone
        assert!(open(&cipher[..TAG_SIZE - 1], b"ctx", 42, &SECRET).is_none());
    }

    #[test]
    fn test_empty_payload_seals() {
        let cipher = seal(&[], b"ctx", 1, &SECRET);

        assert_eq!(cipher.len(), TAG_SIZE);
        assert_eq!(open(&cipher, b"ctx", 1, &SECRET).unwrap(), Vec::<u8>::new());
    }

    #[test]
    fn test_constant_time_eq() {
        assert!(constant_time_eq(&[1, 2, 3], &[1, 2, 3]));
        assert!(!constant_time_eq(&[1, 2, 3], &[1, 2, 4]));
        assert!(!constant_time_eq(&[1, 2, 3], &[1, 2]));
    }

    #[test]
    fn test_fingerprint_is_stable_and_short() {
        let fp1 = fingerprint(b"secret key material");
        let fp2 = fingerprint(b"secret key material");

        assert_eq!(fp1, fp2);
        assert_eq!(fp1.len(), 16);
        assert_ne!(fp1, fingerprint(b"other key material"));
    }

    #[test]
    fn test_seed64_is_stable() {
        assert_eq!(seed64(b"p1"), seed64(b"p1"));
        assert_ne!(seed64(b"p1"), seed64(b"p2"));
    }

    #[test]
    fn test_random_bytes_fills_buffer() {
        let mut buf = [0u8; 64];
        random_bytes(&mut buf);

        // 64 zero bytes from the csprng is not a realistic outcome
        assert!(buf.iter().any(|&byte| byte != 0));
    }
}
