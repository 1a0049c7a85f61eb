use sodiumoxide::crypto::pwhash::argon2id13;
use sodiumoxide::crypto::secretbox;

use crate::error::Error;
use crate::memory::Scratch;

// Password sealed payload:
//
//  | version (1) | argon2id salt (16) | secretbox nonce (24) | tag (16) + data |
//
// The key is derived from the password with argon2id (interactive limits) and
// a fresh salt per payload, then the data is sealed with xsalsa20-poly1305.
// Everything needed to open the payload besides the password travels with it.
pub const VERSION: u8 = 0x01;

const HEADER_LEN: usize = 1 + argon2id13::SALTBYTES + secretbox::NONCEBYTES;

/// Overhead added on top of the plaintext by [`encrypt`].
pub const OVERHEAD: usize = HEADER_LEN + secretbox::MACBYTES;

pub fn init() -> Result<(), Error> {
    sodiumoxide::init().map_err(|_| Error::CryptoError("unable to initialize libsodium"))
}

pub fn encrypt(data: &[u8], password: &str) -> Result<Vec<u8>, Error> {
    let salt = argon2id13::gen_salt();
    let nonce = secretbox::gen_nonce();
    let key = get_password_key(password, &salt)?;

    let mut out = Vec::with_capacity(OVERHEAD + data.len());
    out.push(VERSION);
    out.extend_from_slice(&salt.0);
    out.extend_from_slice(&nonce.0);
    out.extend_from_slice(&secretbox::seal(data, &nonce, &key));

    Ok(out)
}

/// Opens a payload sealed by [`encrypt`]. The plaintext is decrypted in
/// place inside a pinned [`Scratch`].
pub fn decrypt(data: &[u8], password: &str) -> Result<Scratch, Error> {
    if data.len() < OVERHEAD {
        return Err(Error::CryptoError("ciphertext is too short"));
    }
    if data[0] != VERSION {
        return Err(Error::CryptoError("unsupported ciphertext version"));
    }

    let (salt, rest) = data[1..].split_at(argon2id13::SALTBYTES);
    let (nonce, sealed) = rest.split_at(secretbox::NONCEBYTES);
    let (tag, body) = sealed.split_at(secretbox::MACBYTES);

    let salt = argon2id13::Salt::from_slice(salt).ok_or(Error::CryptoError("salt"))?;
    let nonce = secretbox::Nonce::from_slice(nonce).ok_or(Error::CryptoError("nonce"))?;
    let tag = secretbox::Tag::from_slice(tag).ok_or(Error::CryptoError("tag"))?;
    let key = get_password_key(password, &salt)?;

    let mut plain = Scratch::with_capacity(body.len());
    plain.extend_from_slice(body);
    secretbox::open_detached(&mut plain, &tag, &nonce, &key)
        .map_err(|_| Error::CryptoError("wrong password or corrupted ciphertext"))?;

    Ok(plain)
}

// secretbox::Key zeroes itself on drop
fn get_password_key(password: &str, salt: &argon2id13::Salt) -> Result<secretbox::Key, Error> {
    let mut key = secretbox::Key([0; secretbox::KEYBYTES]);
    {
        let secretbox::Key(ref mut kb) = key;
        argon2id13::derive_key(
            kb,
            password.as_bytes(),
            salt,
            argon2id13::OPSLIMIT_INTERACTIVE,
            argon2id13::MEMLIMIT_INTERACTIVE,
        )
        .map_err(|_| Error::CryptoError("key derivation failed"))?;
    }
    Ok(key)
}

#[cfg(test)]
mod test_crypto {
    use super::*;
    use proptest::prelude::*;

    #[test]
    fn round_trip() {
        init().unwrap();
        let sealed = encrypt(b"Hello World!", "hunter2").unwrap();

        assert_eq!(sealed.len(), OVERHEAD + 12);
        assert_eq!(sealed[0], VERSION);
        assert_eq!(&decrypt(&sealed, "hunter2").unwrap()[..], b"Hello World!");
    }

    #[test]
    fn empty_plaintext() {
        init().unwrap();
        let sealed = encrypt(b"", "").unwrap();
        assert!(decrypt(&sealed, "").unwrap().is_empty());
    }

    #[test]
    fn fresh_salt_and_nonce() {
        init().unwrap();
        let a = encrypt(b"same", "same").unwrap();
        let b = encrypt(b"same", "same").unwrap();
        assert_ne!(a, b);
    }

    #[test]
    fn wrong_password() {
        init().unwrap();
        let sealed = encrypt(b"secret", "correct horse").unwrap();

        assert!(matches!(
            decrypt(&sealed, "battery staple"),
            Err(Error::CryptoError(_))
        ));
    }

    #[test]
    fn tampered() {
        init().unwrap();
        let mut sealed = encrypt(b"secret", "pw").unwrap();
        let last = sealed.len() - 1;
        sealed[last] ^= 0x01;

        assert!(matches!(decrypt(&sealed, "pw"), Err(Error::CryptoError(_))));
    }

    #[test]
    fn short_and_bad_version() {
        init().unwrap();
        assert!(decrypt(&[VERSION; 10], "pw").is_err());

        let mut sealed = encrypt(b"secret", "pw").unwrap();
        sealed[0] = 0x02;
        assert!(matches!(decrypt(&sealed, "pw"), Err(Error::CryptoError(_))));
    }

    proptest! {
        // Argon2 is deliberately slow, keep the case count low
        #![proptest_config(ProptestConfig::with_cases(6))]

        #[test]
        fn prop_round_trip(data in proptest::collection::vec(any::<u8>(), 0..4096), password in ".{0,32}") {
            init().unwrap();
            let sealed = encrypt(&data, &password).unwrap();
            prop_assert_eq!(&decrypt(&sealed, &password).unwrap()[..], &data[..]);
        }

        #[test]
        fn prop_other_password_fails(data in proptest::collection::vec(any::<u8>(), 0..256), a in "[a-z]{1,16}", b in "[A-Z]{1,16}") {
            init().unwrap();
            let sealed = encrypt(&data, &a).unwrap();
            prop_assert!(decrypt(&sealed, &b).is_err());
        }
    }
}
