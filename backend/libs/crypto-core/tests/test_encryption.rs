use crypto_core::{
    decrypt_at_rest, derive_key, encrypt_at_rest, generate_nonce, open, seal, CryptoError,
    NONCE_LEN,
};

const MASTER: [u8; 32] = [7u8; 32];

#[test]
fn roundtrip_seal_open() {
    let key = derive_key(&MASTER, b"conversation-1").expect("derive");
    for msg in [&b""[..], b"hello", &[0u8, 255, 1, 254][..], &[42u8; 4096][..]] {
        let sealed = seal(msg, &key).expect("seal");
        assert_eq!(open(&sealed, &key).expect("open"), msg);
    }
}

#[test]
fn sealed_blob_is_not_plaintext() {
    let key = derive_key(&MASTER, b"c").expect("derive");
    let sealed = seal(b"secret message", &key).expect("seal");
    assert!(sealed.len() > NONCE_LEN + b"secret message".len());
    assert!(!sealed
        .windows(b"secret".len())
        .any(|w| w == b"secret"));
}

#[test]
fn wrong_key_fails() {
    let k1 = derive_key(&MASTER, b"a").expect("derive");
    let k2 = derive_key(&MASTER, b"b").expect("derive");
    assert_ne!(k1, k2);
    let sealed = seal(b"hi", &k1).expect("seal");
    assert_eq!(open(&sealed, &k2), Err(CryptoError::Decryption));
}

#[test]
fn truncated_blob_is_rejected() {
    let key = derive_key(&MASTER, b"a").expect("derive");
    assert_eq!(open(&[1, 2, 3], &key), Err(CryptoError::Truncated(3)));
}

#[test]
fn explicit_nonce_api() {
    let key = derive_key(&MASTER, b"a").expect("derive");
    let nonce = generate_nonce();
    let ct = encrypt_at_rest(b"hello", &key, &nonce).expect("encrypt");
    let pt = decrypt_at_rest(&ct, &key, &nonce).expect("decrypt");
    assert_eq!(pt, b"hello");
    assert_eq!(
        decrypt_at_rest(&ct, &key, &nonce[..8]),
        Err(CryptoError::Decryption)
    );
}

#[test]
fn nonce_randomness_length() {
    let n1 = generate_nonce();
    let n2 = generate_nonce();
    assert_eq!(n1.len(), NONCE_LEN);
    assert_ne!(n1, n2, "nonce should be random");
}
