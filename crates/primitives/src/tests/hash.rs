use serde_json::{from_value as from_json_value, json, to_string as to_json_string};

use super::*;

#[test]
fn test_digest() {
    let hash = Hash::digest(b"Hello, World");

    assert_eq!(
        hash.to_hex(),
        "03675ac53ff9cd1535ccc7dfcdfa2c458c5218371f418dc136f2d19ac1fbe8a5"
    );
}

#[test]
fn test_hex_round_trip() {
    let hash = Hash::digest(b"Hello World");

    assert_eq!(
        hash.to_hex(),
        "a591a6d40bf420404a011733cfb7b190d62c65bf0bcda32b57b277d9ad9f146e"
    );

    let parsed: Hash = hash.to_hex().parse().unwrap();
    assert_eq!(parsed, hash);
}

#[test]
fn test_from_hex_rejects_bad_input() {
    assert!(matches!(Hash::from_hex("abc"), Err(InvalidHash::Length(3))));
    assert!(matches!(
        Hash::from_hex(&"zz".repeat(32)),
        Err(InvalidHash::Encoding)
    ));
}

#[test]
fn test_serde() {
    let hash = Hash::digest(b"Hello World");

    assert_eq!(
        to_json_string(&hash).unwrap(),
        "\"a591a6d40bf420404a011733cfb7b190d62c65bf0bcda32b57b277d9ad9f146e\""
    );

    assert_eq!(
        from_json_value::<Hash>(json!(
            "a591a6d40bf420404a011733cfb7b190d62c65bf0bcda32b57b277d9ad9f146e"
        ))
        .unwrap(),
        hash
    );
}

#[test]
fn test_zero_sentinel() {
    assert!(Hash::ZERO.is_zero());
    assert!(!Hash::digest(b"").is_zero());
}
