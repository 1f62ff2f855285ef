use super::*;

use std::io::Write;

#[test]
fn test_md5_from_bytes() {
    let hash = Hash::md5_from_bytes(b"");
    assert_eq!(hash.to_hex(), "d41d8cd98f00b204e9800998ecf8427e");

    let hash = Hash::md5_from_bytes(b"hello world");
    assert_eq!(hash.to_hex(), "5eb63bbbe01eeed093cb22bb8f5acdc3");
}

#[test]
fn test_from_hex_round_trip() {
    let hash = Hash::from_hex("5eb63bbbe01eeed093cb22bb8f5acdc3").unwrap();
    assert_eq!(hash, Hash::md5_from_bytes(b"hello world"));
    assert_eq!(hash.to_hex(), "5eb63bbbe01eeed093cb22bb8f5acdc3");
}

#[test]
fn test_from_hex_rejects_bad_input() {
    // wrong length
    assert!(Hash::from_hex("5eb63b").is_err());
    // right length, not hex
    assert!(Hash::from_hex("zzzzzzzzzzzzzzzzzzzzzzzzzzzzzzzz").is_err());
}

#[tokio::test]
async fn test_md5_from_file() {
    let mut f = tempfile::NamedTempFile::new().unwrap();
    f.write_all(b"hello world").unwrap();
    f.flush().unwrap();

    let hash = Hash::md5_from_file(f.path()).await.unwrap();
    assert_eq!(hash.to_hex(), "5eb63bbbe01eeed093cb22bb8f5acdc3");
}

#[tokio::test]
async fn test_md5_from_file_larger_than_chunk() {
    // Exercise the chunked read path with > 1 MiB of data.
    let data = vec![0xabu8; HASH_CHUNK_SIZE + 12345];
    let mut f = tempfile::NamedTempFile::new().unwrap();
    f.write_all(&data).unwrap();
    f.flush().unwrap();

    let hash = Hash::md5_from_file(f.path()).await.unwrap();
    assert_eq!(hash, Hash::md5_from_bytes(&data));
}

#[test]
fn test_serde_round_trip() {
    let hash = Hash::md5_from_bytes(b"hello world");
    let json = serde_json::to_string(&hash).unwrap();
    assert_eq!(json, "\"5eb63bbbe01eeed093cb22bb8f5acdc3\"");

    let back: Hash = serde_json::from_str(&json).unwrap();
    assert_eq!(back, hash);
}
