use std::path::Path;
use std::sync::Arc;
use std::time::Duration;
use tempfile::TempDir;

use cryptmirror::cache::PlaintextCache;
use cryptmirror::crypto::{self, Passphrase, SALT_SIZE};
use cryptmirror::fs::{AccessMode, EncryptedMirror, MirrorBackend, OpenMode, WritePos};
use cryptmirror::Error;

fn setup() -> (TempDir, EncryptedMirror) {
    let tmp = TempDir::new().expect("temp dir");
    let mirror = EncryptedMirror::new(
        tmp.path(),
        Passphrase::new("integration-password"),
        Arc::new(PlaintextCache::with_default_ttl()),
    )
    .expect("mirror should build");
    (tmp, mirror)
}

fn write_file(mirror: &EncryptedMirror, path: &str, data: &[u8]) {
    let opened = mirror
        .open_file(Path::new(path), OpenMode::Create, AccessMode::ReadWrite)
        .expect("create");
    mirror
        .write(opened.handle, WritePos::Offset(0), data)
        .expect("write");
    mirror.close(opened.handle).expect("close");
}

fn read_file(mirror: &EncryptedMirror, path: &str) -> Vec<u8> {
    let opened = mirror
        .open_file(Path::new(path), OpenMode::Open, AccessMode::Read)
        .expect("open");
    let mut buf = vec![0u8; 1 << 20];
    let n = mirror.read(opened.handle, 0, &mut buf).expect("read");
    mirror.close(opened.handle).expect("close");
    buf.truncate(n);
    buf
}

#[test]
fn mirror_roundtrip_and_ciphertext_on_disk() {
    let (tmp, mirror) = setup();

    let body = b"nothing in the backing dir may be plaintext";
    write_file(&mirror, "/doc.txt", body);
    assert_eq!(read_file(&mirror, "/doc.txt"), body);

    let raw = std::fs::read(tmp.path().join("doc.txt")).expect("backing file");
    assert!(raw.len() > SALT_SIZE);
    assert!(!raw.windows(8).any(|w| body.windows(8).any(|b| b == w)));
}

#[test]
fn stale_cache_never_served_after_write() {
    let (_tmp, mirror) = setup();

    write_file(&mirror, "/a", b"old content");
    // Prime the cache through a read-only open
    assert_eq!(read_file(&mirror, "/a"), b"old content");

    // Mutate through a write-capable open
    let opened = mirror
        .open_file(Path::new("/a"), OpenMode::Open, AccessMode::ReadWrite)
        .expect("write open");
    mirror
        .write(opened.handle, WritePos::Offset(0), b"new content")
        .expect("write");
    mirror.close(opened.handle).expect("close");

    // A later read-only open must see the new content, not the snapshot
    assert_eq!(read_file(&mirror, "/a"), b"new content");
}

#[test]
fn append_after_write_concatenates() {
    let (_tmp, mirror) = setup();

    write_file(&mirror, "/b", b"hello");

    let opened = mirror
        .open_file(Path::new("/b"), OpenMode::Append, AccessMode::ReadWrite)
        .expect("append open");
    mirror
        .write(opened.handle, WritePos::Append, b"world")
        .expect("append write");
    mirror.close(opened.handle).expect("close");

    assert_eq!(read_file(&mirror, "/b"), b"helloworld");
}

#[test]
fn truncate_existing_produces_minimal_backing_file() {
    let (tmp, mirror) = setup();

    write_file(&mirror, "/t", &[0x55u8; 100]);

    let opened = mirror
        .open_file(Path::new("/t"), OpenMode::Truncate, AccessMode::ReadWrite)
        .expect("truncate open");
    mirror.flush(opened.handle).expect("flush");
    mirror.close(opened.handle).expect("close");

    // Salt plus the encryption of an empty payload
    let raw = std::fs::read(tmp.path().join("t")).expect("backing file");
    assert_eq!(raw.len(), SALT_SIZE + 16);
    assert_eq!(read_file(&mirror, "/t"), b"");
}

#[test]
fn policy_table_failures() {
    let (_tmp, mirror) = setup();

    assert!(matches!(
        mirror.open_file(Path::new("/nope"), OpenMode::Open, AccessMode::Read),
        Err(Error::NotFound(_))
    ));
    assert!(matches!(
        mirror.open_file(Path::new("/nope"), OpenMode::Truncate, AccessMode::ReadWrite),
        Err(Error::NotFound(_))
    ));

    write_file(&mirror, "/taken", b"x");
    assert!(matches!(
        mirror.open_file(Path::new("/taken"), OpenMode::CreateNew, AccessMode::ReadWrite),
        Err(Error::AlreadyExists(_))
    ));

    let opened = mirror
        .open_file(Path::new("/taken"), OpenMode::OpenOrCreate, AccessMode::Read)
        .expect("open-or-create");
    assert!(opened.already_existed);
    mirror.close(opened.handle).expect("close");
}

#[test]
fn independent_handles_last_writer_wins() {
    let (_tmp, mirror) = setup();

    write_file(&mirror, "/shared", b"...........");

    let first = mirror
        .open_file(Path::new("/shared"), OpenMode::Open, AccessMode::ReadWrite)
        .expect("first open");
    let second = mirror
        .open_file(Path::new("/shared"), OpenMode::Open, AccessMode::ReadWrite)
        .expect("second open");

    mirror
        .write(first.handle, WritePos::Offset(0), b"first says.")
        .expect("first write");
    mirror
        .write(second.handle, WritePos::Offset(0), b"second says")
        .expect("second write");

    // Handles do not share a buffer; whoever flushes last replaces the
    // whole file.
    mirror.close(first.handle).expect("close first");
    mirror.close(second.handle).expect("close second");

    assert_eq!(read_file(&mirror, "/shared"), b"second says");
}

#[test]
fn concurrent_distinct_paths() {
    let (_tmp, mirror) = setup();
    let mirror = Arc::new(mirror);

    let mut threads = Vec::new();
    for i in 0..8 {
        let mirror = Arc::clone(&mirror);
        threads.push(std::thread::spawn(move || {
            let path = format!("/file-{}", i);
            let body = vec![i as u8; 4000 + i * 13];
            write_file(&mirror, &path, &body);
            assert_eq!(read_file(&mirror, &path), body);
        }));
    }
    for thread in threads {
        thread.join().expect("worker thread");
    }

    assert_eq!(mirror.open_handles(), 0);
    assert_eq!(mirror.list_dir(Path::new("/")).expect("list").len(), 8);
}

#[test]
fn wrong_password_cannot_open() {
    let tmp = TempDir::new().expect("temp dir");
    let cache = Arc::new(PlaintextCache::with_default_ttl());

    let mirror = EncryptedMirror::new(
        tmp.path(),
        Passphrase::new("first password"),
        Arc::clone(&cache),
    )
    .expect("mirror");
    write_file(&mirror, "/secret", b"hidden");
    drop(mirror);

    let wrong = EncryptedMirror::new(tmp.path(), Passphrase::new("second password"), cache)
        .expect("mirror");
    assert!(matches!(
        wrong.open_file(Path::new("/secret"), OpenMode::Open, AccessMode::Read),
        Err(Error::CryptoAuth)
    ));
}

#[test]
fn backing_format_interoperates_with_direct_cipher() {
    let (tmp, mirror) = setup();
    let password = Passphrase::new("integration-password");

    // A backing file produced by the stream cipher directly reads back
    // through the mirror.
    let mut encrypted = Vec::new();
    crypto::encrypt(
        &mut std::io::Cursor::new(b"tool-made file".as_slice()),
        &mut encrypted,
        &password,
    )
    .expect("encrypt");
    std::fs::write(tmp.path().join("tool.bin"), &encrypted).expect("write backing");

    assert_eq!(read_file(&mirror, "/tool.bin"), b"tool-made file");

    // And a mirror-written file decrypts with the stream cipher directly.
    write_file(&mirror, "/fs.bin", b"mirror-made file");
    let raw = std::fs::read(tmp.path().join("fs.bin")).expect("read backing");
    let mut decrypted = Vec::new();
    crypto::decrypt(&mut std::io::Cursor::new(&raw), &mut decrypted, &password)
        .expect("decrypt");
    assert_eq!(decrypted, b"mirror-made file");
}

#[test]
fn sweeper_lifecycle_with_mirror() {
    let tmp = TempDir::new().expect("temp dir");
    let cache = Arc::new(PlaintextCache::new(Duration::from_millis(30)));
    let sweeper = cache
        .start_sweeper(Duration::from_millis(10))
        .expect("sweeper");

    let mirror = EncryptedMirror::new(tmp.path(), Passphrase::new("pw"), Arc::clone(&cache))
        .expect("mirror");

    write_file(&mirror, "/f", b"data");
    read_file(&mirror, "/f");
    assert!(!cache.is_empty());

    // The snapshot expires once it goes unused
    std::thread::sleep(Duration::from_millis(150));
    assert!(cache.is_empty());

    sweeper.stop();
}
