//! Streaming authenticated encryption and data-key wrapping.
//!
//! Object bytes are sealed with XChaCha20-Poly1305 in fixed-size blocks. A
//! sealed stream looks like:
//!
//! ```text
//! header  = "MRM1" | block_size (u32 BE) | nonce_prefix (19 bytes)
//! block_i = AEAD(key, nonce_prefix | i (u32 BE) | last_flag, aad = header, plaintext_i)
//! ```
//!
//! Every block but the last carries exactly `block_size` plaintext bytes. The
//! last block (possibly empty) has `last_flag = 1`, so truncating the stream at
//! a block boundary fails authentication, as do reordering and splicing blocks
//! from another stream.

use crate::error::{KeyError, KeyResult};
use async_stream::try_stream;
use bytes::{Bytes, BytesMut};
use chacha20poly1305::aead::{Aead, KeyInit, Payload};
use chacha20poly1305::{Key, XChaCha20Poly1305, XNonce};
use futures::{Stream, StreamExt};
use rand::RngCore;
use rand::rngs::OsRng;
use std::fmt;
use zeroize::Zeroizing;

pub const MAGIC: &[u8; 4] = b"MRM1";
pub const NONCE_PREFIX_LEN: usize = 19;
pub const HEADER_LEN: usize = MAGIC.len() + 4 + NONCE_PREFIX_LEN;
pub const TAG_LEN: usize = 16;
pub const DATA_KEY_LEN: usize = 32;
pub const DEFAULT_BLOCK_SIZE: usize = 64 * 1024;
pub const MAX_BLOCK_SIZE: usize = 16 * 1024 * 1024;
pub const WRAP_NONCE_LEN: usize = 24;
/// Length of a wrapped data key: nonce, sealed key, tag.
pub const WRAPPED_KEY_LEN: usize = WRAP_NONCE_LEN + DATA_KEY_LEN + TAG_LEN;

/// Per-object symmetric key.
#[derive(Clone)]
pub struct DataKey(Zeroizing<[u8; DATA_KEY_LEN]>);

impl DataKey {
    pub fn generate() -> Self {
        let mut bytes = Zeroizing::new([0u8; DATA_KEY_LEN]);
        OsRng.fill_bytes(bytes.as_mut());
        Self(bytes)
    }

    pub fn from_slice(bytes: &[u8]) -> KeyResult<Self> {
        let array: [u8; DATA_KEY_LEN] = bytes.try_into().map_err(|_| {
            KeyError::InvalidKey(format!(
                "data key must be {DATA_KEY_LEN} bytes, got {}",
                bytes.len()
            ))
        })?;
        Ok(Self(Zeroizing::new(array)))
    }

    pub fn as_bytes(&self) -> &[u8; DATA_KEY_LEN] {
        &self.0
    }

    fn cipher(&self) -> XChaCha20Poly1305 {
        XChaCha20Poly1305::new(Key::from_slice(&self.0[..]))
    }
}

impl fmt::Debug for DataKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str("DataKey([REDACTED])")
    }
}

/// Size of the sealed stream for `plain_len` plaintext bytes.
pub fn ciphertext_len(plain_len: u64, block_size: usize) -> u64 {
    let bs = block_size.max(1) as u64;
    let blocks = plain_len.div_ceil(bs).max(1);
    HEADER_LEN as u64 + plain_len + blocks * TAG_LEN as u64
}

fn check_block_size(block_size: usize) -> KeyResult<()> {
    if block_size == 0 || block_size > MAX_BLOCK_SIZE {
        return Err(KeyError::Crypto(format!(
            "block size {block_size} outside 1..={MAX_BLOCK_SIZE}"
        )));
    }
    Ok(())
}

fn block_nonce(prefix: &[u8; NONCE_PREFIX_LEN], counter: u32, last: bool) -> XNonce {
    let mut nonce = [0u8; 24];
    nonce[..NONCE_PREFIX_LEN].copy_from_slice(prefix);
    nonce[NONCE_PREFIX_LEN..NONCE_PREFIX_LEN + 4].copy_from_slice(&counter.to_be_bytes());
    nonce[23] = u8::from(last);
    XNonce::clone_from_slice(&nonce)
}

/// Incremental encryptor. Feed plaintext with [`update`](Self::update), then
/// call [`finalize`](Self::finalize) exactly once.
pub struct StreamEncryptor {
    cipher: XChaCha20Poly1305,
    header: [u8; HEADER_LEN],
    prefix: [u8; NONCE_PREFIX_LEN],
    block_size: usize,
    counter: u32,
    header_sent: bool,
    pending: BytesMut,
}

impl StreamEncryptor {
    pub fn new(key: &DataKey) -> Self {
        let mut prefix = [0u8; NONCE_PREFIX_LEN];
        OsRng.fill_bytes(&mut prefix);
        Self::build(key, DEFAULT_BLOCK_SIZE, prefix)
    }

    pub fn with_block_size(key: &DataKey, block_size: usize) -> KeyResult<Self> {
        check_block_size(block_size)?;
        let mut prefix = [0u8; NONCE_PREFIX_LEN];
        OsRng.fill_bytes(&mut prefix);
        Ok(Self::build(key, block_size, prefix))
    }

    fn build(key: &DataKey, block_size: usize, prefix: [u8; NONCE_PREFIX_LEN]) -> Self {
        let mut header = [0u8; HEADER_LEN];
        header[..4].copy_from_slice(MAGIC);
        header[4..8].copy_from_slice(&(block_size as u32).to_be_bytes());
        header[8..].copy_from_slice(&prefix);
        Self {
            cipher: key.cipher(),
            header,
            prefix,
            block_size,
            counter: 0,
            header_sent: false,
            pending: BytesMut::new(),
        }
    }

    /// Absorb plaintext and return whatever ciphertext is ready.
    ///
    /// One block is always held back so `finalize` can mark it as last.
    pub fn update(&mut self, data: &[u8]) -> KeyResult<Bytes> {
        self.pending.extend_from_slice(data);
        let mut out = BytesMut::new();
        self.emit_header(&mut out);
        while self.pending.len() > self.block_size {
            let block = self.pending.split_to(self.block_size);
            self.seal(&block, false, &mut out)?;
        }
        Ok(out.freeze())
    }

    /// Seal the final block.
    pub fn finalize(mut self) -> KeyResult<Bytes> {
        let mut out = BytesMut::new();
        self.emit_header(&mut out);
        let block = self.pending.split();
        self.seal(&block, true, &mut out)?;
        Ok(out.freeze())
    }

    fn emit_header(&mut self, out: &mut BytesMut) {
        if !self.header_sent {
            out.extend_from_slice(&self.header);
            self.header_sent = true;
        }
    }

    fn seal(&mut self, block: &[u8], last: bool, out: &mut BytesMut) -> KeyResult<()> {
        let nonce = block_nonce(&self.prefix, self.counter, last);
        let sealed = self
            .cipher
            .encrypt(
                &nonce,
                Payload {
                    msg: block,
                    aad: &self.header,
                },
            )
            .map_err(|_| KeyError::Crypto("block encryption failed".to_string()))?;
        out.extend_from_slice(&sealed);
        self.counter = self
            .counter
            .checked_add(1)
            .ok_or_else(|| KeyError::Crypto("stream exceeds block counter".to_string()))?;
        Ok(())
    }
}

/// Incremental decryptor, the inverse of [`StreamEncryptor`].
///
/// Plaintext returned by `update` is authenticated block by block, but the
/// stream as a whole is only complete once `finalize` succeeds.
pub struct StreamDecryptor {
    cipher: XChaCha20Poly1305,
    header: Option<([u8; HEADER_LEN], [u8; NONCE_PREFIX_LEN], usize)>,
    counter: u32,
    pending: BytesMut,
}

impl StreamDecryptor {
    pub fn new(key: &DataKey) -> Self {
        Self {
            cipher: key.cipher(),
            header: None,
            counter: 0,
            pending: BytesMut::new(),
        }
    }

    pub fn update(&mut self, data: &[u8]) -> KeyResult<Bytes> {
        self.pending.extend_from_slice(data);
        let mut out = BytesMut::new();
        if self.header.is_none() {
            if self.pending.len() < HEADER_LEN {
                return Ok(out.freeze());
            }
            self.parse_header()?;
        }
        let sealed_block = self.sealed_block_len();
        // Hold back one full sealed block: it might be the last one.
        while self.pending.len() > sealed_block {
            let block = self.pending.split_to(sealed_block);
            self.open(&block, false, &mut out)?;
        }
        Ok(out.freeze())
    }

    pub fn finalize(mut self) -> KeyResult<Bytes> {
        if self.header.is_none() {
            if self.pending.len() < HEADER_LEN {
                return Err(KeyError::Crypto("truncated stream header".to_string()));
            }
            self.parse_header()?;
        }
        let mut out = BytesMut::new();
        let sealed_block = self.sealed_block_len();
        while self.pending.len() > sealed_block {
            let block = self.pending.split_to(sealed_block);
            self.open(&block, false, &mut out)?;
        }
        if self.pending.len() < TAG_LEN {
            return Err(KeyError::Crypto("missing final block".to_string()));
        }
        let block = self.pending.split();
        self.open(&block, true, &mut out)?;
        Ok(out.freeze())
    }

    fn sealed_block_len(&self) -> usize {
        self.header.as_ref().map_or(0, |(_, _, bs)| bs + TAG_LEN)
    }

    fn parse_header(&mut self) -> KeyResult<()> {
        let raw = self.pending.split_to(HEADER_LEN);
        if &raw[..4] != MAGIC {
            return Err(KeyError::Crypto("not a sealed stream".to_string()));
        }
        let mut bs = [0u8; 4];
        bs.copy_from_slice(&raw[4..8]);
        let block_size = u32::from_be_bytes(bs) as usize;
        check_block_size(block_size)?;

        let mut header = [0u8; HEADER_LEN];
        header.copy_from_slice(&raw);
        let mut prefix = [0u8; NONCE_PREFIX_LEN];
        prefix.copy_from_slice(&raw[8..]);
        self.header = Some((header, prefix, block_size));
        Ok(())
    }

    fn open(&mut self, block: &[u8], last: bool, out: &mut BytesMut) -> KeyResult<()> {
        let Some((header, prefix, _)) = self.header.as_ref() else {
            return Err(KeyError::Crypto("stream header not read".to_string()));
        };
        let nonce = block_nonce(prefix, self.counter, last);
        let plain = self
            .cipher
            .decrypt(
                &nonce,
                Payload {
                    msg: block,
                    aad: header,
                },
            )
            .map_err(|_| {
                KeyError::Crypto(format!("block {} failed authentication", self.counter))
            })?;
        out.extend_from_slice(&plain);
        self.counter = self
            .counter
            .checked_add(1)
            .ok_or_else(|| KeyError::Crypto("stream exceeds block counter".to_string()))?;
        Ok(())
    }
}

/// Encrypt a byte stream with `key`.
pub fn encrypt_stream<S, E>(
    input: S,
    key: DataKey,
    block_size: usize,
) -> impl Stream<Item = Result<Bytes, E>>
where
    S: Stream<Item = Result<Bytes, E>>,
    E: From<KeyError>,
{
    try_stream! {
        let mut encryptor = StreamEncryptor::with_block_size(&key, block_size)?;
        futures::pin_mut!(input);
        while let Some(chunk) = input.next().await {
            let sealed = encryptor.update(&chunk?)?;
            if !sealed.is_empty() {
                yield sealed;
            }
        }
        yield encryptor.finalize()?;
    }
}

/// Decrypt a stream produced by [`encrypt_stream`]. Yields an error, never
/// silent truncation, if the final block is missing.
pub fn decrypt_stream<S, E>(input: S, key: DataKey) -> impl Stream<Item = Result<Bytes, E>>
where
    S: Stream<Item = Result<Bytes, E>>,
    E: From<KeyError>,
{
    try_stream! {
        let mut decryptor = StreamDecryptor::new(&key);
        futures::pin_mut!(input);
        while let Some(chunk) = input.next().await {
            let plain = decryptor.update(&chunk?)?;
            if !plain.is_empty() {
                yield plain;
            }
        }
        let tail = decryptor.finalize()?;
        if !tail.is_empty() {
            yield tail;
        }
    }
}

/// Associated data binding a wrapped data key to its file.
pub fn file_key_context(file_id: impl fmt::Display) -> String {
    format!("murmur:file-key:{file_id}")
}

/// Associated data binding a shared data key to its file and recipient.
pub fn share_key_context(file_id: impl fmt::Display, user_id: &str) -> String {
    format!("murmur:file-key:{file_id}:user:{user_id}")
}

fn kek_cipher(kek: &[u8]) -> KeyResult<XChaCha20Poly1305> {
    XChaCha20Poly1305::new_from_slice(kek).map_err(|_| {
        KeyError::InvalidKey(format!(
            "key-encryption key must be {DATA_KEY_LEN} bytes, got {}",
            kek.len()
        ))
    })
}

/// Seal `data_key` under `kek`. Output is `nonce | ciphertext | tag`.
pub fn wrap_key(kek: &[u8], data_key: &DataKey, context: &str) -> KeyResult<Vec<u8>> {
    let cipher = kek_cipher(kek)?;
    let mut nonce = [0u8; WRAP_NONCE_LEN];
    OsRng.fill_bytes(&mut nonce);
    let sealed = cipher
        .encrypt(
            XNonce::from_slice(&nonce),
            Payload {
                msg: data_key.as_bytes(),
                aad: context.as_bytes(),
            },
        )
        .map_err(|_| KeyError::Crypto("key wrap failed".to_string()))?;
    let mut wrapped = Vec::with_capacity(WRAPPED_KEY_LEN);
    wrapped.extend_from_slice(&nonce);
    wrapped.extend_from_slice(&sealed);
    Ok(wrapped)
}

/// Open a key sealed by [`wrap_key`] with the same `kek` and `context`.
pub fn unwrap_key(kek: &[u8], wrapped: &[u8], context: &str) -> KeyResult<DataKey> {
    if wrapped.len() != WRAPPED_KEY_LEN {
        return Err(KeyError::Crypto(format!(
            "wrapped key must be {WRAPPED_KEY_LEN} bytes, got {}",
            wrapped.len()
        )));
    }
    let cipher = kek_cipher(kek)?;
    let (nonce, sealed) = wrapped.split_at(WRAP_NONCE_LEN);
    let plain = Zeroizing::new(
        cipher
            .decrypt(
                XNonce::from_slice(nonce),
                Payload {
                    msg: sealed,
                    aad: context.as_bytes(),
                },
            )
            .map_err(|_| KeyError::Crypto("key unwrap failed".to_string()))?,
    );
    DataKey::from_slice(&plain)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn seal_all(key: &DataKey, block_size: usize, chunks: &[&[u8]]) -> Vec<u8> {
        let mut enc = StreamEncryptor::with_block_size(key, block_size).unwrap();
        let mut out = Vec::new();
        for chunk in chunks {
            out.extend_from_slice(&enc.update(chunk).unwrap());
        }
        out.extend_from_slice(&enc.finalize().unwrap());
        out
    }

    fn open_all(key: &DataKey, sealed: &[u8], feed: usize) -> KeyResult<Vec<u8>> {
        let mut dec = StreamDecryptor::new(key);
        let mut out = Vec::new();
        for chunk in sealed.chunks(feed.max(1)) {
            out.extend_from_slice(&dec.update(chunk)?);
        }
        out.extend_from_slice(&dec.finalize()?);
        Ok(out)
    }

    #[test]
    fn test_roundtrip_across_block_boundaries() {
        let key = DataKey::generate();
        for len in [0usize, 1, 15, 16, 17, 48, 100] {
            let plain: Vec<u8> = (0..len).map(|i| i as u8).collect();
            let sealed = seal_all(&key, 16, &[&plain]);
            assert_eq!(sealed.len() as u64, ciphertext_len(len as u64, 16));
            for feed in [1, 7, 32, 1024] {
                assert_eq!(open_all(&key, &sealed, feed).unwrap(), plain, "len {len}");
            }
        }
    }

    #[test]
    fn test_chunking_of_input_does_not_matter() {
        let key = DataKey::generate();
        let sealed = seal_all(&key, 8, &[b"hello ", b"", b"streaming ", b"world"]);
        assert_eq!(open_all(&key, &sealed, 5).unwrap(), b"hello streaming world");
    }

    #[test]
    fn test_truncation_at_block_boundary_fails() {
        let key = DataKey::generate();
        let sealed = seal_all(&key, 16, &[&[7u8; 64]]);
        // Drop the final sealed block; the preceding block is not marked last.
        let cut = sealed.len() - (16 + TAG_LEN);
        assert!(matches!(
            open_all(&key, &sealed[..cut], 64),
            Err(KeyError::Crypto(_))
        ));
        assert!(open_all(&key, &sealed[..HEADER_LEN], 64).is_err());
        assert!(open_all(&key, &sealed[..10], 64).is_err());
    }

    #[test]
    fn test_reordered_blocks_fail() {
        let key = DataKey::generate();
        let sealed = seal_all(&key, 16, &[&[1u8; 16], &[2u8; 16], &[3u8; 8]]);
        let block = 16 + TAG_LEN;
        let mut swapped = sealed.clone();
        let (a, b) = (HEADER_LEN, HEADER_LEN + block);
        swapped[a..a + block].copy_from_slice(&sealed[b..b + block]);
        swapped[b..b + block].copy_from_slice(&sealed[a..a + block]);
        assert!(open_all(&key, &swapped, 1024).is_err());
    }

    #[test]
    fn test_tampered_byte_and_wrong_key_fail() {
        let key = DataKey::generate();
        let mut sealed = seal_all(&key, 16, &[b"some secret audio bytes"]);
        assert!(open_all(&DataKey::generate(), &sealed, 64).is_err());

        let last = sealed.len() - 1;
        sealed[last] ^= 0x01;
        assert!(open_all(&key, &sealed, 64).is_err());
    }

    #[test]
    fn test_header_is_authenticated() {
        let key = DataKey::generate();
        let mut sealed = seal_all(&key, 16, &[b"abc"]);
        sealed[10] ^= 0xff;
        assert!(open_all(&key, &sealed, 64).is_err());

        let mut bad_magic = seal_all(&key, 16, &[b"abc"]);
        bad_magic[0] = b'X';
        assert!(open_all(&key, &bad_magic, 64).is_err());
    }

    #[test]
    fn test_rejects_bad_block_size() {
        let key = DataKey::generate();
        assert!(StreamEncryptor::with_block_size(&key, 0).is_err());
        assert!(StreamEncryptor::with_block_size(&key, MAX_BLOCK_SIZE + 1).is_err());
    }

    #[test]
    fn test_wrap_unwrap_binds_context() {
        let kek = [9u8; 32];
        let data_key = DataKey::generate();
        let ctx = file_key_context("f1");
        let wrapped = wrap_key(&kek, &data_key, &ctx).unwrap();
        assert_eq!(wrapped.len(), WRAPPED_KEY_LEN);

        let unwrapped = unwrap_key(&kek, &wrapped, &ctx).unwrap();
        assert_eq!(unwrapped.as_bytes(), data_key.as_bytes());

        assert!(unwrap_key(&kek, &wrapped, &share_key_context("f1", "bob")).is_err());
        assert!(unwrap_key(&[8u8; 32], &wrapped, &ctx).is_err());
        assert!(matches!(
            unwrap_key(&[1u8; 16], &wrapped, &ctx),
            Err(KeyError::InvalidKey(_))
        ));
        assert!(unwrap_key(&kek, &wrapped[..40], &ctx).is_err());
    }

    #[test]
    fn test_data_key_debug_redacted() {
        let key = DataKey::from_slice(&[0xab; 32]).unwrap();
        assert_eq!(format!("{key:?}"), "DataKey([REDACTED])");
        assert!(DataKey::from_slice(&[0u8; 31]).is_err());
    }

    #[tokio::test]
    async fn test_stream_adapters_roundtrip() {
        let key = DataKey::generate();
        let chunks: Vec<Result<Bytes, KeyError>> = vec![
            Ok(Bytes::from_static(b"first chunk ")),
            Ok(Bytes::from_static(b"second chunk")),
        ];
        let sealed: Vec<Bytes> = encrypt_stream(futures::stream::iter(chunks), key.clone(), 5)
            .map(|r| r.unwrap())
            .collect()
            .await;

        let opened: Vec<Bytes> = decrypt_stream(
            futures::stream::iter(sealed.into_iter().map(Ok::<_, KeyError>)),
            key,
        )
        .map(|r| r.unwrap())
        .collect()
        .await;
        assert_eq!(opened.concat(), b"first chunk second chunk");
    }
}
