//! Content-addressed blob store facade (spec.md §4.4 / C4).
//!
//! Blobs are stored under `DATA_DIR` keyed by the hex digest of their
//! decompressed content, following the same two-tier primary/secondary
//! split the teacher's `common::s3` module uses for its own upload path,
//! but backed primarily by the local filesystem as spec.md §6 requires
//! (`DATA_DIR`/`SECONDARY_DATA_DIR`). Gzip wrapping is detected by magic
//! bytes (spec.md §6), not by file extension, since blobs are named by
//! digest alone and carry no extension.

use std::io::{BufRead, BufReader, Read};
use std::path::{Path, PathBuf};

use flate2::bufread::MultiGzDecoder;
use sha2::{Digest, Sha256};

use crate::err::AppError;

const GZIP_MAGIC: [u8; 2] = [0x1f, 0x8b];

/// Content-addressed blob store with a writable primary root and an
/// optional read-only secondary root, mirroring `DATA_DIR` /
/// `SECONDARY_DATA_DIR` from spec.md §6.
pub struct BlobStore {
    primary: PathBuf,
    secondary: Option<PathBuf>,
    secondary_by_user: bool,
}

impl BlobStore {
    pub fn new(primary: impl Into<PathBuf>) -> Self {
        Self {
            primary: primary.into(),
            secondary: None,
            secondary_by_user: false,
        }
    }

    pub fn with_secondary(mut self, secondary: impl Into<PathBuf>, by_user: bool) -> Self {
        self.secondary = Some(secondary.into());
        self.secondary_by_user = by_user;
        self
    }

    /// Writes `bytes` (already decompressed) under its content digest and
    /// returns the hex digest. Idempotent: writing the same content twice
    /// is a no-op on the second call.
    pub fn put(&self, bytes: &[u8]) -> Result<String, AppError> {
        let digest = digest_hex(bytes);
        let path = self.path_for(&digest);
        if !path.exists() {
            std::fs::create_dir_all(path.parent().expect("digest path has a parent"))?;
            let tmp = path.with_extension("tmp");
            std::fs::write(&tmp, bytes)?;
            std::fs::rename(&tmp, &path)?;
            tracing::debug!(digest = %digest, bytes = bytes.len(), "wrote blob");
        }
        Ok(digest)
    }

    /// Opens a blob for streaming read, transparently unwrapping gzip by
    /// sniffing its magic bytes. Falls back to the secondary root (and,
    /// when `secondary_by_user` is set, a per-owner subdirectory of it)
    /// when the digest is absent from the primary root.
    pub fn open(&self, digest: &str, owner: Option<&str>) -> Result<Box<dyn BufRead>, AppError> {
        let path = self.resolve(digest, owner)?;
        let file = std::fs::File::open(&path)?;
        let mut reader = BufReader::new(file);
        let mut peek = [0u8; 2];
        let n = peek_bytes(&mut reader, &mut peek)?;
        if n == 2 && peek == GZIP_MAGIC {
            tracing::trace!(digest = %digest, "blob is gzip-wrapped");
            Ok(Box::new(BufReader::new(MultiGzDecoder::new(reader))))
        } else {
            Ok(Box::new(reader))
        }
    }

    /// Byte size of the blob's on-disk content, for progress estimation
    /// (spec.md's `Task.progress`). Returns `None` for a gzip-wrapped blob,
    /// since its compressed size on disk isn't comparable to the
    /// decompressed offset the reader's counter tracks.
    pub fn content_length(&self, digest: &str, owner: Option<&str>) -> Result<Option<u64>, AppError> {
        let path = self.resolve(digest, owner)?;
        let mut file = std::fs::File::open(&path)?;
        let mut peek = [0u8; 2];
        let n = file.read(&mut peek)?;
        if n == 2 && peek == GZIP_MAGIC {
            return Ok(None);
        }
        Ok(Some(std::fs::metadata(&path)?.len()))
    }

    fn resolve(&self, digest: &str, owner: Option<&str>) -> Result<PathBuf, AppError> {
        let primary = self.path_for(digest);
        if primary.exists() {
            return Ok(primary);
        }
        if let Some(secondary) = &self.secondary {
            let root = if self.secondary_by_user {
                match owner {
                    Some(owner) => secondary.join(owner),
                    None => secondary.clone(),
                }
            } else {
                secondary.clone()
            };
            let candidate = shard(&root, digest);
            if candidate.exists() {
                return Ok(candidate);
            }
        }
        Err(AppError::NotFound(format!("blob {digest} not found")))
    }

    fn path_for(&self, digest: &str) -> PathBuf {
        shard(&self.primary, digest)
    }
}

/// Shards blobs two levels deep by digest prefix, the way content-addressed
/// stores conventionally avoid enormous flat directories.
fn shard(root: &Path, digest: &str) -> PathBuf {
    let (a, rest) = digest.split_at(2.min(digest.len()));
    let (b, _) = rest.split_at(2.min(rest.len()));
    root.join(a).join(b).join(digest)
}

fn digest_hex(bytes: &[u8]) -> String {
    let mut hasher = Sha256::new();
    hasher.update(bytes);
    base16ct::lower::encode_string(&hasher.finalize())
}

fn peek_bytes(reader: &mut impl BufRead, buf: &mut [u8; 2]) -> std::io::Result<usize> {
    let available = reader.fill_buf()?;
    let n = available.len().min(2);
    buf[..n].copy_from_slice(&available[..n]);
    Ok(n)
}

#[cfg(feature = "s3")]
pub mod s3 {
    //! Optional upload of finished blobs to S3-compatible storage, kept
    //! behind the `s3` feature exactly as the original `common::s3` module
    //! was optional via the `AWS_ACCESS_KEY_ID` environment check.

    use crate::err::AppError;

    pub fn enabled() -> bool {
        std::env::var("AWS_ACCESS_KEY_ID").is_ok()
    }

    pub async fn config_from_env() -> Result<aws_sdk_s3::config::Config, AppError> {
        let config = aws_config::from_env().load().await;
        let endpoint_url = std::env::var("AWS_ENDPOINT_URL").map_err(|e| {
            AppError::Internal(format!("AWS_ENDPOINT_URL not set: {e}"))
        })?;
        Ok(aws_sdk_s3::config::Builder::from(&config)
            .endpoint_url(endpoint_url)
            .force_path_style(true)
            .build())
    }

    pub async fn upload_file(src: &std::path::Path, bucket: &str, key: &str) -> Result<(), AppError> {
        let client = aws_sdk_s3::Client::from_conf(config_from_env().await?);
        let body = aws_sdk_s3::primitives::ByteStream::from_path(src)
            .await
            .map_err(|e| AppError::Io(format!("could not open {src:?}: {e}")))?;
        client
            .put_object()
            .bucket(bucket)
            .key(key)
            .body(body)
            .send()
            .await
            .map_err(|e| AppError::Internal(format!("s3 upload failed: {e}")))?;
        Ok(())
    }
}

#[cfg(test)]
mod test {
    use super::*;

    #[test]
    fn put_is_idempotent_and_content_addressed() {
        let dir = tempfile::tempdir().unwrap();
        let store = BlobStore::new(dir.path());
        let digest1 = store.put(b"hello world").unwrap();
        let digest2 = store.put(b"hello world").unwrap();
        assert_eq!(digest1, digest2);
        assert_eq!(digest1.len(), 64);
    }

    #[test]
    fn different_content_yields_different_digest() {
        let dir = tempfile::tempdir().unwrap();
        let store = BlobStore::new(dir.path());
        let a = store.put(b"alpha").unwrap();
        let b = store.put(b"beta").unwrap();
        assert_ne!(a, b);
    }

    #[test]
    fn open_roundtrips_plain_content() {
        let dir = tempfile::tempdir().unwrap();
        let store = BlobStore::new(dir.path());
        let digest = store.put(b"plain text content").unwrap();
        let mut reader = store.open(&digest, None).unwrap();
        let mut buf = Vec::new();
        reader.read_to_end(&mut buf).unwrap();
        assert_eq!(buf, b"plain text content");
    }

    #[test]
    fn open_transparently_decodes_gzip_by_magic_bytes() {
        use std::io::Write;
        let dir = tempfile::tempdir().unwrap();
        let store = BlobStore::new(dir.path());

        let mut encoder =
            flate2::write::GzEncoder::new(Vec::new(), flate2::Compression::default());
        encoder.write_all(b"gzipped payload").unwrap();
        let gz_bytes = encoder.finish().unwrap();

        let digest = store.put(&gz_bytes).unwrap();
        let mut reader = store.open(&digest, None).unwrap();
        let mut buf = Vec::new();
        reader.read_to_end(&mut buf).unwrap();
        assert_eq!(buf, b"gzipped payload");
    }

    #[test]
    fn content_length_reports_plain_blob_size() {
        let dir = tempfile::tempdir().unwrap();
        let store = BlobStore::new(dir.path());
        let digest = store.put(b"plain text content").unwrap();
        assert_eq!(store.content_length(&digest, None).unwrap(), Some(19));
    }

    #[test]
    fn content_length_is_unknown_for_gzipped_blobs() {
        use std::io::Write;
        let dir = tempfile::tempdir().unwrap();
        let store = BlobStore::new(dir.path());

        let mut encoder =
            flate2::write::GzEncoder::new(Vec::new(), flate2::Compression::default());
        encoder.write_all(b"gzipped payload").unwrap();
        let gz_bytes = encoder.finish().unwrap();

        let digest = store.put(&gz_bytes).unwrap();
        assert_eq!(store.content_length(&digest, None).unwrap(), None);
    }

    #[test]
    fn missing_digest_is_not_found() {
        let dir = tempfile::tempdir().unwrap();
        let store = BlobStore::new(dir.path());
        let err = store.open("deadbeef", None).unwrap_err();
        assert!(matches!(err, AppError::NotFound(_)));
    }

    #[test]
    fn falls_back_to_secondary_root() {
        let primary = tempfile::tempdir().unwrap();
        let secondary = tempfile::tempdir().unwrap();

        let seed = BlobStore::new(secondary.path());
        let digest = seed.put(b"from secondary").unwrap();

        let store = BlobStore::new(primary.path()).with_secondary(secondary.path(), false);
        let mut reader = store.open(&digest, None).unwrap();
        let mut buf = Vec::new();
        reader.read_to_end(&mut buf).unwrap();
        assert_eq!(buf, b"from secondary");
    }
}
