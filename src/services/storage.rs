use crate::utils::hash::StreamDigest;
use anyhow::{Result, anyhow};
use async_trait::async_trait;
use aws_sdk_s3::Client;
use aws_sdk_s3::primitives::ByteStream;
use aws_sdk_s3::types::{CompletedMultipartUpload, CompletedPart};
use bytes::Bytes;
use dashmap::{DashMap, DashSet};
use serde::Serialize;
use std::pin::Pin;
use tokio::io::{AsyncRead, AsyncReadExt};
use tokio_util::sync::CancellationToken;

pub type StorageReader = Pin<Box<dyn AsyncRead + Send>>;

/// A fully written object
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct StoredObject {
    pub path: String,
    pub size: u64,
    pub sha256: String,
}

/// What the ingestion pipeline needs from an object store.
///
/// `put_stream` fails on a source read error, on `cancel`, or when `abort` is called
/// for the same path while the write is in flight. A failed write leaves nothing behind.
#[async_trait]
pub trait ObjectStorage: Send + Sync {
    async fn put_stream(&self, path: &str, reader: StorageReader, cancel: CancellationToken) -> Result<StoredObject>;

    /// Stops an in-flight write. Returns false if nothing was being written to `path`.
    async fn abort(&self, path: &str) -> Result<bool>;

    async fn delete(&self, path: &str) -> Result<()>;
}

/// Reads until `buffer` is full or the source ends, giving up as soon as `cancel` fires.
async fn fill_part<R>(reader: &mut R, buffer: &mut [u8], cancel: &CancellationToken) -> Result<usize>
where
    R: AsyncRead + Unpin + ?Sized,
{
    let mut n = 0;
    while n < buffer.len() {
        let read = tokio::select! {
            biased;
            _ = cancel.cancelled() => return Err(anyhow!("write cancelled")),
            read = reader.read(&mut buffer[n..]) => read?,
        };
        if read == 0 {
            break;
        }
        n += read;
    }
    Ok(n)
}

/// Tracks writes in progress so `abort(path)` can reach them
#[derive(Default)]
struct InFlight {
    writes: DashMap<String, CancellationToken>,
}

/// Deregisters the write when the `put_stream` future completes or is dropped
struct InFlightGuard<'a> {
    in_flight: &'a InFlight,
    path: String,
    token: CancellationToken,
}

impl Drop for InFlightGuard<'_> {
    fn drop(&mut self) {
        self.in_flight.writes.remove(&self.path);
    }
}

impl InFlight {
    fn start(&self, path: &str, parent: &CancellationToken) -> InFlightGuard<'_> {
        let token = parent.child_token();
        self.writes.insert(path.to_string(), token.clone());
        InFlightGuard {
            in_flight: self,
            path: path.to_string(),
            token,
        }
    }

    fn abort(&self, path: &str) -> bool {
        match self.writes.get(path) {
            Some(token) => {
                token.cancel();
                true
            }
            None => false,
        }
    }
}

/// S3/MinIO storage using multipart uploads
pub struct S3ObjectStorage {
    client: Client,
    bucket: String,
    part_size: usize,
    in_flight: InFlight,
}

impl S3ObjectStorage {
    pub fn new(client: Client, bucket: String) -> Self {
        Self {
            client,
            bucket,
            // S3 requires at least 5MB for every part but the last
            part_size: 10 * 1024 * 1024,
            in_flight: InFlight::default(),
        }
    }

    async fn upload_parts(
        &self,
        key: &str,
        upload_id: &str,
        reader: &mut StorageReader,
        cancel: &CancellationToken,
    ) -> Result<(Vec<CompletedPart>, StreamDigest)> {
        let mut digest = StreamDigest::new();
        let mut parts = Vec::new();
        let mut part_number = 1;
        let mut buffer = vec![0u8; self.part_size];

        loop {
            let n = fill_part(reader, &mut buffer, cancel).await?;
            if n == 0 {
                break;
            }
            digest.update(&buffer[..n]);

            let part = self
                .client
                .upload_part()
                .bucket(&self.bucket)
                .key(key)
                .upload_id(upload_id)
                .body(ByteStream::from(buffer[..n].to_vec()))
                .part_number(part_number)
                .send()
                .await?;

            parts.push(
                CompletedPart::builder()
                    .e_tag(part.e_tag().unwrap_or_default())
                    .part_number(part_number)
                    .build(),
            );
            part_number += 1;

            if n < buffer.len() {
                break;
            }
        }

        Ok((parts, digest))
    }

    async fn abort_multipart(&self, key: &str, upload_id: &str) {
        if let Err(e) = self
            .client
            .abort_multipart_upload()
            .bucket(&self.bucket)
            .key(key)
            .upload_id(upload_id)
            .send()
            .await
        {
            tracing::error!("Failed to abort multipart upload {} for {}: {}", upload_id, key, e);
        }
    }

    async fn write(&self, key: &str, mut reader: StorageReader, cancel: &CancellationToken) -> Result<StoredObject> {
        let created = self
            .client
            .create_multipart_upload()
            .bucket(&self.bucket)
            .key(key)
            .send()
            .await?;
        let upload_id = created
            .upload_id()
            .ok_or_else(|| anyhow!("No upload ID"))?
            .to_string();

        let (parts, digest) = match self.upload_parts(key, &upload_id, &mut reader, cancel).await {
            Ok(uploaded) => uploaded,
            Err(e) => {
                tracing::warn!(key, "Upload interrupted, aborting multipart upload: {}", e);
                self.abort_multipart(key, &upload_id).await;
                return Err(e);
            }
        };

        if parts.is_empty() {
            // A multipart upload cannot complete without parts
            self.abort_multipart(key, &upload_id).await;
            self.client
                .put_object()
                .bucket(&self.bucket)
                .key(key)
                .body(ByteStream::from(Vec::new()))
                .send()
                .await?;
        } else {
            self.client
                .complete_multipart_upload()
                .bucket(&self.bucket)
                .key(key)
                .upload_id(&upload_id)
                .multipart_upload(
                    CompletedMultipartUpload::builder()
                        .set_parts(Some(parts))
                        .build(),
                )
                .send()
                .await?;
        }

        let (sha256, size) = digest.finish();
        Ok(StoredObject {
            path: key.to_string(),
            size,
            sha256,
        })
    }
}

#[async_trait]
impl ObjectStorage for S3ObjectStorage {
    async fn put_stream(&self, path: &str, reader: StorageReader, cancel: CancellationToken) -> Result<StoredObject> {
        let guard = self.in_flight.start(path, &cancel);
        self.write(path, reader, &guard.token).await
    }

    async fn abort(&self, path: &str) -> Result<bool> {
        Ok(self.in_flight.abort(path))
    }

    async fn delete(&self, path: &str) -> Result<()> {
        self.client
            .delete_object()
            .bucket(&self.bucket)
            .key(path)
            .send()
            .await?;
        Ok(())
    }
}

/// In-process store for development and tests
#[derive(Default)]
pub struct MemoryObjectStorage {
    objects: DashMap<String, Bytes>,
    aborted: DashSet<String>,
    in_flight: InFlight,
}

impl MemoryObjectStorage {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn get(&self, path: &str) -> Option<Bytes> {
        self.objects.get(path).map(|entry| entry.value().clone())
    }

    pub fn contains(&self, path: &str) -> bool {
        self.objects.contains_key(path)
    }

    /// Paths whose writes ended without producing an object
    pub fn was_aborted(&self, path: &str) -> bool {
        self.aborted.contains(path)
    }

    pub fn len(&self) -> usize {
        self.objects.len()
    }

    pub fn is_empty(&self) -> bool {
        self.objects.is_empty()
    }

    async fn write(&self, mut reader: StorageReader, cancel: &CancellationToken) -> Result<(Vec<u8>, StreamDigest)> {
        let mut data = Vec::new();
        let mut digest = StreamDigest::new();
        let mut buffer = vec![0u8; 64 * 1024];
        loop {
            let n = fill_part(&mut reader, &mut buffer, cancel).await?;
            if n == 0 {
                break;
            }
            digest.update(&buffer[..n]);
            data.extend_from_slice(&buffer[..n]);
        }
        Ok((data, digest))
    }
}

#[async_trait]
impl ObjectStorage for MemoryObjectStorage {
    async fn put_stream(&self, path: &str, reader: StorageReader, cancel: CancellationToken) -> Result<StoredObject> {
        let guard = self.in_flight.start(path, &cancel);
        let written = self.write(reader, &guard.token).await;
        drop(guard);

        let (data, digest) = match written {
            Ok(written) => written,
            Err(e) => {
                self.aborted.insert(path.to_string());
                return Err(e);
            }
        };

        let (sha256, size) = digest.finish();
        self.objects.insert(path.to_string(), Bytes::from(data));
        Ok(StoredObject {
            path: path.to_string(),
            size,
            sha256,
        })
    }

    async fn abort(&self, path: &str) -> Result<bool> {
        Ok(self.in_flight.abort(path))
    }

    async fn delete(&self, path: &str) -> Result<()> {
        self.objects.remove(path);
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::utils::hash::calculate_hash;
    use std::time::Duration;

    #[tokio::test]
    async fn test_memory_put_stream() {
        let storage = MemoryObjectStorage::new();
        let reader: StorageReader = Box::pin(std::io::Cursor::new(b"hello world".to_vec()));
        let stored = storage
            .put_stream("docs/a.txt", reader, CancellationToken::new())
            .await
            .unwrap();

        assert_eq!(stored.size, 11);
        assert_eq!(stored.sha256, calculate_hash(b"hello world"));
        assert_eq!(storage.get("docs/a.txt").unwrap(), Bytes::from_static(b"hello world"));

        storage.delete("docs/a.txt").await.unwrap();
        assert!(storage.is_empty());
    }

    #[tokio::test]
    async fn test_memory_abort_in_flight_write() {
        let storage = std::sync::Arc::new(MemoryObjectStorage::new());
        let (client, server) = tokio::io::duplex(64);
        let reader: StorageReader = Box::pin(server);

        let writer = storage.clone();
        let task = tokio::spawn(async move {
            writer
                .put_stream("slow.bin", reader, CancellationToken::new())
                .await
        });

        tokio::time::sleep(Duration::from_millis(20)).await;
        assert!(storage.abort("slow.bin").await.unwrap());

        assert!(task.await.unwrap().is_err());
        assert!(storage.was_aborted("slow.bin"));
        assert!(!storage.contains("slow.bin"));
        drop(client);
    }

    #[tokio::test]
    async fn test_abort_unknown_path() {
        let storage = MemoryObjectStorage::new();
        assert!(!storage.abort("nothing").await.unwrap());
    }
}
