//! Backup destinations
//!
//! Streaming sink abstraction for backup targets, selected by URL scheme:
//! `file://` (authoritative), `s3://` (AWS SDK), `gcs://` and `azure://`
//! (recognized, not yet implemented). File writers create parent
//! directories and write via temp + fsync + rename, so a failed backup
//! never leaves a partial file at its final path.

use async_trait::async_trait;
use std::path::{Path, PathBuf};
use tokio::fs::{File, OpenOptions};
use tokio::io::AsyncWriteExt;
use tracing::{debug, info};

use crate::error::{MantisError, MantisResult};

/// Factory for destination writers
#[async_trait]
pub trait BackupDestination: Send + Sync {
    /// Open a writer for `location`
    async fn open(&self, location: &str) -> MantisResult<Box<dyn DestinationWriter>>;
}

/// One open destination stream
#[async_trait]
pub trait DestinationWriter: Send {
    async fn write(&mut self, data: &[u8]) -> MantisResult<()>;

    /// Finish the stream and publish the artifact atomically
    async fn close(self: Box<Self>) -> MantisResult<()>;

    /// Discard the stream, removing any temporary artifacts
    async fn abort(self: Box<Self>) -> MantisResult<()>;
}

/// Resolve a destination implementation from a location URL
pub fn destination_for(location: &str) -> MantisResult<Box<dyn BackupDestination>> {
    match scheme_of(location) {
        "file" => Ok(Box::new(FileDestination)),
        "s3" => Ok(Box::new(S3Destination)),
        "gcs" => Err(MantisError::invalid(
            "gcs:// destinations are not yet implemented",
        )),
        "azure" => Err(MantisError::invalid(
            "azure:// destinations are not yet implemented",
        )),
        other => Err(MantisError::invalid(format!(
            "unsupported destination scheme: {}://",
            other
        ))),
    }
}

fn scheme_of(location: &str) -> &str {
    location.split_once("://").map(|(scheme, _)| scheme).unwrap_or("file")
}

/// Filesystem path of a `file://` location (bare paths count as files)
pub fn file_path_of(location: &str) -> Option<PathBuf> {
    match location.split_once("://") {
        Some(("file", path)) => Some(PathBuf::from(path)),
        Some(_) => None,
        None => Some(PathBuf::from(location)),
    }
}

/// Local filesystem destination
pub struct FileDestination;

#[async_trait]
impl BackupDestination for FileDestination {
    async fn open(&self, location: &str) -> MantisResult<Box<dyn DestinationWriter>> {
        let path = file_path_of(location)
            .ok_or_else(|| MantisError::invalid(format!("not a file location: {}", location)))?;
        if let Some(parent) = path.parent() {
            if !parent.as_os_str().is_empty() {
                tokio::fs::create_dir_all(parent).await?;
            }
        }
        let temp = temp_path(&path);
        let file = OpenOptions::new()
            .create(true)
            .write(true)
            .truncate(true)
            .open(&temp)
            .await?;
        debug!("📂 File destination opened: {} (temp {})", path.display(), temp.display());
        Ok(Box::new(FileWriter { file, temp, path }))
    }
}

fn temp_path(path: &Path) -> PathBuf {
    let mut name = path.file_name().map(|n| n.to_os_string()).unwrap_or_default();
    name.push(".tmp");
    path.with_file_name(name)
}

struct FileWriter {
    file: File,
    temp: PathBuf,
    path: PathBuf,
}

#[async_trait]
impl DestinationWriter for FileWriter {
    async fn write(&mut self, data: &[u8]) -> MantisResult<()> {
        self.file.write_all(data).await?;
        Ok(())
    }

    async fn close(mut self: Box<Self>) -> MantisResult<()> {
        self.file.flush().await?;
        self.file.sync_all().await?;
        drop(self.file);
        tokio::fs::rename(&self.temp, &self.path).await?;
        debug!("💾 File destination published: {}", self.path.display());
        Ok(())
    }

    async fn abort(self: Box<Self>) -> MantisResult<()> {
        drop(self.file);
        if self.temp.exists() {
            tokio::fs::remove_file(&self.temp).await?;
        }
        Ok(())
    }
}

/// Amazon S3 destination (`s3://bucket/key`)
pub struct S3Destination;

#[async_trait]
impl BackupDestination for S3Destination {
    async fn open(&self, location: &str) -> MantisResult<Box<dyn DestinationWriter>> {
        let (bucket, key) = parse_s3_location(location)?;
        let aws_config = aws_config::defaults(aws_config::BehaviorVersion::latest())
            .load()
            .await;
        let client = aws_sdk_s3::Client::new(&aws_config);
        info!("☁️ S3 destination opened: bucket={}, key={}", bucket, key);
        Ok(Box::new(S3Writer {
            client,
            bucket,
            key,
            buffer: Vec::new(),
        }))
    }
}

fn parse_s3_location(location: &str) -> MantisResult<(String, String)> {
    let rest = location
        .strip_prefix("s3://")
        .ok_or_else(|| MantisError::invalid(format!("not an s3 location: {}", location)))?;
    let (bucket, key) = rest
        .split_once('/')
        .ok_or_else(|| MantisError::invalid(format!("s3 location misses a key: {}", location)))?;
    if bucket.is_empty() || key.is_empty() {
        return Err(MantisError::invalid(format!("malformed s3 location: {}", location)));
    }
    Ok((bucket.to_string(), key.to_string()))
}

struct S3Writer {
    client: aws_sdk_s3::Client,
    bucket: String,
    key: String,
    buffer: Vec<u8>,
}

#[async_trait]
impl DestinationWriter for S3Writer {
    async fn write(&mut self, data: &[u8]) -> MantisResult<()> {
        self.buffer.extend_from_slice(data);
        Ok(())
    }

    async fn close(self: Box<Self>) -> MantisResult<()> {
        let size = self.buffer.len();
        self.client
            .put_object()
            .bucket(&self.bucket)
            .key(&self.key)
            .body(aws_sdk_s3::primitives::ByteStream::from(self.buffer))
            .send()
            .await
            .map_err(|e| {
                MantisError::Io(std::io::Error::other(format!("S3 upload failed: {}", e)))
            })?;
        info!("☁️ S3 upload complete: s3://{}/{} ({} bytes)", self.bucket, self.key, size);
        Ok(())
    }

    async fn abort(self: Box<Self>) -> MantisResult<()> {
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    #[test]
    fn test_scheme_dispatch() {
        assert!(destination_for("file:///tmp/x").is_ok());
        assert!(destination_for("/tmp/bare-path").is_ok());
        assert!(destination_for("s3://bucket/key").is_ok());
        assert!(destination_for("gcs://bucket/key").is_err());
        assert!(destination_for("azure://container/key").is_err());
        assert!(destination_for("ftp://host/file").is_err());
    }

    #[test]
    fn test_s3_location_parsing() {
        assert_eq!(
            parse_s3_location("s3://backups/daily/full.snap").unwrap(),
            ("backups".to_string(), "daily/full.snap".to_string())
        );
        assert!(parse_s3_location("s3://bucket-only").is_err());
        assert!(parse_s3_location("file:///x").is_err());
    }

    #[tokio::test]
    async fn test_file_writer_publishes_atomically() {
        let temp = TempDir::new().unwrap();
        let target = temp.path().join("nested/dir/backup.snap");
        let location = format!("file://{}", target.display());

        let destination = FileDestination;
        let mut writer = destination.open(&location).await.unwrap();
        writer.write(b"hello ").await.unwrap();
        writer.write(b"backup").await.unwrap();
        // Nothing at the final path until close.
        assert!(!target.exists());
        writer.close().await.unwrap();

        assert_eq!(std::fs::read(&target).unwrap(), b"hello backup");
        assert!(!temp_path(&target).exists());
    }

    #[tokio::test]
    async fn test_file_writer_abort_leaves_nothing() {
        let temp = TempDir::new().unwrap();
        let target = temp.path().join("backup.snap");
        let location = format!("file://{}", target.display());

        let mut writer = FileDestination.open(&location).await.unwrap();
        writer.write(b"partial").await.unwrap();
        writer.abort().await.unwrap();

        assert!(!target.exists());
        assert!(!temp_path(&target).exists());
    }
}
