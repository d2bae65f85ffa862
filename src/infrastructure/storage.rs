use crate::services::storage::{MemoryObjectStorage, ObjectStorage, S3ObjectStorage};
use anyhow::{Context, Result};
use aws_sdk_s3::config::Region;
use std::env;
use std::sync::Arc;
use tracing::{info, warn};

/// S3/MinIO when `MINIO_ENDPOINT` is set, otherwise an in-memory store.
pub async fn setup_storage() -> Result<Arc<dyn ObjectStorage>> {
    let Ok(endpoint_url) = env::var("MINIO_ENDPOINT") else {
        warn!("⚠️  MINIO_ENDPOINT not set, keeping uploads in memory");
        return Ok(Arc::new(MemoryObjectStorage::new()));
    };
    let access_key = env::var("MINIO_ACCESS_KEY").context("MINIO_ACCESS_KEY must be set")?;
    let secret_key = env::var("MINIO_SECRET_KEY").context("MINIO_SECRET_KEY must be set")?;
    let bucket = env::var("MINIO_BUCKET").context("MINIO_BUCKET must be set")?;
    let region = env::var("MINIO_REGION").unwrap_or_else(|_| "us-east-1".to_string());

    info!("☁️  S3 Storage: {} (Bucket: {})", endpoint_url, bucket);

    let aws_config = aws_config::from_env()
        .endpoint_url(&endpoint_url)
        .region(Region::new(region))
        .credentials_provider(aws_sdk_s3::config::Credentials::new(
            access_key, secret_key, None, None, "static",
        ))
        .load()
        .await;

    let s3_config = aws_sdk_s3::config::Builder::from(&aws_config)
        .force_path_style(true)
        .build();

    let s3_client = aws_sdk_s3::Client::from_conf(s3_config);
    Ok(Arc::new(S3ObjectStorage::new(s3_client, bucket)))
}
