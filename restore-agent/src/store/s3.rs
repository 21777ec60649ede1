//! S3 implementation of the object store contract.

use super::{Listing, ObjectStore, RemoteObject, StoreConnector};
use crate::config::StoreConfig;
use crate::utils::errors::{RestoreError, Result};
use async_trait::async_trait;
use aws_sdk_s3::primitives::DateTime as SmithyDateTime;
use aws_sdk_s3::Client;
use chrono::{DateTime, Utc};
use std::collections::HashMap;
use std::path::Path;
use tokio::io::AsyncWriteExt;

/// One S3 session bound to a bucket.
pub struct S3Store {
    client: Client,
    bucket: String,
}

impl S3Store {
    pub async fn connect(config: &StoreConfig) -> Self {
        let mut loader = aws_config::defaults(aws_config::BehaviorVersion::latest());
        if let Some(region) = &config.region {
            loader = loader.region(aws_config::Region::new(region.clone()));
        }
        let shared = loader.load().await;

        let mut builder = aws_sdk_s3::config::Builder::from(&shared);
        if let Some(endpoint) = &config.endpoint {
            builder = builder.endpoint_url(endpoint);
        }
        if config.force_path_style {
            builder = builder.force_path_style(true);
        }

        Self {
            client: Client::from_conf(builder.build()),
            bucket: config.bucket.clone(),
        }
    }
}

/// A missing or out-of-range `LastModified` is an error, never the epoch.
fn to_chrono(key: &str, ts: Option<&SmithyDateTime>) -> Result<DateTime<Utc>> {
    let ts = ts.ok_or_else(|| store_error("read LastModified of", key, "missing"))?;
    ts.to_millis()
        .ok()
        .and_then(DateTime::from_timestamp_millis)
        .ok_or_else(|| store_error("read LastModified of", key, format!("out of range: {:?}", ts)))
}

fn store_error(action: &str, key: &str, err: impl std::fmt::Display) -> RestoreError {
    RestoreError::Store(format!("S3 {} {} failed: {}", action, key, err))
}

#[async_trait]
impl ObjectStore for S3Store {
    async fn list(&self, prefix: &str, delimiter: Option<&str>) -> Result<Listing> {
        let mut listing = Listing::default();
        let mut token: Option<String> = None;

        loop {
            let response = self
                .client
                .list_objects_v2()
                .bucket(&self.bucket)
                .prefix(prefix)
                .set_delimiter(delimiter.map(str::to_string))
                .set_continuation_token(token.take())
                .send()
                .await
                .map_err(|e| store_error("list", prefix, e.into_service_error()))?;

            for object in response.contents() {
                if let Some(key) = object.key() {
                    listing.objects.push(RemoteObject {
                        key: key.to_string(),
                        last_modified: to_chrono(key, object.last_modified())?,
                        size: object.size().unwrap_or(0).max(0) as u64,
                    });
                }
            }
            listing.prefixes.extend(
                response
                    .common_prefixes()
                    .iter()
                    .filter_map(|p| p.prefix().map(str::to_string)),
            );

            match response.next_continuation_token() {
                Some(next) if response.is_truncated().unwrap_or(false) => {
                    token = Some(next.to_string());
                }
                _ => break,
            }
        }

        Ok(listing)
    }

    async fn get_object(&self, key: &str) -> Result<RemoteObject> {
        let head = self
            .client
            .head_object()
            .bucket(&self.bucket)
            .key(key)
            .send()
            .await
            .map_err(|e| {
                let service = e.into_service_error();
                if service.is_not_found() {
                    RestoreError::NotFound(key.to_string())
                } else {
                    store_error("head", key, service)
                }
            })?;

        Ok(RemoteObject {
            key: key.to_string(),
            last_modified: to_chrono(key, head.last_modified())?,
            size: head.content_length().unwrap_or(0).max(0) as u64,
        })
    }

    async fn get_content(&self, key: &str) -> Result<Vec<u8>> {
        let response = self
            .client
            .get_object()
            .bucket(&self.bucket)
            .key(key)
            .send()
            .await
            .map_err(|e| {
                let service = e.into_service_error();
                if service.is_no_such_key() {
                    RestoreError::NotFound(key.to_string())
                } else {
                    store_error("get", key, service)
                }
            })?;

        let data = response
            .body
            .collect()
            .await
            .map_err(|e| store_error("read", key, e))?;
        Ok(data.into_bytes().to_vec())
    }

    async fn get_metadata(&self, key: &str) -> Result<HashMap<String, String>> {
        let head = self
            .client
            .head_object()
            .bucket(&self.bucket)
            .key(key)
            .send()
            .await
            .map_err(|e| store_error("head", key, e.into_service_error()))?;

        Ok(head.metadata().cloned().unwrap_or_default())
    }

    async fn download_to_file(&self, key: &str, path: &Path) -> Result<u64> {
        let mut response = self
            .client
            .get_object()
            .bucket(&self.bucket)
            .key(key)
            .send()
            .await
            .map_err(|e| store_error("get", key, e.into_service_error()))?;

        let mut file = tokio::fs::File::create(path).await?;
        let mut written = 0u64;
        while let Some(chunk) = response
            .body
            .try_next()
            .await
            .map_err(|e| store_error("read", key, e))?
        {
            file.write_all(&chunk).await?;
            written += chunk.len() as u64;
        }
        file.flush().await?;

        Ok(written)
    }
}

/// Opens a fresh S3 session per call.
#[derive(Debug, Clone)]
pub struct S3Connector {
    config: StoreConfig,
}

impl S3Connector {
    pub fn new(config: StoreConfig) -> Self {
        Self { config }
    }
}

#[async_trait]
impl StoreConnector for S3Connector {
    async fn connect(&self) -> Result<Box<dyn ObjectStore>> {
        if self.config.bucket.is_empty() {
            return Err(RestoreError::Configuration("no bucket configured".to_string()));
        }
        Ok(Box::new(S3Store::connect(&self.config).await))
    }
}
