use async_trait::async_trait;
use aws_sdk_s3 as s3;
use s3::config::http::HttpResponse;
use s3::config::Region;
use s3::error::{DisplayErrorContext, ProvideErrorMetadata, SdkError};
use s3::primitives::ByteStream;
use s3::types::{CompletedMultipartUpload, CompletedPart as S3CompletedPart};
use tracing::debug;

use super::blob::{BlobError, BlobResult, BlobStore, CompletedPart};
use crate::config::SpacesConfig;

/// Parses an S3 URI (s3://bucket/key) into bucket and key.
pub fn parse_s3_uri(s3_uri: &str) -> Option<(String, String)> {
    let uri = url::Url::parse(s3_uri).ok()?;
    if uri.scheme() != "s3" {
        return None;
    }
    let bucket = uri.host_str()?.to_string();
    let key = uri.path().trim_start_matches('/').to_string();
    if key.is_empty() {
        return None;
    }
    Some((bucket, key))
}

/// An S3-compatible bucket (AWS, DigitalOcean Spaces, MinIO, ...).
pub struct S3BlobStore {
    client: s3::Client,
    bucket: String,
    folder_prefix: Option<String>,
}

impl S3BlobStore {
    pub async fn connect(spaces_config: &SpacesConfig) -> Self {
        let mut loader = aws_config::defaults(s3::config::BehaviorVersion::latest())
            .region(Region::new(spaces_config.region.clone()));
        if let Some(endpoint) = &spaces_config.endpoint_url {
            loader = loader.endpoint_url(endpoint);
        }
        if let (Some(key_id), Some(secret)) = (
            &spaces_config.access_key_id,
            &spaces_config.secret_access_key,
        ) {
            loader = loader.credentials_provider(s3::config::Credentials::new(
                key_id, secret, None, // session_token
                None,   // expiry
                "Static",
            ));
        }
        let sdk_config = loader.load().await;

        Self::with_client(
            s3::Client::new(&sdk_config),
            spaces_config.bucket_name.clone(),
            spaces_config.folder_prefix.clone(),
        )
    }

    pub fn with_client(client: s3::Client, bucket: String, folder_prefix: Option<String>) -> Self {
        Self {
            client,
            bucket,
            folder_prefix: folder_prefix.filter(|p| !p.is_empty()),
        }
    }

    fn object_key(&self, key: &str) -> String {
        match &self.folder_prefix {
            Some(prefix) => format!("{}/{}", prefix, key),
            None => key.to_string(),
        }
    }
}

/// Maps an HTTP status and S3 error code onto the retry taxonomy.
pub fn classify_status(status: u16, code: Option<&str>, message: &str) -> BlobError {
    let message = match code {
        Some(code) => format!("{} ({}): {}", code, status, message),
        None => format!("HTTP {}: {}", status, message),
    };
    match (status, code) {
        (_, Some("QuotaExceeded" | "TooManyBuckets" | "StorageQuotaExceeded")) => {
            BlobError::QuotaExceeded(message)
        }
        (_, Some("SlowDown" | "RequestTimeout" | "InternalError" | "ServiceUnavailable")) => {
            BlobError::Transient(message)
        }
        (401 | 403, _) => BlobError::Unauthorized(message),
        (404, _) => BlobError::NotFound(message),
        (408 | 429, _) | (500..=599, _) => BlobError::Transient(message),
        _ => BlobError::Rejected(message),
    }
}

fn classify<E>(err: SdkError<E, HttpResponse>) -> BlobError
where
    E: ProvideErrorMetadata + std::error::Error + Send + Sync + 'static,
{
    let text = DisplayErrorContext(&err).to_string();
    match &err {
        SdkError::ServiceError(service) => {
            let status = service.raw().status().as_u16();
            classify_status(status, err.code(), err.message().unwrap_or(text.as_str()))
        }
        SdkError::ConstructionFailure(_) => BlobError::Rejected(text),
        // Timeouts, dispatch failures and unparseable responses.
        _ => BlobError::Transient(text),
    }
}

#[async_trait]
impl BlobStore for S3BlobStore {
    fn describe(&self, key: &str) -> String {
        format!("s3://{}/{}", self.bucket, self.object_key(key))
    }

    fn key_for_locator(&self, locator: &str) -> Option<String> {
        let (bucket, object_key) = parse_s3_uri(locator)?;
        if bucket != self.bucket {
            return None;
        }
        match &self.folder_prefix {
            Some(prefix) => object_key
                .strip_prefix(prefix.as_str())
                .and_then(|rest| rest.strip_prefix('/'))
                .map(str::to_string),
            None => Some(object_key),
        }
    }

    async fn put(&self, key: &str, body: Vec<u8>) -> BlobResult<()> {
        self.client
            .put_object()
            .bucket(&self.bucket)
            .key(self.object_key(key))
            .body(ByteStream::from(body))
            .send()
            .await
            .map_err(classify)?;
        Ok(())
    }

    async fn get_range(&self, key: &str, offset: u64, len: u64) -> BlobResult<Vec<u8>> {
        if len == 0 {
            return Ok(Vec::new());
        }
        let object = self
            .client
            .get_object()
            .bucket(&self.bucket)
            .key(self.object_key(key))
            .range(format!("bytes={}-{}", offset, offset + len - 1))
            .send()
            .await
            .map_err(classify)?;
        let body = object
            .body
            .collect()
            .await
            .map_err(|e| BlobError::Transient(format!("reading object body: {}", e)))?;
        Ok(body.into_bytes().to_vec())
    }

    async fn stat(&self, key: &str) -> BlobResult<Option<u64>> {
        match self
            .client
            .head_object()
            .bucket(&self.bucket)
            .key(self.object_key(key))
            .send()
            .await
            .map_err(classify)
        {
            Ok(head) => Ok(Some(head.content_length().unwrap_or(0).max(0) as u64)),
            Err(BlobError::NotFound(_)) => Ok(None),
            Err(e) => Err(e),
        }
    }

    async fn delete(&self, key: &str) -> BlobResult<()> {
        self.client
            .delete_object()
            .bucket(&self.bucket)
            .key(self.object_key(key))
            .send()
            .await
            .map_err(classify)?;
        Ok(())
    }

    async fn begin_upload(&self, key: &str) -> BlobResult<String> {
        let created = self
            .client
            .create_multipart_upload()
            .bucket(&self.bucket)
            .key(self.object_key(key))
            .send()
            .await
            .map_err(classify)?;
        let upload_id = created
            .upload_id()
            .ok_or_else(|| BlobError::Rejected("multipart upload returned no upload id".to_string()))?
            .to_string();
        debug!(key = %key, upload_id = %upload_id, "Multipart upload started");
        Ok(upload_id)
    }

    async fn upload_part(
        &self,
        key: &str,
        upload_id: &str,
        number: u32,
        body: Vec<u8>,
    ) -> BlobResult<CompletedPart> {
        let size = body.len() as u64;
        let part_number = i32::try_from(number)
            .map_err(|_| BlobError::Rejected(format!("part number {} out of range", number)))?;
        let uploaded = self
            .client
            .upload_part()
            .bucket(&self.bucket)
            .key(self.object_key(key))
            .upload_id(upload_id)
            .part_number(part_number)
            .body(ByteStream::from(body))
            .send()
            .await
            .map_err(classify)?;
        Ok(CompletedPart {
            number,
            etag: uploaded.e_tag().unwrap_or_default().to_string(),
            size,
        })
    }

    async fn complete_upload(
        &self,
        key: &str,
        upload_id: &str,
        parts: &[CompletedPart],
    ) -> BlobResult<()> {
        let completed: Vec<S3CompletedPart> = parts
            .iter()
            .map(|part| {
                S3CompletedPart::builder()
                    .part_number(part.number as i32)
                    .e_tag(&part.etag)
                    .build()
            })
            .collect();
        self.client
            .complete_multipart_upload()
            .bucket(&self.bucket)
            .key(self.object_key(key))
            .upload_id(upload_id)
            .multipart_upload(
                CompletedMultipartUpload::builder()
                    .set_parts(Some(completed))
                    .build(),
            )
            .send()
            .await
            .map_err(classify)?;
        Ok(())
    }

    async fn abort_upload(&self, key: &str, upload_id: &str) -> BlobResult<()> {
        self.client
            .abort_multipart_upload()
            .bucket(&self.bucket)
            .key(self.object_key(key))
            .upload_id(upload_id)
            .send()
            .await
            .map_err(classify)?;
        Ok(())
    }

    async fn promote(&self, from: &str, to: &str) -> BlobResult<()> {
        self.client
            .copy_object()
            .bucket(&self.bucket)
            .copy_source(format!("{}/{}", self.bucket, self.object_key(from)))
            .key(self.object_key(to))
            .send()
            .await
            .map_err(classify)?;
        self.delete(from).await
    }
}
