//! S3 backend on `aws-sdk-s3`.

use async_trait::async_trait;
use aws_sdk_s3::Client;
use aws_sdk_s3::config::{Credentials, Region};
use aws_sdk_s3::error::DisplayErrorContext;
use aws_sdk_s3::primitives::ByteStream;
use aws_sdk_s3::types::{MetadataDirective, StorageClass};
use percent_encoding::{AsciiSet, NON_ALPHANUMERIC, utf8_percent_encode};
use serde::Deserialize;

use super::{ObjectStore, RemoteObject, StorageTier, StoreError};

/// Characters left as-is in an encoded copy source (RFC 3986 unreserved plus `/`).
const COPY_SOURCE: &AsciiSet = &NON_ALPHANUMERIC
    .remove(b'/')
    .remove(b'-')
    .remove(b'_')
    .remove(b'.')
    .remove(b'~');

#[derive(Debug, Clone, Default, Deserialize)]
#[serde(default)]
pub struct S3Config {
    pub bucket: String,
    /// Falls back to the SDK's region provider chain.
    pub region: Option<String>,
    /// Custom endpoint for S3-compatible stores.
    pub endpoint_url: Option<String>,
    pub force_path_style: bool,
    pub cache_control: Option<String>,
    /// Static keys; without them the SDK's default credential chain is used.
    #[serde(skip)]
    pub credentials: Option<StaticCredentials>,
}

#[derive(Clone)]
pub struct StaticCredentials {
    pub access_key_id: String,
    pub secret_access_key: String,
}

impl std::fmt::Debug for StaticCredentials {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("StaticCredentials")
            .field("access_key_id", &self.access_key_id)
            .field("secret_access_key", &"<redacted>")
            .finish()
    }
}

pub struct S3Store {
    client: Client,
    bucket: String,
    cache_control: Option<String>,
}

impl S3Store {
    pub async fn new(config: S3Config) -> Self {
        let mut loader = aws_config::defaults(aws_config::BehaviorVersion::latest());
        if let Some(region) = &config.region {
            loader = loader.region(Region::new(region.clone()));
        }
        if let Some(endpoint) = &config.endpoint_url {
            loader = loader.endpoint_url(endpoint);
        }
        if let Some(creds) = &config.credentials {
            loader = loader.credentials_provider(Credentials::new(
                creds.access_key_id.clone(),
                creds.secret_access_key.clone(),
                None,
                None,
                "tiersync",
            ));
        }
        let sdk_config = loader.load().await;

        let s3_config = aws_sdk_s3::config::Builder::from(&sdk_config)
            .force_path_style(config.force_path_style)
            .build();

        Self {
            client: Client::from_conf(s3_config),
            bucket: config.bucket,
            cache_control: config.cache_control,
        }
    }

    fn copy_source(bucket: &str, key: &str) -> String {
        format!("{bucket}/{}", utf8_percent_encode(key, COPY_SOURCE))
    }

    fn remote_err<E>(operation: &'static str, key: &str) -> impl FnOnce(E) -> StoreError
    where
        E: std::error::Error,
    {
        let key = key.to_string();
        move |e| StoreError::Remote {
            operation,
            key,
            message: DisplayErrorContext(e).to_string(),
        }
    }
}

#[async_trait]
impl ObjectStore for S3Store {
    async fn list(&self, prefix: &str) -> Result<Vec<RemoteObject>, StoreError> {
        let mut objects = Vec::new();
        let mut continuation: Option<String> = None;

        loop {
            let page = self
                .client
                .list_objects_v2()
                .bucket(&self.bucket)
                .prefix(prefix)
                .set_continuation_token(continuation.take())
                .send()
                .await
                .map_err(Self::remote_err("ListObjectsV2", prefix))?;

            for object in page.contents() {
                let Some(key) = object.key() else {
                    continue;
                };
                objects.push(RemoteObject {
                    key: key.to_string(),
                    size: object.size().unwrap_or_default().max(0) as u64,
                    storage_class: object.storage_class().map(|c| c.as_str().to_string()),
                });
            }

            match page.next_continuation_token() {
                Some(token) => continuation = Some(token.to_string()),
                None => break,
            }
        }

        tracing::debug!(bucket = %self.bucket, prefix, count = objects.len(), "Listed objects");
        Ok(objects)
    }

    async fn put(
        &self,
        key: &str,
        body: Vec<u8>,
        tier: StorageTier,
        content_type: &str,
    ) -> Result<(), StoreError> {
        self.client
            .put_object()
            .bucket(&self.bucket)
            .key(key)
            .body(ByteStream::from(body))
            .storage_class(StorageClass::from(tier.as_str()))
            .content_type(content_type)
            .set_cache_control(self.cache_control.clone())
            .send()
            .await
            .map_err(Self::remote_err("PutObject", key))?;
        Ok(())
    }

    async fn copy(
        &self,
        source_key: &str,
        dest_key: &str,
        tier: StorageTier,
    ) -> Result<(), StoreError> {
        self.client
            .copy_object()
            .copy_source(Self::copy_source(&self.bucket, source_key))
            .bucket(&self.bucket)
            .key(dest_key)
            .storage_class(StorageClass::from(tier.as_str()))
            .metadata_directive(MetadataDirective::Copy)
            .send()
            .await
            .map_err(Self::remote_err("CopyObject", dest_key))?;
        Ok(())
    }

    async fn delete(&self, key: &str) -> Result<(), StoreError> {
        self.client
            .delete_object()
            .bucket(&self.bucket)
            .key(key)
            .send()
            .await
            .map_err(Self::remote_err("DeleteObject", key))?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn copy_source_encodes_key_but_keeps_slashes() {
        assert_eq!(
            S3Store::copy_source("tokens", "fa/Tokens/CR_1∕2/Goblin Boss_01.avif"),
            "tokens/fa/Tokens/CR_1%E2%88%952/Goblin%20Boss_01.avif"
        );
        assert_eq!(
            S3Store::copy_source("b", "a-b_c.d~e/f+g"),
            "b/a-b_c.d~e/f%2Bg"
        );
    }

    #[test]
    fn credentials_are_redacted_in_debug_output() {
        let creds = StaticCredentials {
            access_key_id: "AKIDEXAMPLE".into(),
            secret_access_key: "very-secret".into(),
        };
        let debug = format!("{creds:?}");
        assert!(debug.contains("AKIDEXAMPLE"));
        assert!(!debug.contains("very-secret"));
    }

    #[test]
    fn config_defaults_leave_sdk_chain_in_charge() {
        let config: S3Config = serde_json::from_str(r#"{"bucket": "tokens"}"#).unwrap();
        assert_eq!(config.bucket, "tokens");
        assert!(config.region.is_none());
        assert!(config.endpoint_url.is_none());
        assert!(!config.force_path_style);
        assert!(config.credentials.is_none());
    }
}
