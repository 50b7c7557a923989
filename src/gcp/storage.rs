use super::{TokenSource, check_status};
use crate::backends::{BackendError, ObjectStore, StoredObject};
use async_trait::async_trait;
use reqwest::{Client, header::CONTENT_TYPE};
use tracing::debug;

/// Simple media uploads into one Cloud Storage bucket.
#[derive(Clone)]
pub struct GcsObjectStore {
    http: Client,
    tokens: TokenSource,
    base_url: String,
    bucket: String,
}

impl GcsObjectStore {
    pub fn new(http: Client, tokens: TokenSource, base_url: &str, bucket: &str) -> Self {
        Self {
            http,
            tokens,
            base_url: base_url.to_string(),
            bucket: bucket.to_string(),
        }
    }

    fn upload_url(&self, name: &str) -> String {
        format!(
            "{}/upload/storage/v1/b/{}/o?uploadType=media&name={}",
            self.base_url,
            self.bucket,
            urlencoding::encode(name)
        )
    }
}

#[async_trait]
impl ObjectStore for GcsObjectStore {
    async fn put_object(
        &self,
        name: &str,
        content_type: Option<&str>,
        bytes: Vec<u8>,
    ) -> Result<StoredObject, BackendError> {
        let token = self.tokens.token().await?;
        let size = bytes.len();
        let response = self
            .http
            .post(self.upload_url(name))
            .bearer_auth(token)
            .header(CONTENT_TYPE, content_type.unwrap_or("application/octet-stream"))
            .body(bytes)
            .send()
            .await
            .map_err(|err| BackendError::Request(err.to_string()))?;
        check_status(response, "storage upload").await?;
        debug!(target = "harvest.gcp", bucket = %self.bucket, %name, bytes = size, "object_uploaded");
        Ok(StoredObject {
            bucket: self.bucket.clone(),
            name: name.to_string(),
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn upload_url_encodes_object_name() {
        let store = GcsObjectStore::new(
            Client::new(),
            TokenSource::new(Client::new(), Some("t".into())),
            "https://storage.googleapis.com",
            "hades-bucket",
        );
        assert_eq!(
            store.upload_url("a b/c"),
            "https://storage.googleapis.com/upload/storage/v1/b/hades-bucket/o?uploadType=media&name=a%20b%2Fc"
        );
    }
}
