//! S3 Storage Provider
//!
//! Implementation of the StorageProvider trait for Amazon S3 and S3-compatible storage
//! (MinIO, Ceph, Wasabi, ...).
//!
//! Requests go through reqwest and are signed with AWS Signature Version 4.
//! Directories are emulated with a delimiter scan: the server groups keys below the
//! queried prefix by the next `/` and returns them as common prefixes.

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use futures_util::StreamExt;
use quick_xml::events::Event;
use quick_xml::Reader;
use reqwest::header::{CONTENT_LENGTH, CONTENT_TYPE, LAST_MODIFIED};
use reqwest::{Client, Method, Response, StatusCode};
use secrecy::ExposeSecret;
use std::collections::BTreeMap;
use std::io::SeekFrom;
use tokio::io::{AsyncSeekExt, AsyncWriteExt};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use super::{
    cancellable, DownloadSink, Entry, ListPage, ProviderError, ProviderType, S3Config, StorageProvider,
    UploadSource, PATH_SEPARATOR,
};

const DELIMITER: &str = "/";
const UNSIGNED_PAYLOAD: &str = "UNSIGNED-PAYLOAD";
/// SHA-256 of an empty body
const EMPTY_PAYLOAD_SHA256: &str = "e3b0c44298fc1c149afbf4c8996fb92427ae41e4649b934ca495991b7852b855";

/// S3 Storage Provider
pub struct S3Provider {
    config: S3Config,
    client: Client,
}

/// Streamed request body, sent with an unsigned payload hash
struct Payload<'a> {
    body: reqwest::Body,
    length: u64,
    content_type: Option<&'a str>,
}

/// One `Contents` element of a ListObjects response
#[derive(Debug, Clone, PartialEq)]
struct ObjectSummary {
    key: String,
    size: u64,
    last_modified: Option<DateTime<Utc>>,
}

/// Parsed ListObjects (v1) response
#[derive(Debug, Default, PartialEq)]
struct ObjectListing {
    is_truncated: bool,
    next_marker: String,
    contents: Vec<ObjectSummary>,
    common_prefixes: Vec<String>,
}

impl S3Provider {
    /// Create a new S3 provider with the given configuration
    pub fn new(config: S3Config) -> Result<Self, ProviderError> {
        let client = Client::builder()
            .connect_timeout(std::time::Duration::from_secs(10))
            .danger_accept_invalid_certs(!config.verify_cert)
            .build()
            .map_err(|e| ProviderError::ConnectionFailed(format!("Failed to create HTTP client: {}", e)))?;

        Ok(Self { config, client })
    }

    /// Get the S3 endpoint URL
    fn endpoint(&self) -> String {
        if let Some(ref endpoint) = self.config.endpoint {
            endpoint.trim_end_matches('/').to_string()
        } else {
            format!("https://s3.{}.amazonaws.com", self.config.region)
        }
    }

    fn is_anonymous(&self) -> bool {
        self.config.access_key_id.is_empty() && self.config.secret_access_key.expose_secret().is_empty()
    }

    /// Full object key for a key relative to the configured root
    fn object_key(&self, key: &str) -> String {
        format!("{}{}", self.config.prefix, key.trim_start_matches(PATH_SEPARATOR))
    }

    /// Build URL for S3 operations. An empty bucket addresses the service itself.
    fn build_url(&self, bucket: &str, key: &str) -> String {
        let endpoint = self.endpoint();
        let key = encode_key(key.trim_start_matches('/'));

        if bucket.is_empty() {
            return format!("{}/", endpoint);
        }

        if self.config.path_style {
            // Path-style: https://endpoint/bucket/key
            if key.is_empty() {
                format!("{}/{}", endpoint, bucket)
            } else {
                format!("{}/{}/{}", endpoint, bucket, key)
            }
        } else {
            // Virtual-hosted style: https://bucket.endpoint/key
            let endpoint_without_scheme = endpoint.replace("https://", "").replace("http://", "");
            let scheme = if endpoint.starts_with("http://") { "http" } else { "https" };

            if key.is_empty() {
                format!("{}://{}.{}", scheme, bucket, endpoint_without_scheme)
            } else {
                format!("{}://{}.{}/{}", scheme, bucket, endpoint_without_scheme, key)
            }
        }
    }

    /// Sign a request using AWS Signature Version 4
    fn sign_request(
        &self,
        method: &str,
        url: &str,
        headers: &mut BTreeMap<String, String>,
        payload_hash: &str,
    ) -> Result<String, ProviderError> {
        use hmac::{Hmac, Mac};
        use sha2::{Digest, Sha256};

        type HmacSha256 = Hmac<Sha256>;

        let now: DateTime<Utc> = Utc::now();
        let date_stamp = now.format("%Y%m%d").to_string();
        let amz_date = now.format("%Y%m%dT%H%M%SZ").to_string();

        headers.insert("x-amz-date".to_string(), amz_date.clone());
        headers.insert("x-amz-content-sha256".to_string(), payload_hash.to_string());

        // Parse URL to get host and path
        let parsed = url::Url::parse(url).map_err(|e| ProviderError::InvalidConfig(e.to_string()))?;

        let host = match (parsed.host_str(), parsed.port()) {
            (Some(host), Some(port)) => format!("{}:{}", host, port),
            (Some(host), None) => host.to_string(),
            (None, _) => return Err(ProviderError::InvalidConfig(format!("No host in {}", url))),
        };
        let path = parsed.path();
        let query = parsed.query().unwrap_or("");

        headers.insert("host".to_string(), host);

        // Create canonical request, headers are kept sorted by the map
        let signed_headers_str = headers.keys().map(|k| k.as_str()).collect::<Vec<_>>().join(";");
        let canonical_headers: String = headers
            .iter()
            .map(|(k, v)| format!("{}:{}\n", k, v.trim()))
            .collect();

        let canonical_request = format!(
            "{}\n{}\n{}\n{}\n{}\n{}",
            method, path, query, canonical_headers, signed_headers_str, payload_hash
        );

        let canonical_request_hash = hex::encode(Sha256::digest(canonical_request.as_bytes()));

        // Create string to sign
        let credential_scope = format!("{}/{}/s3/aws4_request", date_stamp, self.config.region);
        let string_to_sign = format!(
            "AWS4-HMAC-SHA256\n{}\n{}\n{}",
            amz_date, credential_scope, canonical_request_hash
        );

        // Calculate signature
        fn hmac_sha256(key: &[u8], data: &[u8]) -> Result<Vec<u8>, ProviderError> {
            let mut mac = HmacSha256::new_from_slice(key)
                .map_err(|e| ProviderError::InvalidConfig(format!("Signing key rejected: {}", e)))?;
            mac.update(data);
            Ok(mac.finalize().into_bytes().to_vec())
        }

        let k_date = hmac_sha256(
            format!("AWS4{}", self.config.secret_access_key.expose_secret()).as_bytes(),
            date_stamp.as_bytes(),
        )?;
        let k_region = hmac_sha256(&k_date, self.config.region.as_bytes())?;
        let k_service = hmac_sha256(&k_region, b"s3")?;
        let k_signing = hmac_sha256(&k_service, b"aws4_request")?;
        let signature = hex::encode(hmac_sha256(&k_signing, string_to_sign.as_bytes())?);

        // Create authorization header
        Ok(format!(
            "AWS4-HMAC-SHA256 Credential={}/{}, SignedHeaders={}, Signature={}",
            self.config.access_key_id, credential_scope, signed_headers_str, signature
        ))
    }

    /// Make a (signed unless anonymous) request to S3
    async fn s3_request(
        &self,
        method: Method,
        bucket: &str,
        key: &str,
        query_params: &[(&str, &str)],
        payload: Option<Payload<'_>>,
    ) -> Result<Response, ProviderError> {
        let mut url = self.build_url(bucket, key);
        let query = canonical_query(query_params);
        if !query.is_empty() {
            url = format!("{}?{}", url, query);
        }

        let mut request = self.client.request(method.clone(), &url);

        if !self.is_anonymous() {
            let payload_hash = if payload.is_some() { UNSIGNED_PAYLOAD } else { EMPTY_PAYLOAD_SHA256 };
            let mut headers = BTreeMap::new();
            let authorization = self.sign_request(method.as_str(), &url, &mut headers, payload_hash)?;
            for (name, value) in headers {
                request = request.header(name, value);
            }
            request = request.header("Authorization", authorization);
        }

        if let Some(payload) = payload {
            request = request
                .header(CONTENT_LENGTH, payload.length)
                .header(CONTENT_TYPE, payload.content_type.unwrap_or("application/octet-stream"))
                .body(payload.body);
        }

        Ok(request.send().await?)
    }

    /// Turn a non-success response into an error
    async fn status_error(response: Response, target: &str) -> ProviderError {
        let status = response.status();
        let body = response.text().await.unwrap_or_default();
        let detail = parse_error_body(&body)
            .map(|(code, message)| format!("{}: {}", code, message))
            .unwrap_or_else(|| status.to_string());

        match status {
            StatusCode::UNAUTHORIZED => ProviderError::AuthenticationFailed(detail),
            StatusCode::FORBIDDEN => ProviderError::PermissionDenied(detail),
            StatusCode::NOT_FOUND => ProviderError::NotFound(target.to_string()),
            _ => ProviderError::ServerError(format!("{} ({})", detail, status)),
        }
    }

    fn require_bucket(&self) -> Result<(), ProviderError> {
        if self.config.bucket.is_empty() {
            return Err(ProviderError::InvalidConfig("Bucket name is required".to_string()));
        }
        Ok(())
    }

    async fn list_page(&self, path: &str, cursor: &str) -> Result<ListPage, ProviderError> {
        self.require_bucket()?;
        let prefix = self.object_key(path);

        let mut params: Vec<(&str, &str)> = vec![("delimiter", DELIMITER), ("prefix", prefix.as_str())];
        if !cursor.is_empty() {
            params.push(("marker", cursor));
        }
        let page_size = self.config.page_size.map(|n| n.to_string());
        if let Some(ref max_keys) = page_size {
            params.push(("max-keys", max_keys.as_str()));
        }

        let response = self.s3_request(Method::GET, &self.config.bucket, "", &params, None).await?;
        if !response.status().is_success() {
            return Err(Self::status_error(response, &prefix).await);
        }
        let xml = response.text().await?;
        let listing = parse_list_objects(&xml)?;
        Ok(page_from_listing(&prefix, listing))
    }

    /// List all buckets visible to the configured credentials
    pub async fn list_buckets(&self, cancel: &CancellationToken) -> Result<Vec<String>, ProviderError> {
        let result = cancellable(cancel, async {
            let response = self.s3_request(Method::GET, "", "", &[], None).await?;
            if !response.status().is_success() {
                return Err(Self::status_error(response, "buckets").await);
            }
            let xml = response.text().await?;
            parse_bucket_names(&xml)
        })
        .await;

        result.map_err(|e| ProviderError::context("list buckets", self.endpoint(), e))
    }
}

/// Percent-encode each key segment, keeping the separators
fn encode_key(key: &str) -> String {
    key.split(PATH_SEPARATOR)
        .map(|segment| urlencoding::encode(segment).into_owned())
        .collect::<Vec<_>>()
        .join("/")
}

/// Sorted, encoded query string, identical to the canonical query SigV4 signs
fn canonical_query(params: &[(&str, &str)]) -> String {
    let mut pairs: Vec<(String, String)> = params
        .iter()
        .map(|(k, v)| (urlencoding::encode(k).into_owned(), urlencoding::encode(v).into_owned()))
        .collect();
    pairs.sort();
    pairs
        .into_iter()
        .map(|(k, v)| format!("{}={}", k, v))
        .collect::<Vec<_>>()
        .join("&")
}

/// Build a page relative to `prefix`: common prefixes first, then contents.
///
/// A truncated response without `NextMarker` continues after the greatest key
/// seen on the page, whether that was an object or a common prefix.
fn page_from_listing(prefix: &str, listing: ObjectListing) -> ListPage {
    let mut entries = Vec::with_capacity(listing.common_prefixes.len() + listing.contents.len());

    for common in &listing.common_prefixes {
        let name = common.strip_prefix(prefix).unwrap_or(common);
        if !name.is_empty() {
            entries.push(Entry::directory(name));
        }
    }

    for object in &listing.contents {
        let name = object.key.strip_prefix(prefix).unwrap_or(&object.key);
        // The directory marker object itself
        if name.is_empty() {
            continue;
        }
        entries.push(Entry::file(name, object.size, object.last_modified));
    }

    let next_cursor = if !listing.is_truncated {
        String::new()
    } else if !listing.next_marker.is_empty() {
        listing.next_marker
    } else {
        let last_key = listing.contents.last().map(|o| o.key.as_str());
        let last_prefix = listing.common_prefixes.last().map(|p| p.as_str());
        match last_key.max(last_prefix) {
            Some(last) => last.to_string(),
            None => {
                warn!("S3 response truncated with no keys under {}, stopping", prefix);
                String::new()
            }
        }
    };

    ListPage::new(entries, next_cursor)
}

/// Walk an XML document, reporting each closed element with its ancestors and text
fn walk_xml<F>(xml: &str, mut on_close: F) -> Result<(), ProviderError>
where
    F: FnMut(&[Vec<u8>], &[u8], &str),
{
    let mut reader = Reader::from_str(xml);
    let mut stack: Vec<Vec<u8>> = Vec::new();
    let mut text = String::new();
    let mut buf = Vec::new();

    loop {
        match reader.read_event_into(&mut buf) {
            Ok(Event::Start(ref e)) => {
                stack.push(e.local_name().as_ref().to_vec());
                text.clear();
            }
            Ok(Event::Text(ref e)) => text.push_str(&String::from_utf8_lossy(e)),
            Ok(Event::CData(ref e)) => text.push_str(&String::from_utf8_lossy(e)),
            Ok(Event::GeneralRef(ref e)) => push_reference(&mut text, e),
            Ok(Event::End(_)) => {
                if let Some(name) = stack.pop() {
                    on_close(&stack, &name, &text);
                }
                text.clear();
            }
            Ok(Event::Eof) => break,
            Err(e) => return Err(ProviderError::ParseError(format!("S3 XML: {}", e))),
            _ => {}
        }
        buf.clear();
    }
    Ok(())
}

/// Resolve `&name;` references (predefined entities and character references)
fn push_reference(out: &mut String, name: &[u8]) {
    let resolved = match name {
        b"lt" => Some('<'),
        b"gt" => Some('>'),
        b"amp" => Some('&'),
        b"apos" => Some('\''),
        b"quot" => Some('"'),
        _ => {
            let name = String::from_utf8_lossy(name);
            let code = if let Some(hex) = name.strip_prefix("#x").or_else(|| name.strip_prefix("#X")) {
                u32::from_str_radix(hex, 16).ok()
            } else if let Some(dec) = name.strip_prefix('#') {
                dec.parse().ok()
            } else {
                None
            };
            match code.and_then(char::from_u32) {
                Some(c) => Some(c),
                None => {
                    out.push('&');
                    out.push_str(&name);
                    out.push(';');
                    None
                }
            }
        }
    };
    if let Some(c) = resolved {
        out.push(c);
    }
}

fn parse_list_objects(xml: &str) -> Result<ObjectListing, ProviderError> {
    let mut listing = ObjectListing::default();
    let mut current = ObjectSummary {
        key: String::new(),
        size: 0,
        last_modified: None,
    };

    walk_xml(xml, |parents, name, text| {
        let parent = parents.last().map(|p| p.as_slice());
        match (parent, name) {
            (Some(b"ListBucketResult"), b"IsTruncated") => listing.is_truncated = text.trim() == "true",
            (Some(b"ListBucketResult"), b"NextMarker") => listing.next_marker = text.to_string(),
            (Some(b"Contents"), b"Key") => current.key = text.to_string(),
            (Some(b"Contents"), b"Size") => current.size = text.trim().parse().unwrap_or(0),
            (Some(b"Contents"), b"LastModified") => {
                current.last_modified = DateTime::parse_from_rfc3339(text.trim())
                    .ok()
                    .map(|d| d.with_timezone(&Utc));
            }
            (_, b"Contents") => {
                let done = std::mem::replace(
                    &mut current,
                    ObjectSummary {
                        key: String::new(),
                        size: 0,
                        last_modified: None,
                    },
                );
                listing.contents.push(done);
            }
            (Some(b"CommonPrefixes"), b"Prefix") => listing.common_prefixes.push(text.to_string()),
            _ => {}
        }
    })?;

    Ok(listing)
}

fn parse_bucket_names(xml: &str) -> Result<Vec<String>, ProviderError> {
    let mut names = Vec::new();
    walk_xml(xml, |parents, name, text| {
        if name == b"Name" && parents.last().map(|p| p.as_slice()) == Some(b"Bucket".as_slice()) {
            names.push(text.to_string());
        }
    })?;
    Ok(names)
}

/// `(Code, Message)` of an S3 `<Error>` body
fn parse_error_body(xml: &str) -> Option<(String, String)> {
    if xml.trim().is_empty() {
        return None;
    }
    let mut code = String::new();
    let mut message = String::new();
    walk_xml(xml, |parents, name, text| {
        if parents.last().map(|p| p.as_slice()) == Some(b"Error".as_slice()) {
            match name {
                b"Code" => code = text.to_string(),
                b"Message" => message = text.to_string(),
                _ => {}
            }
        }
    })
    .ok()?;
    (!code.is_empty()).then_some((code, message))
}

#[async_trait]
impl StorageProvider for S3Provider {
    fn provider_type(&self) -> ProviderType {
        ProviderType::S3
    }

    fn display_name(&self) -> String {
        let root = format!("{}/{}", self.config.bucket, self.config.prefix);
        let root = root.trim_end_matches('/');
        if self.config.endpoint.is_some() {
            format!("s3://{} ({})", root, self.endpoint())
        } else {
            format!("s3://{} ({})", root, self.config.region)
        }
    }

    async fn list(&self, path: &str, cursor: &str, cancel: &CancellationToken) -> Result<ListPage, ProviderError> {
        debug!("S3 list path={:?} cursor={:?}", path, cursor);
        cancellable(cancel, self.list_page(path, cursor))
            .await
            .map_err(|e| ProviderError::context("list", path, e))
    }

    async fn upload(
        &self,
        mut source: Box<dyn UploadSource>,
        key: &str,
        content_type: Option<&str>,
        cancel: &CancellationToken,
    ) -> Result<(), ProviderError> {
        let object_key = self.object_key(key);
        let result = cancellable(cancel, async {
            self.require_bucket()?;
            let length = source.seek(SeekFrom::End(0)).await?;
            source.rewind().await?;

            let payload = Payload {
                body: reqwest::Body::wrap_stream(tokio_util::io::ReaderStream::new(source)),
                length,
                content_type,
            };
            let response = self
                .s3_request(Method::PUT, &self.config.bucket, &object_key, &[], Some(payload))
                .await?;
            if !response.status().is_success() {
                return Err(Self::status_error(response, &object_key).await);
            }
            Ok(length)
        })
        .await;

        match result {
            Ok(length) => {
                info!("Uploaded {} bytes to {}", length, object_key);
                Ok(())
            }
            Err(e) => {
                warn!("S3 upload of {} failed: {}", object_key, e);
                Err(ProviderError::context("upload", key, e))
            }
        }
    }

    async fn download(
        &self,
        sink: &mut dyn DownloadSink,
        key: &str,
        cancel: &CancellationToken,
    ) -> Result<(), ProviderError> {
        let object_key = self.object_key(key);
        let result = cancellable(cancel, async {
            self.require_bucket()?;
            let response = self
                .s3_request(Method::GET, &self.config.bucket, &object_key, &[], None)
                .await?;
            if !response.status().is_success() {
                return Err(Self::status_error(response, &object_key).await);
            }

            // Chunked writes instead of buffering the whole object
            let mut stream = response.bytes_stream();
            let mut received: u64 = 0;
            while let Some(chunk) = stream.next().await {
                let chunk = chunk?;
                sink.write_all(&chunk).await?;
                received += chunk.len() as u64;
            }
            sink.flush().await?;
            Ok(received)
        })
        .await;

        match result {
            Ok(received) => {
                info!("Downloaded {} bytes from {}", received, object_key);
                Ok(())
            }
            Err(e) => {
                warn!("S3 download of {} failed: {}", object_key, e);
                Err(ProviderError::context("download", key, e))
            }
        }
    }

    async fn delete(&self, key: &str, cancel: &CancellationToken) -> Result<(), ProviderError> {
        let object_key = self.object_key(key);
        let result = cancellable(cancel, async {
            self.require_bucket()?;
            let response = self
                .s3_request(Method::DELETE, &self.config.bucket, &object_key, &[], None)
                .await?;
            match response.status() {
                StatusCode::OK | StatusCode::NO_CONTENT | StatusCode::ACCEPTED => Ok(()),
                _ => Err(Self::status_error(response, &object_key).await),
            }
        })
        .await;

        match result {
            Ok(()) => {
                info!("Deleted {}", object_key);
                Ok(())
            }
            Err(e) => {
                warn!("S3 delete of {} failed: {}", object_key, e);
                Err(ProviderError::context("delete", key, e))
            }
        }
    }

    async fn stat(&self, key: &str, cancel: &CancellationToken) -> Result<Entry, ProviderError> {
        let object_key = self.object_key(key);
        let result = cancellable(cancel, async {
            self.require_bucket()?;
            // Use HEAD request to get object metadata
            let response = self
                .s3_request(Method::HEAD, &self.config.bucket, &object_key, &[], None)
                .await?;
            if !response.status().is_success() {
                return Err(Self::status_error(response, &object_key).await);
            }

            let headers = response.headers();
            let size = headers
                .get(CONTENT_LENGTH)
                .and_then(|v| v.to_str().ok())
                .and_then(|s| s.parse().ok())
                .unwrap_or(0);
            let modified = headers
                .get(LAST_MODIFIED)
                .and_then(|v| v.to_str().ok())
                .and_then(|s| DateTime::parse_from_rfc2822(s).ok())
                .map(|d| d.with_timezone(&Utc));
            let content_type = headers
                .get(CONTENT_TYPE)
                .and_then(|v| v.to_str().ok())
                .map(|s| s.to_string());

            Ok(Entry::file(key.trim_start_matches(PATH_SEPARATOR), size, modified).with_content_type(content_type))
        })
        .await;

        result.map_err(|e| ProviderError::context("stat", key, e))
    }

    async fn close(&self) -> Result<(), ProviderError> {
        // Stateless HTTP, nothing to release
        Ok(())
    }
}
