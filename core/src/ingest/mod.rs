//! Context Ingestor (C2): turns pasted text, an uploaded file, or a fetched URL into
//! an active [`crate::store::RuleContextRow`]. Every ingested row is immediately
//! persisted through the [`Store`](crate::store::Store); callers are responsible for
//! requesting a retrieval-index rebuild afterwards (this module never reaches into
//! C3 directly, keeping the dependency direction one-way).

use std::time::Duration;

use thiserror::Error;

use crate::store::{RuleContextSource, RuleContextRow, Store, StoreError};

#[derive(Debug, Error)]
pub enum IngestError {
    #[error("unsupported mime: {0}")]
    UnsupportedMime(String),
    #[error("oversize: {0}")]
    Oversize(String),
    #[error("too many redirects")]
    TooManyRedirects,
    #[error("timeout")]
    Timeout,
    #[error("network: {0}")]
    Network(String),
    #[error("decode: {0}")]
    Decode(String),
    #[error(transparent)]
    Store(#[from] StoreError),
}

/// MIME types the ingestor accepts for uploaded files.
const ALLOWED_MIMES: &[&str] = &["text/plain", "text/markdown", "application/json"];

/// MIME types a fetched URL's preflight may report: `text/*` plus a short list of
/// text-shaped structured formats.
const ALLOWED_URL_MIMES: &[&str] = &["application/xhtml+xml", "application/json", "application/xml"];

fn mime_allowed(mime: &str) -> bool {
    let base = mime.split(';').next().unwrap_or(mime).trim();
    ALLOWED_MIMES.contains(&base)
}

fn mime_allowed_for_url(mime: &str) -> bool {
    let base = mime.split(';').next().unwrap_or(mime).trim();
    base.starts_with("text/") || ALLOWED_URL_MIMES.contains(&base)
}

/// Pulls readable text out of uploaded bytes given their MIME type. A pure function by
/// design: no I/O, no store access, easy to unit test and to swap for a richer
/// extractor (PDF, docx, ...) later without touching the rest of the ingestor.
pub trait Extractor: Send + Sync {
    fn extract(&self, bytes: &[u8], mime: &str) -> Result<String, IngestError>;
}

/// Default extractor: decodes bytes as UTF-8 text. MIME admission is the caller's
/// job (`ingest_file` and `ingest_url` each gate against their own allowlist before
/// ever reaching here), so this never re-checks it.
pub struct PlainTextExtractor;

impl Extractor for PlainTextExtractor {
    fn extract(&self, bytes: &[u8], _mime: &str) -> Result<String, IngestError> {
        String::from_utf8(bytes.to_vec()).map_err(|e| IngestError::Decode(e.to_string()))
    }
}

pub struct IngestLimits {
    pub max_upload_bytes: u64,
    pub max_url_bytes: u64,
    pub url_timeout: Duration,
    pub max_redirects: u8,
}

pub struct Ingestor {
    store: Store,
    limits: IngestLimits,
    extractor: Box<dyn Extractor>,
    http: reqwest::Client,
}

impl Ingestor {
    pub fn new(store: Store, limits: IngestLimits) -> Self {
        let http = reqwest::Client::builder()
            .connect_timeout(limits.url_timeout)
            .timeout(limits.url_timeout)
            .redirect(reqwest::redirect::Policy::none())
            .build()
            .expect("reqwest client builds with static config");
        Self {
            store,
            limits,
            extractor: Box::new(PlainTextExtractor),
            http,
        }
    }

    pub fn with_extractor(mut self, extractor: Box<dyn Extractor>) -> Self {
        self.extractor = extractor;
        self
    }

    /// Ingests pasted text verbatim (trimmed of leading/trailing whitespace). An empty
    /// trimmed body is rejected so a stray paste doesn't create a useless active row.
    pub async fn ingest_text(
        &self,
        session_id: Option<String>,
        text: &str,
    ) -> Result<RuleContextRow, IngestError> {
        let trimmed = text.trim();
        if trimmed.is_empty() {
            return Err(IngestError::Decode("pasted text is empty".into()));
        }
        if trimmed.len() as u64 > self.limits.max_upload_bytes {
            return Err(IngestError::Oversize(format!(
                "text is {} bytes, cap is {}",
                trimmed.len(),
                self.limits.max_upload_bytes
            )));
        }
        Ok(self
            .store
            .insert_rule_context(session_id, RuleContextSource::Text, trimmed, None)
            .await?)
    }

    /// Ingests an uploaded file. `declared_mime` is what the client sent; it alone
    /// decides MIME admission (no sniffing beyond what [`Extractor::extract`] itself
    /// enforces), matching the fixed allowlist this host supports.
    pub async fn ingest_file(
        &self,
        session_id: Option<String>,
        filename: &str,
        bytes: &[u8],
        declared_mime: &str,
    ) -> Result<RuleContextRow, IngestError> {
        if bytes.len() as u64 > self.limits.max_upload_bytes {
            return Err(IngestError::Oversize(format!(
                "file is {} bytes, cap is {}",
                bytes.len(),
                self.limits.max_upload_bytes
            )));
        }
        if !mime_allowed(declared_mime) {
            return Err(IngestError::UnsupportedMime(declared_mime.to_string()));
        }
        let content = self.extractor.extract(bytes, declared_mime)?;
        Ok(self
            .store
            .insert_rule_context(
                session_id,
                RuleContextSource::File,
                &content,
                Some(filename.to_string()),
            )
            .await?)
    }

    /// Fetches a URL and ingests its body. Restricted to `http`/`https`, a bounded
    /// number of redirects (each followed manually so the byte cap and MIME allowlist
    /// apply to the *final* response, not a redirect hop), and a streamed read so an
    /// oversize body is rejected without buffering the whole thing first.
    pub async fn ingest_url(
        &self,
        session_id: Option<String>,
        url: &str,
    ) -> Result<RuleContextRow, IngestError> {
        // Preflight: a HEAD must clear the size cap and MIME allowlist before any GET
        // is issued, so a rejected URL never causes the body to be read at all.
        let (final_url, head) = self.resolve_redirects(url, reqwest::Method::HEAD).await?;
        if !head.status().is_success() {
            return Err(IngestError::Network(format!(
                "unexpected status: {}",
                head.status()
            )));
        }
        let mime = head
            .headers()
            .get(reqwest::header::CONTENT_TYPE)
            .and_then(|v| v.to_str().ok())
            .unwrap_or("text/plain")
            .to_string();
        if !mime_allowed_for_url(&mime) {
            return Err(IngestError::UnsupportedMime(mime));
        }
        if let Some(len) = head.content_length() {
            if len > self.limits.max_url_bytes {
                return Err(IngestError::Oversize(format!(
                    "Content-Length {len} exceeds cap {}",
                    self.limits.max_url_bytes
                )));
            }
        }

        let response = self
            .http
            .get(final_url)
            .send()
            .await
            .map_err(Self::map_reqwest_err)?;
        if !response.status().is_success() {
            return Err(IngestError::Network(format!(
                "unexpected status: {}",
                response.status()
            )));
        }
        // The GET may report a different Content-Type/Length than the HEAD did; the
        // cap and allowlist are re-checked here and the streamed read below still
        // enforces the cap even if neither header is present.
        let get_mime = response
            .headers()
            .get(reqwest::header::CONTENT_TYPE)
            .and_then(|v| v.to_str().ok())
            .unwrap_or(mime.as_str())
            .to_string();
        if !mime_allowed_for_url(&get_mime) {
            return Err(IngestError::UnsupportedMime(get_mime));
        }
        if let Some(len) = response.content_length() {
            if len > self.limits.max_url_bytes {
                return Err(IngestError::Oversize(format!(
                    "Content-Length {len} exceeds cap {}",
                    self.limits.max_url_bytes
                )));
            }
        }

        let cap = self.limits.max_url_bytes;
        let mut body = Vec::new();
        let mut stream = response.bytes_stream();
        use futures_util::StreamExt;
        while let Some(chunk) = stream.next().await {
            let chunk = chunk.map_err(Self::map_reqwest_err)?;
            body.extend_from_slice(&chunk);
            if body.len() as u64 > cap {
                return Err(IngestError::Oversize(format!(
                    "body exceeded cap {cap} bytes while streaming"
                )));
            }
        }

        let content = self.extractor.extract(&body, &get_mime)?;
        Ok(self
            .store
            .insert_rule_context(session_id, RuleContextSource::Url, &content, Some(url.to_string()))
            .await?)
    }

    /// Follows redirects manually (bounded by `max_redirects`) using a cheap probe
    /// method, returning the final URL without ever reading a response body.
    async fn resolve_redirects(
        &self,
        url: &str,
        probe_method: reqwest::Method,
    ) -> Result<(reqwest::Url, reqwest::Response), IngestError> {
        let mut current = url.to_string();
        let mut hops = 0u8;
        loop {
            let parsed =
                reqwest::Url::parse(&current).map_err(|e| IngestError::Network(e.to_string()))?;
            if parsed.scheme() != "http" && parsed.scheme() != "https" {
                return Err(IngestError::Network(format!(
                    "unsupported scheme: {}",
                    parsed.scheme()
                )));
            }
            let resp = self
                .http
                .request(probe_method.clone(), parsed.clone())
                .send()
                .await
                .map_err(Self::map_reqwest_err)?;
            if !resp.status().is_redirection() {
                return Ok((parsed, resp));
            }
            hops += 1;
            if hops > self.limits.max_redirects {
                return Err(IngestError::TooManyRedirects);
            }
            let location = resp
                .headers()
                .get(reqwest::header::LOCATION)
                .and_then(|v| v.to_str().ok())
                .ok_or_else(|| IngestError::Network("redirect without Location".into()))?
                .to_string();
            current = location;
        }
    }

    fn map_reqwest_err(e: reqwest::Error) -> IngestError {
        if e.is_timeout() {
            IngestError::Timeout
        } else {
            IngestError::Network(e.to_string())
        }
    }
}
