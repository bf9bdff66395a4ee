//! 凭证：请求签名策略。
//!
//! Credentials sign each attempt just before it reaches the wire, so retries
//! carry a fresh `x-ms-date` and signature.
//!
//! - [`AnonymousCredential`]: no signing. Use it for public resources or URLs
//!   that already embed a SAS token. The pipeline omits its stage entirely.
//! - [`SharedKeyCredential`]: account name + base64 account key, signed with
//!   HMAC-SHA256 into the `Authorization: SharedKey` header.

use std::collections::BTreeMap;
use std::fmt;
use std::sync::Arc;

use arc_swap::ArcSwap;
use base64::engine::general_purpose::STANDARD as BASE64;
use base64::Engine;
use chrono::{DateTime, Utc};
use hmac::{Hmac, Mac};
use reqwest::header::{self, HeaderValue};
use sha2::Sha256;

use crate::context::Context;
use crate::pipeline::{Policy, PolicyFactory, PolicyOptions, PolicyRef};
use crate::request::{Request, Response};
use crate::{Error, Result};

type HmacSha256 = Hmac<Sha256>;

/// Header carrying the signing time.
pub const DATE_HEADER: &str = "x-ms-date";

/// Signs outgoing requests.
pub trait Credential: Send + Sync + fmt::Debug {
    fn sign(&self, request: &mut Request) -> Result<()>;

    /// Anonymous credentials are skipped when the pipeline is composed.
    fn is_anonymous(&self) -> bool {
        false
    }
}

/// Leaves requests untouched.
#[derive(Debug, Clone, Copy, Default)]
pub struct AnonymousCredential;

impl Credential for AnonymousCredential {
    fn sign(&self, _request: &mut Request) -> Result<()> {
        Ok(())
    }

    fn is_anonymous(&self) -> bool {
        true
    }
}

/// Storage account name and key.
pub struct SharedKeyCredential {
    account_name: String,
    key: ArcSwap<Vec<u8>>,
}

impl SharedKeyCredential {
    /// `account_key` is the base64 key shown for the storage account.
    pub fn new(account_name: impl Into<String>, account_key: &str) -> Result<Self> {
        let account_name = account_name.into();
        if account_name.trim().is_empty() {
            return Err(Error::credential("account name must not be empty"));
        }
        Ok(Self {
            account_name,
            key: ArcSwap::from_pointee(decode_key(account_key)?),
        })
    }

    pub fn account_name(&self) -> &str {
        &self.account_name
    }

    /// Replace the key, e.g. after rotation. In-flight signatures keep the old key.
    pub fn set_account_key(&self, account_key: &str) -> Result<()> {
        self.key.store(Arc::new(decode_key(account_key)?));
        Ok(())
    }

    /// Sign as of `now`.
    pub(crate) fn sign_at(&self, request: &mut Request, now: DateTime<Utc>) -> Result<()> {
        let date = now.format("%a, %d %b %Y %H:%M:%S GMT").to_string();
        request.set_header(DATE_HEADER, &date)?;

        let string_to_sign = self.string_to_sign(request);
        let key = self.key.load();
        let mut mac = HmacSha256::new_from_slice(key.as_slice())
            .map_err(|e| Error::credential(format!("unusable account key: {}", e)))?;
        mac.update(string_to_sign.as_bytes());
        let signature = BASE64.encode(mac.finalize().into_bytes());

        let authorization = format!("SharedKey {}:{}", self.account_name, signature);
        let value = HeaderValue::from_str(&authorization)
            .map_err(|e| Error::credential(format!("invalid authorization header: {}", e)))?;
        request.headers.insert(header::AUTHORIZATION, value);
        Ok(())
    }

    fn string_to_sign(&self, request: &Request) -> String {
        let h = |name: header::HeaderName| {
            request
                .headers
                .get(name)
                .and_then(|v| v.to_str().ok())
                .unwrap_or("")
                .to_string()
        };
        // Without the header, sign the buffered body's length the transport will send.
        let content_length = match request.header_str(header::CONTENT_LENGTH.as_str()) {
            Some(v) => v.to_string(),
            None => request.body.len().map(|n| n.to_string()).unwrap_or_default(),
        };
        let content_length = if content_length == "0" {
            String::new()
        } else {
            content_length
        };

        let lines = [
            request.method.as_str().to_string(),
            h(header::CONTENT_ENCODING),
            h(header::CONTENT_LANGUAGE),
            content_length,
            request.header_str("content-md5").unwrap_or("").to_string(),
            h(header::CONTENT_TYPE),
            // Date is always empty; x-ms-date is part of the canonical headers.
            String::new(),
            h(header::IF_MODIFIED_SINCE),
            h(header::IF_MATCH),
            h(header::IF_NONE_MATCH),
            h(header::IF_UNMODIFIED_SINCE),
            h(header::RANGE),
            canonicalized_headers(request),
        ];
        format!("{}\n{}", lines.join("\n"), self.canonicalized_resource(request))
    }

    fn canonicalized_resource(&self, request: &Request) -> String {
        let mut resource = format!("/{}", self.account_name);
        let path = request.url.path();
        if path.is_empty() {
            resource.push('/');
        } else {
            resource.push_str(path);
        }

        let mut params: BTreeMap<String, Vec<String>> = BTreeMap::new();
        for (name, value) in request.url.query_pairs() {
            params
                .entry(name.to_lowercase())
                .or_default()
                .push(value.into_owned());
        }
        for (name, mut values) in params {
            values.sort();
            resource.push('\n');
            resource.push_str(&name);
            resource.push(':');
            resource.push_str(&values.join(","));
        }
        resource
    }
}

fn canonicalized_headers(request: &Request) -> String {
    let mut ms_headers: BTreeMap<String, Vec<String>> = BTreeMap::new();
    for (name, value) in request.headers.iter() {
        let name = name.as_str();
        if name.starts_with("x-ms-") {
            ms_headers
                .entry(name.to_string())
                .or_default()
                .push(value.to_str().unwrap_or("").trim().to_string());
        }
    }
    ms_headers
        .into_iter()
        .map(|(name, values)| format!("{}:{}", name, values.join(",")))
        .collect::<Vec<_>>()
        .join("\n")
}

fn decode_key(account_key: &str) -> Result<Vec<u8>> {
    let key = BASE64
        .decode(account_key.trim())
        .map_err(|e| Error::credential(format!("account key is not valid base64: {}", e)))?;
    if key.is_empty() {
        return Err(Error::credential("account key must not be empty"));
    }
    Ok(key)
}

impl Credential for SharedKeyCredential {
    fn sign(&self, request: &mut Request) -> Result<()> {
        self.sign_at(request, Utc::now())
    }
}

impl fmt::Debug for SharedKeyCredential {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("SharedKeyCredential")
            .field("account_name", &self.account_name)
            .field("key", &"<redacted>")
            .finish()
    }
}

/// Pipeline stage that signs each request with a [`Credential`].
#[derive(Debug, Clone)]
pub struct CredentialPolicyFactory {
    credential: Arc<dyn Credential>,
}

impl CredentialPolicyFactory {
    pub fn new(credential: Arc<dyn Credential>) -> Self {
        Self { credential }
    }
}

impl PolicyFactory for CredentialPolicyFactory {
    fn create(&self, next: PolicyRef, _options: &PolicyOptions) -> PolicyRef {
        Arc::new(CredentialPolicy {
            next,
            credential: self.credential.clone(),
        })
    }

    fn name(&self) -> &str {
        "credential"
    }
}

struct CredentialPolicy {
    next: PolicyRef,
    credential: Arc<dyn Credential>,
}

#[async_trait::async_trait]
impl Policy for CredentialPolicy {
    async fn send(&self, ctx: &Context, mut request: Request) -> Result<Response> {
        self.credential.sign(&mut request)?;
        self.next.send(ctx, request).await
    }
}
