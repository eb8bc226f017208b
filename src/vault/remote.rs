//! S3-compatible object store backend
//!
//! Objects are addressed path-style as `{endpoint}/{bucket}/{key}`.
//! Requests are signed with SigV4 when credentials are configured and
//! sent anonymously otherwise.

use super::sigv4::{self, Credentials, RequestParts};
use super::{VaultKey, VaultStorage};
use crate::config::RemoteVaultConfig;
use crate::error::{Error, Result};
use async_trait::async_trait;
use chrono::Utc;
use quick_xml::Reader;
use quick_xml::events::Event;
use reqwest::header::AUTHORIZATION;
use reqwest::{Method, Response, StatusCode, Url};
use std::collections::BTreeSet;
use std::time::Duration;
use tracing::debug;

const REQUEST_TIMEOUT: Duration = Duration::from_secs(30);

/// Vault stored in one bucket of an S3-compatible service.
#[derive(Debug, Clone)]
pub struct RemoteVault {
    client: reqwest::Client,
    endpoint: Url,
    bucket: String,
    credentials: Option<Credentials>,
}

impl RemoteVault {
    /// # Errors
    ///
    /// Returns [`Error::Config`] for an unusable endpoint URL and
    /// [`Error::Storage`] if the HTTP client cannot be built.
    pub fn new(config: RemoteVaultConfig) -> Result<Self> {
        let endpoint = Url::parse(&config.endpoint)
            .map_err(|e| Error::Config(format!("Invalid vault endpoint: {e}")))?;
        if endpoint.host_str().is_none() {
            return Err(Error::Config(format!(
                "Vault endpoint has no host: {}",
                config.endpoint
            )));
        }
        if config.bucket.is_empty() || config.bucket.contains('/') {
            return Err(Error::Config(format!(
                "Invalid vault bucket: {:?}",
                config.bucket
            )));
        }

        let client = reqwest::Client::builder()
            .timeout(REQUEST_TIMEOUT)
            .build()
            .map_err(|e| Error::Storage(format!("HTTP client: {e}")))?;

        let credentials = match (config.access_key, config.secret_key) {
            (Some(access_key), Some(secret_key)) => Some(Credentials {
                access_key,
                secret_key,
                region: config.region,
            }),
            _ => None,
        };

        Ok(Self {
            client,
            endpoint,
            bucket: config.bucket,
            credentials,
        })
    }

    fn url(&self, key: Option<&VaultKey>, query: &str) -> Url {
        let base = self.endpoint.path().trim_end_matches('/');
        let mut path = format!("{base}/{}", sigv4::uri_encode(&self.bucket, false));
        if let Some(key) = key {
            path.push('/');
            path.push_str(&sigv4::uri_encode(key.as_str(), true));
        }
        let mut url = self.endpoint.clone();
        url.set_path(&path);
        url.set_query((!query.is_empty()).then_some(query));
        url
    }

    async fn send(&self, method: Method, url: Url, body: Vec<u8>) -> Result<Response> {
        let mut request = self.client.request(method.clone(), url.clone());
        if let Some(credentials) = &self.credentials {
            let host = match (url.host_str(), url.port()) {
                (Some(host), Some(port)) => format!("{host}:{port}"),
                (Some(host), None) => host.to_string(),
                (None, _) => String::new(),
            };
            let signed = sigv4::sign(
                credentials,
                &RequestParts {
                    method: method.as_str(),
                    host: &host,
                    path: url.path(),
                    query: url.query().unwrap_or(""),
                    payload: &body,
                },
                Utc::now(),
            )?;
            request = request
                .header("x-amz-date", signed.amz_date)
                .header("x-amz-content-sha256", signed.content_sha256)
                .header(AUTHORIZATION, signed.authorization);
        }
        debug!("{} {}", method, url.path());
        request
            .body(body)
            .send()
            .await
            .map_err(|e| Error::Storage(format!("{method} {}: {e}", url.path())))
    }

    async fn list_page(&self, prefix: &str, token: Option<&str>) -> Result<ListPage> {
        let mut params = vec![("list-type", "2"), ("encoding-type", "url")];
        if !prefix.is_empty() {
            params.push(("prefix", prefix));
        }
        if let Some(token) = token {
            params.push(("continuation-token", token));
        }
        let url = self.url(None, &sigv4::canonical_query(&params));
        let response = check(self.send(Method::GET, url, Vec::new()).await?, "list").await?;
        let xml = response
            .text()
            .await
            .map_err(|e| Error::Storage(format!("list: {e}")))?;
        parse_list_page(&xml)
    }
}

/// Turn a non-success response into a storage error with its body.
async fn check(response: Response, what: &str) -> Result<Response> {
    let status = response.status();
    if status.is_success() {
        return Ok(response);
    }
    let body = response.text().await.unwrap_or_default();
    let snippet: String = body.chars().take(200).collect();
    Err(Error::Storage(format!("{what}: HTTP {status}: {snippet}")))
}

#[async_trait]
impl VaultStorage for RemoteVault {
    async fn put(&self, key: &VaultKey, data: &[u8]) -> Result<()> {
        let response = self
            .send(Method::PUT, self.url(Some(key), ""), data.to_vec())
            .await?;
        check(response, &format!("put {key}")).await?;
        debug!("Stored {} bytes under {}", data.len(), key);
        Ok(())
    }

    async fn get(&self, key: &VaultKey) -> Result<Vec<u8>> {
        let response = self
            .send(Method::GET, self.url(Some(key), ""), Vec::new())
            .await?;
        if response.status() == StatusCode::NOT_FOUND {
            return Err(Error::NotFound(key.to_string()));
        }
        let response = check(response, &format!("get {key}")).await?;
        let body = response
            .bytes()
            .await
            .map_err(|e| Error::Storage(format!("get {key}: {e}")))?;
        Ok(body.to_vec())
    }

    async fn delete(&self, key: &VaultKey) -> Result<()> {
        let response = self
            .send(Method::DELETE, self.url(Some(key), ""), Vec::new())
            .await?;
        if response.status() == StatusCode::NOT_FOUND {
            return Ok(());
        }
        check(response, &format!("delete {key}")).await?;
        Ok(())
    }

    async fn list(&self, prefix: Option<&VaultKey>) -> Result<BTreeSet<VaultKey>> {
        let raw_prefix = prefix.map_or("", VaultKey::as_str);
        let mut keys = BTreeSet::new();
        let mut token: Option<String> = None;

        loop {
            let page = self.list_page(raw_prefix, token.as_deref()).await?;
            for raw in &page.keys {
                let decoded = urlencoding::decode(raw)
                    .map_err(|e| Error::Storage(format!("list: bad key encoding {raw}: {e}")))?;
                match VaultKey::parse(&decoded) {
                    Ok(key) if prefix.is_none_or(|p| key.is_within(p)) => {
                        keys.insert(key);
                    }
                    Ok(_) => {}
                    Err(_) => debug!("Skipping object with foreign key {}", decoded),
                }
            }
            match page.next_token {
                Some(next) if page.truncated => token = Some(next),
                _ => break,
            }
        }
        Ok(keys)
    }

    fn backend(&self) -> &'static str {
        "remote"
    }
}

/// The parts of a `ListObjectsV2` response the vault needs.
#[derive(Debug, Default, PartialEq, Eq)]
struct ListPage {
    /// Still URL-encoded (`encoding-type=url`).
    keys: Vec<String>,
    truncated: bool,
    next_token: Option<String>,
}

#[derive(Clone, Copy)]
enum Field {
    Key,
    Truncated,
    Token,
}

fn parse_list_page(xml: &str) -> Result<ListPage> {
    let mut reader = Reader::from_str(xml);
    reader.config_mut().trim_text(true);

    let mut page = ListPage::default();
    let mut in_contents = false;
    let mut field: Option<Field> = None;

    loop {
        match reader.read_event() {
            Ok(Event::Start(ref e)) => {
                field = match e.name().as_ref() {
                    b"Contents" => {
                        in_contents = true;
                        None
                    }
                    b"Key" if in_contents => Some(Field::Key),
                    b"IsTruncated" => Some(Field::Truncated),
                    b"NextContinuationToken" => Some(Field::Token),
                    _ => None,
                };
            }
            Ok(Event::Text(ref e)) => {
                let text = String::from_utf8_lossy(e);
                match field {
                    Some(Field::Key) => page.keys.push(text.into_owned()),
                    Some(Field::Truncated) => page.truncated = text == "true",
                    Some(Field::Token) => page.next_token = Some(text.into_owned()),
                    None => {}
                }
            }
            Ok(Event::End(ref e)) => {
                if e.name().as_ref() == b"Contents" {
                    in_contents = false;
                }
                field = None;
            }
            Ok(Event::Eof) => break,
            Err(e) => {
                return Err(Error::Storage(format!(
                    "Error parsing list response: {e}"
                )));
            }
            _ => {}
        }
    }

    Ok(page)
}
