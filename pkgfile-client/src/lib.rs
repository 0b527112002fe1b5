//! Asynchronous HTTP client for fetching repository file-list archives
//! from mirror servers.

use std::time::Duration;

use anyhow::{bail, format_err, Error};
use bytes::Bytes;
use http::header::{HeaderValue, IF_MODIFIED_SINCE, LAST_MODIFIED, LOCATION, USER_AGENT};
use http::{Request, StatusCode};
use hyper::client::{Client, HttpConnector};
use hyper::Body;
use openssl::ssl::{SslConnector, SslMethod};
use url::Url;

use proxmox_http::client::HttpsConnector;

pub mod http_date;

const PKGFILE_TCP_KEEPALIVE_TIME: u32 = 120;

/// Generous cap on a single request; mirrors that stall longer than this
/// are treated as failed candidates.
const REQUEST_TIMEOUT: Duration = Duration::from_secs(60);

const MAX_REDIRECTS: usize = 5;

/// Result of one conditional archive fetch.
pub enum FetchOutcome {
    /// Server answered `304`, the on-disk database is current.
    NotModified,
    /// Full response body plus the server's `Last-Modified` (unix epoch).
    Archive {
        data: Bytes,
        last_modified: Option<i64>,
    },
}

/// HTTP(S) mirror client
pub struct MirrorClient {
    client: Client<HttpsConnector, Body>,
    user_agent: String,
}

impl MirrorClient {
    pub const DEFAULT_USER_AGENT_STRING: &'static str = "pkgfile/1.0";

    pub fn new() -> Self {
        let ssl_connector = SslConnector::builder(SslMethod::tls()).unwrap().build();

        let mut httpc = HttpConnector::new();
        httpc.set_nodelay(true);
        httpc.enforce_http(false); // we want https...
        httpc.set_connect_timeout(Some(Duration::new(10, 0)));

        let https = HttpsConnector::with_connector(httpc, ssl_connector, PKGFILE_TCP_KEEPALIVE_TIME);
        let client = Client::builder().build(https);

        Self {
            client,
            user_agent: Self::DEFAULT_USER_AGENT_STRING.to_string(),
        }
    }

    /// Conditionally fetch `url`, following redirects.
    ///
    /// When `if_modified_since` is set, the request carries the matching
    /// header and a `304` response short-circuits into
    /// [FetchOutcome::NotModified]. Anything but a success or `304` status
    /// is an error, so the caller can fall back to the next mirror.
    pub async fn fetch_archive(
        &self,
        url: &str,
        if_modified_since: Option<i64>,
    ) -> Result<FetchOutcome, Error> {
        let mut url = url.to_owned();

        for _ in 0..=MAX_REDIRECTS {
            let mut request = Request::builder()
                .method("GET")
                .uri(url.as_str())
                .header(USER_AGENT, HeaderValue::from_str(&self.user_agent)?);

            if let Some(mtime) = if_modified_since {
                request = request.header(IF_MODIFIED_SINCE, http_date::format_http_date(mtime));
            }

            let request = request.body(Body::empty())?;

            let response = tokio::time::timeout(REQUEST_TIMEOUT, self.client.request(request))
                .await
                .map_err(|_| format_err!("request to '{}' timed out", url))??;

            let status = response.status();

            if status == StatusCode::NOT_MODIFIED {
                return Ok(FetchOutcome::NotModified);
            }

            if status.is_redirection() {
                let location = response
                    .headers()
                    .get(LOCATION)
                    .ok_or_else(|| format_err!("redirect from '{}' without location", url))?
                    .to_str()?;
                url = Url::parse(&url)?.join(location)?.into();
                continue;
            }

            if !status.is_success() {
                bail!("got bad status '{}' from '{}'", status, url);
            }

            let last_modified = response
                .headers()
                .get(LAST_MODIFIED)
                .and_then(|value| value.to_str().ok())
                .and_then(|value| http_date::parse_http_date(value).ok());

            let data = tokio::time::timeout(REQUEST_TIMEOUT, hyper::body::to_bytes(response))
                .await
                .map_err(|_| format_err!("download from '{}' timed out", url))??;

            return Ok(FetchOutcome::Archive {
                data,
                last_modified,
            });
        }

        bail!("too many redirects fetching '{}'", url);
    }
}

impl Default for MirrorClient {
    fn default() -> Self {
        Self::new()
    }
}
