//! Content-store client (fetch by CID, upload via pinning service)
//!
//! ## Overview
//! CIDs are opaque handles to immutable archives in an external
//! content-addressed store, reachable through an **ordered** list of HTTP
//! gateways. This module implements the resilient retrieval half of the
//! pipeline:
//!
//! - **Ordered fallback.** Attempt `i` uses `gateways[(i−1) mod |gateways|]`,
//!   so a flaky primary degrades to the secondaries without operator action.
//! - **Retry as a state machine.** The loop carries an attempt counter, the
//!   last error, and a deadline per attempt; it is not a try/catch ladder.
//!   Backoff is exponential (1s base, factor 2, 15s cap) with ±25% jitter.
//! - **Fast-fail on 4xx.** A client error from a gateway is authoritative for
//!   the CID (the content does not exist or is malformed); retrying other
//!   gateways would only mask it.
//! - **Uploads** go to the configured pinning service with bearer-token
//!   auth. 401/403 are never retried.
//!
//! Cancellation: all network calls run on the caller's task. Dropping the
//! future (e.g. when the overall request deadline fires) aborts the in-flight
//! HTTP attempt and frees the connection.

use std::time::Duration;

use rand::Rng;
use tracing::{debug, warn};

/// Default number of fetch attempts before giving up.
pub const DEFAULT_MAX_ATTEMPTS: u32 = 5;
/// Default per-attempt timeout.
pub const DEFAULT_ATTEMPT_TIMEOUT: Duration = Duration::from_secs(30);
/// Base delay for exponential backoff.
pub const BACKOFF_INITIAL: Duration = Duration::from_secs(1);
/// Ceiling for exponential backoff.
pub const BACKOFF_CAP: Duration = Duration::from_secs(15);

/// Errors surfaced by the content-store client.
#[derive(Debug, thiserror::Error)]
pub enum StoreError {
    /// Transient transport-level failure (connect error, 5xx, reset).
    #[error("transient gateway failure: {0}")]
    Transient(String),
    /// Non-recoverable gateway response (HTTP 4xx other than auth).
    #[error("gateway rejected request with status {status}")]
    Permanent {
        /// HTTP status returned by the gateway.
        status: u16,
    },
    /// Credential rejection from the pinning service (401/403).
    #[error("pinning service rejected credentials (status {status})")]
    Auth {
        /// HTTP status returned by the pinning service.
        status: u16,
    },
    /// The per-attempt deadline expired.
    #[error("gateway attempt timed out after {0:?}")]
    Timeout(Duration),
    /// The gateway answered 200 with an empty body.
    #[error("gateway returned an empty body")]
    EmptyResponse,
    /// All attempts exhausted; carries the final attempt's error.
    #[error("all {attempts} gateway attempts failed; last: {last}")]
    Exhausted {
        /// Number of attempts made.
        attempts: u32,
        /// The last attempt's error, boxed to keep the variant small.
        last: Box<StoreError>,
    },
    /// The pinning response did not contain a recognizable CID.
    #[error("pinning service response missing CID field")]
    MissingCid,
}

impl StoreError {
    /// True when another attempt may reasonably succeed.
    pub fn is_retryable(&self) -> bool {
        matches!(
            self,
            StoreError::Transient(_) | StoreError::Timeout(_) | StoreError::EmptyResponse
        )
    }
}

/// Static configuration for the client; read-only after startup.
#[derive(Debug, Clone)]
pub struct StoreConfig {
    /// Ordered gateway URL prefixes, e.g. `https://ipfs.io/ipfs`.
    pub gateways: Vec<String>,
    /// Pinning-service upload endpoint.
    pub pin_url: String,
    /// Bearer credential for the pinning service.
    pub pin_token: String,
    /// Fetch attempts before `Exhausted`.
    pub max_attempts: u32,
    /// Deadline applied to each individual HTTP attempt.
    pub attempt_timeout: Duration,
}

impl Default for StoreConfig {
    fn default() -> Self {
        Self {
            gateways: vec![
                "https://ipfs.io/ipfs".into(),
                "https://cloudflare-ipfs.com/ipfs".into(),
                "https://gateway.pinata.cloud/ipfs".into(),
            ],
            pin_url: "https://api.pinata.cloud/pinning/pinFileToIPFS".into(),
            pin_token: String::new(),
            max_attempts: DEFAULT_MAX_ATTEMPTS,
            attempt_timeout: DEFAULT_ATTEMPT_TIMEOUT,
        }
    }
}

/// Backoff delay before attempt `next_attempt` (1-based), jittered ±25%.
///
/// Exposed for tests; the jitter keeps herds of concurrent requests from
/// synchronizing their retries against a recovering gateway.
pub fn backoff_delay(next_attempt: u32) -> Duration {
    let exp = next_attempt.saturating_sub(1).min(16);
    let base = BACKOFF_INITIAL
        .saturating_mul(1u32 << exp)
        .min(BACKOFF_CAP);
    let jitter = rand::thread_rng().gen_range(0.75_f64..1.25_f64);
    base.mul_f64(jitter)
}

/// Resilient fetch/upload client over the gateway list.
#[derive(Clone)]
pub struct StoreClient {
    http: reqwest::Client,
    cfg: StoreConfig,
}

impl StoreClient {
    /// Build a client from configuration. The underlying connection pool is
    /// shared across all requests made through this value.
    pub fn new(cfg: StoreConfig) -> Self {
        Self {
            http: reqwest::Client::new(),
            cfg,
        }
    }

    /// The configured gateway list, in fallback order.
    pub fn gateways(&self) -> &[String] {
        &self.cfg.gateways
    }

    fn gateway_for_attempt(&self, attempt: u32) -> &str {
        let idx = (attempt as usize - 1) % self.cfg.gateways.len();
        &self.cfg.gateways[idx]
    }

    /// Fetch the bytes behind `cid`, rotating through the gateway list with
    /// backoff. Terminates early on 4xx (the CID itself is bad).
    pub async fn fetch(&self, cid: &str) -> Result<Vec<u8>, StoreError> {
        let mut last: Option<StoreError> = None;
        for attempt in 1..=self.cfg.max_attempts {
            if attempt > 1 {
                tokio::time::sleep(backoff_delay(attempt)).await;
            }
            let gateway = self.gateway_for_attempt(attempt);
            let url = format!("{}/{}", gateway.trim_end_matches('/'), cid);
            debug!(cid, attempt, gateway, "content-store fetch attempt");
            match self.fetch_once(&url).await {
                Ok(bytes) => return Ok(bytes),
                Err(e @ StoreError::Permanent { .. }) => {
                    warn!(cid, gateway, error = %e, "gateway rejected CID; not retrying");
                    return Err(e);
                }
                Err(e) => {
                    warn!(cid, attempt, gateway, error = %e, "fetch attempt failed");
                    last = Some(e);
                }
            }
        }
        Err(StoreError::Exhausted {
            attempts: self.cfg.max_attempts,
            last: Box::new(last.unwrap_or(StoreError::EmptyResponse)),
        })
    }

    async fn fetch_once(&self, url: &str) -> Result<Vec<u8>, StoreError> {
        let res = self
            .http
            .get(url)
            .timeout(self.cfg.attempt_timeout)
            .send()
            .await
            .map_err(|e| classify_reqwest(e, self.cfg.attempt_timeout))?;
        let status = res.status();
        if status.is_client_error() {
            return Err(StoreError::Permanent {
                status: status.as_u16(),
            });
        }
        if !status.is_success() {
            return Err(StoreError::Transient(format!("status {status}")));
        }
        let body = res
            .bytes()
            .await
            .map_err(|e| classify_reqwest(e, self.cfg.attempt_timeout))?;
        if body.is_empty() {
            return Err(StoreError::EmptyResponse);
        }
        Ok(body.to_vec())
    }

    /// Upload `bytes` to the pinning service and return the resulting CID.
    ///
    /// Transient failures are retried with the same backoff schedule as
    /// fetches; credential rejections (401/403) terminate immediately.
    pub async fn upload(&self, bytes: Vec<u8>, name: &str) -> Result<String, StoreError> {
        let mut last: Option<StoreError> = None;
        for attempt in 1..=self.cfg.max_attempts {
            if attempt > 1 {
                tokio::time::sleep(backoff_delay(attempt)).await;
            }
            match self.upload_once(bytes.clone(), name).await {
                Ok(cid) => return Ok(cid),
                Err(e) if e.is_retryable() => {
                    warn!(attempt, error = %e, "upload attempt failed");
                    last = Some(e);
                }
                Err(e) => return Err(e),
            }
        }
        Err(StoreError::Exhausted {
            attempts: self.cfg.max_attempts,
            last: Box::new(last.unwrap_or(StoreError::EmptyResponse)),
        })
    }

    async fn upload_once(&self, bytes: Vec<u8>, name: &str) -> Result<String, StoreError> {
        let part = reqwest::multipart::Part::bytes(bytes).file_name(name.to_string());
        let form = reqwest::multipart::Form::new().part("file", part);
        let res = self
            .http
            .post(&self.cfg.pin_url)
            .bearer_auth(&self.cfg.pin_token)
            .multipart(form)
            .timeout(self.cfg.attempt_timeout)
            .send()
            .await
            .map_err(|e| classify_reqwest(e, self.cfg.attempt_timeout))?;
        let status = res.status();
        if status.as_u16() == 401 || status.as_u16() == 403 {
            return Err(StoreError::Auth {
                status: status.as_u16(),
            });
        }
        if status.is_client_error() {
            return Err(StoreError::Permanent {
                status: status.as_u16(),
            });
        }
        if !status.is_success() {
            return Err(StoreError::Transient(format!("status {status}")));
        }
        let v: serde_json::Value = res
            .json()
            .await
            .map_err(|e| StoreError::Transient(e.to_string()))?;
        // Pinning services differ on the field name; accept the common ones.
        for key in ["IpfsHash", "Hash", "cid", "Cid"] {
            if let Some(cid) = v.get(key).and_then(|x| x.as_str()) {
                return Ok(cid.to_string());
            }
        }
        Err(StoreError::MissingCid)
    }

    /// Cheap reachability check of the first gateway, used by `/ready`.
    /// A short deadline keeps readiness probes from stacking up.
    pub async fn probe(&self) -> bool {
        let Some(gateway) = self.cfg.gateways.first() else {
            return false;
        };
        let url = gateway.trim_end_matches('/').to_string();
        match self
            .http
            .head(&url)
            .timeout(Duration::from_secs(3))
            .send()
            .await
        {
            Ok(res) => !res.status().is_server_error(),
            Err(_) => false,
        }
    }
}

fn classify_reqwest(e: reqwest::Error, attempt_timeout: Duration) -> StoreError {
    if e.is_timeout() {
        StoreError::Timeout(attempt_timeout)
    } else {
        StoreError::Transient(e.to_string())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use wiremock::matchers::{method, path};
    use wiremock::{Mock, MockServer, ResponseTemplate};

    fn test_cfg(gateways: Vec<String>) -> StoreConfig {
        StoreConfig {
            gateways,
            pin_url: String::new(),
            pin_token: String::new(),
            max_attempts: 3,
            attempt_timeout: Duration::from_secs(5),
        }
    }

    #[test]
    fn backoff_grows_and_caps() {
        // Jitter is ±25%, so compare against widened bounds.
        let d2 = backoff_delay(2); // base 2s
        assert!(d2 >= Duration::from_millis(1500) && d2 <= Duration::from_millis(2500));
        let d10 = backoff_delay(10); // base would be 512s; capped at 15s
        assert!(d10 <= Duration::from_millis(18_750));
        assert!(d10 >= Duration::from_millis(11_250));
    }

    #[tokio::test]
    async fn fetch_falls_back_to_second_gateway() {
        let bad = MockServer::start().await;
        let good = MockServer::start().await;
        Mock::given(method("GET"))
            .and(path("/QmTest"))
            .respond_with(ResponseTemplate::new(500))
            .mount(&bad)
            .await;
        Mock::given(method("GET"))
            .and(path("/QmTest"))
            .respond_with(ResponseTemplate::new(200).set_body_bytes(b"archive".to_vec()))
            .mount(&good)
            .await;

        let client = StoreClient::new(test_cfg(vec![bad.uri(), good.uri()]));
        let bytes = client.fetch("QmTest").await.unwrap();
        assert_eq!(bytes, b"archive");
    }

    #[tokio::test]
    async fn fetch_stops_on_client_error() {
        let server = MockServer::start().await;
        Mock::given(method("GET"))
            .and(path("/QmGone"))
            .respond_with(ResponseTemplate::new(404))
            .expect(1) // exactly one attempt; 4xx must not be retried
            .mount(&server)
            .await;

        let client = StoreClient::new(test_cfg(vec![server.uri()]));
        let err = client.fetch("QmGone").await.unwrap_err();
        assert!(matches!(err, StoreError::Permanent { status: 404 }));
    }

    #[tokio::test]
    async fn empty_body_is_retried_then_exhausted() {
        let server = MockServer::start().await;
        Mock::given(method("GET"))
            .and(path("/QmEmpty"))
            .respond_with(ResponseTemplate::new(200))
            .expect(3)
            .mount(&server)
            .await;

        let client = StoreClient::new(test_cfg(vec![server.uri()]));
        let err = client.fetch("QmEmpty").await.unwrap_err();
        match err {
            StoreError::Exhausted { attempts, last } => {
                assert_eq!(attempts, 3);
                assert!(matches!(*last, StoreError::EmptyResponse));
            }
            other => panic!("expected Exhausted, got {other}"),
        }
    }

    #[tokio::test]
    async fn upload_does_not_retry_auth_failure() {
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .and(path("/pin"))
            .respond_with(ResponseTemplate::new(401))
            .expect(1)
            .mount(&server)
            .await;

        let mut cfg = test_cfg(vec![server.uri()]);
        cfg.pin_url = format!("{}/pin", server.uri());
        let client = StoreClient::new(cfg);
        let err = client.upload(b"blob".to_vec(), "justification.json").await.unwrap_err();
        assert!(matches!(err, StoreError::Auth { status: 401 }));
    }

    #[tokio::test]
    async fn upload_parses_pinning_response() {
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .and(path("/pin"))
            .respond_with(
                ResponseTemplate::new(200)
                    .set_body_json(serde_json::json!({ "IpfsHash": "QmPinned" })),
            )
            .mount(&server)
            .await;

        let mut cfg = test_cfg(vec![server.uri()]);
        cfg.pin_url = format!("{}/pin", server.uri());
        let client = StoreClient::new(cfg);
        let cid = client.upload(b"blob".to_vec(), "justification.json").await.unwrap();
        assert_eq!(cid, "QmPinned");
    }
}
