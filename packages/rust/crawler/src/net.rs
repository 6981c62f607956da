//! HTTP plumbing shared by the source fetcher and the asset store.

use std::net::IpAddr;
use std::time::Duration;

use reqwest::{Client, StatusCode};
use sha2::{Digest, Sha256};
use url::Url;

use larder_shared::{LarderError, Result};

/// User-Agent string for outgoing requests.
const USER_AGENT: &str = concat!("larder/", env!("CARGO_PKG_VERSION"));

/// Build the shared HTTP client.
pub(crate) fn build_client(timeout: Duration) -> Result<Client> {
    Client::builder()
        .user_agent(USER_AGENT)
        .redirect(reqwest::redirect::Policy::limited(5))
        .timeout(timeout)
        .build()
        .map_err(|e| LarderError::config(format!("failed to build HTTP client: {e}")))
}

/// Issue a GET and map transport failures and error statuses onto [`LarderError`].
pub(crate) async fn get(
    client: &Client,
    url: &Url,
    allow_localhost: bool,
) -> Result<reqwest::Response> {
    if !allow_localhost && is_ssrf_target(url) {
        tracing::warn!(%url, "SSRF protection: blocked");
        return Err(LarderError::validation(format!("{url}: blocked target")));
    }

    let response = client
        .get(url.as_str())
        .send()
        .await
        .map_err(|e| send_error(url, e))?;

    let status = response.status();
    if status.is_success() {
        return Ok(response);
    }
    Err(status_error(url, status))
}

/// Classify a failed send. Only timeouts are distinguished.
pub(crate) fn send_error(url: &Url, e: reqwest::Error) -> LarderError {
    if e.is_timeout() {
        LarderError::Timeout(format!("{url}: {e}"))
    } else {
        LarderError::Network(format!("{url}: {e}"))
    }
}

/// Map a non-success status to the error variant the retry policy expects.
pub(crate) fn status_error(url: &Url, status: StatusCode) -> LarderError {
    match status {
        StatusCode::NOT_FOUND | StatusCode::GONE => LarderError::NotFound(url.to_string()),
        StatusCode::TOO_MANY_REQUESTS => LarderError::RateLimited(format!("{url}: HTTP {status}")),
        StatusCode::REQUEST_TIMEOUT | StatusCode::GATEWAY_TIMEOUT => {
            LarderError::Timeout(format!("{url}: HTTP {status}"))
        }
        _ => LarderError::Network(format!("{url}: HTTP {status}")),
    }
}

// ---------------------------------------------------------------------------
// SSRF protection
// ---------------------------------------------------------------------------

/// Check if a URL targets a potentially dangerous resource.
pub(crate) fn is_ssrf_target(url: &Url) -> bool {
    // Block non-HTTP schemes
    match url.scheme() {
        "http" | "https" => {}
        _ => return true,
    }

    // Block private/loopback IPs
    if let Some(host) = url.host_str() {
        let bare = host.trim_start_matches('[').trim_end_matches(']');
        if let Ok(ip) = bare.parse::<IpAddr>() {
            return is_private_ip(&ip);
        }
        // Block known local hostnames
        if host == "localhost" || host.ends_with(".local") || host.ends_with(".internal") {
            return true;
        }
    }

    false
}

/// Check if an IP is in a private/reserved range.
fn is_private_ip(ip: &IpAddr) -> bool {
    match ip {
        IpAddr::V4(v4) => {
            v4.is_loopback()
                || v4.is_private()
                || v4.is_link_local()
                || v4.is_broadcast()
                || v4.is_unspecified()
                // 100.64.0.0/10 (Carrier-grade NAT)
                || (v4.octets()[0] == 100 && (v4.octets()[1] & 0xC0) == 64)
                // 192.0.0.0/24
                || (v4.octets()[0] == 192 && v4.octets()[1] == 0 && v4.octets()[2] == 0)
        }
        IpAddr::V6(v6) => v6.is_loopback() || v6.is_unspecified(),
    }
}

/// Compute SHA-256 hash of content.
pub fn compute_hash(content: &[u8]) -> String {
    let mut hasher = Sha256::new();
    hasher.update(content);
    format!("{:x}", hasher.finalize())
}
