//! Input validation and SSRF protection.
//!
//! Validates:
//! - Callback URLs (protocol, length, private/internal destinations)
//! - Tenant ids, event types, idempotency keys and payloads on ingestion

use std::net::IpAddr;

use url::Host;

use crate::error::WebhookError;

/// Maximum length of tenant ids, event types and idempotency keys.
pub const MAX_IDENTIFIER_LEN: usize = 100;

/// Maximum callback URL length.
pub const MAX_CALLBACK_URL_LEN: usize = 500;

/// Which destinations a callback URL may point at.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct UrlPolicy {
    /// Accept `http://` in addition to `https://`.
    pub allow_http: bool,
    /// Accept loopback/private/link-local hosts. Local development only.
    pub allow_internal_hosts: bool,
}

// ---------------------------------------------------------------------------
// URL validation
// ---------------------------------------------------------------------------

/// Validate a webhook callback URL.
///
/// Checks:
/// 1. URL is parseable and at most 500 characters
/// 2. Scheme is HTTPS (or HTTP if the policy allows it)
/// 3. Host is not a private/internal address (SSRF protection)
pub fn validate_webhook_url(url: &str, policy: UrlPolicy) -> Result<(), WebhookError> {
    if url.chars().count() > MAX_CALLBACK_URL_LEN {
        return Err(WebhookError::InvalidUrl(format!(
            "URL exceeds {MAX_CALLBACK_URL_LEN} characters"
        )));
    }

    let parsed = url::Url::parse(url)
        .map_err(|e| WebhookError::InvalidUrl(format!("Invalid URL format: {e}")))?;

    match parsed.scheme() {
        "https" => {}
        "http" if policy.allow_http => {}
        "http" => {
            return Err(WebhookError::InvalidUrl(
                "Webhook URLs must use HTTPS".to_string(),
            ));
        }
        scheme => {
            return Err(WebhookError::InvalidUrl(format!(
                "Unsupported URL scheme: {scheme}"
            )));
        }
    }

    let host = parsed
        .host()
        .ok_or_else(|| WebhookError::InvalidUrl("URL must have a host".to_string()))?;

    if policy.allow_internal_hosts {
        return Ok(());
    }

    match host {
        Host::Ipv4(v4) => check_ip_not_internal(&IpAddr::V4(v4)),
        Host::Ipv6(v6) => check_ip_not_internal(&IpAddr::V6(v6)),
        Host::Domain(domain) => validate_host_not_internal(domain),
    }
}

// ---------------------------------------------------------------------------
// SSRF protection
// ---------------------------------------------------------------------------

/// Validate that a host is not a private/internal address.
///
/// Blocks:
/// - Loopback addresses (127.0.0.0/8)
/// - Private networks (10.0.0.0/8, 172.16.0.0/12, 192.168.0.0/16)
/// - Link-local (169.254.0.0/16, cloud metadata endpoints)
/// - CGNAT (100.64.0.0/10)
/// - IPv6 loopback, unspecified, unique-local and link-local
/// - Internal hostnames (localhost, *.internal, *.local)
pub fn validate_host_not_internal(host: &str) -> Result<(), WebhookError> {
    let bare = host.trim_start_matches('[').trim_end_matches(']');
    if let Ok(ip) = bare.parse::<IpAddr>() {
        return check_ip_not_internal(&ip);
    }

    let lower = host.to_ascii_lowercase();
    if lower == "localhost"
        || lower.ends_with(".localhost")
        || lower == "metadata.google.internal"
        || lower.ends_with(".internal")
        || lower.ends_with(".local")
    {
        return Err(WebhookError::SsrfDetected(format!(
            "Destination host {host} is a restricted internal hostname"
        )));
    }

    Ok(())
}

fn check_ip_not_internal(ip: &IpAddr) -> Result<(), WebhookError> {
    if is_internal_ip(ip) {
        return Err(WebhookError::SsrfDetected(format!(
            "Destination host {ip} is a private/internal address"
        )));
    }
    Ok(())
}

/// Check if an IP address belongs to a private/internal range.
fn is_internal_ip(ip: &IpAddr) -> bool {
    match ip {
        IpAddr::V4(v4) => {
            v4.is_loopback()
                || v4.is_private()
                || v4.is_link_local()
                || v4.is_broadcast()
                || v4.is_unspecified()
                || (v4.octets()[0] == 100 && (v4.octets()[1] & 0xC0) == 64) // 100.64.0.0/10
        }
        IpAddr::V6(v6) => {
            if let Some(v4) = v6.to_ipv4_mapped() {
                return is_internal_ip(&IpAddr::V4(v4));
            }
            let first = v6.segments()[0];
            v6.is_loopback()
                || v6.is_unspecified()
                || (first & 0xfe00) == 0xfc00 // fc00::/7 unique local
                || (first & 0xffc0) == 0xfe80 // fe80::/10 link local
        }
    }
}

// ---------------------------------------------------------------------------
// Ingestion validation
// ---------------------------------------------------------------------------

fn validate_identifier(field: &str, value: &str) -> Result<(), WebhookError> {
    if value.trim().is_empty() {
        return Err(WebhookError::Validation(format!("{field} is required")));
    }
    if value.chars().count() > MAX_IDENTIFIER_LEN {
        return Err(WebhookError::Validation(format!(
            "{field} exceeds {MAX_IDENTIFIER_LEN} characters"
        )));
    }
    Ok(())
}

pub fn validate_tenant_id(tenant_id: &str) -> Result<(), WebhookError> {
    validate_identifier("tenant_id", tenant_id)
}

/// Event types are 1..=100 characters with no whitespace.
pub fn validate_event_type(event_type: &str) -> Result<(), WebhookError> {
    validate_identifier("event_type", event_type)?;
    if event_type.chars().any(char::is_whitespace) {
        return Err(WebhookError::Validation(format!(
            "event_type must not contain whitespace: {event_type:?}"
        )));
    }
    Ok(())
}

/// A subscriber filter: at least one entry, each a valid event type.
pub fn validate_event_types(event_types: &[String]) -> Result<(), WebhookError> {
    if event_types.is_empty() {
        return Err(WebhookError::Validation(
            "at least one event type is required".to_string(),
        ));
    }
    for et in event_types {
        validate_event_type(et)?;
    }
    Ok(())
}

pub fn validate_idempotency_key(key: Option<&str>) -> Result<(), WebhookError> {
    match key {
        Some(key) => validate_identifier("idempotency_key", key),
        None => Ok(()),
    }
}

/// The payload must be present (not JSON `null`).
pub fn validate_payload(payload: &serde_json::Value) -> Result<(), WebhookError> {
    if payload.is_null() {
        return Err(WebhookError::Validation("payload is required".to_string()));
    }
    Ok(())
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------

#[cfg(test)]
mod tests {
    use super::*;

    const STRICT: UrlPolicy = UrlPolicy {
        allow_http: false,
        allow_internal_hosts: false,
    };

    // --- URL validation ---

    #[test]
    fn test_valid_https_url() {
        assert!(validate_webhook_url("https://example.com/webhooks", STRICT).is_ok());
    }

    #[test]
    fn test_valid_https_url_with_port() {
        assert!(validate_webhook_url("https://hooks.example.com:8443/callback", STRICT).is_ok());
    }

    #[test]
    fn test_http_url_rejected_by_default() {
        let result = validate_webhook_url("http://example.com/webhooks", STRICT);
        assert!(matches!(result, Err(WebhookError::InvalidUrl(_))));
    }

    #[test]
    fn test_http_url_allowed_when_enabled() {
        let policy = UrlPolicy {
            allow_http: true,
            ..STRICT
        };
        assert!(validate_webhook_url("http://example.com/webhooks", policy).is_ok());
    }

    #[test]
    fn test_invalid_url_format() {
        assert!(validate_webhook_url("not-a-url", STRICT).is_err());
    }

    #[test]
    fn test_unsupported_scheme() {
        assert!(validate_webhook_url("ftp://example.com/webhooks", STRICT).is_err());
    }

    #[test]
    fn test_url_too_long() {
        let url = format!("https://example.com/{}", "a".repeat(500));
        assert!(matches!(
            validate_webhook_url(&url, STRICT),
            Err(WebhookError::InvalidUrl(_))
        ));
    }

    // --- SSRF protection ---

    #[test]
    fn test_ssrf_blocks_loopback() {
        assert!(validate_host_not_internal("127.0.0.1").is_err());
        assert!(validate_host_not_internal("127.0.0.2").is_err());
    }

    #[test]
    fn test_ssrf_blocks_private_ranges() {
        assert!(validate_host_not_internal("10.0.0.1").is_err());
        assert!(validate_host_not_internal("172.16.0.1").is_err());
        assert!(validate_host_not_internal("172.31.255.255").is_err());
        assert!(validate_host_not_internal("192.168.0.1").is_err());
    }

    #[test]
    fn test_ssrf_blocks_link_local() {
        assert!(validate_host_not_internal("169.254.169.254").is_err());
    }

    #[test]
    fn test_ssrf_blocks_cgnat() {
        assert!(validate_host_not_internal("100.64.0.1").is_err());
        assert!(validate_host_not_internal("100.127.255.255").is_err());
    }

    #[test]
    fn test_ssrf_blocks_ipv6() {
        assert!(validate_host_not_internal("::1").is_err());
        assert!(validate_host_not_internal("::").is_err());
        assert!(validate_host_not_internal("fd00::1").is_err());
        assert!(validate_host_not_internal("fe80::1").is_err());
        assert!(validate_host_not_internal("::ffff:10.0.0.1").is_err());
    }

    #[test]
    fn test_ssrf_blocks_internal_hostnames() {
        assert!(validate_host_not_internal("localhost").is_err());
        assert!(validate_host_not_internal("LOCALHOST").is_err());
        assert!(validate_host_not_internal("metadata.google.internal").is_err());
        assert!(validate_host_not_internal("service.internal").is_err());
        assert!(validate_host_not_internal("myhost.local").is_err());
    }

    #[test]
    fn test_ssrf_allows_public_hosts() {
        assert!(validate_host_not_internal("8.8.8.8").is_ok());
        assert!(validate_host_not_internal("203.0.113.50").is_ok());
        assert!(validate_host_not_internal("example.com").is_ok());
        assert!(validate_host_not_internal("2001:4860:4860::8888").is_ok());
    }

    #[test]
    fn test_ssrf_url_private_ip() {
        let result = validate_webhook_url("https://10.0.0.1/webhook", STRICT);
        assert!(matches!(result, Err(WebhookError::SsrfDetected(_))));
    }

    #[test]
    fn test_ssrf_url_bracketed_ipv6() {
        let result = validate_webhook_url("https://[::1]:8443/webhook", STRICT);
        assert!(matches!(result, Err(WebhookError::SsrfDetected(_))));
    }

    #[test]
    fn test_internal_hosts_allowed_when_enabled() {
        let policy = UrlPolicy {
            allow_http: true,
            allow_internal_hosts: true,
        };
        assert!(validate_webhook_url("http://127.0.0.1:8080/hook", policy).is_ok());
    }

    // --- Ingestion validation ---

    #[test]
    fn test_identifier_bounds() {
        assert!(validate_tenant_id("t1").is_ok());
        assert!(validate_tenant_id("").is_err());
        assert!(validate_tenant_id("   ").is_err());
        assert!(validate_tenant_id(&"t".repeat(100)).is_ok());
        assert!(validate_tenant_id(&"t".repeat(101)).is_err());
    }

    #[test]
    fn test_event_type_rules() {
        assert!(validate_event_type("order.completed").is_ok());
        assert!(validate_event_type("order completed").is_err());
        assert!(validate_event_type("").is_err());
    }

    #[test]
    fn test_event_types_non_empty() {
        assert!(validate_event_types(&[]).is_err());
        let result = validate_event_types(&["ok".to_string(), "bad type".to_string()]);
        assert!(result.unwrap_err().to_string().contains("bad type"));
    }

    #[test]
    fn test_idempotency_key_optional() {
        assert!(validate_idempotency_key(None).is_ok());
        assert!(validate_idempotency_key(Some("abc")).is_ok());
        assert!(validate_idempotency_key(Some("")).is_err());
        assert!(validate_idempotency_key(Some(&"k".repeat(101))).is_err());
    }

    #[test]
    fn test_payload_required() {
        assert!(validate_payload(&serde_json::Value::Null).is_err());
        assert!(validate_payload(&serde_json::json!({"a": 1})).is_ok());
        assert!(validate_payload(&serde_json::json!([])).is_ok());
    }
}
