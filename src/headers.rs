//! Protocol headers: extraction, version negotiation, and agent profile
//! discovery.
//!
//! Every UCP endpoint requires `UCP-Agent`, `Request-Signature` and
//! `Request-Id`; state-mutating endpoints additionally require
//! `Idempotency-Key`. A missing header is a 422. The `UCP-Agent` header also
//! carries `version=<ISO date>` for negotiation and `profile="<url>"`
//! pointing at the agent's profile document, from which the platform's
//! webhook URL is discovered best-effort.

use std::time::Duration;

use axum::extract::FromRequestParts;
use axum::http::request::Parts;
use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};
use axum::Json;
use serde::Deserialize;
use serde_json::json;
use tracing::{error, warn};

use crate::config;
use crate::models::PlatformConfig;

/// Headers shared by every UCP request.
#[derive(Debug, Clone)]
pub struct CommonHeaders {
    pub ucp_agent: String,
    /// Presence-checked only; `test` is the development literal.
    pub request_signature: String,
    pub request_id: String,
}

impl<S> FromRequestParts<S> for CommonHeaders
where
    S: Send + Sync,
{
    type Rejection = Response;

    async fn from_request_parts(parts: &mut Parts, _state: &S) -> Result<Self, Self::Rejection> {
        let ucp_agent = required_header(parts, "ucp-agent")?;
        let request_signature = required_header(parts, "request-signature")?;
        let request_id = required_header(parts, "request-id")?;

        if let Some(version) = agent_version(&ucp_agent) {
            if version.as_str() > config::server_version() {
                return Err(version_rejection(&version));
            }
        }

        Ok(Self {
            ucp_agent,
            request_signature,
            request_id,
        })
    }
}

/// The `Idempotency-Key` header, required on state-mutating commands.
#[derive(Debug, Clone)]
pub struct IdempotencyKey(pub String);

impl<S> FromRequestParts<S> for IdempotencyKey
where
    S: Send + Sync,
{
    type Rejection = Response;

    async fn from_request_parts(parts: &mut Parts, _state: &S) -> Result<Self, Self::Rejection> {
        required_header(parts, "idempotency-key").map(Self)
    }
}

/// The bare `Request-Signature` header, for endpoints (inbound webhooks)
/// that skip the full common set.
#[derive(Debug, Clone)]
pub struct RequestSignature(pub String);

impl<S> FromRequestParts<S> for RequestSignature
where
    S: Send + Sync,
{
    type Rejection = Response;

    async fn from_request_parts(parts: &mut Parts, _state: &S) -> Result<Self, Self::Rejection> {
        required_header(parts, "request-signature").map(Self)
    }
}

fn required_header(parts: &Parts, name: &str) -> Result<String, Response> {
    parts
        .headers
        .get(name)
        .and_then(|value| value.to_str().ok())
        .map(str::to_string)
        .ok_or_else(|| {
            (
                StatusCode::UNPROCESSABLE_ENTITY,
                Json(json!({"detail": format!("Missing required header: {name}")})),
            )
                .into_response()
        })
}

/// Extracts `version=` from the `UCP-Agent` header. Accepts quoted and
/// unquoted forms, in any `;`-separated segment.
pub(crate) fn agent_version(ucp_agent: &str) -> Option<String> {
    for segment in ucp_agent.split(';') {
        let segment = segment.trim();
        if let Some(raw) = segment.strip_prefix("version=") {
            let version = raw.trim().trim_matches('"').to_string();
            if !version.is_empty() {
                return Some(version);
            }
        }
    }
    None
}

fn version_rejection(agent_version: &str) -> Response {
    let server_version = config::server_version();
    (
        StatusCode::BAD_REQUEST,
        Json(json!({
            "code": "VERSION_UNSUPPORTED",
            "severity": "critical",
            "message": format!(
                "Version {agent_version} is not supported. This merchant implements version {server_version}."
            ),
        })),
    )
        .into_response()
}

// ============================================================================
// Agent profile discovery
// ============================================================================

#[derive(Debug, Deserialize)]
struct AgentProfile {
    ucp: Option<UcpProfile>,
}

#[derive(Debug, Deserialize)]
struct UcpProfile {
    #[serde(default)]
    capabilities: Vec<ProfileCapability>,
}

#[derive(Debug, Deserialize)]
struct ProfileCapability {
    config: Option<ProfileConfig>,
}

#[derive(Debug, Deserialize)]
struct ProfileConfig {
    webhook_url: Option<String>,
}

/// Extracts the `profile="<url>"` attribute of the `UCP-Agent` header.
pub(crate) fn profile_url(ucp_agent: &str) -> Option<String> {
    let start = ucp_agent.find("profile=\"")? + "profile=\"".len();
    let rest = &ucp_agent[start..];
    let end = rest.find('"')?;
    Some(rest[..end].to_string())
}

/// Fetches the agent profile and captures its webhook URL as platform
/// configuration. Every failure is logged and treated as "no platform".
pub async fn discover_platform(ucp_agent: &str) -> Option<PlatformConfig> {
    let webhook_url = extract_webhook_url(ucp_agent).await?;
    Some(PlatformConfig {
        webhook_url: Some(webhook_url),
    })
}

async fn extract_webhook_url(ucp_agent: &str) -> Option<String> {
    let profile_uri = profile_url(ucp_agent)?;

    let client = reqwest::Client::builder()
        .timeout(Duration::from_secs(5))
        .build()
        .ok()?;

    let response = match client.get(&profile_uri).send().await {
        Ok(response) => response,
        Err(e) => {
            error!("Network error fetching profile from {profile_uri}: {e}");
            return None;
        }
    };
    if !response.status().is_success() {
        error!(
            "Failed to fetch profile from {profile_uri}: status {}",
            response.status()
        );
        return None;
    }

    let profile: AgentProfile = match response.json().await {
        Ok(profile) => profile,
        Err(e) => {
            error!("Failed to validate agent profile from {profile_uri}: {e}");
            return None;
        }
    };

    let webhook_url = profile
        .ucp
        .into_iter()
        .flat_map(|ucp| ucp.capabilities)
        .find_map(|capability| capability.config.and_then(|config| config.webhook_url));
    if webhook_url.is_none() {
        warn!("No webhook_url found in profile from {profile_uri}");
    }
    webhook_url
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parses_quoted_and_unquoted_versions() {
        assert_eq!(
            agent_version(r#"profile="https://agent.example/profile"; version="2026-01-11""#),
            Some("2026-01-11".to_string())
        );
        assert_eq!(
            agent_version("version=2025-12-01"),
            Some("2025-12-01".to_string())
        );
        assert_eq!(agent_version(r#"profile="https://agent.example/p""#), None);
    }

    #[test]
    fn iso_date_versions_compare_lexicographically() {
        assert!("2099-01-01" > config::server_version());
        assert!("2025-06-01" < config::server_version());
    }

    #[test]
    fn extracts_profile_url() {
        assert_eq!(
            profile_url(r#"profile="https://agent.example/profile"; version="2026-01-11""#),
            Some("https://agent.example/profile".to_string())
        );
        assert_eq!(profile_url("version=2026-01-11"), None);
    }
}
