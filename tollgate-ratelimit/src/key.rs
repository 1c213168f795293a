//! Rate limit key derivation
//!
//! A [`RateLimitKey`] names one bucket of counters. It is derived from the
//! caller identity resolved upstream plus the endpoint class of the request,
//! so that different endpoint families draw from independent budgets even for
//! the same caller. Identical inputs always produce identical keys.

use crate::error::{RateLimitError, RateLimitResult};
use http::HeaderMap;
use serde::{Deserialize, Serialize};
use std::fmt;
use std::net::{IpAddr, SocketAddr};
use tracing::warn;

/// Endpoint family; each class is a separate pool of quota.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
#[serde(from = "String", into = "String")]
pub enum EndpointClass {
    #[default]
    Api,
    Auth,
    Webhook,
    Media,
    Custom(String),
}

impl EndpointClass {
    pub fn parse(name: &str) -> Self {
        match name.trim().to_ascii_lowercase().as_str() {
            "api" => Self::Api,
            "auth" => Self::Auth,
            "webhook" | "webhooks" => Self::Webhook,
            "media" => Self::Media,
            other => Self::Custom(other.to_string()),
        }
    }

    pub fn as_str(&self) -> &str {
        match self {
            Self::Api => "api",
            Self::Auth => "auth",
            Self::Webhook => "webhook",
            Self::Media => "media",
            Self::Custom(name) => name,
        }
    }
}

impl From<String> for EndpointClass {
    fn from(name: String) -> Self {
        Self::parse(&name)
    }
}

impl From<EndpointClass> for String {
    fn from(class: EndpointClass) -> Self {
        class.as_str().to_string()
    }
}

impl fmt::Display for EndpointClass {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Maps request paths to endpoint classes by longest matching prefix.
#[derive(Debug, Clone)]
pub struct EndpointClassifier {
    rules: Vec<(String, EndpointClass)>,
    default_class: EndpointClass,
}

impl EndpointClassifier {
    /// Empty classifier; every path is `api`.
    pub fn new() -> Self {
        Self {
            rules: Vec::new(),
            default_class: EndpointClass::Api,
        }
    }

    /// Add a prefix rule. Prefixes match whole path segments.
    pub fn route(mut self, prefix: impl Into<String>, class: EndpointClass) -> Self {
        let prefix = prefix.into();
        let prefix = prefix.trim_end_matches('/').to_string();
        self.rules.push((prefix, class));
        self.rules.sort_by(|a, b| b.0.len().cmp(&a.0.len()));
        self
    }

    pub fn default_class(mut self, class: EndpointClass) -> Self {
        self.default_class = class;
        self
    }

    pub fn classify(&self, path: &str) -> EndpointClass {
        self.rules
            .iter()
            .find(|(prefix, _)| {
                path.strip_prefix(prefix.as_str())
                    .is_some_and(|rest| rest.is_empty() || rest.starts_with('/'))
            })
            .map(|(_, class)| class.clone())
            .unwrap_or_else(|| self.default_class.clone())
    }
}

impl Default for EndpointClassifier {
    fn default() -> Self {
        Self::new()
            .route("/auth", EndpointClass::Auth)
            .route("/oauth", EndpointClass::Auth)
            .route("/webhooks", EndpointClass::Webhook)
            .route("/media", EndpointClass::Media)
            .route("/uploads", EndpointClass::Media)
    }
}

/// Caller identity resolved by the authentication layer.
///
/// Inserted into request extensions before the admission middleware runs.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct CallerIdentity {
    pub organization_id: Option<String>,
    pub user_id: Option<String>,
    pub client_ip: Option<IpAddr>,
}

impl CallerIdentity {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_organization(mut self, organization_id: impl Into<String>) -> Self {
        self.organization_id = Some(organization_id.into());
        self
    }

    pub fn with_user(mut self, user_id: impl Into<String>) -> Self {
        self.user_id = Some(user_id.into());
        self
    }

    pub fn with_ip(mut self, ip: IpAddr) -> Self {
        self.client_ip = Some(ip);
        self
    }
}

/// Socket peer address of the connection, inserted by the server.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PeerAddr(pub SocketAddr);

/// How a key identifies its caller.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum KeyScope {
    User,
    Ip,
    Anonymous,
}

/// Composite bucket identifier.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct RateLimitKey {
    key: String,
    class: EndpointClass,
    scope: KeyScope,
}

impl RateLimitKey {
    /// Derive a key, preferring organization+user over client IP.
    ///
    /// A missing organization leaves its segment empty, which no escaped id
    /// can produce. Fails when neither a user nor an IP is known.
    pub fn derive(identity: &CallerIdentity, class: &EndpointClass) -> RateLimitResult<Self> {
        let org = non_empty(identity.organization_id.as_deref())
            .map(escape)
            .unwrap_or_default();
        let class_part = escape(class.as_str());

        if let Some(user) = non_empty(identity.user_id.as_deref()) {
            return Ok(Self {
                key: format!("org:{}:user:{}:{}", org, escape(user), class_part),
                class: class.clone(),
                scope: KeyScope::User,
            });
        }

        if let Some(ip) = identity.client_ip {
            return Ok(Self {
                key: format!("org:{}:ip:{}:{}", org, escape(&ip.to_string()), class_part),
                class: class.clone(),
                scope: KeyScope::Ip,
            });
        }

        Err(RateLimitError::key_derivation(
            "no user id and no client ip for request",
        ))
    }

    /// Shared bucket for callers with no identity at all.
    pub fn anonymous(class: &EndpointClass) -> Self {
        Self {
            key: format!("anon:{}", escape(class.as_str())),
            class: class.clone(),
            scope: KeyScope::Anonymous,
        }
    }

    /// Derive a key, falling back to the anonymous bucket.
    pub fn derive_or_anonymous(identity: &CallerIdentity, class: &EndpointClass) -> Self {
        match Self::derive(identity, class) {
            Ok(key) => key,
            Err(err) => {
                warn!(error = %err, class = %class, "Falling back to anonymous rate limit bucket");
                Self::anonymous(class)
            }
        }
    }

    pub fn as_str(&self) -> &str {
        &self.key
    }

    pub fn class(&self) -> &EndpointClass {
        &self.class
    }

    pub fn scope(&self) -> KeyScope {
        self.scope
    }
}

impl fmt::Display for RateLimitKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.key)
    }
}

fn non_empty(value: Option<&str>) -> Option<&str> {
    value.map(str::trim).filter(|v| !v.is_empty())
}

/// Escape key separators so user-supplied ids cannot collide across buckets.
fn escape(component: &str) -> String {
    let mut out = String::with_capacity(component.len());
    for ch in component.chars() {
        match ch {
            '%' => out.push_str("%25"),
            ':' => out.push_str("%3A"),
            '{' => out.push_str("%7B"),
            '}' => out.push_str("%7D"),
            _ => out.push(ch),
        }
    }
    out
}

/// Resolve the client IP of a request.
///
/// With `trust_forwarded` set, `X-Forwarded-For` (left-most entry),
/// `X-Real-IP` and `Forwarded: for=` are consulted in that order before the
/// socket peer address.
pub fn resolve_client_ip(
    headers: &HeaderMap,
    peer: Option<IpAddr>,
    trust_forwarded: bool,
) -> Option<IpAddr> {
    if trust_forwarded {
        let forwarded_for = header_str(headers, "x-forwarded-for")
            .and_then(|v| v.split(',').next())
            .and_then(parse_ip_token);
        if forwarded_for.is_some() {
            return forwarded_for;
        }

        let real_ip = header_str(headers, "x-real-ip").and_then(parse_ip_token);
        if real_ip.is_some() {
            return real_ip;
        }

        let forwarded = header_str(headers, "forwarded").and_then(|v| {
            v.split(',')
                .next()?
                .split(';')
                .find_map(|pair| {
                    let (name, value) = pair.split_once('=')?;
                    name.trim().eq_ignore_ascii_case("for").then_some(value)
                })
                .and_then(parse_ip_token)
        });
        if forwarded.is_some() {
            return forwarded;
        }
    }

    peer
}

fn header_str<'a>(headers: &'a HeaderMap, name: &str) -> Option<&'a str> {
    headers.get(name).and_then(|v| v.to_str().ok())
}

/// Parse `1.2.3.4`, `1.2.3.4:80`, `"[2001:db8::1]:4711"` or `2001:db8::1`.
fn parse_ip_token(token: &str) -> Option<IpAddr> {
    let token = token.trim().trim_matches('"');
    if token.is_empty() || token.eq_ignore_ascii_case("unknown") {
        return None;
    }

    if let Some(rest) = token.strip_prefix('[') {
        return rest.split(']').next()?.parse().ok();
    }

    token
        .parse::<IpAddr>()
        .ok()
        .or_else(|| token.parse::<SocketAddr>().ok().map(|addr| addr.ip()))
}
