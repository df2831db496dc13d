//! Anonymous bearer token exchange for registry pulls.
//!
//! Public registries answer unauthenticated requests with `401` and a
//! `WWW-Authenticate: Bearer realm="...",service="...",scope="..."`
//! challenge. The token is fetched anonymously from `realm` and the request
//! retried with it.
//!
//! Reference: <https://distribution.github.io/distribution/spec/auth/token/>

use serde::Deserialize;

/// Parsed `Bearer` challenge.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BearerChallenge {
    pub realm: String,
    pub service: Option<String>,
    pub scope: Option<String>,
}

impl BearerChallenge {
    /// Parse a `WWW-Authenticate` header value. Returns `None` for non-bearer
    /// schemes or when `realm` is missing.
    pub fn parse(header: &str) -> Option<Self> {
        let header = header.trim();
        let (scheme, params) = header.split_once(char::is_whitespace)?;
        if !scheme.eq_ignore_ascii_case("bearer") {
            return None;
        }

        let mut realm = None;
        let mut service = None;
        let mut scope = None;

        for (key, value) in split_params(params) {
            match key.to_ascii_lowercase().as_str() {
                "realm" => realm = Some(value),
                "service" => service = Some(value),
                "scope" => scope = Some(value),
                _ => {}
            }
        }

        Some(Self {
            realm: realm?,
            service,
            scope,
        })
    }

    /// Query parameters for the token request.
    pub fn query(&self) -> Vec<(&'static str, &str)> {
        let mut query = Vec::new();
        if let Some(service) = &self.service {
            query.push(("service", service.as_str()));
        }
        if let Some(scope) = &self.scope {
            query.push(("scope", scope.as_str()));
        }
        query
    }
}

/// Split `key="value",key=value` pairs. Commas inside quotes are kept
/// (scopes such as `repository:a/b:pull,push` contain them).
fn split_params(params: &str) -> Vec<(String, String)> {
    let mut pairs = Vec::new();
    let mut rest = params.trim();

    while !rest.is_empty() {
        let Some((key, after_key)) = rest.split_once('=') else {
            break;
        };
        let key = key.trim().trim_start_matches(',').trim().to_string();
        let after_key = after_key.trim_start();

        let (value, remainder) = if let Some(quoted) = after_key.strip_prefix('"') {
            match quoted.find('"') {
                Some(end) => (quoted[..end].to_string(), &quoted[end + 1..]),
                None => (quoted.to_string(), ""),
            }
        } else {
            match after_key.find(',') {
                Some(end) => (after_key[..end].trim().to_string(), &after_key[end..]),
                None => (after_key.trim().to_string(), ""),
            }
        };

        pairs.push((key, value));
        rest = remainder.trim_start().trim_start_matches(',').trim_start();
    }

    pairs
}

/// Token endpoint response. Registries use either field name.
#[derive(Debug, Deserialize)]
pub struct TokenResponse {
    #[serde(default)]
    token: Option<String>,
    #[serde(default)]
    access_token: Option<String>,
}

impl TokenResponse {
    pub fn into_token(self) -> Option<String> {
        self.token.or(self.access_token).filter(|t| !t.is_empty())
    }
}
