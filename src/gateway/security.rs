//! Credential injection for HTTP tools
//!
//! Each security requirement of a plan reads its values from the merged tool
//! environment and sets a header or query field on the outgoing request. The
//! OAuth2 client credentials flow exchanges a client id and secret for a
//! token, caching tokens per project, client, token URL and scope set.

use super::models::ToolCallErrorSchema;
use super::request::PreparedRequest;
use super::serialization::{encode_query, QueryValues};
use super::writer::ResponseWriter;
use crate::cache::{Cache, CacheableObject, TypedObjectCache};
use crate::error::Result;
use crate::guardian::Policy;
use crate::metrics::HttpLogAttributes;
use crate::toolconfig::{
    canonical_header_key, to_http_header, CaseInsensitiveEnv, HttpToolCallPlan, HttpToolSecurity,
    ToolCallEnv, ToolDescriptor,
};
use base64::{engine::general_purpose::STANDARD, Engine as _};
use chrono::{DateTime, Utc};
use reqwest::header::{HeaderMap, HeaderName, HeaderValue, AUTHORIZATION, CONTENT_TYPE};
use reqwest::StatusCode;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::collections::BTreeMap;
use std::sync::Arc;
use std::time::Duration;
use tracing::{error, info, warn};

const TOKEN_CACHE_NAMESPACE: &str = "client_credentials_token_cache";
const FORM_CONTENT_TYPE: &str = "application/x-www-form-urlencoded";

/// Marker carried by every token endpoint failure; these abort the tool call
pub const TOKEN_REQUEST_FAILED: &str = "failed to make client credentials token request";

/// A cached client credentials access token
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct ClientCredentialsToken {
    pub project_id: String,
    pub client_id: String,
    pub token_url: String,
    pub access_token: String,
    pub scopes: Vec<String>,
    pub expires_in_secs: u64,
    pub created_at: DateTime<Utc>,
}

impl ClientCredentialsToken {
    pub fn is_expired(&self, now: DateTime<Utc>) -> bool {
        let age = now.signed_duration_since(self.created_at);
        age > chrono::Duration::seconds(self.expires_in_secs as i64)
    }
}

impl CacheableObject for ClientCredentialsToken {
    fn cache_key(&self) -> String {
        token_cache_key(&self.project_id, &self.client_id, &self.token_url, &self.scopes)
    }

    fn ttl(&self) -> Option<Duration> {
        Some(Duration::from_secs(self.expires_in_secs))
    }
}

fn normalize_scopes(scopes: &[String]) -> String {
    let mut sorted = scopes.to_vec();
    sorted.sort();
    sorted.join(",")
}

/// Cache key of a token for one project, client, token URL and scope set
pub fn token_cache_key(project_id: &str, client_id: &str, token_url: &str, scopes: &[String]) -> String {
    format!(
        "clientCredentialsTokenCache:projectID-{}-clientID-{}-tokenURL-{}-scopes-{}",
        project_id,
        client_id,
        url::form_urlencoded::byte_serialize(token_url.as_bytes()).collect::<String>(),
        normalize_scopes(scopes)
    )
}

/// `Bearer <token>` unless the value already carries the prefix
pub fn format_for_bearer(token: &str) -> String {
    if token.to_lowercase().starts_with("bearer ") {
        token.to_string()
    } else {
        format!("Bearer {}", token)
    }
}

#[derive(Debug, Default, Deserialize)]
struct OAuthFlows {
    #[serde(rename = "clientCredentials", default)]
    client_credentials: Option<OAuthFlow>,
}

#[derive(Debug, Default, Deserialize)]
struct OAuthFlow {
    #[serde(rename = "tokenUrl", default)]
    token_url: String,
}

/// What the resolver needs to know about the call being secured
#[derive(Debug, Clone, Copy)]
pub struct SecurityContext<'a> {
    pub tool: &'a ToolDescriptor,
    pub plan: &'a HttpToolCallPlan,
    pub env: &'a ToolCallEnv,
    pub server_url: &'a str,
}

/// Applies a plan's security requirements to outgoing requests
#[derive(Clone)]
pub struct SecurityResolver {
    tokens: TypedObjectCache<ClientCredentialsToken>,
    client: reqwest::Client,
    policy: Arc<Policy>,
}

impl SecurityResolver {
    /// `client` is used for token exchanges only
    pub fn new(cache: Arc<dyn Cache>, client: reqwest::Client, policy: Arc<Policy>) -> Self {
        Self {
            tokens: TypedObjectCache::new(cache, TOKEN_CACHE_NAMESPACE),
            client,
            policy,
        }
    }

    pub fn token_cache(&self) -> &TypedObjectCache<ClientCredentialsToken> {
        &self.tokens
    }

    pub fn policy(&self) -> &Policy {
        &self.policy
    }

    /// Inject credentials into `req`.
    ///
    /// Returns `false` when a token endpoint failure was already written to
    /// `writer` as a 401; the caller must not dial the upstream.
    pub async fn process_security(
        &self,
        req: &mut PreparedRequest,
        writer: &mut dyn ResponseWriter,
        ctx: SecurityContext<'_>,
        attrs: &mut HttpLogAttributes,
    ) -> Result<bool> {
        let merged = ctx.env.merged();
        let mut processed: BTreeMap<String, String> = BTreeMap::new();

        let proceed = self
            .apply_requirements(req, writer, &ctx, &merged, &mut processed)
            .await;
        attrs.record_request_headers(
            processed.iter().map(|(k, v)| (k.as_str(), v.as_str())),
            true,
        );
        if !proceed? {
            return Ok(false);
        }

        for (key, value) in ctx.env.system_env.all() {
            let header = to_http_header(key);
            if processed.contains_key(&canonical_header_key(&header)) {
                continue;
            }
            set_header(&mut req.headers, &header, value);
        }

        Ok(true)
    }

    async fn apply_requirements(
        &self,
        req: &mut PreparedRequest,
        writer: &mut dyn ResponseWriter,
        ctx: &SecurityContext<'_>,
        merged: &CaseInsensitiveEnv,
        processed: &mut BTreeMap<String, String>,
    ) -> Result<bool> {
        for security in &ctx.plan.security {
            let Some(security_type) = security.security_type.as_deref() else {
                error!(tool_urn = %ctx.tool.urn, "invalid security type in tool definition");
                continue;
            };
            let scheme = security.scheme.as_deref().unwrap_or("");

            match security_type {
                "apiKey" => apply_api_key(req, security, merged, processed),
                "http" => match scheme {
                    "bearer" => match security.env_variables.first() {
                        None => error!(security_scheme = scheme, "no environment variables provided for bearer auth"),
                        Some(var) if merged.get(var).is_empty() => {
                            error!(env_var = %var, security_scheme = scheme, "token value is empty for bearer auth")
                        }
                        Some(var) => {
                            let value = format_for_bearer(merged.get(var));
                            set_security_header(req, processed, "Authorization", &value);
                        }
                    },
                    "basic" => apply_basic(req, security, merged, processed),
                    other => {
                        error!(security_scheme = other, "unsupported http security scheme");
                    }
                },
                "openIdConnect" => apply_access_token(req, security, merged, processed),
                "oauth2" => {
                    if security.oauth_types.is_empty() {
                        error!(security_scheme = scheme, "no oauth types provided for oauth2 auth");
                    }
                    for oauth_type in &security.oauth_types {
                        match oauth_type.as_str() {
                            "authorization_code" | "implicit" => {
                                apply_access_token(req, security, merged, processed)
                            }
                            "client_credentials" => {
                                match self.client_credentials(ctx, security, merged).await {
                                    Ok(token) => {
                                        let value = format_for_bearer(&token);
                                        set_security_header(req, processed, "Authorization", &value);
                                    }
                                    Err(e) => {
                                        let message = e.to_string();
                                        error!(tool_urn = %ctx.tool.urn, error = %message, "could not process client credentials");
                                        if message.contains(TOKEN_REQUEST_FAILED) {
                                            write_unauthorized(writer, message).await?;
                                            return Ok(false);
                                        }
                                    }
                                }
                            }
                            other => warn!(oauth_type = other, "unsupported oauth type"),
                        }
                    }
                }
                other => {
                    error!(security_type = other, "unsupported security scheme type");
                }
            }
        }
        Ok(true)
    }

    /// Resolve a client credentials token, from the environment, the cache or the token endpoint
    async fn client_credentials(
        &self,
        ctx: &SecurityContext<'_>,
        security: &HttpToolSecurity,
        merged: &CaseInsensitiveEnv,
    ) -> std::result::Result<String, CredentialsError> {
        let mut client_secret = "";
        let mut client_id = "";
        let mut token_url_override = "";
        let mut access_token = "";
        for var in &security.env_variables {
            if var.contains("CLIENT_SECRET") {
                client_secret = merged.get(var);
            } else if var.contains("CLIENT_ID") {
                client_id = merged.get(var);
            } else if var.contains("TOKEN_URL") {
                token_url_override = merged.get(var);
            } else if var.contains("ACCESS_TOKEN") {
                access_token = merged.get(var);
            }
        }

        if !access_token.is_empty() {
            return Ok(access_token.to_string());
        }
        if client_secret.is_empty() {
            return Err(CredentialsError::new("missing client secret for client credentials"));
        }
        if client_id.is_empty() {
            return Err(CredentialsError::new("missing client id for client credentials"));
        }

        let scopes = ctx
            .plan
            .security_scopes
            .get(&security.key)
            .cloned()
            .unwrap_or_default();

        let flows: OAuthFlows = match &security.oauth_flows {
            Some(flows) => serde_json::from_value(flows.clone()).map_err(|e| {
                CredentialsError::new(format!(
                    "failed to unmarshal oauth flows for client credentials: {}",
                    e
                ))
            })?,
            None => OAuthFlows::default(),
        };
        let flow = flows
            .client_credentials
            .ok_or_else(|| CredentialsError::new("no client credentials flow found"))?;

        let mut token_url = flow.token_url;
        if token_url.starts_with('/') {
            token_url = format!("{}{}", ctx.server_url.trim_end_matches('/'), token_url);
        }
        if !token_url_override.is_empty() {
            token_url = token_url_override.to_string();
        }
        if token_url.is_empty() {
            return Err(CredentialsError::new("no client credentials token url found"));
        }

        let project_id = &ctx.tool.project_id;
        let cache_key = token_cache_key(project_id, client_id, &token_url, &scopes);
        if let Some(token) = self.cached_token(&cache_key).await {
            return Ok(token);
        }

        let body = self
            .request_token(&token_url, client_id, client_secret, &scopes)
            .await?;
        let (access_token, expires_in) = parse_token_response(&body).map_err(|e| {
            CredentialsError::new(format!("failed to parse client credentials token response: {}", e))
        })?;

        if expires_in > 0 {
            let entry = ClientCredentialsToken {
                project_id: project_id.clone(),
                client_id: client_id.to_string(),
                token_url,
                access_token: access_token.clone(),
                scopes,
                expires_in_secs: expires_in as u64,
                created_at: Utc::now(),
            };
            if let Err(e) = self.tokens.store(&entry).await {
                error!(error = %e, "failed to store client credentials token in cache");
            }
        }

        Ok(access_token)
    }

    async fn cached_token(&self, key: &str) -> Option<String> {
        let cached = match self.tokens.get(key).await {
            Ok(Some(cached)) => cached,
            Ok(None) => return None,
            Err(e) => {
                warn!(error = %e, "failed to read client credentials token from cache");
                return None;
            }
        };

        // The backing cache may not honour TTLs
        if cached.is_expired(Utc::now()) {
            if let Err(e) = self.tokens.delete(key).await {
                error!(error = %e, "failed to delete expired client credentials token from cache");
            }
            return None;
        }
        Some(cached.access_token)
    }

    async fn request_token(
        &self,
        token_url: &str,
        client_id: &str,
        client_secret: &str,
        scopes: &[String],
    ) -> std::result::Result<Vec<u8>, CredentialsError> {
        let url = url::Url::parse(token_url).map_err(|e| {
            CredentialsError::new(format!("failed to create client credentials token request: {}", e))
        })?;
        self.policy
            .check_url(&url)
            .map_err(|e| CredentialsError::new(format!("{}: {}", TOKEN_REQUEST_FAILED, e)))?;

        let mut form = QueryValues::new();
        form.insert("grant_type".into(), vec!["client_credentials".into()]);
        form.insert("client_id".into(), vec![client_id.to_string()]);
        form.insert("client_secret".into(), vec![client_secret.to_string()]);
        if !scopes.is_empty() {
            form.insert("scope".into(), vec![scopes.join(" ")]);
        }

        let mut resp = self
            .client
            .post(url.clone())
            .header(CONTENT_TYPE, FORM_CONTENT_TYPE)
            .body(encode_query(&form))
            .send()
            .await
            .map_err(|e| CredentialsError::new(format!("{}: {}", TOKEN_REQUEST_FAILED, e)))?;

        if matches!(
            resp.status(),
            StatusCode::UNAUTHORIZED | StatusCode::FORBIDDEN | StatusCode::BAD_REQUEST
        ) {
            info!(token_url = %token_url, "retrying client credentials token request with basic auth");
            let mut form = QueryValues::new();
            form.insert("grant_type".into(), vec!["client_credentials".into()]);
            if !scopes.is_empty() {
                form.insert("scope".into(), vec![scopes.join(" ")]);
            }
            resp = self
                .client
                .post(url)
                .header(CONTENT_TYPE, FORM_CONTENT_TYPE)
                .basic_auth(client_id, Some(client_secret))
                .body(encode_query(&form))
                .send()
                .await
                .map_err(|e| {
                    CredentialsError::new(format!(
                        "{}: failed to make retry token request: {}",
                        TOKEN_REQUEST_FAILED, e
                    ))
                })?;
        }

        let status = resp.status();
        if status != StatusCode::OK {
            let body = resp.text().await.unwrap_or_default();
            return Err(CredentialsError::new(format!(
                "{}: status {}, response: {}",
                TOKEN_REQUEST_FAILED,
                status.as_u16(),
                body
            )));
        }

        resp.bytes().await.map(|b| b.to_vec()).map_err(|e| {
            CredentialsError::new(format!(
                "failed to read client credentials token response body: {}",
                e
            ))
        })
    }
}

/// Failure of the client credentials flow; the message decides whether the call aborts
#[derive(Debug, Clone, PartialEq)]
struct CredentialsError(String);

impl CredentialsError {
    fn new<S: Into<String>>(message: S) -> Self {
        Self(message.into())
    }
}

impl std::fmt::Display for CredentialsError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(&self.0)
    }
}

/// Token and lifetime from a token endpoint response, snake_case first
pub fn parse_token_response(body: &[u8]) -> std::result::Result<(String, i64), String> {
    let value: Value = serde_json::from_slice(body)
        .map_err(|e| format!("failed to decode client credentials token response: {}", e))?;

    let mut access_token = token_field(&value, "access_token");
    let mut expires_in = expiry_field(&value, "expires_in");
    if access_token.is_empty() {
        access_token = token_field(&value, "accessToken");
        expires_in = expiry_field(&value, "expiresIn");
    }
    if access_token.is_empty() {
        return Err("no access token in client credentials token response".to_string());
    }
    Ok((access_token, expires_in))
}

fn token_field(value: &Value, name: &str) -> String {
    value.get(name).and_then(Value::as_str).unwrap_or("").to_string()
}

fn expiry_field(value: &Value, name: &str) -> i64 {
    match value.get(name) {
        Some(Value::Number(n)) => n
            .as_i64()
            .or_else(|| n.as_f64().map(|f| f as i64))
            .unwrap_or(0),
        Some(Value::String(s)) => s.parse().unwrap_or(0),
        _ => 0,
    }
}

pub(crate) fn set_header(headers: &mut HeaderMap, name: &str, value: &str) -> bool {
    let name = match HeaderName::from_bytes(name.as_bytes()) {
        Ok(name) => name,
        Err(_) => {
            warn!(header = %name, "skipping invalid header name");
            return false;
        }
    };
    match HeaderValue::from_str(value) {
        Ok(value) => {
            headers.insert(name, value);
            true
        }
        Err(_) => {
            warn!(header = %name, "skipping invalid header value");
            false
        }
    }
}

fn set_security_header(
    req: &mut PreparedRequest,
    processed: &mut BTreeMap<String, String>,
    name: &str,
    value: &str,
) {
    if set_header(&mut req.headers, name, value) {
        processed.insert(canonical_header_key(name), value.to_string());
    }
}

fn apply_api_key(
    req: &mut PreparedRequest,
    security: &HttpToolSecurity,
    merged: &CaseInsensitiveEnv,
    processed: &mut BTreeMap<String, String>,
) {
    let scheme = security.scheme.as_deref().unwrap_or("");
    let Some(var) = security.env_variables.first() else {
        error!(security_scheme = scheme, "no environment variables provided for api key auth");
        return;
    };
    let value = merged.get(var);
    if value.is_empty() {
        error!(env_var = %var, security_scheme = scheme, "missing value for environment variable in api key auth");
        return;
    }
    let name = match security.name.as_deref() {
        Some(name) if !name.is_empty() => name,
        _ => {
            error!(security_scheme = scheme, "no name provided for api key auth");
            return;
        }
    };

    match security.placement.as_deref().unwrap_or("") {
        "header" => set_security_header(req, processed, name, value),
        "query" => {
            let mut query = QueryValues::new();
            for (k, v) in req.url.query_pairs() {
                query.entry(k.into_owned()).or_default().push(v.into_owned());
            }
            query.insert(name.to_string(), vec![value.to_string()]);
            let encoded = encode_query(&query);
            req.url.set_query(Some(&encoded));
        }
        other => error!(security_placement = other, "unsupported api key placement"),
    }
}

fn apply_basic(
    req: &mut PreparedRequest,
    security: &HttpToolSecurity,
    merged: &CaseInsensitiveEnv,
    processed: &mut BTreeMap<String, String>,
) {
    if security.env_variables.len() < 2 {
        error!("not enough environment variables provided for basic auth");
        return;
    }
    let mut username = "";
    let mut password = "";
    for var in &security.env_variables {
        if var.contains("USERNAME") {
            username = merged.get(var);
        } else if var.contains("PASSWORD") {
            password = merged.get(var);
        }
    }
    if username.is_empty() || password.is_empty() {
        error!(
            username_present = !username.is_empty(),
            password_present = !password.is_empty(),
            "missing username or password value for basic auth"
        );
        return;
    }
    let encoded = STANDARD.encode(format!("{}:{}", username, password));
    set_security_header(req, processed, AUTHORIZATION.as_str(), &format!("Basic {}", encoded));
}

fn apply_access_token(
    req: &mut PreparedRequest,
    security: &HttpToolSecurity,
    merged: &CaseInsensitiveEnv,
    processed: &mut BTreeMap<String, String>,
) {
    for var in security.env_variables.iter().filter(|v| v.contains("ACCESS_TOKEN")) {
        let token = merged.get(var);
        if token.is_empty() {
            error!(env_var = %var, "missing authorization code");
        } else {
            let value = format_for_bearer(token);
            set_security_header(req, processed, "Authorization", &value);
        }
    }
}

async fn write_unauthorized(writer: &mut dyn ResponseWriter, message: String) -> Result<()> {
    let body = serde_json::to_vec(&ToolCallErrorSchema { error: message })?;
    writer
        .headers_mut()
        .insert(CONTENT_TYPE, HeaderValue::from_static("application/json"));
    writer.write_header(StatusCode::UNAUTHORIZED).await?;
    writer.write(&body).await?;
    writer.write(b"\n").await
}
