//! Tool proxy
//!
//! Turns one tool call body into an upstream request, secures and dials it
//! with retry, then relays the response to a [`ResponseWriter`].

use super::filtering::{apply_filter, filter_applies};
use super::models::{
    FilterRequest, PromptGetParams, ToolCallBody, ToolCallErrorSchema, HEADER_FILTERED_RESPONSE,
    HEADER_INVOKE_ID, HEADER_PROXIED_RESPONSE, HEADER_PROXY, PROXIED_HEADERS,
};
use super::request::PreparedRequest;
use super::retry::RetryPolicy;
use super::security::{set_header, SecurityContext, SecurityResolver};
use super::serialization::{
    encode_query, form_encode_body, insert_path_params, serialize_path_or_header, serialize_query,
    ParamLocation, QueryValues,
};
use super::templates::render_template;
use super::validation::{validate_and_heal, Validated};
use super::writer::ResponseWriter;
use crate::cache::Cache;
use crate::config::GatewayConfig;
use crate::error::{GatewayError, GuardianErrorKind, Result};
use crate::guardian::{guarded_client, Policy};
use crate::metrics::{filter_allowed_headers, HttpLogAttributes, ToolMetrics, ToolMetricsClient};
use crate::toolconfig::{
    FunctionToolCallPlan, HttpToolCallPlan, PromptToolCallPlan, ResponseFilterConfig, ToolCallEnv,
    ToolCallPlan, ToolDescriptor, ToolKind,
};
use async_trait::async_trait;
use bytes::Bytes;
use futures_util::StreamExt;
use reqwest::header::{HeaderMap, HeaderName, HeaderValue, ACCEPT, CONTENT_LENGTH, CONTENT_TYPE, TRAILER, USER_AGENT};
use reqwest::{Method, StatusCode};
use serde::Serialize;
use serde_json::value::RawValue;
use serde_json::{Map, Value};
use std::collections::{BTreeMap, HashMap};
use std::sync::Arc;
use std::time::Duration;
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};
use url::Url;
use uuid::Uuid;

const INVALID_INPUT_PREFIX: &str =
    "The input to the tool is invalid with the attached error. Please review the tool schema closely";

/// Cancellation and deadline for one tool call
#[derive(Debug, Clone, Default)]
pub struct CallContext {
    pub cancel: CancellationToken,
    /// Retries that would start after this instant are skipped
    pub deadline: Option<Instant>,
}

impl CallContext {
    pub fn new(cancel: CancellationToken) -> Self {
        Self { cancel, deadline: None }
    }

    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.deadline = Some(Instant::now() + timeout);
        self
    }
}

/// Executes tool calls against upstream servers, function runners and prompt templates
#[derive(Clone)]
pub struct ToolProxy {
    client: reqwest::Client,
    security: SecurityResolver,
    retry: RetryPolicy,
    metrics: Arc<dyn ToolMetrics>,
    logs: Arc<dyn ToolMetricsClient>,
}

impl ToolProxy {
    pub fn new(
        client: reqwest::Client,
        security: SecurityResolver,
        retry: RetryPolicy,
        metrics: Arc<dyn ToolMetrics>,
        logs: Arc<dyn ToolMetricsClient>,
    ) -> Self {
        Self {
            client,
            security,
            retry,
            metrics,
            logs,
        }
    }

    /// Build a proxy whose clients both dial through `policy`
    pub fn from_config(
        config: &GatewayConfig,
        policy: Arc<Policy>,
        cache: Arc<dyn Cache>,
        metrics: Arc<dyn ToolMetrics>,
        logs: Arc<dyn ToolMetricsClient>,
    ) -> Result<Self> {
        let client = guarded_client(policy.clone(), &config.proxy.client_options())?;
        let token_client = guarded_client(policy.clone(), &config.oauth.client_options())?;
        let security = SecurityResolver::new(cache, token_client, policy);
        Ok(Self::new(
            client,
            security,
            RetryPolicy::from(&config.retry),
            metrics,
            logs,
        ))
    }

    pub fn security(&self) -> &SecurityResolver {
        &self.security
    }

    /// Run one tool call and write its response to `writer`.
    ///
    /// Errors are returned before anything is written; once a status has been
    /// written the call always returns `Ok`.
    pub async fn do_call(
        &self,
        writer: &mut dyn ResponseWriter,
        body: &[u8],
        env: ToolCallEnv,
        plan: &ToolCallPlan,
        attrs: &mut HttpLogAttributes,
        ctx: &CallContext,
    ) -> Result<()> {
        let tool = &plan.descriptor;
        let mut recorder = StatusRecorder::new(writer);

        let result = match plan.kind {
            ToolKind::Http => match plan.http.as_ref() {
                Some(http) => {
                    self.do_http(&mut recorder, body, env, tool, http, attrs, ctx)
                        .await
                }
                None => Err(kind_not_set(tool)),
            },
            ToolKind::Function => match plan.function.as_ref() {
                Some(function) => {
                    self.do_function(&mut recorder, body, env, tool, function, attrs, ctx)
                        .await
                }
                None => Err(kind_not_set(tool)),
            },
            ToolKind::Prompt => match plan.prompt.as_ref() {
                Some(prompt) => self.do_prompt(&mut recorder, body, prompt).await,
                None => Err(kind_not_set(tool)),
            },
        };

        let status = match &result {
            Ok(()) => recorder.status(),
            Err(e) => e.status_code(),
        };
        let content_type = recorder
            .headers()
            .get(CONTENT_TYPE)
            .and_then(|v| v.to_str().ok())
            .unwrap_or("")
            .to_string();
        info!(
            tool_urn = %tool.urn,
            tool_name = %tool.name,
            organization_id = %tool.organization_id,
            project_id = %tool.project_id,
            http_status = status,
            http_method = %attrs.http_method,
            content_type = %content_type,
            "{} tool call",
            plan.kind
        );
        self.metrics
            .record_tool_call(&tool.organization_id, &tool.urn.to_string(), status)
            .await;

        result
    }

    #[allow(clippy::too_many_arguments)]
    async fn do_http(
        &self,
        writer: &mut dyn ResponseWriter,
        raw: &[u8],
        mut env: ToolCallEnv,
        tool: &ToolDescriptor,
        plan: &HttpToolCallPlan,
        attrs: &mut HttpLogAttributes,
        ctx: &CallContext,
    ) -> Result<()> {
        attrs.record_method(&plan.method);
        attrs.record_route(&plan.path);

        let mut call: ToolCallBody = serde_json::from_slice(raw)
            .map_err(|e| GatewayError::bad_request(format!("invalid request body: {}", e)))?;

        if let Some(schema) = plan.schema.as_ref() {
            match validate_and_heal(raw, schema) {
                Ok(Validated::Original) => {}
                Ok(Validated::Healed(healed)) => {
                    call = serde_json::from_slice(&healed).map_err(|e| {
                        GatewayError::bad_request(format!("invalid request body: {}", e))
                    })?;
                }
                Err(e) => {
                    warn!(tool_urn = %tool.urn, error = %e, "tool call failed schema validation");
                    let message = format!("{}: {}", INVALID_INPUT_PREFIX, e);
                    return write_json_error(writer, StatusCode::BAD_REQUEST, message).await;
                }
            }
        }

        if let Some(vars) = call.environment_variables.take() {
            for (key, value) in vars {
                env.user_config.set(key, value);
            }
        }

        let mut path_values = HashMap::new();
        for (name, value) in call.path_parameters.iter().flatten() {
            let settings = plan.path_params.get(name);
            if settings.is_none() {
                warn!(http_param_name = %name, "no settings found for path parameter");
            }
            match serialize_path_or_header(name, value, settings, ParamLocation::Path) {
                Some(rendered) if !rendered.is_empty() => {
                    path_values.insert(name.clone(), rendered);
                }
                _ => error!(http_param_name = %name, "failed to parse path parameter"),
            }
        }
        let request_path = insert_path_params(&plan.path, &path_values);

        let server_url = resolve_server_url(plan, &env);
        if server_url.is_empty() {
            return Err(GatewayError::invalid("no server URL provided for tool"));
        }
        attrs.record_server_url(&server_url);
        let full_url = format!(
            "{}/{}",
            server_url.trim_end_matches('/'),
            request_path.trim_start_matches('/')
        );
        let url = Url::parse(&full_url)
            .map_err(|e| GatewayError::invalid(format!("error parsing server url: {}", e)))?;
        let method = Method::from_bytes(plan.method.to_ascii_uppercase().as_bytes())
            .map_err(|_| GatewayError::invalid(format!("invalid http method: {}", plan.method)))?;

        let mut req = PreparedRequest::new(method, url);
        let content_type = plan.request_content_type.as_deref().unwrap_or("");
        if content_type.starts_with("application/x-www-form-urlencoded") {
            let body = call.body_bytes();
            if !body.is_empty() {
                let fields: Map<String, Value> = serde_json::from_slice(body).map_err(|e| {
                    GatewayError::bad_request(format!("failed to parse form body: {}", e))
                })?;
                req.body = Bytes::from(form_encode_body(&fields));
            }
            set_header(&mut req.headers, "Content-Type", content_type);
        } else {
            req.body = Bytes::copy_from_slice(call.body_bytes());
            if !content_type.is_empty() {
                set_header(&mut req.headers, "Content-Type", content_type);
            }
        }
        attrs.record_request_body_bytes(req.body.len() as u64);

        if let Some(params) = call.query_parameters.as_ref() {
            let mut values = QueryValues::new();
            for (name, value) in params {
                let rendered = serialize_query(name, value, plan.query_params.get(name));
                if rendered.is_empty() {
                    error!(http_param_name = %name, "failed to parse query parameter");
                    continue;
                }
                for (key, items) in rendered {
                    values.entry(key).or_default().extend(items);
                }
            }
            let query = encode_query(&values);
            if !query.is_empty() {
                req.url.set_query(Some(&query));
            }
        }

        for (name, value) in call.header_parameters.iter().flatten() {
            match serialize_path_or_header(name, value, plan.header_params.get(name), ParamLocation::Header) {
                Some(rendered) if !rendered.is_empty() => {
                    set_header(&mut req.headers, name, &rendered);
                }
                _ => error!(http_param_name = %name, "failed to parse header parameter"),
            }
        }

        let security = SecurityContext {
            tool,
            plan,
            env: &env,
            server_url: &server_url,
        };
        if !self
            .security
            .process_security(&mut req, writer, security, attrs)
            .await?
        {
            return Ok(());
        }

        set_header(&mut req.headers, HEADER_PROXY, "1");
        if !req.headers.contains_key(ACCEPT) {
            req.headers.insert(ACCEPT, HeaderValue::from_static("*/*"));
        }
        attrs.record_user_agent(req.header_str(USER_AGENT.as_str()));

        let options = RelayOptions {
            filter_config: plan.response_filter.as_ref(),
            filter_request: call.response_filter.as_ref(),
            expected_invoke_id: None,
        };
        self.reverse_proxy(writer, req, tool, attrs, ctx, options).await
    }

    #[allow(clippy::too_many_arguments)]
    async fn do_function(
        &self,
        writer: &mut dyn ResponseWriter,
        raw: &[u8],
        env: ToolCallEnv,
        tool: &ToolDescriptor,
        plan: &FunctionToolCallPlan,
        attrs: &mut HttpLogAttributes,
        ctx: &CallContext,
    ) -> Result<()> {
        let invocation_id = Uuid::new_v4();
        let project_id = parse_id(&tool.project_id, "project")?;
        let deployment_id = parse_id(&tool.deployment_id, "deployment")?;
        let function_id = parse_id(&plan.function_id, "function")?;
        let functions_access_id = parse_id(&plan.functions_access_id, "function access")?;

        let input: Box<RawValue> = serde_json::from_slice(raw)
            .map_err(|e| GatewayError::bad_request(format!("failed to read request body: {}", e)))?;

        let payload = RunnerToolCallRequest {
            invocation_id,
            organization_id: &tool.organization_id,
            organization_slug: &tool.organization_slug,
            project_id,
            project_slug: &tool.project_slug,
            deployment_id,
            function_id,
            functions_access_id,
            tool_urn: tool.urn.to_string(),
            tool_name: &tool.name,
            input: &input,
            environment: function_environment(plan, &env),
        };

        let runner_url = format!("{}/tool-call", plan.runner_url.trim_end_matches('/'));
        let url = Url::parse(&runner_url)
            .map_err(|e| GatewayError::unexpected(format!("failed to create function tool call request: {}", e)))?;
        let mut req = PreparedRequest::new(Method::POST, url);
        req.body = Bytes::from(serde_json::to_vec(&payload)?);
        req.headers
            .insert(CONTENT_TYPE, HeaderValue::from_static("application/json"));
        req.headers.insert(ACCEPT, HeaderValue::from_static("*/*"));
        set_header(&mut req.headers, HEADER_PROXY, "1");

        attrs.record_method(Method::POST.as_str());
        attrs.record_route("/tool-call");
        attrs.record_server_url(&plan.runner_url);
        attrs.record_request_body_bytes(req.body.len() as u64);

        let expected = invocation_id.to_string();
        let disabled = ResponseFilterConfig::disabled();
        let none = FilterRequest::none();
        let options = RelayOptions {
            filter_config: Some(&disabled),
            filter_request: Some(&none),
            expected_invoke_id: Some(&expected),
        };
        self.reverse_proxy(writer, req, tool, attrs, ctx, options).await
    }

    async fn do_prompt(
        &self,
        writer: &mut dyn ResponseWriter,
        raw: &[u8],
        plan: &PromptToolCallPlan,
    ) -> Result<()> {
        let params: PromptGetParams = serde_json::from_slice(raw).map_err(|e| {
            GatewayError::bad_request(format!("failed to parse get prompt request: {}", e))
        })?;
        let rendered = render_template(&plan.prompt, &plan.kind, &plan.engine, params.arguments.as_ref())?;

        writer
            .headers_mut()
            .insert(CONTENT_TYPE, HeaderValue::from_static("text/plain"));
        writer.write_header(StatusCode::OK).await?;
        writer.write(rendered.as_bytes()).await?;
        Ok(())
    }

    async fn reverse_proxy(
        &self,
        writer: &mut dyn ResponseWriter,
        req: PreparedRequest,
        tool: &ToolDescriptor,
        attrs: &mut HttpLogAttributes,
        ctx: &CallContext,
        options: RelayOptions<'_>,
    ) -> Result<()> {
        let mut base = attrs.clone();
        base.record_request_headers(
            filter_allowed_headers(header_pairs(&req.headers))
                .iter()
                .map(|(k, v)| (k.as_str(), v.as_str())),
            false,
        );

        // Literal IP hosts never reach the guarded resolver
        self.security.policy().check_url(&req.url).map_err(|e| {
            warn!(tool_urn = %tool.urn, url = %req.url, "guardian refused upstream address");
            let message = format!("failed to execute request: {}", e);
            match e.guardian_kind() {
                Some(GuardianErrorKind::BadHost) => GatewayError::bad_host(message),
                _ => GatewayError::blocked_ip(message),
            }
        })?;

        let client = &self.client;
        let logs = &self.logs;
        let prepared = &req;
        let response = self
            .retry
            .execute(&req.method, &ctx.cancel, ctx.deadline, |_| {
                let started = Instant::now();
                let send = prepared.build(client).send();
                let mut attempt = base.clone();
                async move {
                    let outcome = send.await;
                    let elapsed = started.elapsed();
                    attempt.record_duration_ms(elapsed.as_secs_f64() * 1000.0);
                    let outcome_text = match &outcome {
                        Ok(resp) => {
                            attempt.record_status_code(resp.status().as_u16());
                            attempt.record_response_headers(filter_allowed_headers(header_pairs(resp.headers())));
                            if let Some(len) = resp.content_length() {
                                attempt.record_response_body_bytes(len);
                            }
                            resp.status().as_u16().to_string()
                        }
                        Err(e) => format!("error: {}", e),
                    };
                    attempt.record_message(format!(
                        "{} {} -> {} ({:.2}s)",
                        prepared.method,
                        prepared.url.path(),
                        outcome_text,
                        elapsed.as_secs_f64()
                    ));
                    logs.log(attempt.to_record(tool)).await;
                    outcome
                }
            })
            .await?;

        if let Some(expected) = options.expected_invoke_id {
            let received = response
                .headers()
                .get(HEADER_INVOKE_ID)
                .and_then(|v| v.to_str().ok())
                .unwrap_or("");
            if received != expected {
                return Err(GatewayError::gateway(
                    "response verification failed: failed to verify function invocation ID",
                ));
            }
        }

        let status = response.status();
        attrs.record_status_code(status.as_u16());
        let upstream = response.headers().clone();
        copy_proxied_headers(&upstream, writer.headers_mut());

        let content_type = upstream
            .get(CONTENT_TYPE)
            .and_then(|v| v.to_str().ok())
            .unwrap_or("")
            .to_string();

        if content_type.starts_with("text/event-stream") {
            writer.write_header(status).await?;
            debug!(tool_urn = %tool.urn, "streaming with flush");
            let written = relay_body(writer, response, &ctx.cancel, true).await;
            attrs.record_response_body_bytes(written);
            return Ok(());
        }

        let filter_request = options
            .filter_request
            .filter(|request| filter_applies(options.filter_config, Some(*request), status.as_u16(), &content_type));
        if let Some(request) = filter_request {
            let read = response.bytes().await.map_err(|e| e.to_string());
            let filtered = apply_filter(request, status, &content_type, read.as_deref().map_err(Clone::clone));
            let (status, body) = match filtered {
                Some(result) => {
                    let headers = writer.headers_mut();
                    headers.remove(CONTENT_LENGTH);
                    set_header(headers, "Content-Type", &result.content_type);
                    set_header(headers, HEADER_FILTERED_RESPONSE, "1");
                    (result.status, Bytes::from(result.body))
                }
                None => (status, read.unwrap_or_default()),
            };
            writer.write_header(status).await?;
            if let Err(e) = writer.write(&body).await {
                warn!(error = %e, "failed to write filtered response");
            }
            attrs.record_response_body_bytes(body.len() as u64);
            return Ok(());
        }

        writer.write_header(status).await?;
        let written = relay_body(writer, response, &ctx.cancel, false).await;
        attrs.record_response_body_bytes(written);
        Ok(())
    }
}

struct RelayOptions<'a> {
    filter_config: Option<&'a ResponseFilterConfig>,
    filter_request: Option<&'a FilterRequest>,
    expected_invoke_id: Option<&'a str>,
}

#[derive(Serialize)]
struct RunnerToolCallRequest<'a> {
    invocation_id: Uuid,
    organization_id: &'a str,
    #[serde(skip_serializing_if = "str::is_empty")]
    organization_slug: &'a str,
    project_id: Uuid,
    #[serde(skip_serializing_if = "str::is_empty")]
    project_slug: &'a str,
    deployment_id: Uuid,
    function_id: Uuid,
    functions_access_id: Uuid,
    tool_urn: String,
    tool_name: &'a str,
    input: &'a RawValue,
    environment: BTreeMap<String, String>,
}

fn kind_not_set(tool: &ToolDescriptor) -> GatewayError {
    GatewayError::invariant(format!("tool call plan kind not set for {}", tool.urn))
}

fn parse_id(value: &str, what: &str) -> Result<Uuid> {
    Uuid::parse_str(value).map_err(|_| {
        GatewayError::invariant(format!("invalid {} id received for function tool call", what))
    })
}

fn header_pairs(headers: &HeaderMap) -> impl Iterator<Item = (&str, &str)> {
    headers
        .iter()
        .map(|(name, value)| (name.as_str(), value.to_str().unwrap_or("")))
}

/// Server URL for an HTTP tool.
///
/// The system environment wins. When it is non-empty but lacks the
/// variable, the user configuration is not consulted, so callers cannot
/// point a tool holding system credentials at a host of their choosing.
pub fn resolve_server_url(plan: &HttpToolCallPlan, env: &ToolCallEnv) -> String {
    let default = plan.default_server_url.clone().unwrap_or_default();
    let var = plan.server_env_var.as_str();
    if var.is_empty() {
        return default;
    }

    let from_env = match env.system_env.lookup(var).filter(|v| !v.is_empty()) {
        Some(value) => value,
        None if !env.system_env.is_empty() => "",
        None => env.user_config.get(var),
    };
    if from_env.is_empty() {
        warn!(env_var = %var, "provided variables for server not found");
        return default;
    }
    from_env.to_string()
}

/// Runner environment: system variables upper-cased, then declared
/// variables overridden from the user configuration
pub fn function_environment(plan: &FunctionToolCallPlan, env: &ToolCallEnv) -> BTreeMap<String, String> {
    let mut out: BTreeMap<String, String> = env
        .system_env
        .all()
        .map(|(k, v)| (k.to_ascii_uppercase(), v.to_string()))
        .collect();
    for var in plan.variables.iter().chain(plan.auth_input.iter()) {
        let value = env.user_config.get(var);
        if !value.is_empty() {
            out.insert(var.clone(), value.to_string());
        }
    }
    out
}

fn copy_proxied_headers(upstream: &HeaderMap, out: &mut HeaderMap) {
    if let Some(trailer) = upstream.get(TRAILER) {
        out.insert(TRAILER, trailer.clone());
    }
    for name in PROXIED_HEADERS.iter().copied().chain(["Set-Cookie"]) {
        let Ok(header) = HeaderName::from_bytes(name.as_bytes()) else {
            continue;
        };
        for value in upstream.get_all(&header) {
            out.append(header.clone(), value.clone());
        }
    }
    set_header(out, HEADER_PROXIED_RESPONSE, "1");
}

async fn write_json_error(writer: &mut dyn ResponseWriter, status: StatusCode, message: String) -> Result<()> {
    let mut body = serde_json::to_vec(&ToolCallErrorSchema { error: message })?;
    body.push(b'\n');
    writer
        .headers_mut()
        .insert(CONTENT_TYPE, HeaderValue::from_static("application/json"));
    writer.write_header(status).await?;
    writer.write(&body).await
}

/// Copy the upstream body to `writer`, returning the bytes written.
///
/// A failed client write stops the copy; upstream read errors are logged.
async fn relay_body(
    writer: &mut dyn ResponseWriter,
    response: reqwest::Response,
    cancel: &CancellationToken,
    flush_each: bool,
) -> u64 {
    let mut stream = response.bytes_stream();
    let mut written = 0u64;
    loop {
        let next = tokio::select! {
            biased;
            _ = cancel.cancelled() => {
                debug!("tool call cancelled while relaying response");
                break;
            }
            next = stream.next() => next,
        };
        let chunk = match next {
            None => break,
            Some(Ok(chunk)) => chunk,
            Some(Err(e)) => {
                error!(error = %e, "failed to read upstream response body");
                break;
            }
        };
        if let Err(e) = writer.write(&chunk).await {
            warn!(error = %e, "failed to write response to client");
            break;
        }
        written += chunk.len() as u64;
        if flush_each {
            if let Err(e) = writer.flush().await {
                warn!(error = %e, "failed to flush response to client");
                break;
            }
        }
    }
    written
}

/// Remembers the status written through it
struct StatusRecorder<'a> {
    inner: &'a mut dyn ResponseWriter,
    status: Option<StatusCode>,
}

impl<'a> StatusRecorder<'a> {
    fn new(inner: &'a mut dyn ResponseWriter) -> Self {
        Self { inner, status: None }
    }

    fn status(&self) -> u16 {
        self.status.unwrap_or(StatusCode::OK).as_u16()
    }
}

#[async_trait]
impl<'a> ResponseWriter for StatusRecorder<'a> {
    fn headers(&self) -> &HeaderMap {
        self.inner.headers()
    }

    fn headers_mut(&mut self) -> &mut HeaderMap {
        self.inner.headers_mut()
    }

    async fn write_header(&mut self, status: StatusCode) -> Result<()> {
        if self.status.is_none() {
            self.status = Some(status);
        }
        self.inner.write_header(status).await
    }

    async fn write(&mut self, chunk: &[u8]) -> Result<()> {
        if self.status.is_none() {
            self.status = Some(StatusCode::OK);
        }
        self.inner.write(chunk).await
    }

    async fn flush(&mut self) -> Result<()> {
        self.inner.flush().await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::toolconfig::CaseInsensitiveEnv;

    fn env(system: &[(&str, &str)], user: &[(&str, &str)]) -> ToolCallEnv {
        let mut system_env = CaseInsensitiveEnv::new();
        for (k, v) in system {
            system_env.set(*k, *v);
        }
        let mut user_config = CaseInsensitiveEnv::new();
        for (k, v) in user {
            user_config.set(*k, *v);
        }
        ToolCallEnv::new(system_env, user_config)
    }

    fn plan() -> HttpToolCallPlan {
        HttpToolCallPlan {
            default_server_url: Some("https://default.example.com".to_string()),
            server_env_var: "API_SERVER_URL".to_string(),
            method: "GET".to_string(),
            path: "/".to_string(),
            ..Default::default()
        }
    }

    #[test]
    fn test_server_url_precedence() {
        let p = plan();
        assert_eq!(
            resolve_server_url(&p, &env(&[("api_server_url", "https://sys.example.com")], &[])),
            "https://sys.example.com"
        );
        assert_eq!(
            resolve_server_url(&p, &env(&[], &[("API_SERVER_URL", "https://user.example.com")])),
            "https://user.example.com"
        );
        // User config is ignored once any system env exists
        assert_eq!(
            resolve_server_url(
                &p,
                &env(&[("OTHER", "x")], &[("API_SERVER_URL", "https://evil.example.com")])
            ),
            "https://default.example.com"
        );
        assert_eq!(resolve_server_url(&p, &env(&[], &[])), "https://default.example.com");
    }

    #[test]
    fn test_function_environment() {
        let plan = FunctionToolCallPlan {
            variables: vec!["API_TOKEN".to_string()],
            auth_input: Some("ACCESS_TOKEN".to_string()),
            ..Default::default()
        };
        let out = function_environment(
            &plan,
            &env(
                &[("region", "eu"), ("API_TOKEN", "system")],
                &[("api_token", "user"), ("ACCESS_TOKEN", "abc"), ("UNDECLARED", "x")],
            ),
        );
        assert_eq!(out.get("REGION").map(String::as_str), Some("eu"));
        assert_eq!(out.get("API_TOKEN").map(String::as_str), Some("user"));
        assert_eq!(out.get("ACCESS_TOKEN").map(String::as_str), Some("abc"));
        assert!(!out.contains_key("UNDECLARED"));
    }

    #[test]
    fn test_proxied_headers_are_allowlisted() {
        let mut upstream = HeaderMap::new();
        upstream.insert(CONTENT_TYPE, HeaderValue::from_static("application/json"));
        upstream.insert("x-internal", HeaderValue::from_static("secret"));
        upstream.append("set-cookie", HeaderValue::from_static("a=1"));
        upstream.append("set-cookie", HeaderValue::from_static("b=2"));
        upstream.insert(TRAILER, HeaderValue::from_static("X-Checksum"));

        let mut out = HeaderMap::new();
        copy_proxied_headers(&upstream, &mut out);
        assert_eq!(out.get(CONTENT_TYPE).unwrap(), "application/json");
        assert!(out.get("x-internal").is_none());
        assert_eq!(out.get_all("set-cookie").iter().count(), 2);
        assert_eq!(out.get(TRAILER).unwrap(), "X-Checksum");
        assert_eq!(out.get("gram-proxied-response").unwrap(), "1");
    }
}
