//! Tool call gateway
//!
//! Parameter serialization, schema validation with repair, credential
//! injection, retrying upstream dials, jq response filtering and the proxy
//! that ties them together.

pub mod filtering;
pub mod models;
pub mod proxy;
pub mod request;
pub mod retry;
pub mod security;
pub mod serialization;
pub mod templates;
pub mod validation;
pub mod writer;

pub use filtering::{apply_filter, filter_applies, FilterResult};
pub use models::{FilterRequest, PromptGetParams, ToolCallBody, ToolCallErrorSchema};
pub use proxy::{function_environment, resolve_server_url, CallContext, ToolProxy};
pub use request::PreparedRequest;
pub use retry::{parse_retry_after, RetryPolicy};
pub use security::{ClientCredentialsToken, SecurityContext, SecurityResolver};
pub use serialization::{serialize_path_or_header, serialize_query, ParamLocation, QueryValues};
pub use templates::render_template;
pub use validation::{validate_and_heal, Validated};
pub use writer::{BufferedResponseWriter, ChannelResponseWriter, ResponseEvent, ResponseWriter};
