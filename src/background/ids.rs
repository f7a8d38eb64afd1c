//! Workflow names and workflow id formats
//!
//! Ids follow `v<major>:<name>[:<scope>]`.

use uuid::Uuid;

pub const TASK_QUEUE_MAIN: &str = "main";

pub const PROCESS_DEPLOYMENT: &str = "process_deployment";
pub const CUSTOM_DOMAIN_RECONCILE: &str = "custom_domain_reconcile";
pub const AGENTS_RESPONSE: &str = "agents_response";
pub const DELAYED_CHAT_RESOLUTION_ANALYSIS: &str = "delayed_chat_resolution_analysis";
pub const ANALYZE_CHAT_RESOLUTIONS: &str = "analyze_chat_resolutions";
pub const REFRESH_BILLING_USAGE: &str = "refresh_billing_usage";
pub const REPORT_BILLING_USAGE: &str = "report_billing_usage";
pub const REFRESH_MODEL_PRICING: &str = "refresh_model_pricing";
pub const COLLECT_PLATFORM_USAGE_METRICS: &str = "collect_platform_usage_metrics";
pub const FALLBACK_MODEL_USAGE_TRACKING: &str = "fallback_model_usage_tracking";

pub fn process_deployment_id(deployment_id: Uuid) -> String {
    format!("v1:process-deployment:{}", deployment_id)
}

/// Fixed id shared by the schedule and manual triggers
pub fn custom_domain_reconcile_id() -> String {
    "v1:custom-domain-reconcile".to_string()
}

pub fn agents_response_id(response_id: Uuid) -> String {
    format!("v1:agents-response:{}", response_id)
}

pub fn delayed_chat_resolution_id(chat_id: Uuid) -> String {
    format!("v1:delayed-chat-resolution-analysis:{}", chat_id)
}

pub fn analyze_chat_resolutions_id(chat_id: Uuid) -> String {
    format!("v1:analyze-chat-resolutions:{}", chat_id)
}

pub fn refresh_billing_usage_id() -> String {
    "v1:refresh-billing-usage".to_string()
}

pub fn report_billing_usage_id() -> String {
    "v1:report-billing-usage".to_string()
}

pub fn refresh_model_pricing_id() -> String {
    "v1:refresh-model-pricing".to_string()
}

pub fn collect_platform_usage_metrics_id() -> String {
    "v1:collect-platform-usage-metrics".to_string()
}

pub fn fallback_model_usage_id(generation_id: &str) -> String {
    format!("v1:fallback-model-usage:{}", generation_id)
}

/// Schedule ids are the workflow id with a `-schedule` suffix
pub fn schedule_id(workflow_id: &str) -> String {
    format!("{}-schedule", workflow_id)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_id_formats() {
        let id = Uuid::nil();
        assert_eq!(
            agents_response_id(id),
            "v1:agents-response:00000000-0000-0000-0000-000000000000"
        );
        assert_eq!(
            process_deployment_id(id),
            "v1:process-deployment:00000000-0000-0000-0000-000000000000"
        );
        assert_eq!(fallback_model_usage_id("gen-1"), "v1:fallback-model-usage:gen-1");
        assert_eq!(schedule_id(&custom_domain_reconcile_id()), "v1:custom-domain-reconcile-schedule");
    }
}
