use chrono::Utc;
use schemars::JsonSchema;
use serde::{Deserialize, Serialize};
use serde_json::Value;

/// Natural keys used for update-in-place lookups. Records carry no
/// synthetic ids; identity is the field combination itself.
pub const POST_KEY: &[&str] = &["platform", "scheduled_time"];
pub const ENGAGEMENT_KEY: &[&str] = &["platform", "post_url"];
pub const DOC_KEY: &[&str] = &["framework", "topic"];

/// A job listing with a score for how well it fits the profile.
#[derive(Clone, Debug, Serialize, Deserialize, JsonSchema)]
pub struct JobRecord {
    pub title: String,
    pub company: String,
    pub link: String,
    pub fit_score: f64,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub salary: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub location: Option<String>,
}

#[derive(Clone, Debug, Serialize, Deserialize, JsonSchema)]
pub struct ScheduledPost {
    pub platform: String,
    pub content: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub image_url: Option<String>,
    /// ISO-8601 datetime the post should go out.
    pub scheduled_time: String,
    #[serde(default = "default_post_status")]
    pub status: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub post_url: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub engagement: Option<Value>,
}

fn default_post_status() -> String {
    "scheduled".to_string()
}

#[derive(Clone, Debug, Serialize, Deserialize, JsonSchema)]
pub struct CodeExample {
    pub title: String,
    pub code: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub explanation: Option<String>,
    pub source_url: String,
}

#[derive(Clone, Debug, Serialize, Deserialize, JsonSchema)]
pub struct DocEntry {
    pub framework: String,
    pub topic: String,
    pub description: String,
    #[serde(default)]
    pub code_examples: Vec<CodeExample>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub api_reference: Option<String>,
    pub source_url: String,
    #[serde(default = "now_timestamp")]
    pub timestamp: String,
}

pub(crate) fn now_timestamp() -> String {
    Utc::now().to_rfc3339()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn post_status_defaults_to_scheduled() {
        let post: ScheduledPost = serde_json::from_str(
            r#"{"platform":"Mastodon","content":"hello","scheduled_time":"2026-08-10T09:00:00Z"}"#,
        )
        .unwrap();
        assert_eq!(post.status, "scheduled");
        assert!(post.post_url.is_none());
    }

    #[test]
    fn doc_entry_fills_in_a_timestamp() {
        let entry: DocEntry = serde_json::from_str(
            r#"{"framework":"tokio","topic":"select","description":"waits on several futures","source_url":"https://docs.rs/tokio"}"#,
        )
        .unwrap();
        assert!(!entry.timestamp.is_empty());
        assert!(entry.code_examples.is_empty());
    }
}
