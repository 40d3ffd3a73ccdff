use serde::{Deserialize, Deserializer};
use serde_json::Value;
use std::fmt;

/// A feed as listed by the MISP REST API.
///
/// MISP is loose about scalar types here: flags arrive as booleans, `"0"`/
/// `"1"` strings, or numbers depending on version, and ids as strings or
/// numbers. Deserialization normalizes all of them.
#[derive(Debug, Clone, Default, Deserialize)]
pub struct Feed {
    #[serde(default, deserialize_with = "lenient_id")]
    pub id: Option<String>,
    #[serde(default, deserialize_with = "lenient_flag")]
    pub enabled: bool,
    #[serde(default, deserialize_with = "lenient_flag")]
    pub caching_enabled: bool,
}

impl Feed {
    /// A feed needs no configuration when both flags are already set.
    pub fn is_operational(&self) -> bool {
        self.enabled && self.caching_enabled
    }
}

/// Listing entries come either wrapped under a `"Feed"` key (classic
/// CakePHP shape) or flat.
#[derive(Debug, Deserialize)]
#[serde(untagged)]
enum FeedEntry {
    Wrapped {
        #[serde(rename = "Feed")]
        feed: Feed,
    },
    Flat(Feed),
}

impl FeedEntry {
    fn into_feed(self) -> Feed {
        match self {
            FeedEntry::Wrapped { feed } => feed,
            FeedEntry::Flat(feed) => feed,
        }
    }
}

/// Parse a feed listing response body.
///
/// Accepts a bare JSON array or an object with the array under `"data"`.
/// Returns `None` when the body is not a recognizable listing, so callers
/// can fall through to the next endpoint variant.
pub fn parse_feed_listing(body: &str) -> Option<Vec<Feed>> {
    let value: Value = serde_json::from_str(body).ok()?;
    let items = match value {
        Value::Array(items) => items,
        Value::Object(mut map) => match map.remove("data") {
            Some(Value::Array(items)) => items,
            _ => return None,
        },
        _ => return None,
    };

    let mut feeds = Vec::with_capacity(items.len());
    for item in items {
        let entry: FeedEntry = serde_json::from_value(item).ok()?;
        feeds.push(entry.into_feed());
    }
    Some(feeds)
}

/// Build an edit payload from a `feeds/view` response by merging the
/// enable flags into the existing definition. Handles the `"Feed"`-wrapped
/// and flat response shapes; returns `None` for anything else.
pub fn merged_enable_payload(detail: Value, feed_id: &str) -> Option<Value> {
    let mut base = match detail {
        Value::Object(mut map) => match map.remove("Feed") {
            Some(Value::Object(inner)) => inner,
            Some(_) => return None,
            None => map,
        },
        _ => return None,
    };

    base.insert("enabled".to_string(), Value::Bool(true));
    base.insert("caching_enabled".to_string(), Value::Bool(true));
    base.entry("id".to_string())
        .or_insert_with(|| Value::String(feed_id.to_string()));

    Some(Value::Object(base))
}

/// Outcome counts for a configure-feeds run.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct EnableSummary {
    pub total: usize,
    pub already_enabled: usize,
    pub attempted: usize,
    pub succeeded: usize,
    pub failed: usize,
}

impl fmt::Display for EnableSummary {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "total={} already_enabled={} attempted={} succeeded={} failed={}",
            self.total, self.already_enabled, self.attempted, self.succeeded, self.failed
        )
    }
}

/// One step of the provisioning sequence.
#[derive(Debug)]
pub struct StepOutcome {
    pub step: &'static str,
    pub ok: bool,
    pub detail: String,
}

/// Ordered per-step outcomes for a provision-feeds run.
#[derive(Debug, Default)]
pub struct ProvisionReport {
    pub steps: Vec<StepOutcome>,
}

impl ProvisionReport {
    pub fn record(&mut self, step: &'static str, result: anyhow::Result<String>) {
        let outcome = match result {
            Ok(detail) => StepOutcome {
                step,
                ok: true,
                detail,
            },
            Err(error) => StepOutcome {
                step,
                ok: false,
                detail: format!("{error:#}"),
            },
        };
        self.steps.push(outcome);
    }

    pub fn success(&self) -> bool {
        !self.steps.is_empty() && self.steps.iter().all(|s| s.ok)
    }

    pub fn failed_steps(&self) -> usize {
        self.steps.iter().filter(|s| !s.ok).count()
    }
}

fn lenient_id<'de, D>(deserializer: D) -> Result<Option<String>, D::Error>
where
    D: Deserializer<'de>,
{
    let value = Option::<Value>::deserialize(deserializer)?;
    Ok(value.and_then(|v| match v {
        Value::String(s) => {
            let s = s.trim().to_owned();
            (!s.is_empty()).then_some(s)
        }
        Value::Number(n) => Some(n.to_string()),
        _ => None,
    }))
}

fn lenient_flag<'de, D>(deserializer: D) -> Result<bool, D::Error>
where
    D: Deserializer<'de>,
{
    let value = Option::<Value>::deserialize(deserializer)?;
    Ok(match value {
        Some(Value::Bool(b)) => b,
        Some(Value::String(s)) => {
            matches!(s.trim().to_lowercase().as_str(), "1" | "true" | "yes" | "on")
        }
        Some(Value::Number(n)) => n.as_f64().is_some_and(|f| f != 0.0),
        _ => false,
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use anyhow::anyhow;
    use serde_json::json;

    #[test]
    fn test_parse_wrapped_listing_with_string_flags() {
        let body = r#"[
            {"Feed": {"id": "1", "enabled": "1", "caching_enabled": "0", "name": "CIRCL"}},
            {"Feed": {"id": "2", "enabled": "0", "caching_enabled": "0"}}
        ]"#;
        let feeds = parse_feed_listing(body).unwrap();
        assert_eq!(feeds.len(), 2);
        assert_eq!(feeds[0].id.as_deref(), Some("1"));
        assert!(feeds[0].enabled);
        assert!(!feeds[0].caching_enabled);
        assert!(!feeds[0].is_operational());
        assert!(!feeds[1].enabled);
    }

    #[test]
    fn test_parse_flat_listing_with_mixed_types() {
        let body = r#"[
            {"id": 7, "enabled": true, "caching_enabled": true},
            {"id": "8", "enabled": 1, "caching_enabled": "true"}
        ]"#;
        let feeds = parse_feed_listing(body).unwrap();
        assert_eq!(feeds[0].id.as_deref(), Some("7"));
        assert!(feeds[0].is_operational());
        assert_eq!(feeds[1].id.as_deref(), Some("8"));
        assert!(feeds[1].is_operational());
    }

    #[test]
    fn test_parse_data_wrapped_listing() {
        let body = r#"{"data": [{"id": "3"}, {"id": "4"}]}"#;
        let feeds = parse_feed_listing(body).unwrap();
        assert_eq!(feeds.len(), 2);
        assert_eq!(feeds[1].id.as_deref(), Some("4"));
    }

    #[test]
    fn test_parse_listing_length_is_feed_count() {
        let items: Vec<Value> = (1..=42).map(|i| json!({"Feed": {"id": i}})).collect();
        let body = serde_json::to_string(&items).unwrap();
        let feeds = parse_feed_listing(&body).unwrap();
        assert_eq!(feeds.len(), 42);
    }

    #[test]
    fn test_parse_rejects_non_listing() {
        assert!(parse_feed_listing("<html>login</html>").is_none());
        assert!(parse_feed_listing(r#"{"message": "unauthorized"}"#).is_none());
        assert!(parse_feed_listing("\"just a string\"").is_none());
    }

    #[test]
    fn test_missing_id_is_none() {
        let body = r#"[{"enabled": "1"}, {"id": ""}]"#;
        let feeds = parse_feed_listing(body).unwrap();
        assert!(feeds[0].id.is_none());
        assert!(feeds[1].id.is_none());
    }

    #[test]
    fn test_merged_payload_unwraps_feed_key() {
        let detail = json!({"Feed": {"id": "5", "name": "abuse.ch", "enabled": false}});
        let merged = merged_enable_payload(detail, "5").unwrap();
        assert_eq!(merged["enabled"], json!(true));
        assert_eq!(merged["caching_enabled"], json!(true));
        assert_eq!(merged["name"], json!("abuse.ch"));
        assert_eq!(merged["id"], json!("5"));
    }

    #[test]
    fn test_merged_payload_inserts_missing_id() {
        let detail = json!({"name": "feed"});
        let merged = merged_enable_payload(detail, "9").unwrap();
        assert_eq!(merged["id"], json!("9"));
    }

    #[test]
    fn test_merged_payload_rejects_non_object() {
        assert!(merged_enable_payload(json!([1, 2]), "1").is_none());
        assert!(merged_enable_payload(json!("nope"), "1").is_none());
    }

    #[test]
    fn test_enable_summary_display() {
        let summary = EnableSummary {
            total: 5,
            already_enabled: 2,
            attempted: 3,
            succeeded: 2,
            failed: 1,
        };
        assert_eq!(
            summary.to_string(),
            "total=5 already_enabled=2 attempted=3 succeeded=2 failed=1"
        );
    }

    #[test]
    fn test_provision_report_success() {
        let mut report = ProvisionReport::default();
        assert!(!report.success()); // empty report is not a success

        report.record("login", Ok("authenticated".to_string()));
        report.record("cache-feeds", Ok("triggered".to_string()));
        assert!(report.success());
        assert_eq!(report.failed_steps(), 0);

        report.record("fetch-all-feeds", Err(anyhow!("status 500")));
        assert!(!report.success());
        assert_eq!(report.failed_steps(), 1);
        assert!(report.steps[2].detail.contains("status 500"));
    }
}
