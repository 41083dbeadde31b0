//! Shared helpers: clocks, retry, LLM response cleanup, prompt formatting.

use std::future::Future;
use std::time::{Duration, SystemTime, UNIX_EPOCH};

use chrono::{DateTime, Utc};
use chrono_tz::Tz;

use crate::error::Result;
use crate::memory::ScoredMemory;

/// Header line prepended to the injected memory block
pub const MEMORY_INJECTION_HEADER: &str =
    "[Long-term memory] The following facts were recalled from previous conversations:";

/// Footer line appended to the injected memory block
pub const MEMORY_INJECTION_FOOTER: &str =
    "[End of long-term memory] Use these naturally; do not mention the recall mechanism.";

/// Seconds since the Unix epoch as a float.
pub fn now_ts() -> f64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_secs_f64())
        .unwrap_or(0.0)
}

/// Current wall-clock time in the given IANA timezone.
///
/// Falls back to UTC with a warning when the name does not resolve; config
/// validation rejects bad names up front, so the fallback only fires for
/// values that bypassed validation.
pub fn now_in_tz(tz_name: &str) -> DateTime<Tz> {
    let tz: Tz = tz_name.parse().unwrap_or_else(|_| {
        tracing::warn!("unknown timezone {tz_name:?}, falling back to UTC");
        Tz::UTC
    });
    Utc::now().with_timezone(&tz)
}

/// Coerce a loosely typed timestamp value to a float, substituting a default
/// for anything unparseable.
pub fn validate_timestamp(value: Option<&serde_json::Value>, default: f64) -> f64 {
    match value {
        Some(v) => v
            .as_f64()
            .or_else(|| v.as_str().and_then(|s| s.parse().ok()))
            .unwrap_or(default),
        None => default,
    }
}

/// Extract the JSON payload from a chat completion that may be wrapped in
/// Markdown code fences.
///
/// JSON-mode responses still arrive as ```` ```json {...} ``` ```` from some
/// providers. This trims a fenced wrapper if present, then falls back to the
/// first `{` ... last `}` span, then to the trimmed input.
pub fn extract_json_from_response(text: &str) -> &str {
    let trimmed = text.trim();

    let unfenced = if let Some(rest) = trimmed.strip_prefix("```") {
        // Drop the optional language tag on the opening fence line.
        let body = rest.split_once('\n').map(|(_, b)| b).unwrap_or(rest);
        body.strip_suffix("```").unwrap_or(body).trim()
    } else {
        trimmed
    };

    match (unfenced.find('{'), unfenced.rfind('}')) {
        (Some(start), Some(end)) if start < end => &unfenced[start..=end],
        _ => unfenced,
    }
}

/// Run a fallible async operation with exponential backoff.
///
/// `max_retries` is the number of retries after the first attempt. The delay
/// before retry `n` is `backoff_secs * 2^n`. Only the final error is
/// propagated; intermediate failures are logged.
pub async fn retry_on_failure<T, F, Fut>(
    op_name: &str,
    max_retries: u32,
    backoff_secs: f64,
    mut op: F,
) -> Result<T>
where
    F: FnMut() -> Fut,
    Fut: Future<Output = Result<T>>,
{
    let mut attempt = 0;
    loop {
        match op().await {
            Ok(value) => return Ok(value),
            Err(e) if attempt < max_retries => {
                let wait = backoff_secs * f64::from(1u32 << attempt);
                tracing::warn!(
                    "{op_name} failed (attempt {}/{}): {e}; retrying in {wait:.1}s",
                    attempt + 1,
                    max_retries + 1
                );
                tokio::time::sleep(Duration::from_secs_f64(wait)).await;
                attempt += 1;
            }
            Err(e) => {
                tracing::error!("{op_name} failed after {} attempts: {e}", attempt + 1);
                return Err(e);
            }
        }
    }
}

/// Format recalled memories into the block injected ahead of the system
/// prompt: one `- [importance: X.XX] content` line per record.
pub fn format_memories_for_injection(memories: &[ScoredMemory]) -> String {
    if memories.is_empty() {
        return String::new();
    }

    let mut out = String::with_capacity(memories.len() * 64);
    out.push_str(MEMORY_INJECTION_HEADER);
    out.push('\n');
    for mem in memories {
        out.push_str(&format!(
            "- [importance: {:.2}] {}\n",
            mem.record.metadata.importance, mem.record.content
        ));
    }
    out.push_str(MEMORY_INJECTION_FOOTER);
    out
}

// ============================================================================
// TESTS
// ============================================================================

#[cfg(test)]
mod tests {
    use super::*;
    use crate::memory::{MemoryMetadata, MemoryRecord};

    #[test]
    fn test_extract_json_plain() {
        assert_eq!(extract_json_from_response(r#"{"a": 1}"#), r#"{"a": 1}"#);
    }

    #[test]
    fn test_extract_json_fenced() {
        let fenced = "```json\n{\"a\": 1}\n```";
        assert_eq!(extract_json_from_response(fenced), r#"{"a": 1}"#);

        let bare_fence = "```\n{\"a\": 1}\n```";
        assert_eq!(extract_json_from_response(bare_fence), r#"{"a": 1}"#);
    }

    #[test]
    fn test_extract_json_with_prose() {
        let noisy = "Here you go:\n{\"scores\": {\"t\": 0.5}}\nHope that helps!";
        assert_eq!(extract_json_from_response(noisy), r#"{"scores": {"t": 0.5}}"#);
    }

    #[test]
    fn test_validate_timestamp_coercion() {
        use serde_json::json;
        assert_eq!(validate_timestamp(Some(&json!(12.5)), 0.0), 12.5);
        assert_eq!(validate_timestamp(Some(&json!("99")), 0.0), 99.0);
        assert_eq!(validate_timestamp(Some(&json!("eh")), 7.0), 7.0);
        assert_eq!(validate_timestamp(None, 7.0), 7.0);
    }

    #[test]
    fn test_now_in_tz_falls_back_to_utc() {
        let t = now_in_tz("Not/AZone");
        assert_eq!(t.timezone(), Tz::UTC);
    }

    #[test]
    fn test_injection_format() {
        let mem = ScoredMemory {
            record: MemoryRecord {
                id: 1,
                content: "user likes jazz".to_string(),
                metadata: MemoryMetadata {
                    importance: 0.8,
                    ..Default::default()
                },
            },
            similarity: 0.9,
        };
        let block = format_memories_for_injection(&[mem]);
        assert!(block.contains("- [importance: 0.80] user likes jazz"));
        assert!(block.starts_with(MEMORY_INJECTION_HEADER));
        assert!(format_memories_for_injection(&[]).is_empty());
    }

    #[tokio::test]
    async fn test_retry_eventually_succeeds() {
        use std::sync::atomic::{AtomicU32, Ordering};
        let calls = AtomicU32::new(0);
        let result = retry_on_failure("test-op", 2, 0.0, || {
            let n = calls.fetch_add(1, Ordering::SeqCst);
            async move {
                if n < 2 {
                    Err(crate::error::MemoryError::External("flaky".into()))
                } else {
                    Ok(n)
                }
            }
        })
        .await;
        assert_eq!(result.unwrap(), 2);
        assert_eq!(calls.load(Ordering::SeqCst), 3);
    }

    #[tokio::test]
    async fn test_retry_propagates_final_error() {
        let result: Result<()> = retry_on_failure("test-op", 1, 0.0, || async {
            Err(crate::error::MemoryError::External("down".into()))
        })
        .await;
        assert!(result.is_err());
    }
}
