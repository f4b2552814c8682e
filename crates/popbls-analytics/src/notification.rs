//! Store-write notifications and their transport envelopes.
//!
//! A queued message body may be:
//! - the store event itself: `{"Records":[{"s3":{"bucket":{..},"object":{..}}}]}`
//! - a notification envelope around it: `{"Type":"Notification","Message":"<event json>"}`
//! - a queue record carrying either of the above in `body`.

use chrono::{SecondsFormat, Utc};
use popbls_core::ObjectRef;
use serde_json::{json, Value as JsonValue};
use thiserror::Error;
use tracing::warn;

const MAX_ENVELOPE_DEPTH: usize = 4;

#[derive(Debug, Error)]
pub enum NotificationError {
    #[error("invalid json in notification: {0}")]
    InvalidJson(#[from] serde_json::Error),
    #[error("notification has no `Records` array")]
    MissingRecords,
    #[error("notification nested deeper than {MAX_ENVELOPE_DEPTH} envelopes")]
    TooDeep,
}

/// Decode an event key: `+` is a space, `%XX` escapes are expanded.
pub fn decode_event_key(raw: &str) -> String {
    let spaced = raw.replace('+', " ");
    String::from_utf8_lossy(&urlencoding::decode_binary(spaced.as_bytes())).into_owned()
}

/// Encode a key the way store events carry it: per path segment, space as `+`.
pub fn encode_event_key(key: &str) -> String {
    key.split('/')
        .map(|segment| urlencoding::encode(segment).replace("%20", "+"))
        .collect::<Vec<_>>()
        .join("/")
}

/// Unwrap every envelope layer and return the objects the event refers to.
///
/// Test events from the store carry no objects and yield an empty list.
/// Individual records without a bucket name or key are skipped with a warning.
pub fn extract_object_refs(body: &str) -> Result<Vec<ObjectRef>, NotificationError> {
    let value: JsonValue = serde_json::from_str(body)?;
    let mut refs = Vec::new();
    collect_refs(&value, 0, &mut refs)?;
    Ok(refs)
}

fn collect_refs(
    value: &JsonValue,
    depth: usize,
    refs: &mut Vec<ObjectRef>,
) -> Result<(), NotificationError> {
    if depth > MAX_ENVELOPE_DEPTH {
        return Err(NotificationError::TooDeep);
    }

    // Envelope layers carry the next layer as a JSON string.
    for field in ["Message", "body"] {
        if let Some(inner) = value.get(field).and_then(JsonValue::as_str) {
            let inner: JsonValue = serde_json::from_str(inner)?;
            return collect_refs(&inner, depth + 1, refs);
        }
    }

    if value.get("Event").and_then(JsonValue::as_str) == Some("s3:TestEvent") {
        return Ok(());
    }

    let records = value
        .get("Records")
        .and_then(JsonValue::as_array)
        .ok_or(NotificationError::MissingRecords)?;

    for (index, record) in records.iter().enumerate() {
        if record.get("body").is_some() || record.get("Message").is_some() {
            collect_refs(record, depth + 1, refs)?;
            continue;
        }
        let bucket = record.pointer("/s3/bucket/name").and_then(JsonValue::as_str);
        let key = record.pointer("/s3/object/key").and_then(JsonValue::as_str);
        match (bucket, key) {
            (Some(bucket), Some(key)) => refs.push(ObjectRef {
                bucket: bucket.to_string(),
                key: decode_event_key(key),
            }),
            _ => warn!(index, "notification record has no bucket/key; skipping"),
        }
    }
    Ok(())
}

/// Object-created event for `bucket`/`key`, shaped like an S3 notification.
pub fn object_created_event(bucket: &str, key: &str, size: u64, etag: &str) -> JsonValue {
    json!({
        "Records": [{
            "eventVersion": "2.1",
            "eventSource": "aws:s3",
            "eventTime": Utc::now().to_rfc3339_opts(SecondsFormat::Millis, true),
            "eventName": "ObjectCreated:Put",
            "s3": {
                "s3SchemaVersion": "1.0",
                "bucket": { "name": bucket },
                "object": {
                    "key": encode_event_key(key),
                    "size": size,
                    "eTag": etag,
                }
            }
        }]
    })
}

/// Wrap an event in a notification envelope (the second layer).
pub fn wrap_in_notification(event: &JsonValue, message_id: &str) -> JsonValue {
    json!({
        "Type": "Notification",
        "MessageId": message_id,
        "Subject": "Amazon S3 Notification",
        "Message": event.to_string(),
        "Timestamp": Utc::now().to_rfc3339_opts(SecondsFormat::Millis, true),
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    fn object(bucket: &str, key: &str) -> ObjectRef {
        ObjectRef {
            bucket: bucket.into(),
            key: key.into(),
        }
    }

    #[test]
    fn unwraps_raw_store_event() {
        let body = object_created_event("b", "raw/datausa/population/x.json", 10, "e").to_string();
        assert_eq!(
            extract_object_refs(&body).expect("refs"),
            vec![object("b", "raw/datausa/population/x.json")]
        );
    }

    #[test]
    fn unwraps_notification_envelope() {
        let event = object_created_event("b", "pop/ingestion_date=2026-01-01/p.json", 10, "e");
        let body = wrap_in_notification(&event, "m-1").to_string();
        assert_eq!(
            extract_object_refs(&body).expect("refs"),
            vec![object("b", "pop/ingestion_date=2026-01-01/p.json")]
        );
    }

    #[test]
    fn unwraps_queue_batch_around_envelope() {
        let event = object_created_event("b", "k/one.json", 1, "e");
        let envelope = wrap_in_notification(&event, "m-1").to_string();
        let batch = json!({"Records": [{"messageId": "q-1", "body": envelope}]}).to_string();
        assert_eq!(
            extract_object_refs(&batch).expect("refs"),
            vec![object("b", "k/one.json")]
        );
    }

    #[test]
    fn event_keys_are_url_decoded() {
        assert_eq!(
            decode_event_key("raw/my+file%3Dv1.json"),
            "raw/my file=v1.json"
        );
        let key = "pop/ingestion_date=2026-01-01/a b.json";
        assert_eq!(decode_event_key(&encode_event_key(key)), key);
    }

    #[test]
    fn test_events_carry_no_objects() {
        let body = r#"{"Service":"Amazon S3","Event":"s3:TestEvent","Bucket":"b"}"#;
        assert!(extract_object_refs(body).expect("refs").is_empty());
    }

    #[test]
    fn malformed_payloads_are_errors() {
        assert!(matches!(
            extract_object_refs("not json"),
            Err(NotificationError::InvalidJson(_))
        ));
        assert!(matches!(
            extract_object_refs(r#"{"Message":"{\"nothing\":1}"}"#),
            Err(NotificationError::MissingRecords)
        ));
        assert!(matches!(
            extract_object_refs(r#"{"Message":"not json either"}"#),
            Err(NotificationError::InvalidJson(_))
        ));
    }

    #[test]
    fn records_without_bucket_or_key_are_skipped() {
        let body = r#"{"Records":[{"s3":{"bucket":{"name":"b"}}},{"s3":{"bucket":{"name":"b"},"object":{"key":"k"}}}]}"#;
        assert_eq!(extract_object_refs(body).expect("refs"), vec![object("b", "k")]);
    }
}
