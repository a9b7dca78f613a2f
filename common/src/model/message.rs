use chrono::{DateTime, TimeZone, Utc};
use eyre::{Context, Result};
use serde_json::Value;

use crate::utils::float_from_value;

/// A decoded PubSub envelope. The inner `message` field arrives as a JSON
/// string nested inside the outer frame, so the connection decodes twice
/// before building one of these.
#[derive(Debug, Clone)]
pub struct Message {
    /// Topic kind prefix, e.g. `"video-playback-by-id"`.
    pub topic: String,
    /// The id half of the topic string.
    pub topic_user: String,
    /// Inner message type, e.g. `"stream-up"` or `"prediction-result"`.
    pub msg_type: String,
    /// The `data` object of the inner message, when present.
    pub data: Option<Value>,
    /// The whole inner message. Dropped after routing so the allocation
    /// does not outlive the handler.
    pub raw: Option<Value>,
    pub timestamp: DateTime<Utc>,
    pub channel_id: String,
    /// Dedup key: `type.topic.channel`.
    pub identifier: String,
}

impl Message {
    /// Parses a message from the full topic string and the inner JSON text.
    pub fn parse(topic_full: &str, inner: &str) -> Result<Message> {
        let (topic, topic_user) = split_topic(topic_full);

        let raw: Value = serde_json::from_str(inner).context("Parsing inner PubSub message")?;
        let msg_type = raw
            .get("type")
            .and_then(|v| v.as_str())
            .unwrap_or_default()
            .to_owned();
        let data = raw.get("data").filter(|v| v.is_object()).cloned();

        let timestamp = resolve_timestamp(&raw, data.as_ref());
        let channel_id = resolve_channel_id(data.as_ref(), topic_user);
        let identifier = format!("{msg_type}.{topic}.{channel_id}");

        Ok(Message {
            topic: topic.to_owned(),
            topic_user: topic_user.to_owned(),
            msg_type,
            data,
            raw: Some(raw),
            timestamp,
            channel_id,
            identifier,
        })
    }

    pub fn data_get<'a>(&'a self, key: &str) -> Option<&'a Value> {
        self.data.as_ref().and_then(|d| d.get(key))
    }
}

fn split_topic(topic_full: &str) -> (&str, &str) {
    match topic_full.rsplit_once('.') {
        Some((topic, user)) => (topic, user),
        None => (topic_full, ""),
    }
}

fn resolve_timestamp(raw: &Value, data: Option<&Value>) -> DateTime<Utc> {
    if let Some(ts) = data
        .and_then(|d| d.get("timestamp"))
        .and_then(|v| v.as_str())
    {
        if let Ok(t) = DateTime::parse_from_rfc3339(ts) {
            return t.with_timezone(&Utc);
        }
    }

    let server_time = data
        .and_then(|d| d.get("server_time"))
        .or_else(|| raw.get("server_time"));
    if server_time.is_some() {
        let secs = float_from_value(server_time);
        if let Some(t) = Utc.timestamp_opt(secs as i64, 0).single() {
            return t;
        }
    }

    Utc::now()
}

fn resolve_channel_id(data: Option<&Value>, topic_user: &str) -> String {
    let Some(data) = data else {
        return topic_user.to_owned();
    };

    for path in [
        &["prediction", "channel_id"][..],
        &["claim", "channel_id"],
        &["channel_id"],
        &["balance", "channel_id"],
    ] {
        let mut v = data;
        let mut found = true;
        for key in path {
            match v.get(key) {
                Some(next) => v = next,
                None => {
                    found = false;
                    break;
                }
            }
        }
        if found {
            if let Some(s) = v.as_str() {
                return s.to_owned();
            }
        }
    }

    topic_user.to_owned()
}

#[cfg(test)]
mod test {
    use super::*;

    #[test]
    fn parse_stream_up() {
        let inner = r#"{"type":"stream-up","server_time":1700000000.123,"play_delay":0}"#;
        let msg = Message::parse("video-playback-by-id.12345", inner).unwrap();
        assert_eq!(msg.topic, "video-playback-by-id");
        assert_eq!(msg.topic_user, "12345");
        assert_eq!(msg.msg_type, "stream-up");
        assert_eq!(msg.channel_id, "12345");
        assert_eq!(msg.identifier, "stream-up.video-playback-by-id.12345");
        assert_eq!(msg.timestamp.timestamp(), 1_700_000_000);
    }

    #[test]
    fn channel_id_from_nested_data() {
        let inner = r#"{"type":"points-earned","data":{"timestamp":"2024-01-01T00:00:00Z","balance":{"channel_id":"999","balance":1500}}}"#;
        let msg = Message::parse("community-points-user-v1.42", inner).unwrap();
        assert_eq!(msg.channel_id, "999");
        assert_eq!(msg.timestamp.timestamp(), 1_704_067_200);
    }

    #[test]
    fn channel_id_from_prediction() {
        let inner = r#"{"type":"prediction-made","data":{"prediction":{"channel_id":"7","event_id":"e1"}}}"#;
        let msg = Message::parse("predictions-user-v1.42", inner).unwrap();
        assert_eq!(msg.channel_id, "7");
        assert_eq!(msg.identifier, "prediction-made.predictions-user-v1.7");
    }

    #[test]
    fn invalid_json_is_an_error() {
        assert!(Message::parse("raid.1", "not json").is_err());
    }
}
