//! Messages and MQTT-style topic filters.

use bytes::Bytes;
use serde::Serialize;
use serde::de::DeserializeOwned;

use crate::error::{Result, TransportError};

/// A message travelling on a topic. The payload is opaque bytes; the
/// helpers below treat it as JSON.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Message {
    pub topic: String,
    pub payload: Bytes,
}

impl Message {
    pub fn new(topic: impl Into<String>, payload: impl Into<Bytes>) -> Self {
        Self {
            topic: topic.into(),
            payload: payload.into(),
        }
    }

    /// Serializes `value` as the JSON payload of a message on `topic`.
    pub fn json<T: Serialize>(topic: impl Into<String>, value: &T) -> Result<Self> {
        let payload = serde_json::to_vec(value)?;
        Ok(Self::new(topic, payload))
    }

    /// Decodes the JSON payload.
    pub fn decode<T: DeserializeOwned>(&self) -> serde_json::Result<T> {
        serde_json::from_slice(&self.payload)
    }
}

/// Checks that a topic is publishable: non-empty and wildcard-free.
pub fn validate_topic(topic: &str) -> Result<()> {
    if topic.is_empty() || topic.contains(['+', '#']) {
        return Err(TransportError::InvalidTopic(topic.to_string()));
    }
    Ok(())
}

/// A subscription filter.
///
/// Levels are separated by `/`. `+` matches exactly one level and `#`, which
/// may only appear as the final level, matches the parent level and
/// everything below it.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct TopicFilter {
    raw: String,
    levels: Vec<String>,
}

impl TopicFilter {
    pub fn parse(filter: &str) -> Result<Self> {
        let invalid = |reason: &str| TransportError::InvalidFilter {
            filter: filter.to_string(),
            reason: reason.to_string(),
        };

        if filter.is_empty() {
            return Err(invalid("filter is empty"));
        }

        let levels: Vec<String> = filter.split('/').map(str::to_string).collect();
        for (i, level) in levels.iter().enumerate() {
            if level == "#" && i != levels.len() - 1 {
                return Err(invalid("'#' must be the last level"));
            }
            if level.len() > 1 && level.contains(['+', '#']) {
                return Err(invalid("wildcards must occupy a whole level"));
            }
        }

        Ok(Self {
            raw: filter.to_string(),
            levels,
        })
    }

    pub fn as_str(&self) -> &str {
        &self.raw
    }

    pub fn matches(&self, topic: &str) -> bool {
        let mut topic_levels = topic.split('/');
        for level in &self.levels {
            match level.as_str() {
                "#" => return true,
                "+" => {
                    if topic_levels.next().is_none() {
                        return false;
                    }
                }
                literal => {
                    if topic_levels.next() != Some(literal) {
                        return false;
                    }
                }
            }
        }
        topic_levels.next().is_none()
    }
}

impl std::fmt::Display for TopicFilter {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(&self.raw)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn filter(s: &str) -> TopicFilter {
        TopicFilter::parse(s).unwrap()
    }

    #[test]
    fn exact_match() {
        assert!(filter("responses/car-1").matches("responses/car-1"));
        assert!(!filter("responses/car-1").matches("responses/car-2"));
        assert!(!filter("responses/car-1").matches("responses/car-1/extra"));
    }

    #[test]
    fn single_level_wildcard() {
        let f = filter("nodes/+/reservations/request");
        assert!(f.matches("nodes/node-1/reservations/request"));
        assert!(!f.matches("nodes/reservations/request"));
        assert!(!f.matches("nodes/a/b/reservations/request"));
    }

    #[test]
    fn multi_level_wildcard() {
        let f = filter("nodes/node-1/#");
        assert!(f.matches("nodes/node-1"));
        assert!(f.matches("nodes/node-1/resources/R1/status"));
        assert!(!f.matches("nodes/node-2/resources"));
        assert!(filter("#").matches("anything/at/all"));
    }

    #[test]
    fn invalid_filters() {
        assert!(TopicFilter::parse("").is_err());
        assert!(TopicFilter::parse("a/#/b").is_err());
        assert!(TopicFilter::parse("a/b+").is_err());
    }

    #[test]
    fn publish_topics_reject_wildcards() {
        assert!(validate_topic("responses/car-1").is_ok());
        assert!(validate_topic("responses/+").is_err());
        assert!(validate_topic("").is_err());
    }

    #[test]
    fn json_helpers() {
        let msg = Message::json("t", &serde_json::json!({"a": 1})).unwrap();
        let value: serde_json::Value = msg.decode().unwrap();
        assert_eq!(value["a"], 1);
    }
}
