//! Message and validated topic types
//!
//! `TopicName`/`TopicFilter` are parse-don't-validate newtypes: once
//! constructed, every other module can trust the segment rules hold without
//! re-checking them.

use std::fmt;
use std::sync::Arc;

use bytes::Bytes;

use crate::protocol::QoS;

fn split_segments(s: &str) -> impl Iterator<Item = &str> {
    s.split('/')
}

/// Rejected topic name or topic filter.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TopicError(pub &'static str);

impl fmt::Display for TopicError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl std::error::Error for TopicError {}

/// A validated MQTT topic name: a non-empty sequence of non-empty segments,
/// containing no wildcard characters.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct TopicName(Arc<str>);

impl TopicName {
    pub fn parse(topic: &str) -> Result<Self, TopicError> {
        if topic.is_empty() {
            return Err(TopicError("topic name must not be empty"));
        }
        for segment in split_segments(topic) {
            if segment.is_empty() {
                return Err(TopicError("topic name segments must not be empty"));
            }
            if segment.contains('+') || segment.contains('#') {
                return Err(TopicError("topic name must not contain wildcards"));
            }
            if segment.contains('\0') {
                return Err(TopicError("topic name must not contain a null byte"));
            }
        }
        Ok(TopicName(Arc::from(topic)))
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }

    pub fn is_system_topic(&self) -> bool {
        self.0.starts_with('$')
    }
}

impl fmt::Display for TopicName {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl AsRef<str> for TopicName {
    fn as_ref(&self) -> &str {
        &self.0
    }
}

/// A validated MQTT topic filter: segments are literals, a single-level
/// wildcard `+`, or a terminal multi-level wildcard `#` (only as the last
/// segment).
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct TopicFilter(Arc<str>);

impl TopicFilter {
    pub fn parse(filter: &str) -> Result<Self, TopicError> {
        if filter.is_empty() {
            return Err(TopicError("topic filter must not be empty"));
        }
        let segments: Vec<&str> = split_segments(filter).collect();
        for (index, segment) in segments.iter().enumerate() {
            if segment.is_empty() {
                return Err(TopicError("topic filter segments must not be empty"));
            }
            if segment.contains('\0') {
                return Err(TopicError("topic filter must not contain a null byte"));
            }
            if segment.contains('#') && *segment != "#" {
                return Err(TopicError(
                    "multi-level wildcard must occupy its entire segment",
                ));
            }
            if *segment == "#" && index != segments.len() - 1 {
                return Err(TopicError(
                    "multi-level wildcard may only appear as the last segment",
                ));
            }
            if segment.contains('+') && *segment != "+" {
                return Err(TopicError(
                    "single-level wildcard must occupy its entire segment",
                ));
            }
        }
        Ok(TopicFilter(Arc::from(filter)))
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for TopicFilter {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl AsRef<str> for TopicFilter {
    fn as_ref(&self) -> &str {
        &self.0
    }
}

/// An application message. Retained publishes with an empty payload are the
/// delete-retained sentinel and never enter the retained store.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Message {
    pub topic: TopicName,
    pub qos: QoS,
    pub retain: bool,
    pub payload: Bytes,
}

impl Message {
    pub fn new(topic: TopicName, qos: QoS, retain: bool, payload: Bytes) -> Self {
        Self {
            topic,
            qos,
            retain,
            payload,
        }
    }

    /// True for a retained publish carrying the delete-retained sentinel.
    pub fn is_retained_delete(&self) -> bool {
        self.retain && self.payload.is_empty()
    }
}
