//! Topic names published by the risk stream backend

use thiserror::Error;

/// Risk assessment updates
pub const RISK_UPDATE: &str = "risk_update";

/// Threshold alerts raised for high-risk assessments
pub const ALERT: &str = "alert";

/// Topics the backend is known to publish
pub const KNOWN_TOPICS: [&str; 2] = [RISK_UPDATE, ALERT];

/// Normalize a topic name supplied by application code
///
/// Surrounding whitespace is dropped; the topic is otherwise matched
/// verbatim against inbound event types.
pub fn normalize_topic(topic: &str) -> Result<String, TopicError> {
    let trimmed = topic.trim();
    if trimmed.is_empty() {
        return Err(TopicError::Empty);
    }
    if trimmed.chars().any(char::is_control) {
        return Err(TopicError::ControlCharacter);
    }
    Ok(trimmed.to_string())
}

/// Topic validation errors
#[derive(Debug, Error, PartialEq)]
pub enum TopicError {
    #[error("Topic cannot be empty")]
    Empty,
    #[error("Topic contains a control character")]
    ControlCharacter,
}
