//! Tests for logging configuration and format parsing
//!
//! Tests the pure functions in the logging module that handle
//! log format and level parsing from environment values.

use riskstream::observability::logging::{init_logging, parse_level, LogFormat};
use tracing::Level;

#[test]
fn test_log_format_parse_is_case_insensitive() {
    for input in ["json", "JSON", "Json"] {
        assert_eq!(LogFormat::parse(input), LogFormat::Json);
    }
    for input in ["pretty", "PRETTY", "Pretty"] {
        assert_eq!(LogFormat::parse(input), LogFormat::Pretty);
    }
    for input in ["compact", "COMPACT", "Compact"] {
        assert_eq!(LogFormat::parse(input), LogFormat::Compact);
    }
}

#[test]
fn test_log_format_parse_invalid_defaults_to_json() {
    // Invalid formats default to JSON for production safety
    for input in ["invalid", "", "xml", "yaml", "123"] {
        assert_eq!(LogFormat::parse(input), LogFormat::Json, "input: {input:?}");
    }
}

#[test]
fn test_log_format_parse_ignores_surrounding_whitespace() {
    assert_eq!(LogFormat::parse("  compact  "), LogFormat::Compact);
    assert_eq!(LogFormat::parse("pretty\n"), LogFormat::Pretty);
    assert_eq!(LogFormat::parse("\tjson"), LogFormat::Json);
}

#[test]
fn test_log_level_parsing() {
    assert_eq!(parse_level("error"), Level::ERROR);
    assert_eq!(parse_level(" warn "), Level::WARN);
    assert_eq!(parse_level("DEBUG"), Level::DEBUG);
    assert_eq!(parse_level("trace\n"), Level::TRACE);
    assert_eq!(parse_level("loud"), Level::INFO);
}

#[test]
fn test_logging_can_be_initialized_and_used() {
    init_logging(Level::DEBUG, LogFormat::Compact, true);

    let span = riskstream::connection_span!(generation = 1u64, endpoint = "ws://localhost/ws");
    let _guard = span.enter();
    tracing::info!(state = "Connected", "Logging smoke test");
}
