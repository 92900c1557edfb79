use serde_json::Value;
use tidemark::{JsonLineLogger, LogContext, LogHandle, LogLevel, LogRotationPolicy, LogicalTime};

#[test]
fn json_logger_serializes_entries() {
    let policy = LogRotationPolicy {
        max_bytes: 256,
        max_files: 2,
    };
    let mut logger = JsonLineLogger::new(policy);
    let context = LogContext::new("cursor")
        .cursor(7)
        .at(LogicalTime::new(12, 3));
    logger
        .log(100, LogLevel::Info, context, "first entry")
        .unwrap();
    let lines = logger.lines();
    assert_eq!(lines.len(), 1);
    let parsed: Value = serde_json::from_str(&lines[0]).unwrap();
    assert_eq!(parsed["ts"], 100);
    assert_eq!(parsed["level"], "INFO");
    assert_eq!(parsed["component"], "cursor");
    assert_eq!(parsed["cursor_id"], 7);
    assert_eq!(parsed["cluster_time"], serde_json::json!([12, 3]));
    assert_eq!(parsed["message"], "first entry");
}

#[test]
fn cluster_time_is_omitted_when_unknown() {
    let mut logger = JsonLineLogger::new(LogRotationPolicy::default());
    logger
        .log(0, LogLevel::Warn, LogContext::new("session"), "no position")
        .unwrap();
    let parsed: Value = serde_json::from_str(&logger.lines()[0]).unwrap();
    assert!(parsed.get("cluster_time").is_none());
    assert_eq!(parsed["cursor_id"], 0);
}

#[test]
fn loglevel_override_filters_entries() {
    let policy = LogRotationPolicy {
        max_bytes: 512,
        max_files: 1,
    };
    let mut logger = JsonLineLogger::new(policy);
    logger.set_level(LogLevel::Warn);
    logger
        .log(0, LogLevel::Info, LogContext::new("resume"), "info suppressed")
        .unwrap();
    logger
        .log(1, LogLevel::Warn, LogContext::new("resume"), "warn visible")
        .unwrap();
    let lines = logger.lines();
    assert_eq!(lines.len(), 1);
    let parsed: Value = serde_json::from_str(&lines[0]).unwrap();
    assert_eq!(parsed["level"], "WARN");
    assert_eq!(parsed["message"], "warn visible");
}

#[test]
fn rotation_discards_old_segments() {
    let policy = LogRotationPolicy {
        max_bytes: 96,
        max_files: 2,
    };
    let mut logger = JsonLineLogger::new(policy);
    for idx in 0..10 {
        logger
            .log(idx, LogLevel::Info, LogContext::new("cursor").cursor(idx), "payload")
            .unwrap();
    }
    let segments: Vec<_> = logger.files().collect();
    assert!(segments.len() <= 3, "active + rotated segments retained");
    assert!(segments.iter().any(|file| !file.lines().is_empty()));
    let retained = logger.lines();
    assert!(retained.len() < 10);
    assert!(retained.last().unwrap().contains("\"cursor_id\":9"));
}

#[test]
fn handle_clones_share_one_logger() {
    let handle = LogHandle::default();
    let clone = handle.clone();
    clone.debug(LogContext::new("cursor"), "hidden at default level");
    clone.info(LogContext::new("cursor"), "visible");
    handle.set_level(LogLevel::Debug);
    clone.debug(LogContext::new("cursor"), "now visible");
    handle.error(LogContext::new("cursor").cursor(3), "fault");

    let levels: Vec<String> = handle
        .lines()
        .iter()
        .map(|line| {
            let parsed: Value = serde_json::from_str(line).unwrap();
            parsed["level"].as_str().unwrap().to_string()
        })
        .collect();
    assert_eq!(levels, vec!["INFO", "DEBUG", "ERROR"]);
}
