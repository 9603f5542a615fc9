use bytemuck::{Pod, Zeroable};
use pooled_logger::manager::POOL_EXHAUSTED_WARNING;
use pooled_logger::sinks::MemorySink;
use pooled_logger::type_registry::TypeRegistry;
use pooled_logger::{ExhaustionStrategy, Level, LogManager, LoggerRule, PipelineConfig, UnmanagedStruct};
use std::fmt;
use std::sync::Arc;
use std::thread;

fn config(pool_size: usize) -> PipelineConfig {
    PipelineConfig {
        pool_size,
        ..PipelineConfig::default()
    }
}

fn start(config: PipelineConfig, sink: &MemorySink) -> LogManager {
    LogManager::initialize(config, vec![Box::new(sink.clone())], Vec::new()).unwrap()
}

#[test]
fn test_end_to_end_info_message() {
    let sink = MemorySink::new("memory", Level::Info);
    let manager = start(config(4), &sink);
    let logger = manager.logger("app");

    logger.info().append("Count ").append(42i32).submit();
    manager.flush().unwrap();

    let records = sink.records();
    assert_eq!(records.len(), 1);
    assert_eq!(records[0].text, "Count 42");
    assert_eq!(records[0].level, Level::Info);
    assert_eq!(records[0].logger, "app");
    assert!(!records[0].truncated);
}

#[test]
fn test_disabled_level_acquires_nothing() {
    let sink = MemorySink::new("memory", Level::Info);
    let manager = start(config(4), &sink);
    let logger = manager.logger("app");

    let before = manager.pool_metrics();
    let mut event = logger.debug();
    assert!(!event.is_enabled());
    event.append("hidden").submit();
    manager.flush().unwrap();

    assert_eq!(manager.pool_metrics().acquired, before.acquired, "Debug event must not touch the pool");
    assert!(sink.is_empty());
}

#[test]
fn test_single_producer_fifo() {
    let sink = MemorySink::new("memory", Level::Trace);
    let manager = start(
        PipelineConfig {
            root_level: Level::Trace,
            exhaustion_strategy: ExhaustionStrategy::WaitUntilAvailable,
            ..config(8)
        },
        &sink,
    );
    let logger = manager.logger("seq");

    for i in 0..500u32 {
        logger.trace().append(i).submit();
    }
    manager.flush().unwrap();

    let expected: Vec<String> = (0..500u32).map(|i| i.to_string()).collect();
    assert_eq!(sink.texts(), expected);
}

#[test]
fn test_multiple_producers_keep_their_own_order() {
    let sink = MemorySink::new("memory", Level::Info);
    let manager = start(
        PipelineConfig {
            exhaustion_strategy: ExhaustionStrategy::WaitUntilAvailable,
            ..config(16)
        },
        &sink,
    );

    let handles: Vec<_> = (0..4u32)
        .map(|producer| {
            let logger = manager.logger("multi");
            thread::spawn(move || {
                for seq in 0..200u32 {
                    logger.info().append(producer).append(":").append(seq).submit();
                }
            })
        })
        .collect();
    for handle in handles {
        handle.join().unwrap();
    }
    manager.flush().unwrap();

    let texts = sink.texts();
    assert_eq!(texts.len(), 800);
    for producer in 0..4u32 {
        let prefix = format!("{}:", producer);
        let seqs: Vec<u32> = texts
            .iter()
            .filter_map(|text| text.strip_prefix(&prefix))
            .map(|seq| seq.parse().unwrap())
            .collect();
        assert_eq!(seqs, (0..200).collect::<Vec<_>>(), "producer {} out of order", producer);
    }
}

#[test]
fn test_truncated_message_carries_suffix() {
    let sink = MemorySink::new("memory", Level::Info);
    let manager = start(
        PipelineConfig {
            segment_size: 16,
            ..config(2)
        },
        &sink,
    );

    manager
        .logger("small")
        .info()
        .append(1u32)
        .append(2u32)
        .append(3u32)
        .append(4u32)
        .submit();
    manager.flush().unwrap();

    let records = sink.records();
    assert!(records[0].truncated);
    // 15 usable bytes hold three 5-byte values; the fourth hits the marker.
    assert_eq!(records[0].text, "123 [TRUNCATED]");
}

#[test]
fn test_dropped_event_reports_once() {
    let sink = MemorySink::new("memory", Level::Info);
    let manager = start(
        PipelineConfig {
            queue_capacity_override: Some(8),
            ..config(1)
        },
        &sink,
    );
    let logger = manager.logger("busy");

    let mut held = logger.info();
    held.append("first");
    for _ in 0..5 {
        logger.info().append("dropped").submit();
    }
    held.submit();
    manager.flush().unwrap();

    // One warning per exhaustion episode; an episode ends when the
    // dispatcher hands the warning message back.
    let records = sink.records();
    let (last, warnings) = records.split_last().unwrap();
    assert_eq!(last.text, "first");
    assert!(!warnings.is_empty() && warnings.len() <= 5);
    for warning in warnings {
        assert_eq!(warning.text, POOL_EXHAUSTED_WARNING);
        assert_eq!(warning.level, Level::Warn);
        assert_eq!(warning.logger, "busy");
    }
    assert_eq!(manager.pool_metrics().dropped, 5);
}

#[test]
fn test_rules_route_to_named_sinks() {
    let console = MemorySink::new("console", Level::Info);
    let audit = MemorySink::new("audit", Level::Trace);
    let manager = LogManager::initialize(
        config(8),
        vec![Box::new(console.clone()), Box::new(audit.clone())],
        vec![
            LoggerRule::new("").sink("console"),
            LoggerRule::new("security").level(Level::Debug).sink("audit"),
        ],
    )
    .unwrap();

    manager.logger("web").info().append("request").submit();
    manager.logger("security.login").debug().append("attempt").submit();
    manager.logger("security.login").warn().append("locked").submit();
    manager.flush().unwrap();

    assert_eq!(console.texts(), vec!["request", "locked"]);
    assert_eq!(audit.texts(), vec!["attempt", "locked"]);
}

#[test]
fn test_key_values_and_errors_reach_sinks() {
    let sink = MemorySink::new("memory", Level::Info);
    let manager = start(config(4), &sink);

    let error: pooled_logger::message::SharedError = Arc::new(std::io::Error::other("timeout"));
    manager
        .logger("api")
        .error()
        .append("call failed")
        .append_key_value("attempt", 3u8)
        .with_error(error)
        .submit();
    manager.flush().unwrap();

    let record = &sink.records()[0];
    assert_eq!(record.text, "call failed");
    assert_eq!(record.key_values, vec![("attempt".to_string(), "3".to_string())]);
    assert_eq!(record.error.as_deref(), Some("timeout"));
}

#[test]
fn test_shutdown_drains_and_disposes() {
    let dir = tempfile::tempdir().unwrap();
    let path = dir.path().join("pipeline.log");
    let file = pooled_logger::sinks::FileSink::create("file", &path, Level::Info).unwrap();
    let manager = LogManager::builder(config(32)).sink(file).build().unwrap();

    let logger = manager.logger("shutdown");
    for i in 0..20u32 {
        logger.info().append("line ").append(i).submit();
    }
    manager.shutdown().unwrap();

    let contents = std::fs::read_to_string(&path).unwrap();
    assert_eq!(contents.lines().count(), 20);
    assert!(contents.lines().last().unwrap().ends_with("shutdown: line 19"));
    assert!(manager.flush().is_err());
}

#[test]
fn test_events_after_shutdown_are_ignored() {
    let sink = MemorySink::new("memory", Level::Info);
    let manager = start(config(4), &sink);
    let logger = manager.logger("late");
    manager.shutdown().unwrap();

    let mut event = logger.info();
    assert!(!event.is_enabled());
    event.append("too late").submit();
    assert!(sink.is_empty());
}

#[test]
fn test_duplicate_sink_names_rejected() {
    let a = MemorySink::new("same", Level::Info);
    let b = MemorySink::new("same", Level::Info);
    let result = LogManager::initialize(config(4), vec![Box::new(a), Box::new(b)], Vec::new());
    assert!(matches!(result, Err(pooled_logger::Error::Config(_))));
}

#[derive(Clone, Copy, Pod, Zeroable)]
#[repr(C)]
struct Corrupt {
    x: u32,
}

impl UnmanagedStruct for Corrupt {
    const TYPE_ID: u32 = 0x0BAD_0001;

    fn render(&self, _out: &mut dyn fmt::Write, _format: Option<&str>) -> fmt::Result {
        panic!("corrupt struct {}", self.x)
    }
}

#[test]
fn test_render_panic_still_reaches_sinks() {
    let registry = TypeRegistry::new();
    registry.register_struct::<Corrupt>().unwrap();
    let sink = MemorySink::new("memory", Level::Info);
    let manager = LogManager::builder(config(4))
        .sink(sink.clone())
        .type_lookup(Arc::new(registry))
        .build()
        .unwrap();
    let logger = manager.logger("panicky");

    logger.info().append("before ").append_unmanaged(&Corrupt { x: 1 }).submit();
    logger.info().append("after").submit();
    manager.flush().unwrap();

    assert_eq!(
        sink.texts(),
        vec![
            "before Unmanaged(0x0bad0001) [render panicked: corrupt struct 1]".to_string(),
            "after".to_string(),
        ]
    );
    assert_eq!(sink.records()[0].logger, "panicky");
    assert_eq!(manager.dispatch_stats().render_failures(), 1);
}
