use bytemuck::{Pod, Zeroable};
use chrono::{TimeZone, Utc};
use pooled_logger::sinks::MemorySink;
use pooled_logger::type_registry::{TypeLookup, TypeRegistry};
use pooled_logger::{
    register_enum, register_struct, Decimal, EnumArg, Level, LogEnum, LogManager, LogMessage, Logger, PipelineConfig,
    UnmanagedStruct,
};
use std::fmt;
use std::sync::Arc;
use std::time::Duration;
use uuid::Uuid;

#[derive(Debug, Clone, Copy, PartialEq)]
enum Venue {
    Lse,
    Xetra,
}

impl LogEnum for Venue {
    const TYPE_ID: u32 = 0x7E_00_00_01;

    fn to_raw(self) -> u64 {
        self as u64
    }

    fn name_of(raw: u64) -> Option<&'static str> {
        match raw {
            0 => Some("LSE"),
            1 => Some("XETRA"),
            _ => None,
        }
    }
}

#[derive(Debug, Clone, Copy, Pod, Zeroable)]
#[repr(C)]
struct Fill {
    price_ticks: u32,
    quantity: u32,
}

impl UnmanagedStruct for Fill {
    const TYPE_ID: u32 = 0x7E_00_00_02;

    fn render(&self, out: &mut dyn fmt::Write, format: Option<&str>) -> fmt::Result {
        match format {
            Some("short") => write!(out, "{}@{}", self.quantity, self.price_ticks),
            _ => write!(out, "Fill {{ qty: {}, px: {} }}", self.quantity, self.price_ticks),
        }
    }
}

struct Harness {
    manager: LogManager,
    sink: MemorySink,
}

impl Harness {
    fn with_types(types: Arc<dyn TypeLookup>, segment_size: usize) -> Self {
        let sink = MemorySink::new("memory", Level::Trace);
        let manager = LogManager::builder(PipelineConfig {
            pool_size: 4,
            segment_size,
            ..PipelineConfig::default()
        })
        .sink(sink.clone())
        .type_lookup(types)
        .build()
        .unwrap();
        Self { manager, sink }
    }

    fn new() -> Self {
        let registry = TypeRegistry::new();
        registry.register_enum::<Venue>().unwrap();
        registry.register_struct::<Fill>().unwrap();
        Self::with_types(Arc::new(registry), 1024)
    }

    /// Logs one event built by `build` and returns its rendered text.
    fn render(&self, build: impl FnOnce(&mut LogMessage<'_>)) -> String {
        self.sink.clear();
        let logger: Logger = self.manager.logger("fmt");
        let mut event = logger.info();
        build(&mut event);
        event.submit();
        self.manager.flush().unwrap();
        self.sink.texts().pop().unwrap()
    }
}

#[test]
fn test_primitives_render_like_display() {
    let h = Harness::new();
    assert_eq!(h.render(|e| { e.append(u8::MAX); }), u8::MAX.to_string());
    assert_eq!(h.render(|e| { e.append(i8::MIN); }), i8::MIN.to_string());
    assert_eq!(h.render(|e| { e.append(u16::MAX); }), u16::MAX.to_string());
    assert_eq!(h.render(|e| { e.append(i16::MIN); }), i16::MIN.to_string());
    assert_eq!(h.render(|e| { e.append(u32::MAX); }), u32::MAX.to_string());
    assert_eq!(h.render(|e| { e.append(i32::MIN); }), i32::MIN.to_string());
    assert_eq!(h.render(|e| { e.append(u64::MAX); }), u64::MAX.to_string());
    assert_eq!(h.render(|e| { e.append(i64::MIN); }), i64::MIN.to_string());
    assert_eq!(h.render(|e| { e.append(12345usize); }), "12345");
    assert_eq!(h.render(|e| { e.append(-9isize); }), "-9");
    assert_eq!(h.render(|e| { e.append(1.5f32); }), "1.5");
    assert_eq!(h.render(|e| { e.append(0.1f64); }), 0.1f64.to_string());
    assert_eq!(h.render(|e| { e.append(true); }), "true");
    assert_eq!(h.render(|e| { e.append('ß'); }), "ß");
    assert_eq!(h.render(|e| { e.append(Decimal::new(-12345, 2)); }), "-123.45");
    assert_eq!(h.render(|e| { e.append(Duration::from_millis(1500)); }), "1.5s");
    assert_eq!(h.render(|e| { e.append(None::<u32>); }), "null");
    assert_eq!(h.render(|e| { e.append("plain"); }), "plain");
    assert_eq!(h.render(|e| { e.append(Arc::<str>::from("shared")); }), "shared");
    assert_eq!(h.render(|e| { e.append_inline_str(&String::from("inline")); }), "inline");
}

#[test]
fn test_guid_and_datetime_formats() {
    let h = Harness::new();
    let id = Uuid::from_u128(0x6fa4_59ea_ee8a_3ca4_894e_db77_e160_355e);
    let at = Utc.timestamp_opt(1_700_000_000, 0).unwrap();

    assert_eq!(h.render(|e| { e.append(id); }), "6fa459ea-ee8a-3ca4-894e-db77e160355e");
    assert_eq!(h.render(|e| { e.append_formatted(id, "simple"); }), "6fa459eaee8a3ca4894edb77e160355e");
    assert_eq!(h.render(|e| { e.append_formatted(id, "braced"); }), "{6fa459ea-ee8a-3ca4-894e-db77e160355e}");
    assert_eq!(h.render(|e| { e.append_formatted(at, "%Y-%m-%d %H:%M"); }), "2023-11-14 22:13");
}

#[test]
fn test_format_specifiers_match_std() {
    let h = Harness::new();
    assert_eq!(h.render(|e| { e.append_formatted(255u32, "#06x"); }), format!("{:#06x}", 255u32));
    assert_eq!(h.render(|e| { e.append_formatted(-42i64, "08"); }), format!("{:08}", -42i64));
    assert_eq!(h.render(|e| { e.append_formatted(5u8, "#b"); }), format!("{:#b}", 5u8));
    assert_eq!(h.render(|e| { e.append_formatted(3.14159f64, ".2"); }), format!("{:.2}", 3.14159f64));
    assert_eq!(h.render(|e| { e.append_formatted(1500.0f64, "e"); }), format!("{:e}", 1500.0f64));
    assert_eq!(h.render(|e| { e.append_formatted("abc", ">6"); }), format!("{:>6}", "abc"));
    assert_eq!(h.render(|e| { e.append_formatted("abcdef", ".3"); }), format!("{:.3}", "abcdef"));
    assert_eq!(h.render(|e| { e.append_formatted(Decimal::new(12345, 2), ".1"); }), "123.5");
}

#[test]
fn test_unusable_specifier_falls_back_to_plain() {
    let h = Harness::new();
    assert_eq!(h.render(|e| { e.append_formatted(42u32, "N2"); }), "42");
    let at = Utc.timestamp_opt(0, 0).unwrap();
    let fallback = h.render(|e| { e.append_formatted(at, "%Q"); });
    assert!(fallback.starts_with("1970-01-01T00:00:00"), "got {}", fallback);
}

#[test]
fn test_templates_substitute_in_order() {
    let h = Harness::new();
    let text = h.render(|e| {
        e.format("{1} before {0}, {{literal}}, {7}")
            .append("second")
            .append("first");
    });
    assert_eq!(text, "first before second, {literal}, {7}");
}

#[test]
fn test_registered_types_render_by_name() {
    let h = Harness::new();
    assert_eq!(h.render(|e| { e.append_enum(Venue::Xetra); }), "XETRA");
    assert_eq!(h.render(|e| { e.append_enum_option(None::<Venue>); }), "null");
    assert_eq!(h.render(|e| { e.append(EnumArg(Venue::Lse)); }), "LSE");

    let fill = Fill {
        price_ticks: 101,
        quantity: 7,
    };
    assert_eq!(h.render(|e| { e.append_unmanaged(&fill); }), "Fill { qty: 7, px: 101 }");
    assert_eq!(h.render(|e| { e.append_unmanaged_formatted(&fill, "short"); }), "7@101");
    assert_eq!(h.render(|e| { e.append_unmanaged_option(None::<&Fill>); }), "null");
}

#[test]
fn test_unregistered_types_render_placeholders() {
    let h = Harness::with_types(Arc::new(TypeRegistry::new()), 1024);
    assert_eq!(h.render(|e| { e.append_enum(Venue::Xetra); }), "1");

    let fill = Fill {
        price_ticks: 1,
        quantity: 2,
    };
    assert_eq!(h.render(|e| { e.append_unmanaged(&fill); }), "Unmanaged(0x7e000002)");
}

#[test]
fn test_global_registry_is_used_by_default() {
    register_enum::<Venue>().unwrap();
    register_struct::<Fill>().unwrap();

    let sink = MemorySink::new("memory", Level::Info);
    let manager = LogManager::initialize(
        PipelineConfig {
            pool_size: 2,
            ..PipelineConfig::default()
        },
        vec![Box::new(sink.clone())],
        Vec::new(),
    )
    .unwrap();
    manager
        .logger("global")
        .info()
        .append_enum(Venue::Lse)
        .append(" ")
        .append_unmanaged_formatted(
            &Fill {
                price_ticks: 5,
                quantity: 3,
            },
            "short",
        )
        .submit();
    manager.shutdown().unwrap();

    assert_eq!(sink.texts(), vec!["LSE 3@5"]);
}

#[test]
fn test_truncation_keeps_leading_arguments() {
    let h = Harness::with_types(Arc::new(TypeRegistry::new()), 16);
    let text = h.render(|e| {
        for digit in 0..10u8 {
            e.append(digit);
        }
    });
    // Each u8 takes two bytes and the last byte is kept for the marker.
    assert_eq!(text, "0123456 [TRUNCATED]");
}
