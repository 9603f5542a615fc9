use std::fmt;
use std::sync::Arc;
use std::thread;
use std::time::Duration;

use bytemuck::{Pod, Zeroable};
use tracing_subscriber::EnvFilter;

use pooled_logger::sinks::ConsoleSink;
use pooled_logger::{
    register_enum, register_struct, Decimal, Level, LogEnum, LogManager, LoggerRule, PipelineConfig, UnmanagedStruct,
};

#[derive(Debug, Clone, Copy)]
enum Side {
    Buy,
    Sell,
}

impl LogEnum for Side {
    const TYPE_ID: u32 = 0x0051_DE00;

    fn to_raw(self) -> u64 {
        self as u64
    }

    fn name_of(raw: u64) -> Option<&'static str> {
        match raw {
            0 => Some("Buy"),
            1 => Some("Sell"),
            _ => None,
        }
    }
}

#[derive(Debug, Clone, Copy, Pod, Zeroable)]
#[repr(C)]
struct Quote {
    bid_cents: i64,
    ask_cents: i64,
}

impl UnmanagedStruct for Quote {
    const TYPE_ID: u32 = 0x0000_0701;

    fn render(&self, out: &mut dyn fmt::Write, _format: Option<&str>) -> fmt::Result {
        write!(
            out,
            "{}.{:02}/{}.{:02}",
            self.bid_cents / 100,
            self.bid_cents % 100,
            self.ask_cents / 100,
            self.ask_cents % 100
        )
    }
}

/// Runs a small multi-threaded demo. An optional argument names a JSON
/// pipeline configuration file.
fn main() -> pooled_logger::Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("warn")))
        .init();

    let config = match std::env::args().nth(1) {
        Some(path) => PipelineConfig::load(path)?,
        None => PipelineConfig {
            pool_size: 64,
            root_level: Level::Debug,
            ..PipelineConfig::default()
        },
    };

    register_enum::<Side>()?;
    register_struct::<Quote>()?;

    let manager = LogManager::builder(config)
        .sink(ConsoleSink::new(Level::Trace))
        .rule(LoggerRule::new("demo.noisy").level(Level::Warn))
        .build()?;

    let workers: Vec<_> = (0..3u32)
        .map(|worker| {
            let logger = manager.logger("demo.trader");
            thread::spawn(move || {
                for order in 0..4u64 {
                    let side = if order % 2 == 0 { Side::Buy } else { Side::Sell };
                    logger
                        .info()
                        .format("worker {0} sent {1} order #{2} at {3}")
                        .append(worker)
                        .append_enum(side)
                        .append(order)
                        .append_unmanaged(&Quote {
                            bid_cents: 10_050 + order as i64,
                            ask_cents: 10_075 + order as i64,
                        })
                        .append_key_value("notional", Decimal::new(125_000 + order as i128, 2))
                        .submit();
                    thread::sleep(Duration::from_millis(5));
                }
            })
        })
        .collect();

    let noisy = manager.logger("demo.noisy");
    noisy.info().append("filtered out before touching the pool").submit();
    noisy.warn().append("reached the console").submit();

    let error: pooled_logger::message::SharedError = Arc::new(std::io::Error::other("connection reset"));
    manager
        .logger("demo")
        .error()
        .append("feed disconnected")
        .with_error(error)
        .submit();

    for worker in workers {
        let _ = worker.join();
    }

    manager.shutdown()?;
    println!("pool: {:?}", manager.pool_metrics());
    Ok(())
}
