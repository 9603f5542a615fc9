use std::collections::HashMap;
use std::path::Path;
use std::sync::Arc;
use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::error::{Error, Result};
use crate::level::{Level, LEVEL_OFF};
use crate::pool::ExhaustionStrategy;

/// Smallest buffer that still fits a couple of values and the truncation
/// marker.
pub const MIN_SEGMENT_SIZE: usize = 16;

/// String-table indices are two bytes wide.
pub const MAX_STRING_CAPACITY: usize = u16::MAX as usize + 1;

/// Settings for a [`LogManager`](crate::manager::LogManager).
///
/// Every field has a default, so a JSON document only needs the fields it
/// changes:
///
/// ```
/// # use pooled_logger::config::PipelineConfig;
/// # use pooled_logger::pool::ExhaustionStrategy;
/// let config = PipelineConfig::from_json(r#"{
///     "pool_size": 64,
///     "exhaustion_strategy": "WaitUntilAvailable",
///     "root_level": "Debug"
/// }"#).unwrap();
///
/// assert_eq!(config.pool_size, 64);
/// assert_eq!(config.segment_size, 1024);
/// assert_eq!(config.exhaustion_strategy, ExhaustionStrategy::WaitUntilAvailable);
/// assert_eq!(config.queue_capacity(), Some(64));
/// ```
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct PipelineConfig {
    pub pool_size: usize,
    /// Bytes per message buffer.
    pub segment_size: usize,
    /// String-table slots per message.
    pub string_capacity: usize,
    /// Defaults to `pool_size`. Ignored under `Allocate`, which uses an
    /// unbounded queue.
    #[serde(rename = "queue_capacity")]
    pub queue_capacity_override: Option<usize>,
    pub exhaustion_strategy: ExhaustionStrategy,
    pub truncated_suffix: String,
    pub quarantine_delay_ms: u64,
    /// How long the dispatcher waits for work before flushing sinks anyway.
    pub idle_flush_ms: u64,
    pub null_display: String,
    /// Level for loggers no rule matches.
    pub root_level: Level,
}

impl Default for PipelineConfig {
    fn default() -> Self {
        Self {
            pool_size: 1024,
            segment_size: 1024,
            string_capacity: 32,
            queue_capacity_override: None,
            exhaustion_strategy: ExhaustionStrategy::DropAndNotify,
            truncated_suffix: crate::render::DEFAULT_TRUNCATED_SUFFIX.to_string(),
            quarantine_delay_ms: 15_000,
            idle_flush_ms: 100,
            null_display: crate::render::DEFAULT_NULL_DISPLAY.to_string(),
            root_level: Level::Info,
        }
    }
}

impl PipelineConfig {
    /// Parses and validates a JSON document.
    pub fn from_json(json: &str) -> Result<Self> {
        let config: PipelineConfig = serde_json::from_str(json)?;
        config.validate()?;
        Ok(config)
    }

    /// Reads, parses and validates a JSON file.
    pub fn load(path: impl AsRef<Path>) -> Result<Self> {
        let json = std::fs::read_to_string(path)?;
        Self::from_json(&json)
    }

    pub fn validate(&self) -> Result<()> {
        if self.pool_size == 0 {
            return Err(Error::Config("pool_size must be at least 1".into()));
        }
        if self.segment_size < MIN_SEGMENT_SIZE {
            return Err(Error::Config(format!(
                "segment_size must be at least {}, got {}",
                MIN_SEGMENT_SIZE, self.segment_size
            )));
        }
        if self.string_capacity > MAX_STRING_CAPACITY {
            return Err(Error::Config(format!(
                "string_capacity must be at most {}, got {}",
                MAX_STRING_CAPACITY, self.string_capacity
            )));
        }
        if self.queue_capacity_override == Some(0) {
            return Err(Error::Config("queue_capacity must be at least 1".into()));
        }
        if self.idle_flush_ms == 0 {
            return Err(Error::Config("idle_flush_ms must be at least 1".into()));
        }
        Ok(())
    }

    /// Bound of the handoff queue, `None` when it is unbounded.
    pub fn queue_capacity(&self) -> Option<usize> {
        match self.exhaustion_strategy {
            ExhaustionStrategy::Allocate => None,
            _ => Some(self.queue_capacity_override.unwrap_or(self.pool_size)),
        }
    }

    pub fn quarantine_delay(&self) -> Duration {
        Duration::from_millis(self.quarantine_delay_ms)
    }

    pub fn idle_flush(&self) -> Duration {
        Duration::from_millis(self.idle_flush_ms)
    }
}

/// Routing for a subtree of logger names.
///
/// A rule with prefix `"db"` applies to the loggers `db`, `db.pool` and
/// `db.pool.conn`, but not to `dbx`. The empty prefix matches everything.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct LoggerRule {
    pub prefix: String,
    /// Level for the subtree. `None` inherits the parent's.
    #[serde(default)]
    pub level: Option<Level>,
    /// Sinks added for the subtree.
    #[serde(default)]
    pub sinks: Vec<String>,
    /// When false, sinks inherited from parent rules are dropped.
    #[serde(default = "default_true")]
    pub include_parent_sinks: bool,
}

fn default_true() -> bool {
    true
}

impl LoggerRule {
    pub fn new(prefix: impl Into<String>) -> Self {
        Self {
            prefix: prefix.into(),
            level: None,
            sinks: Vec::new(),
            include_parent_sinks: true,
        }
    }

    pub fn level(mut self, level: Level) -> Self {
        self.level = Some(level);
        self
    }

    pub fn sink(mut self, name: impl Into<String>) -> Self {
        self.sinks.push(name.into());
        self
    }

    /// Drops the sinks inherited from parent rules.
    pub fn exclusive(mut self) -> Self {
        self.include_parent_sinks = false;
        self
    }

    fn depth(&self) -> usize {
        if self.prefix.is_empty() {
            0
        } else {
            self.prefix.split('.').count()
        }
    }

    fn matches(&self, logger: &str) -> bool {
        let prefix = self.prefix.as_str();
        prefix.is_empty()
            || logger == prefix
            || (logger.starts_with(prefix) && logger[prefix.len()..].starts_with('.'))
    }
}

/// Effective settings for one logger name.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ResolvedConfig {
    pub level: Level,
    /// Indices of the sinks, in the order they were supplied.
    pub sinks: Vec<usize>,
    /// Lowest level any resolved sink will accept, or
    /// `LEVEL_OFF` when the logger reaches no sink.
    pub(crate) producer_min: u8,
}

impl ResolvedConfig {
    /// Whether an event at `level` reaches at least one sink.
    pub fn is_enabled(&self, level: Level) -> bool {
        level.as_u8() >= self.producer_min
    }
}

struct CompiledRule {
    rule: LoggerRule,
    sinks: Vec<usize>,
}

/// Maps logger names to levels and sinks.
///
/// Rules form a tree by prefix. For a given name, every rule whose prefix
/// matches is applied from the shortest prefix to the longest: the level of
/// the deepest rule that sets one wins, and each rule's sinks are added to
/// those collected so far, or replace them when the rule is
/// [exclusive](LoggerRule::exclusive). The root level comes from the
/// pipeline configuration and the root sinks are all supplied sinks.
///
/// # Examples
///
/// ```
/// # use pooled_logger::config::{LoggerRule, Resolver};
/// # use pooled_logger::level::Level;
/// let sinks = [("console".to_string(), Level::Trace), ("audit".to_string(), Level::Trace)];
/// let rules = [
///     LoggerRule::new("").sink("console"),
///     LoggerRule::new("app.audit").level(Level::Debug).sink("audit").exclusive(),
/// ];
/// let resolver = Resolver::new(Level::Info, &sinks, &rules, false).unwrap();
///
/// let resolved = resolver.resolve("app.audit.login");
/// assert_eq!(resolved.level, Level::Debug);
/// assert_eq!(resolved.sinks, vec![1]);
///
/// let resolved = resolver.resolve("app.web");
/// assert_eq!(resolved.level, Level::Info);
/// assert_eq!(resolved.sinks, vec![0]);
/// ```
pub struct Resolver {
    root_level: Level,
    root_sinks: Vec<usize>,
    sink_levels: Vec<Level>,
    rules: Vec<CompiledRule>,
}

impl Resolver {
    /// Builds a resolver over `sinks` (name, minimum level). When
    /// `root_gets_all_sinks` is true every sink is attached at the root;
    /// otherwise sinks are only reached through rules.
    pub fn new(
        root_level: Level,
        sinks: &[(String, Level)],
        rules: &[LoggerRule],
        root_gets_all_sinks: bool,
    ) -> Result<Self> {
        let index_of: HashMap<&str, usize> = sinks
            .iter()
            .enumerate()
            .map(|(index, (name, _))| (name.as_str(), index))
            .collect();

        let mut compiled = rules
            .iter()
            .map(|rule| {
                let sinks = rule
                    .sinks
                    .iter()
                    .map(|name| {
                        index_of.get(name.as_str()).copied().ok_or_else(|| Error::UnknownSink {
                            rule: rule.prefix.clone(),
                            sink: name.clone(),
                        })
                    })
                    .collect::<Result<Vec<_>>>()?;
                Ok(CompiledRule {
                    rule: rule.clone(),
                    sinks,
                })
            })
            .collect::<Result<Vec<_>>>()?;
        // Stable: equal-depth rules keep their given order.
        compiled.sort_by_key(|compiled| compiled.rule.depth());

        Ok(Self {
            root_level,
            root_sinks: if root_gets_all_sinks {
                (0..sinks.len()).collect()
            } else {
                Vec::new()
            },
            sink_levels: sinks.iter().map(|(_, level)| *level).collect(),
            rules: compiled,
        })
    }

    pub fn resolve(&self, logger: &str) -> ResolvedConfig {
        let mut level = self.root_level;
        let mut sinks = self.root_sinks.clone();

        for compiled in self.rules.iter().filter(|compiled| compiled.rule.matches(logger)) {
            if let Some(rule_level) = compiled.rule.level {
                level = rule_level;
            }
            if !compiled.rule.include_parent_sinks {
                sinks.clear();
            }
            for &sink in &compiled.sinks {
                if !sinks.contains(&sink) {
                    sinks.push(sink);
                }
            }
        }

        let producer_min = sinks
            .iter()
            .map(|&sink| self.sink_levels[sink].max(level).as_u8())
            .min()
            .unwrap_or(LEVEL_OFF);

        ResolvedConfig {
            level,
            sinks,
            producer_min,
        }
    }
}

/// Per-name memo of [`Resolver::resolve`], owned by the dispatcher.
pub(crate) struct ResolutionCache {
    resolver: Arc<Resolver>,
    entries: HashMap<Arc<str>, ResolvedConfig>,
    root: ResolvedConfig,
}

impl ResolutionCache {
    pub(crate) fn new(resolver: Arc<Resolver>) -> Self {
        let root = resolver.resolve("");
        Self {
            resolver,
            entries: HashMap::new(),
            root,
        }
    }

    pub(crate) fn get(&mut self, logger: Option<&Arc<str>>) -> &ResolvedConfig {
        let Some(name) = logger.filter(|name| !name.is_empty()) else {
            return &self.root;
        };
        let resolver = &self.resolver;
        self.entries
            .entry(Arc::clone(name))
            .or_insert_with(|| resolver.resolve(name))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn sinks() -> Vec<(String, Level)> {
        vec![
            ("console".to_string(), Level::Info),
            ("file".to_string(), Level::Trace),
            ("audit".to_string(), Level::Warn),
        ]
    }

    #[test]
    fn test_defaults_validate() {
        PipelineConfig::default().validate().unwrap();
    }

    #[test]
    fn test_validation_rejects_bad_values() {
        let config = PipelineConfig {
            segment_size: 8,
            ..PipelineConfig::default()
        };
        assert!(matches!(config.validate(), Err(Error::Config(_))));

        let config = PipelineConfig {
            queue_capacity_override: Some(0),
            ..PipelineConfig::default()
        };
        assert!(config.validate().is_err());

        assert!(matches!(
            PipelineConfig::from_json("{\"pool_size\": \"many\"}"),
            Err(Error::ConfigParse(_))
        ));
    }

    #[test]
    fn test_allocate_ignores_queue_bound() {
        let mut config = PipelineConfig {
            pool_size: 8,
            queue_capacity_override: Some(2),
            ..PipelineConfig::default()
        };
        assert_eq!(config.queue_capacity(), Some(2));
        config.exhaustion_strategy = ExhaustionStrategy::Allocate;
        assert_eq!(config.queue_capacity(), None);
    }

    #[test]
    fn test_prefix_matches_whole_segments() {
        let rule = LoggerRule::new("a.b");
        assert!(rule.matches("a.b"));
        assert!(rule.matches("a.b.c"));
        assert!(!rule.matches("a.bc"));
        assert!(!rule.matches("a"));
        assert!(LoggerRule::new("").matches("anything"));
    }

    #[test]
    fn test_deepest_level_wins_and_sinks_accumulate() {
        let rules = [
            LoggerRule::new("db.pool").sink("audit"),
            LoggerRule::new("db").level(Level::Debug),
        ];
        let resolver = Resolver::new(Level::Info, &sinks(), &rules, true).unwrap();

        let resolved = resolver.resolve("db.pool.conn");
        assert_eq!(resolved.level, Level::Debug);
        assert_eq!(resolved.sinks, vec![0, 1, 2]);
        // The file sink takes Trace, so Debug events reach something.
        assert!(resolved.is_enabled(Level::Debug));
        assert!(!resolved.is_enabled(Level::Trace));
    }

    #[test]
    fn test_producer_min_accounts_for_sink_levels() {
        let rules = [LoggerRule::new("net").level(Level::Trace).sink("audit").exclusive()];
        let resolver = Resolver::new(Level::Info, &sinks(), &rules, true).unwrap();

        let resolved = resolver.resolve("net");
        assert_eq!(resolved.sinks, vec![2]);
        assert!(!resolved.is_enabled(Level::Info));
        assert!(resolved.is_enabled(Level::Warn));
    }

    #[test]
    fn test_no_sinks_means_off() {
        let resolver = Resolver::new(Level::Trace, &sinks(), &[], false).unwrap();
        let resolved = resolver.resolve("x");
        assert!(resolved.sinks.is_empty());
        assert!(!resolved.is_enabled(Level::Fatal));
    }

    #[test]
    fn test_unknown_sink_is_an_error() {
        let rules = [LoggerRule::new("x").sink("nowhere")];
        let err = Resolver::new(Level::Info, &sinks(), &rules, true).err().unwrap();
        assert!(matches!(err, Error::UnknownSink { ref sink, .. } if sink == "nowhere"));
    }

    #[test]
    fn test_cache_returns_same_resolution() {
        let resolver = Arc::new(Resolver::new(Level::Warn, &sinks(), &[], true).unwrap());
        let mut cache = ResolutionCache::new(Arc::clone(&resolver));
        let name: Arc<str> = Arc::from("svc");
        assert_eq!(cache.get(Some(&name)).clone(), resolver.resolve("svc"));
        assert_eq!(cache.get(None).level, Level::Warn);
    }
}
