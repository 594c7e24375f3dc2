//! Cache settings
//!
//! Settings are plain data with defaults; [`Settings::from_properties`]
//! reads the `hibernate.cache.*` property names.

use std::collections::HashMap;
use std::fmt;
use std::sync::Arc;
use std::time::Duration;

use ahash::RandomState;

use crate::error::{Error, Result};
use crate::region::{LruRegionFactory, NoCachingRegionFactory, RegionFactory};

const PREFIX: &str = "hibernate.cache.";

/// Default bound for every region without an override
pub const DEFAULT_MAX_ENTRIES: usize = 10_000;

/// Default lifetime of a soft lock left behind by a crashed writer
pub const DEFAULT_SOFT_LOCK_TIMEOUT: Duration = Duration::from_secs(60);

/// Eviction policy of one region
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct RegionConfig {
    /// Size bound; `None` is unbounded
    pub max_entries: Option<usize>,
    /// Time bound; `None` keeps entries until evicted
    pub ttl: Option<Duration>,
}

impl RegionConfig {
    /// No size or time bound
    pub fn unbounded() -> Self {
        Self::default()
    }

    /// Size bound only
    pub fn bounded(max_entries: usize) -> Self {
        Self {
            max_entries: Some(max_entries),
            ttl: None,
        }
    }
}

/// Coordinator settings
#[derive(Clone)]
pub struct Settings {
    /// Enables the entity (L2) cache
    pub use_second_level_cache: bool,
    /// Enables the query cache; requires the L2 cache
    pub use_query_cache: bool,
    /// Builds region storage
    pub region_factory: Arc<dyn RegionFactory>,
    /// Policy for regions without an override
    pub default_region: RegionConfig,
    /// Per-region overrides
    pub regions: HashMap<String, RegionConfig, RandomState>,
    /// Lifetime of soft locks
    pub soft_lock_timeout: Duration,
}

impl Default for Settings {
    fn default() -> Self {
        Self {
            use_second_level_cache: true,
            use_query_cache: false,
            region_factory: Arc::new(LruRegionFactory),
            default_region: RegionConfig::bounded(DEFAULT_MAX_ENTRIES),
            regions: HashMap::with_hasher(RandomState::new()),
            soft_lock_timeout: DEFAULT_SOFT_LOCK_TIMEOUT,
        }
    }
}

impl fmt::Debug for Settings {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Settings")
            .field("use_second_level_cache", &self.use_second_level_cache)
            .field("use_query_cache", &self.use_query_cache)
            .field("region_factory", &self.region_factory.name())
            .field("default_region", &self.default_region)
            .field("regions", &self.regions)
            .field("soft_lock_timeout", &self.soft_lock_timeout)
            .finish()
    }
}

impl Settings {
    /// Toggle the query cache
    pub fn with_query_cache(mut self, enabled: bool) -> Self {
        self.use_query_cache = enabled;
        self
    }

    /// Toggle the L2 cache
    pub fn with_second_level_cache(mut self, enabled: bool) -> Self {
        self.use_second_level_cache = enabled;
        self
    }

    /// Replace the region factory
    pub fn with_region_factory(mut self, factory: Arc<dyn RegionFactory>) -> Self {
        self.region_factory = factory;
        self
    }

    /// Override the policy of one region
    pub fn with_region(mut self, name: impl Into<String>, config: RegionConfig) -> Self {
        self.regions.insert(name.into(), config);
        self
    }

    /// Policy for a region
    pub fn region_config(&self, name: &str) -> RegionConfig {
        self.regions.get(name).copied().unwrap_or(self.default_region)
    }

    /// Reject inconsistent combinations
    pub fn validate(&self) -> Result<()> {
        if self.use_query_cache && !self.use_second_level_cache {
            return Err(Error::Config(
                "use_query_cache requires use_second_level_cache".to_string(),
            ));
        }
        if self.default_region.max_entries == Some(0)
            || self.regions.values().any(|r| r.max_entries == Some(0))
        {
            return Err(Error::Config("max_entries must be positive".to_string()));
        }
        Ok(())
    }

    /// Read settings from `hibernate.cache.*` properties
    ///
    /// Unknown keys outside the prefix are ignored; unknown keys inside it
    /// are an error.
    pub fn from_properties(properties: &HashMap<String, String>) -> Result<Self> {
        let mut settings = Settings::default();
        let mut keys: Vec<_> = properties.keys().collect();
        keys.sort();

        for key in keys {
            let Some(name) = key.strip_prefix(PREFIX) else {
                continue;
            };
            let value = properties[key].trim();
            match name {
                "use_second_level_cache" => settings.use_second_level_cache = parse_bool(key, value)?,
                "use_query_cache" => settings.use_query_cache = parse_bool(key, value)?,
                "region.factory_class" => {
                    settings.region_factory = match value {
                        "lru" => Arc::new(LruRegionFactory),
                        "none" => Arc::new(NoCachingRegionFactory),
                        other => {
                            return Err(Error::Config(format!("unknown region factory `{}`", other)))
                        }
                    }
                }
                "default.max_entries" => {
                    settings.default_region.max_entries = parse_limit(key, value)?
                }
                "default.ttl_secs" => settings.default_region.ttl = parse_ttl(key, value)?,
                "soft_lock_timeout_ms" => {
                    settings.soft_lock_timeout = Duration::from_millis(parse_number(key, value)?)
                }
                other => {
                    let region = other.strip_prefix("region.").and_then(|rest| {
                        rest.strip_suffix(".max_entries")
                            .map(|region| (region, true))
                            .or_else(|| rest.strip_suffix(".ttl_secs").map(|region| (region, false)))
                    });
                    let (region, is_size) = region
                        .filter(|(region, _)| !region.is_empty())
                        .ok_or_else(|| Error::Config(format!("unknown property {}", key)))?;
                    let mut config = settings.region_config(region);
                    if is_size {
                        config.max_entries = parse_limit(key, value)?;
                    } else {
                        config.ttl = parse_ttl(key, value)?;
                    }
                    settings.regions.insert(region.to_string(), config);
                }
            }
        }

        settings.validate()?;
        Ok(settings)
    }
}

fn parse_bool(key: &str, value: &str) -> Result<bool> {
    match value.to_ascii_lowercase().as_str() {
        "true" => Ok(true),
        "false" => Ok(false),
        _ => Err(Error::Config(format!("{} expects true or false, got `{}`", key, value))),
    }
}

fn parse_number(key: &str, value: &str) -> Result<u64> {
    value
        .parse()
        .map_err(|_| Error::Config(format!("{} expects a number, got `{}`", key, value)))
}

/// `0` means unbounded
fn parse_limit(key: &str, value: &str) -> Result<Option<usize>> {
    let n = parse_number(key, value)?;
    Ok(if n == 0 { None } else { Some(n as usize) })
}

/// `0` means no expiry
fn parse_ttl(key: &str, value: &str) -> Result<Option<Duration>> {
    let n = parse_number(key, value)?;
    Ok(if n == 0 { None } else { Some(Duration::from_secs(n)) })
}
