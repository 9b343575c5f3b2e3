//! Typed service settings resolved from `FundamentalsConfig`.
//!
//! The shared config keeps names as strings; this is where they are checked
//! against the fixed vocabularies and expanded into one source descriptor per
//! `(asset, data_type)`.

use std::collections::BTreeMap;
use std::path::PathBuf;
use std::time::Duration;
use zero_common::config::{FundamentalsConfig, SourceEntry};
use zero_common::Error;

use crate::data::{AssetClass, AssetConfig, DataType, Priority, SourceConfig, SourceKey};
use crate::scheduler::{RateLimits, SchedulerConfig};

/// Fully resolved settings for the fundamentals service.
#[derive(Debug, Clone)]
pub struct FundamentalsSettings {
    pub assets: Vec<AssetConfig>,
    /// One per `(asset, data_type)`, ordered by key
    pub sources: Vec<SourceConfig>,
    pub scheduler: SchedulerConfig,
    pub fetch_timeout: Duration,
    pub snapshot_limit: usize,
    pub data_dir: PathBuf,
}

impl FundamentalsSettings {
    /// Sources belonging to one asset.
    pub fn sources_for<'a>(&'a self, asset: &'a str) -> impl Iterator<Item = &'a SourceConfig> + 'a {
        self.sources.iter().filter(move |s| s.asset == asset)
    }
}

impl TryFrom<&FundamentalsConfig> for FundamentalsSettings {
    type Error = Error;

    fn try_from(config: &FundamentalsConfig) -> Result<Self, Self::Error> {
        config.validate()?;

        let mut assets = Vec::with_capacity(config.assets.len());
        let mut sources: BTreeMap<SourceKey, SourceConfig> = BTreeMap::new();

        for entry in &config.assets {
            let symbol = entry.symbol.trim().to_string();
            if assets.iter().any(|a: &AssetConfig| a.symbol == symbol) {
                return Err(Error::Config(format!("duplicate asset symbol: {symbol}")));
            }

            let asset_class: AssetClass = entry
                .asset_class
                .parse()
                .map_err(|e: String| Error::Config(format!("asset {symbol}: {e}")))?;

            let data_types = match &entry.data_types {
                Some(names) => names
                    .iter()
                    .map(|name| parse_data_type(&symbol, name))
                    .collect::<Result<Vec<_>, _>>()?,
                None => asset_class.default_data_types(),
            };

            for data_type in data_types {
                let source = SourceConfig::new(symbol.clone(), data_type);
                sources.insert(source.key(), source);
            }

            assets.push(AssetConfig {
                name: if entry.name.is_empty() {
                    symbol.clone()
                } else {
                    entry.name.clone()
                },
                symbol,
                asset_class,
            });
        }

        for entry in &config.sources {
            apply_override(&mut sources, &assets, entry)?;
        }

        Ok(Self {
            assets,
            sources: sources.into_values().collect(),
            scheduler: SchedulerConfig {
                tick_interval: Duration::from_secs(config.tick_interval_secs),
                max_parallel_requests: config.max_parallel_requests,
                max_retries: config.max_retries,
                rate_limits: RateLimits::from(&config.rate_limit),
                ..SchedulerConfig::default()
            },
            fetch_timeout: Duration::from_secs(config.fetch_timeout_secs),
            snapshot_limit: config.snapshot_limit,
            data_dir: config.resolved_data_dir(),
        })
    }
}

fn parse_data_type(asset: &str, name: &str) -> Result<DataType, Error> {
    name.parse()
        .map_err(|e: String| Error::Config(format!("asset {asset}: {e}")))
}

fn apply_override(
    sources: &mut BTreeMap<SourceKey, SourceConfig>,
    assets: &[AssetConfig],
    entry: &SourceEntry,
) -> Result<(), Error> {
    let asset = entry.asset.trim();
    if !assets.iter().any(|a| a.symbol == asset) {
        return Err(Error::Config(format!(
            "source override for unknown asset: {asset}"
        )));
    }

    let data_type = parse_data_type(asset, &entry.data_type)?;
    let key = SourceKey::new(asset, data_type);
    let mut source = sources
        .remove(&key)
        .unwrap_or_else(|| SourceConfig::new(asset, data_type));

    if let Some(name) = &entry.name {
        source = source.with_name(name.clone());
    }
    if let Some(field) = &entry.timestamp_field {
        source = source.with_timestamp_field(field.clone());
    }
    if let Some(field) = &entry.id_field {
        source = source.with_id_field(field.clone());
    }
    if let Some(field) = &entry.value_field {
        source = source.with_value_field(field.clone());
    }
    if let Some(secs) = entry.check_frequency_secs {
        if secs == 0 {
            return Err(Error::Config(format!("source {key}: check frequency must be > 0")));
        }
        let secs = i64::try_from(secs)
            .map_err(|_| Error::Config(format!("source {key}: check frequency too large")))?;
        source = source.with_check_frequency(chrono::Duration::seconds(secs));
    }
    if let Some(priority) = &entry.priority {
        let priority: Priority = priority
            .parse()
            .map_err(|e: String| Error::Config(format!("source {key}: {e}")))?;
        source = source.with_priority(priority);
    }

    sources.insert(key, source);
    Ok(())
}
