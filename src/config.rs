use std::collections::BTreeMap;
use std::str::FromStr;
use std::time::Duration;

use tracing::info;

use crate::error::AppError;
use crate::models::SlotId;

pub const DEFAULT_SLOT_TIMES: &str = "1=08:00 - 09:30;2=09:40 - 11:10;3=11:50 - 13:20;\
4=13:30 - 15:00;5=15:40 - 17:10;6=17:20 - 18:50";

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SheetBackend {
    Sqlite,
    Memory,
}

impl FromStr for SheetBackend {
    type Err = AppError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().as_str() {
            "sqlite" => Ok(SheetBackend::Sqlite),
            "memory" => Ok(SheetBackend::Memory),
            other => Err(AppError::Config(format!(
                "Unknown SHEET_BACKEND '{}', expected 'sqlite' or 'memory'",
                other
            ))),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RateLimitConfig {
    pub min_interval: Duration,
    pub max_retries: u32,
    pub base_backoff: Duration,
    pub backoff_factor: u32,
}

impl Default for RateLimitConfig {
    fn default() -> Self {
        Self {
            min_interval: Duration::from_millis(1100),
            max_retries: 5,
            base_backoff: Duration::from_secs(1),
            backoff_factor: 2,
        }
    }
}

impl RateLimitConfig {
    /// Delay before retry number `attempt` (zero-based).
    pub fn backoff_for(&self, attempt: u32) -> Duration {
        let factor = self.backoff_factor.max(1).saturating_pow(attempt);
        self.base_backoff.saturating_mul(factor)
    }
}

/// Slot number to wall-clock range, e.g. `1 -> "08:00 - 09:30"`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SlotTable(BTreeMap<SlotId, String>);

impl SlotTable {
    pub fn new(slots: BTreeMap<SlotId, String>) -> Self {
        Self(slots)
    }

    pub fn contains(&self, slot: SlotId) -> bool {
        self.0.contains_key(&slot)
    }

    pub fn time_range(&self, slot: SlotId) -> Option<&str> {
        self.0.get(&slot).map(String::as_str)
    }

    pub fn slots(&self) -> impl Iterator<Item = SlotId> + '_ {
        self.0.keys().copied()
    }

    pub fn len(&self) -> usize {
        self.0.len()
    }
}

impl FromStr for SlotTable {
    type Err = AppError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let mut slots = BTreeMap::new();

        for entry in s.split(';').map(str::trim).filter(|e| !e.is_empty()) {
            let (slot, range) = entry.split_once('=').ok_or_else(|| {
                AppError::Config(format!("Slot entry '{}' must look like 1=08:00 - 09:30", entry))
            })?;
            let slot: SlotId = slot
                .trim()
                .parse()
                .map_err(|_| AppError::Config(format!("Invalid slot number '{}'", slot.trim())))?;
            slots.insert(slot, range.trim().to_string());
        }

        if slots.is_empty() {
            return Err(AppError::Config("SLOT_TIMES defines no slots".to_string()));
        }

        Ok(Self(slots))
    }
}

#[derive(Debug, Clone)]
pub struct AppConfig {
    pub group_id: String,
    pub backend: SheetBackend,
    pub database_url: String,
    pub slots: SlotTable,
    pub rate_limit: RateLimitConfig,
    pub cache_ttl: Duration,
    pub page_size: usize,
    pub session_idle_ttl: Duration,
    pub session_sweep_interval: Duration,
}

impl AppConfig {
    pub fn from_env() -> Result<Self, AppError> {
        let group_id = dotenvy::var("GROUP_ID")
            .ok()
            .filter(|g| !g.trim().is_empty())
            .ok_or_else(|| AppError::Config("GROUP_ID must be set".to_string()))?;

        let defaults = RateLimitConfig::default();

        let config = Self {
            group_id: group_id.trim().to_string(),
            backend: env_or("SHEET_BACKEND", SheetBackend::Sqlite)?,
            database_url: dotenvy::var("DATABASE_URL")
                .unwrap_or_else(|_| "sqlite://attendance.db?mode=rwc".to_string()),
            slots: env_or("SLOT_TIMES", SlotTable::from_str(DEFAULT_SLOT_TIMES)?)?,
            rate_limit: RateLimitConfig {
                min_interval: Duration::from_millis(env_or(
                    "MIN_CALL_INTERVAL_MS",
                    defaults.min_interval.as_millis() as u64,
                )?),
                max_retries: env_or("QUOTA_MAX_RETRIES", defaults.max_retries)?,
                base_backoff: Duration::from_millis(env_or(
                    "QUOTA_BACKOFF_BASE_MS",
                    defaults.base_backoff.as_millis() as u64,
                )?),
                backoff_factor: env_or("QUOTA_BACKOFF_FACTOR", defaults.backoff_factor)?,
            },
            cache_ttl: Duration::from_secs(env_or("CACHE_TTL_SECS", 30)?),
            page_size: env_or("PAGE_SIZE", 10usize)?,
            session_idle_ttl: Duration::from_secs(env_or("SESSION_IDLE_TTL_SECS", 86_400)?),
            session_sweep_interval: Duration::from_secs(env_or(
                "SESSION_SWEEP_INTERVAL_SECS",
                600,
            )?),
        };

        if config.page_size == 0 {
            return Err(AppError::Config("PAGE_SIZE must be at least 1".to_string()));
        }
        if config.session_sweep_interval.is_zero() {
            return Err(AppError::Config(
                "SESSION_SWEEP_INTERVAL_SECS must be at least 1".to_string(),
            ));
        }

        info!(
            group_id = %config.group_id,
            backend = ?config.backend,
            slots = config.slots.len(),
            "Loaded configuration"
        );

        Ok(config)
    }
}

fn env_or<T>(key: &str, default: T) -> Result<T, AppError>
where
    T: FromStr,
    T::Err: std::fmt::Display,
{
    match dotenvy::var(key) {
        Ok(value) => value
            .trim()
            .parse()
            .map_err(|e| AppError::Config(format!("Invalid value for {}: {}", key, e))),
        Err(_) => Ok(default),
    }
}
