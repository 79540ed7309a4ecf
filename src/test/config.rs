#[cfg(test)]
mod tests {
    use std::time::Duration;

    use serial_test::serial;

    use crate::config::{AppConfig, DEFAULT_SLOT_TIMES, SheetBackend, SlotTable};
    use crate::env::env_files;
    use crate::error::AppError;

    const KEYS: [&str; 12] = [
        "GROUP_ID",
        "SHEET_BACKEND",
        "DATABASE_URL",
        "SLOT_TIMES",
        "MIN_CALL_INTERVAL_MS",
        "QUOTA_MAX_RETRIES",
        "QUOTA_BACKOFF_BASE_MS",
        "QUOTA_BACKOFF_FACTOR",
        "CACHE_TTL_SECS",
        "PAGE_SIZE",
        "SESSION_IDLE_TTL_SECS",
        "SESSION_SWEEP_INTERVAL_SECS",
    ];

    /// Loads the config with every known key unset except `overrides`.
    fn load_with(overrides: &[(&str, &str)]) -> Result<AppConfig, AppError> {
        let vars: Vec<(&str, Option<&str>)> = KEYS
            .iter()
            .map(|key| {
                let value = overrides
                    .iter()
                    .find(|(k, _)| k == key)
                    .map(|(_, v)| *v);
                (*key, value)
            })
            .collect();

        temp_env::with_vars(vars, AppConfig::from_env)
    }

    #[test]
    #[serial]
    fn test_defaults() {
        let config = load_with(&[("GROUP_ID", " IT-21 ")]).unwrap();

        assert_eq!(config.group_id, "IT-21");
        assert_eq!(config.backend, SheetBackend::Sqlite);
        assert_eq!(config.rate_limit.min_interval, Duration::from_millis(1100));
        assert_eq!(config.rate_limit.max_retries, 5);
        assert_eq!(config.cache_ttl, Duration::from_secs(30));
        assert_eq!(config.page_size, 10);
        assert_eq!(config.slots.len(), 6);
        assert_eq!(config.slots.time_range(1), Some("08:00 - 09:30"));
        assert_eq!(config.session_idle_ttl, Duration::from_secs(86_400));
    }

    #[test]
    #[serial]
    fn test_group_id_is_required() {
        assert!(matches!(load_with(&[]), Err(AppError::Config(_))));
        assert!(matches!(
            load_with(&[("GROUP_ID", "   ")]),
            Err(AppError::Config(_))
        ));
    }

    #[test]
    #[serial]
    fn test_overrides() {
        let config = load_with(&[
            ("GROUP_ID", "IT-22"),
            ("SHEET_BACKEND", "Memory"),
            ("MIN_CALL_INTERVAL_MS", "250"),
            ("QUOTA_BACKOFF_FACTOR", "3"),
            ("PAGE_SIZE", "8"),
            ("SLOT_TIMES", "1=09:00 - 10:00; 2=10:15 - 11:15"),
        ])
        .unwrap();

        assert_eq!(config.backend, SheetBackend::Memory);
        assert_eq!(config.rate_limit.min_interval, Duration::from_millis(250));
        assert_eq!(config.rate_limit.backoff_factor, 3);
        assert_eq!(config.page_size, 8);
        assert_eq!(config.slots.slots().collect::<Vec<_>>(), vec![1, 2]);
        assert_eq!(config.slots.time_range(2), Some("10:15 - 11:15"));
    }

    #[test]
    #[serial]
    fn test_malformed_values_are_rejected() {
        for (key, value) in [
            ("MIN_CALL_INTERVAL_MS", "soon"),
            ("PAGE_SIZE", "0"),
            ("PAGE_SIZE", "-1"),
            ("SHEET_BACKEND", "excel"),
            ("SLOT_TIMES", "1 08:00"),
            ("SESSION_SWEEP_INTERVAL_SECS", "0"),
        ] {
            let result = load_with(&[("GROUP_ID", "IT-21"), (key, value)]);
            assert!(
                matches!(result, Err(AppError::Config(_))),
                "{}={} should be rejected",
                key,
                value
            );
        }
    }

    #[test]
    fn test_slot_table_parsing() {
        let table: SlotTable = DEFAULT_SLOT_TIMES.parse().unwrap();
        assert_eq!(table.len(), 6);
        assert!(table.contains(6));
        assert!(!table.contains(7));

        assert!("".parse::<SlotTable>().is_err());
        assert!(" ; ".parse::<SlotTable>().is_err());
        assert!("x=08:00 - 09:00".parse::<SlotTable>().is_err());
        assert!("300=08:00 - 09:00".parse::<SlotTable>().is_err());
    }

    #[test]
    fn test_env_files_follow_profile() {
        assert_eq!(
            env_files("production"),
            vec!["config/common.env", "config/production.env", ".secrets.env"]
        );
    }
}
