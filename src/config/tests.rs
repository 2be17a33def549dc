use super::*;

#[test]
fn defaults_resolve_without_sources() {
    let settings = Settings::from_raw(RawSettings::default()).expect("valid settings");

    assert_eq!(settings.logging.level, LevelFilter::INFO);
    assert!(matches!(settings.logging.format, LogFormat::Compact));
    assert_eq!(settings.cache.memory_capacity.get(), 256);
    assert_eq!(
        settings.cache.persistent_dir,
        PathBuf::from(DEFAULT_PERSISTENT_DIR)
    );
    assert!(settings.cache.enable_persistent);
    assert!(settings.cache.max_age_seconds.is_none());
    assert_eq!(settings.query.default_page_size.get(), 50);
    assert_eq!(settings.query.owner_scope, "users");
}

#[test]
fn cli_overrides_take_highest_precedence() {
    let mut raw = RawSettings::default();
    raw.logging.level = Some("info".to_string());
    raw.cache.memory_capacity = Some(64);

    let overrides = Overrides {
        log_level: Some("debug".to_string()),
        cache_memory_capacity: Some(8),
        no_persistent: true,
        ..Default::default()
    };

    raw.apply_overrides(&overrides);
    let settings = Settings::from_raw(raw).expect("valid settings");

    assert_eq!(settings.logging.level, LevelFilter::DEBUG);
    assert_eq!(settings.cache.memory_capacity.get(), 8);
    assert!(!settings.cache.enable_persistent);
}

#[test]
fn cli_json_logging_enforces_format() {
    let mut raw = RawSettings::default();
    let overrides = Overrides {
        log_json: Some(true),
        ..Default::default()
    };

    raw.apply_overrides(&overrides);
    let settings = Settings::from_raw(raw).expect("valid settings");

    assert!(matches!(settings.logging.format, LogFormat::Json));
}

#[test]
fn zero_values_are_rejected() {
    let mut raw = RawSettings::default();
    raw.cache.memory_capacity = Some(0);
    let err = Settings::from_raw(raw).expect_err("zero capacity");
    assert!(matches!(
        err,
        LoadError::Invalid {
            key: "cache.memory_capacity",
            ..
        }
    ));

    let mut raw = RawSettings::default();
    raw.cache.max_age_seconds = Some(0);
    let err = Settings::from_raw(raw).expect_err("zero max age");
    assert!(matches!(
        err,
        LoadError::Invalid {
            key: "cache.max_age_seconds",
            ..
        }
    ));

    let mut raw = RawSettings::default();
    raw.query.default_page_size = Some(0);
    assert!(Settings::from_raw(raw).is_err());
}

#[test]
fn owner_scope_is_trimmed_and_required() {
    let mut raw = RawSettings::default();
    raw.query.owner_scope = Some(" /accounts/ ".to_string());
    let settings = Settings::from_raw(raw).expect("valid settings");
    assert_eq!(settings.query.owner_scope, "accounts");

    let mut raw = RawSettings::default();
    raw.query.owner_scope = Some("/".to_string());
    let err = Settings::from_raw(raw).expect_err("empty scope");
    assert!(matches!(
        err,
        LoadError::Invalid {
            key: "query.owner_scope",
            ..
        }
    ));
}

#[test]
fn invalid_log_level_is_reported() {
    let mut raw = RawSettings::default();
    raw.logging.level = Some("chatty".to_string());
    let err = Settings::from_raw(raw).expect_err("bad level");
    assert!(err.to_string().contains("logging.level"));
}

#[test]
fn parse_cache_get_arguments() {
    let args = CliArgs::parse_from(["biztrack", "cache", "get", "--key", "u1:clients:{}"]);

    match args.command.expect("cache command") {
        Command::Cache(CacheArgs {
            command: CacheCommand::Get { key },
        }) => assert_eq!(key, "u1:clients:{}"),
        other => panic!("unexpected command: {other:?}"),
    }
}

#[test]
fn global_overrides_follow_subcommands() {
    let args = CliArgs::parse_from([
        "biztrack",
        "org-tree",
        "--input",
        "org.json",
        "--log-json",
        "true",
        "--no-persistent",
    ]);

    assert_eq!(args.overrides.log_json, Some(true));
    assert!(args.overrides.no_persistent);
    match args.command.expect("org-tree command") {
        Command::OrgTree(tree) => assert_eq!(tree.input, PathBuf::from("org.json")),
        other => panic!("unexpected command: {other:?}"),
    }
}
