use std::path::PathBuf;

use clap::Parser;

use super::*;

#[test]
fn cli_overrides_take_highest_precedence() {
    let mut raw = RawSettings::default();
    raw.cache.max_entries = 200;
    raw.logging.level = Some("info".to_string());

    let overrides = Overrides {
        max_entries: Some(50),
        log_level: Some("debug".to_string()),
        ..Default::default()
    };

    raw.apply_overrides(&overrides);
    let settings = Settings::from_raw(raw).expect("valid settings");

    assert_eq!(settings.cache.max_entries, 50);
    assert_eq!(settings.logging.level, LevelFilter::DEBUG);
}

#[test]
fn defaults_are_valid() {
    let settings = Settings::from_raw(RawSettings::default()).expect("valid settings");
    assert_eq!(settings.cache.max_entries, 500);
    assert_eq!(settings.logging.level, LevelFilter::INFO);
    assert!(matches!(settings.logging.format, LogFormat::Compact));
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
fn invalid_log_level_is_rejected() {
    let mut raw = RawSettings::default();
    raw.logging.level = Some("loud".to_string());

    let err = Settings::from_raw(raw).unwrap_err();
    assert!(matches!(
        err,
        LoadError::Invalid {
            key: "logging.level",
            ..
        }
    ));
}

#[test]
fn zero_max_entries_is_rejected() {
    let mut raw = RawSettings::default();
    raw.cache.max_entries = 0;

    let err = Settings::from_raw(raw).unwrap_err();
    assert!(matches!(
        err,
        LoadError::Invalid {
            key: "cache.max_entries",
            ..
        }
    ));
}

#[test]
fn evict_fraction_outside_unit_interval_is_rejected() {
    for fraction in [0.0, 1.5, f64::NAN] {
        let mut raw = RawSettings::default();
        raw.cache.evict_fraction = fraction;
        assert!(
            Settings::from_raw(raw).is_err(),
            "fraction {fraction} should be rejected"
        );
    }
}

#[test]
fn expiry_index_inside_namespace_is_rejected() {
    let mut raw = RawSettings::default();
    raw.cache.expiry_index_key = "courier-cache:index".to_string();

    let err = Settings::from_raw(raw).unwrap_err();
    assert!(matches!(
        err,
        LoadError::Invalid {
            key: "cache.expiry_index_key",
            ..
        }
    ));
}

#[test]
fn malformed_rule_is_rejected() {
    let mut raw = RawSettings::default();
    raw.cache
        .rules
        .insert(" ".to_string(), vec!["routes:*".to_string()]);

    let err = Settings::from_raw(raw).unwrap_err();
    assert!(matches!(err, LoadError::Invalid { key: "cache.rules", .. }));
}

#[test]
fn purge_storage_dir_overrides_config() {
    let mut raw = RawSettings::default();
    raw.cache.storage_dir = Some(PathBuf::from("/var/lib/courier"));

    raw.apply_purge_overrides(&PurgeArgs {
        storage_dir: Some(PathBuf::from("/tmp/courier")),
    });
    let settings = Settings::from_raw(raw).expect("valid settings");

    assert_eq!(
        settings.cache.storage_dir.as_deref(),
        Some(PathBuf::from("/tmp/courier").as_path())
    );
}

#[test]
fn parses_replay_command() {
    let args = CliArgs::try_parse_from([
        "courier-cache",
        "--log-level",
        "warn",
        "replay",
        "--keys",
        "keys.txt",
        "events.jsonl",
    ])
    .expect("arguments should parse");

    assert_eq!(args.overrides.log_level.as_deref(), Some("warn"));
    match args.command {
        Command::Replay(replay) => {
            assert_eq!(replay.keys, PathBuf::from("keys.txt"));
            assert_eq!(replay.events, PathBuf::from("events.jsonl"));
        }
        other => panic!("unexpected command: {other:?}"),
    }
}

#[test]
fn global_overrides_follow_subcommand() {
    let args = CliArgs::try_parse_from(["courier-cache", "rules", "--json", "--max-entries", "9"])
        .expect("arguments should parse");

    assert_eq!(args.overrides.max_entries, Some(9));
    assert!(matches!(args.command, Command::Rules(RulesArgs { json: true })));
}

#[test]
fn subcommand_is_required() {
    assert!(CliArgs::try_parse_from(["courier-cache"]).is_err());
}
