use std::sync::Mutex;
use std::time::Duration;

use tempfile::NamedTempFile;

use framecast::{ColorEncoding, ConfigError, Resolution, SourceKind, StreamerConfig};

static ENV_LOCK: Mutex<()> = Mutex::new(());

fn clear_env() {
    for key in [
        "FRAMECAST_CONFIG",
        "FRAMECAST_TARGET",
        "FRAMECAST_ACTIVE_SOURCE",
        "FRAMECAST_PROFILE",
        "FRAMECAST_FPS",
    ] {
        std::env::remove_var(key);
    }
}

fn write_config(json: &str) -> NamedTempFile {
    let mut file = NamedTempFile::new().expect("temp config");
    std::io::Write::write_all(&mut file, json.as_bytes()).expect("write config");
    file
}

#[test]
fn loads_config_from_file_and_env_overrides() {
    let _guard = ENV_LOCK.lock().unwrap();
    clear_env();

    let file = write_config(
        r#"{
            "target": "127.0.0.1:9000",
            "profile": "hd-full",
            "transport": { "inter_packet_delay_ms": 1.5 },
            "fps": 24,
            "sources": [
                { "type": "network-video", "id": "cam",
                  "params": { "url": "rtsp://10.0.0.20/live", "buffer_size": 50 } },
                { "type": "synthetic", "id": "bars" }
            ],
            "active_source": "cam"
        }"#,
    );

    std::env::set_var("FRAMECAST_CONFIG", file.path());
    std::env::set_var("FRAMECAST_PROFILE", "ld-low");
    std::env::set_var("FRAMECAST_ACTIVE_SOURCE", "bars");

    let cfg = StreamerConfig::load().expect("load config");

    assert_eq!(cfg.target, "127.0.0.1:9000");
    assert_eq!(cfg.profile, "ld-low");
    assert_eq!(cfg.transport.resolution, Resolution::R120);
    assert_eq!(cfg.transport.color, ColorEncoding::Rgb332);
    assert_eq!(cfg.transport.rows_per_packet, 4);
    assert_eq!(cfg.transport.inter_packet_delay, Duration::from_micros(1500));
    assert_eq!(cfg.fps, 24.0);
    assert_eq!(cfg.sources.len(), 2);
    assert_eq!(cfg.sources[0].descriptor.kind, SourceKind::NetworkVideo);
    assert_eq!(
        cfg.sources[0].descriptor.params.get("buffer_size"),
        Some(&serde_json::json!(50))
    );
    assert_eq!(cfg.active_source.as_deref(), Some("bars"));

    let stream = cfg.stream_config().expect("stream config");
    assert_eq!(stream.target().port(), 9000);
    assert_eq!(stream.packets_per_frame(), 30);

    clear_env();
}

#[test]
fn env_target_and_fps_override_defaults() {
    let _guard = ENV_LOCK.lock().unwrap();
    clear_env();

    std::env::set_var("FRAMECAST_TARGET", "127.0.0.1:7777");
    std::env::set_var("FRAMECAST_FPS", "12.5");

    let cfg = StreamerConfig::load().expect("load config");
    assert_eq!(cfg.resolve_target().unwrap().port(), 7777);
    assert_eq!(cfg.fps, 12.5);
    assert_eq!(cfg.frame_interval(), Duration::from_millis(80));
    assert_eq!(cfg.enabled_sources().count(), 1);

    clear_env();
}

#[test]
fn rejects_malformed_fps_env() {
    let _guard = ENV_LOCK.lock().unwrap();
    clear_env();

    std::env::set_var("FRAMECAST_FPS", "fast");
    let err = StreamerConfig::load().unwrap_err();
    assert!(err.to_string().contains("FRAMECAST_FPS"));

    clear_env();
}

#[test]
fn rejects_oversized_packets_with_specific_error() {
    let _guard = ENV_LOCK.lock().unwrap();
    clear_env();

    let file = write_config(
        r#"{ "profile": "hd-full",
              "transport": { "rows_per_packet": 5, "max_datagram_bytes": 1472 } }"#,
    );
    let err = StreamerConfig::load_from(Some(file.path())).unwrap_err();
    assert_eq!(
        err.downcast_ref::<ConfigError>(),
        Some(&ConfigError::DatagramTooLarge {
            size: 2405,
            limit: 1472
        })
    );

    clear_env();
}

#[test]
fn widest_row_groups_are_accepted_by_default() {
    let _guard = ENV_LOCK.lock().unwrap();
    clear_env();

    let file = write_config(r#"{ "profile": "hd-full", "transport": { "rows_per_packet": 15 } }"#);
    let cfg = StreamerConfig::load_from(Some(file.path())).expect("load config");
    let stream = cfg.stream_config().expect("stream config");
    assert_eq!(stream.rows_per_packet().get(), 15);
    assert_eq!(stream.packets_per_frame(), 16);

    clear_env();
}

#[test]
fn rejects_unknown_keys_and_missing_files() {
    let _guard = ENV_LOCK.lock().unwrap();
    clear_env();

    let file = write_config(r#"{ "taget": "127.0.0.1:1" }"#);
    let err = StreamerConfig::load_from(Some(file.path())).unwrap_err();
    assert!(err.to_string().contains("invalid config file"));

    let missing = std::env::temp_dir().join("framecast-does-not-exist.json");
    let err = StreamerConfig::load_from(Some(&missing)).unwrap_err();
    assert!(err.to_string().contains("failed to read config file"));

    clear_env();
}
