//! Loading site files from disk with environment overrides.

use pp_core::signal::OddShotPolicy;
use pp_hardware::config::SiteConfig;
use std::io::Write;

const SITE: &str = r#"
[application]
name = "2D-IR lab"
log_level = "debug"
data_directory = "/tmp/pp-data"

[signal]
odd_shots = "reject"

[[cameras]]
name = "Probe"
shots = 200
pixels = 128
mode = "instant"

[[cameras]]
name = "Reference"
pixels = 64

[[delay_lines]]
name = "Delay1"
home_mm = 8.8
pos_sign = -1.0

[shaper]
name = "AOM"
pixels = 4096
"#;

fn write_site(contents: &str) -> tempfile::NamedTempFile {
    let mut file = tempfile::Builder::new()
        .suffix(".toml")
        .tempfile()
        .unwrap();
    file.write_all(contents.as_bytes()).unwrap();
    file
}

#[test]
fn test_load_site_file() {
    let file = write_site(SITE);
    let config = SiteConfig::load_from(file.path()).unwrap();

    assert_eq!(config.application.name, "2D-IR lab");
    assert_eq!(config.application.loop_interval_ms, 10);
    assert_eq!(config.signal.odd_shots, OddShotPolicy::Reject);
    assert_eq!(config.cameras.len(), 2);
    assert_eq!(config.cameras[0].shots, 200);
    assert_eq!(config.cameras[1].shots, 20);
    assert_eq!(config.cameras[1].driver, "mock_camera");
    assert_eq!(config.delay_lines[0].pos_sign, -1.0);
    assert_eq!(config.shaper.as_ref().map(|s| s.pixels), Some(4096));
    assert!(config.shutter.is_none());
}

#[test]
fn test_missing_file_is_configuration_error() {
    let err = SiteConfig::load_from("/definitely/not/here.toml").unwrap_err();
    assert!(err.to_string().contains("not found"));
}

#[test]
fn test_invalid_site_is_rejected() {
    let file = write_site(
        r#"
[[cameras]]
name = "Probe"
driver = "unknown_cam"

[[delay_lines]]
name = "Delay1"
"#,
    );
    assert!(SiteConfig::load_from(file.path()).is_err());
}

#[test]
fn test_env_overrides_file() {
    let file = write_site(SITE);
    // A prefix unique to this test keeps parallel tests apart.
    std::env::set_var("PPTEST_ENV_APPLICATION__LOG_LEVEL", "warn");
    std::env::set_var("PPTEST_ENV_SIGNAL__ODD_SHOTS", "truncate");

    let config =
        SiteConfig::extract(SiteConfig::figment_with_prefix(file.path(), "PPTEST_ENV_")).unwrap();

    assert_eq!(config.application.log_level, "warn");
    assert_eq!(config.signal.odd_shots, OddShotPolicy::Truncate);
    assert_eq!(config.cameras[0].name, "Probe");

    std::env::remove_var("PPTEST_ENV_APPLICATION__LOG_LEVEL");
    std::env::remove_var("PPTEST_ENV_SIGNAL__ODD_SHOTS");
}
