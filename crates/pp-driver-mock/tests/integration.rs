//! Integration tests for the simulated devices behind trait objects.

use pp_core::capabilities::{Camera, DelayStage, PulseShaper, RotationStage, Shutter};
use pp_core::signal::SignalExtractor;
use pp_driver_mock::*;
use std::sync::Arc;

/// The controller only ever sees `Arc<dyn Trait>`.
#[tokio::test]
async fn test_devices_as_trait_objects() {
    let camera: Arc<dyn Camera> = Arc::new(MockCamera::builder("Cam").channels(32).build());
    let stage: Arc<dyn DelayStage> = Arc::new(MockDelayLine::builder("Delay").build());
    let shaper: Arc<dyn PulseShaper> = Arc::new(MockShaper::new("Shaper", 64));
    let shutter: Arc<dyn Shutter> = Arc::new(MockShutter::new("Shutter"));
    let rotator: Arc<dyn RotationStage> = Arc::new(MockRotationStage::new("Rot"));

    assert_eq!(camera.read().await.unwrap().pixels(), 32);
    stage.set_position_fs(250.0, true).await.unwrap();
    assert_eq!(shaper.masks().await.unwrap().frames(), 1);
    shutter.close().await.unwrap();
    assert!(!shutter.is_open().await.unwrap());
    rotator.set_degrees(10.0).await.unwrap();
}

/// Noise around 30 counts with unit std gives roughly 3.3 % relative noise
/// and a small differential signal.
#[tokio::test]
async fn test_noise_camera_statistics() {
    let camera = MockCamera::builder("Cam")
        .channels(64)
        .shots(2000)
        .seed(99)
        .build();
    let reading = camera.read().await.unwrap();
    let processed = SignalExtractor::default().extract(&reading).unwrap();

    for (mean, std_pct) in processed
        .probe_mean
        .iter()
        .zip(processed.probe_std_pct.iter())
    {
        assert!((mean - 30.0).abs() < 0.2, "mean {}", mean);
        assert!((std_pct - 100.0 / 30.0).abs() < 0.5, "std {}", std_pct);
    }
    for signal in processed.differential_signal.iter() {
        assert!(signal.abs() < 5.0, "signal {}", signal);
    }
    assert_eq!(processed.aux_mean.len(), 3);
}

#[tokio::test]
async fn test_chaos_camera_fails_sometimes() {
    let camera = MockCamera::builder("Cam")
        .channels(4)
        .error_config(ErrorConfig::random_failures_seeded(0.5, Some(5)))
        .build();

    let mut failures = 0;
    for _ in 0..100 {
        if camera.read().await.is_err() {
            failures += 1;
        }
    }
    assert!(failures > 20 && failures < 80, "{} failures", failures);
}
