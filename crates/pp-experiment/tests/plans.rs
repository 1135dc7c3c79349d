//! Concrete plans driven step by step against simulated devices.

use pp_core::capabilities::{Camera, PulseShaper, ShaperSettings};
use pp_core::error::PpError;
use pp_core::signal::SignalExtractor;
use pp_driver_mock::{ErrorConfig, ErrorScenario, MockCamera, MockDelayLine, MockShaper};
use pp_experiment::plans::{
    AdaptiveTimeZeroConfig, AdaptiveTimeZeroPlan, FastGvdConfig, FastGvdScan, PumpProbePlan,
};
use pp_experiment::storage::{JsonLinesStore, MemoryStore, ScanKey};
use pp_experiment::{Cam, DelayLine, Plan, PlanEvent, PlanStatus, ScanRunner, ScanSteps, StepResult};
use std::sync::Arc;

/// 1000 * log10(1.05)
const BOOST_MOD: f64 = 21.189;

fn pattern_camera(gain: f64) -> MockCamera {
    MockCamera::builder("Cam")
        .with_pattern(vec![100.0; 8], gain)
        .shots(20)
        .build()
}

async fn wrap_cam(camera: Arc<MockCamera>) -> Arc<Cam> {
    Arc::new(Cam::new(camera, SignalExtractor::default()).await.unwrap())
}

async fn wrap_delay(stage: MockDelayLine) -> Arc<DelayLine> {
    Arc::new(DelayLine::new(Arc::new(stage)).await.unwrap())
}

/// Step until the plan stops asking for more, yielding to spawned reads.
async fn drive<S: ScanSteps>(runner: &mut ScanRunner<S>) -> StepResult {
    for _ in 0..10_000 {
        let result = runner.make_step().await;
        if !result.is_continue() {
            return result;
        }
        tokio::task::yield_now().await;
    }
    panic!("plan did not finish");
}

#[tokio::test]
async fn test_pump_probe_records_every_point() {
    let camera = Arc::new(pattern_camera(1.05));
    let cam = wrap_cam(camera.clone()).await;
    let dl = wrap_delay(MockDelayLine::builder("Delay").build()).await;
    dl.set_pos(-100.0, true).await.unwrap();

    let delays = vec![0.0, 250.0, 500.0];
    let plan = PumpProbePlan::new(
        "sample",
        cam.clone(),
        dl.clone(),
        delays,
        40,
        Box::new(MemoryStore::new()),
    )
    .unwrap();
    let results = plan.results();
    let mut runner = ScanRunner::new(plan).with_max_scan(2);
    let mut events = runner.subscribe();

    assert!(matches!(drive(&mut runner).await, StepResult::Done));
    assert_eq!(runner.status(), PlanStatus::Finished);

    let store = runner.steps().store();
    assert_eq!(store.len(), 3 * 3 * 2);
    let signal = store.get(&ScanKey::new("signal", 1, 2)).unwrap();
    assert!(signal.iter().all(|v| (v - BOOST_MOD).abs() < 1e-2));
    let probe = store.get(&ScanKey::new("probe", 0, 0)).unwrap();
    assert!(probe.iter().all(|v| (v - 102.5).abs() < 1e-9));

    let mean = runner.steps().mean_signal(1).unwrap();
    assert!(mean.iter().all(|v| (v - BOOST_MOD).abs() < 1e-2));
    {
        let results = results.read();
        assert_eq!(results.scans_done, 2);
        assert!(results.mean_signals.iter().all(Option::is_some));
        assert!(results.latest_signal.is_some());
    }

    // Reads ran with the plan's shot count, the old one is back afterwards.
    assert_eq!(cam.last_read().shots, 40);
    assert_eq!(camera.shots().await, 20);
    assert!((dl.pos() + 100.0).abs() < 1e-6);
    assert_eq!(camera.read_count(), 6);

    let mut step_done = 0;
    while let Ok(event) = events.try_recv() {
        if matches!(event, PlanEvent::StepDone { .. }) {
            step_done += 1;
        }
    }
    assert_eq!(step_done, 6);
}

#[tokio::test]
async fn test_pump_probe_yields_while_stage_moves() {
    const POLLS: u32 = 5;
    let camera = Arc::new(pattern_camera(1.0));
    let cam = wrap_cam(camera.clone()).await;
    let dl = wrap_delay(MockDelayLine::builder("Delay").moving_polls(POLLS).build()).await;

    let plan =
        PumpProbePlan::new("slow", cam, dl, vec![1000.0], 20, Box::new(MemoryStore::new()))
            .unwrap();
    let mut runner = ScanRunner::new(plan).with_max_scan(1);

    let mut steps_before_read = 0;
    while camera.read_count() == 0 {
        assert!(runner.make_step().await.is_continue());
        steps_before_read += 1;
        tokio::task::yield_now().await;
        assert!(steps_before_read < 100);
    }

    assert!(steps_before_read >= POLLS as usize);
    assert_eq!(runner.steps().settle_polls(), u64::from(POLLS));
    assert!(matches!(drive(&mut runner).await, StepResult::Done));
}

#[tokio::test]
async fn test_pump_probe_failure_restores_devices() {
    let camera = Arc::new(
        MockCamera::builder("Cam")
            .with_pattern(vec![100.0; 4], 1.0)
            .shots(20)
            .error_config(ErrorConfig::scenario(ErrorScenario::FailOnNth {
                operation: "read",
                nth: 2,
            }))
            .build(),
    );
    let cam = wrap_cam(camera.clone()).await;
    let dl = wrap_delay(MockDelayLine::builder("Delay").build()).await;

    let plan = PumpProbePlan::new(
        "doomed",
        cam,
        dl.clone(),
        vec![0.0, 100.0, 200.0],
        100,
        Box::new(MemoryStore::new()),
    )
    .unwrap();
    let mut runner = ScanRunner::new(plan).with_max_scan(1);

    match drive(&mut runner).await {
        StepResult::Failed(e) => assert!(e.to_string().contains("Injected failure"), "{}", e),
        other => panic!("expected failure, got {:?}", other),
    }
    assert_eq!(runner.status(), PlanStatus::Stopped);
    assert_eq!(camera.shots().await, 20);
    assert!(dl.pos().abs() < 1e-9);
    // The first point survives as valid partial data.
    assert_eq!(runner.steps().store().len(), 3);
}

#[tokio::test]
async fn test_pump_probe_rejects_bad_parameters() {
    let cam = wrap_cam(Arc::new(pattern_camera(1.0))).await;
    let dl = wrap_delay(MockDelayLine::builder("Delay").build()).await;

    let empty = PumpProbePlan::new(
        "x",
        cam.clone(),
        dl.clone(),
        vec![],
        10,
        Box::new(MemoryStore::new()),
    );
    assert!(matches!(empty, Err(PpError::Configuration(_))));

    let nan = PumpProbePlan::new(
        "x",
        cam,
        dl,
        vec![0.0, f64::NAN],
        10,
        Box::new(MemoryStore::new()),
    );
    assert!(matches!(nan, Err(PpError::Configuration(_))));
}

#[tokio::test]
async fn test_pump_probe_writes_json_lines() {
    let dir = tempfile::tempdir().unwrap();
    let cam = wrap_cam(Arc::new(pattern_camera(1.05))).await;
    let dl = wrap_delay(MockDelayLine::builder("Delay").build()).await;

    let store = JsonLinesStore::open(dir.path(), "run.pp").unwrap();
    let path = store.path().to_path_buf();
    let plan = PumpProbePlan::new("run", cam, dl, vec![0.0, 50.0], 20, Box::new(store)).unwrap();
    let mut runner = ScanRunner::new(plan).with_max_scan(1);
    runner.meta().save_meta(dir.path()).unwrap();
    drive(&mut runner).await;

    let text = std::fs::read_to_string(path).unwrap();
    assert_eq!(text.lines().count(), 6);
    let meta_files = std::fs::read_dir(dir.path())
        .unwrap()
        .filter_map(Result::ok)
        .filter(|e| e.path().extension().is_some_and(|ext| ext == "json"))
        .count();
    assert_eq!(meta_files, 1);
}

#[tokio::test]
async fn test_fast_gvd_sets_shots_and_masks() {
    let camera = Arc::new(pattern_camera(1.05));
    let cam = wrap_cam(camera.clone()).await;
    let shaper = Arc::new(MockShaper::new("Shaper", 16));
    shaper
        .apply_settings(ShaperSettings {
            gvd: 1.0,
            chopped: true,
            dispersion_compensation: true,
            ..Default::default()
        })
        .await
        .unwrap();
    let before = shaper.settings().await.unwrap();

    let mut config = FastGvdConfig::new(vec![-1.0, 0.0, 1.0], 4);
    config.max_reads = Some(3);
    let plan = FastGvdScan::new("gvd", cam, shaper.clone(), config)
        .await
        .unwrap();
    let results = plan.results();
    let mut runner = ScanRunner::new(plan).with_max_scan(1);

    // Setup runs on the first step.
    assert!(runner.make_step().await.is_continue());
    assert_eq!(camera.shots().await, 4 * 2 * 3);
    let masks = shaper.masks().await.unwrap();
    assert_eq!(masks.frames(), 6);
    assert!(masks.amplitude[0].iter().all(|&a| a == 0.0));
    assert!(masks.amplitude[1].iter().all(|&a| a == 1.0));
    assert_eq!(masks.phase[2], masks.phase[3]);
    assert_ne!(masks.phase[0], masks.phase[2]);
    let during = shaper.settings().await.unwrap();
    assert!(!during.chopped);
    assert!(!during.dispersion_compensation);

    assert!(matches!(drive(&mut runner).await, StepResult::Done));
    {
        let results = results.read();
        assert_eq!(results.reads, 3);
        assert_eq!(results.mean_signal.dim(), (3, 8));
        assert!(results.mean_signal.iter().all(|v| (v - BOOST_MOD).abs() < 1e-2));
    }

    assert_eq!(camera.shots().await, 20);
    assert_eq!(shaper.settings().await.unwrap(), before);
}

#[tokio::test]
async fn test_fast_gvd_restores_shaper_when_shots_restore_fails() {
    let camera = Arc::new(
        MockCamera::builder("Cam")
            .with_pattern(vec![100.0; 8], 1.0)
            .shots(20)
            .error_config(ErrorConfig::scenario(ErrorScenario::FailOnNth {
                operation: "set_shots",
                nth: 2,
            }))
            .build(),
    );
    let cam = wrap_cam(camera.clone()).await;
    let shaper = Arc::new(MockShaper::new("Shaper", 16));
    shaper
        .apply_settings(ShaperSettings {
            gvd: 1.0,
            chopped: true,
            dispersion_compensation: true,
            ..Default::default()
        })
        .await
        .unwrap();
    let before = shaper.settings().await.unwrap();

    let mut config = FastGvdConfig::new(vec![0.0, 1.0], 2);
    config.max_reads = Some(1);
    let plan = FastGvdScan::new("gvd", cam, shaper.clone(), config)
        .await
        .unwrap();
    let mut runner = ScanRunner::new(plan);

    match drive(&mut runner).await {
        StepResult::Failed(e) => assert!(e.to_string().contains("Injected failure"), "{}", e),
        other => panic!("expected failure, got {:?}", other),
    }
    assert_eq!(runner.status(), PlanStatus::Stopped);
    // The shot count stays at the plan's value, the shaper is still restored.
    assert_eq!(camera.shots().await, 2 * 2 * 2);
    assert_eq!(shaper.settings().await.unwrap(), before);
}

#[tokio::test]
async fn test_fast_gvd_too_many_shots_touches_nothing() {
    let camera = Arc::new(pattern_camera(1.0));
    let cam = wrap_cam(camera.clone()).await;
    let shaper = Arc::new(MockShaper::new("Shaper", 16));

    let config = FastGvdConfig::new(vec![0.0; 101], 50);
    let result = FastGvdScan::new("gvd", cam, shaper.clone(), config).await;

    assert!(matches!(result, Err(PpError::Configuration(_))));
    assert_eq!(shaper.upload_count(), 0);
    assert_eq!(camera.shots().await, 20);
}

#[tokio::test]
async fn test_fast_gvd_runs_until_stopped() {
    let camera = Arc::new(pattern_camera(1.0));
    let cam = wrap_cam(camera.clone()).await;
    let shaper = Arc::new(MockShaper::new("Shaper", 16));

    let plan = FastGvdScan::new("gvd", cam, shaper, FastGvdConfig::new(vec![0.0, 1.0], 2))
        .await
        .unwrap();
    let mut runner = ScanRunner::new(plan);
    for _ in 0..12 {
        assert!(runner.make_step().await.is_continue());
    }
    runner.request_stop();
    assert!(matches!(runner.make_step().await, StepResult::Done));
    assert_eq!(runner.status(), PlanStatus::Stopped);
    assert_eq!(camera.shots().await, 20);
    assert_eq!(camera.read_count(), 10);
}

#[tokio::test]
async fn test_adaptive_time_zero_flat_curve() {
    let cam = wrap_cam(Arc::new(pattern_camera(1.05))).await;
    let dl = wrap_delay(MockDelayLine::builder("Delay").build()).await;

    let config = AdaptiveTimeZeroConfig {
        start: -1.0,
        stop: 1.0,
        step: 0.5,
        shots: 40,
        ..Default::default()
    };
    let plan = AdaptiveTimeZeroPlan::new("t0", cam, dl.clone(), config).unwrap();
    let handle = plan.handle();
    let mut runner = ScanRunner::new(plan);

    // One sweep and its refinement, without an explicit scan count.
    assert!(matches!(drive(&mut runner).await, StepResult::Done));
    assert_eq!(runner.status(), PlanStatus::Finished);
    assert_eq!(runner.cur_scan(), 1);

    // A flat curve needs no refinement.
    let data = handle.data();
    let xs: Vec<f64> = data.iter().map(|p| p.0).collect();
    assert_eq!(xs, vec![-1.0, -0.5, 0.0, 0.5]);
    assert!(data.iter().all(|p| (p.1 - BOOST_MOD).abs() < 1e-2));
    assert!(dl.pos().abs() < 1e-9);

    handle.set_zero_pos(0.5).await.unwrap();
    assert!(dl.pos().abs() < 1e-9);
    let shifted: Vec<f64> = handle.data().iter().map(|p| p.0).collect();
    assert_eq!(shifted, vec![-1.5, -1.0, -0.5, 0.0]);
}

#[tokio::test]
async fn test_adaptive_time_zero_restores_position_when_shots_restore_fails() {
    let camera = Arc::new(
        MockCamera::builder("Cam")
            .with_pattern(vec![100.0; 8], 1.05)
            .shots(20)
            .error_config(ErrorConfig::scenario(ErrorScenario::FailOnNth {
                operation: "set_shots",
                nth: 2,
            }))
            .build(),
    );
    let cam = wrap_cam(camera.clone()).await;
    let dl = wrap_delay(MockDelayLine::builder("Delay").build()).await;
    dl.set_pos(-100.0, true).await.unwrap();

    let config = AdaptiveTimeZeroConfig {
        start: 0.0,
        stop: 1.0,
        step: 0.5,
        shots: 40,
        ..Default::default()
    };
    let plan = AdaptiveTimeZeroPlan::new("t0", cam, dl.clone(), config).unwrap();
    let mut runner = ScanRunner::new(plan);

    assert!(matches!(drive(&mut runner).await, StepResult::Failed(_)));
    assert_eq!(camera.shots().await, 40);
    assert!((dl.pos() + 100.0).abs() < 1e-6);
}
