use shell_logger_stats::{SamplerRegistry, Samples, StatsError, finish_all, start_all};
use std::thread;
use std::time::Duration;

#[test]
fn test_sample_count_tracks_interval() {
    let registry = SamplerRegistry::with_defaults();
    let running = registry.create("cpu", 0.1).unwrap().start().unwrap();
    thread::sleep(Duration::from_secs(1));
    let samples = running.finish().unwrap();

    let ticks = samples.ticks();
    assert!(ticks > 5, "only {ticks} samples");
    assert!(ticks < 15, "{ticks} samples");
}

#[test]
fn test_all_default_samplers() {
    let registry = SamplerRegistry::with_defaults();
    let before = chrono::Utc::now().timestamp_millis();
    let samplers = registry
        .create_all(&["cpu", "memory", "disk"], 0.1)
        .unwrap();
    let running = start_all(samplers).unwrap();
    thread::sleep(Duration::from_millis(300));
    let results = finish_all(running).unwrap();
    let after = chrono::Utc::now().timestamp_millis();

    assert_eq!(results.len(), 3);
    for name in ["cpu", "memory"] {
        let Samples::Series(series) = &results[name] else {
            panic!("{name} should be a series");
        };
        assert!(!series.is_empty());
        for (timestamp, value) in series {
            assert!((before..=after).contains(timestamp));
            assert!((0.0..=100.0).contains(value));
        }
    }

    let Samples::PerMount(mounts) = &results["disk"] else {
        panic!("disk should be per mount");
    };
    assert!(mounts.contains_key("/tmp"));
    assert!(!mounts["/tmp"].is_empty());
}

#[test]
fn test_unknown_sampler_is_a_configuration_error() {
    let registry = SamplerRegistry::with_defaults();
    assert!(matches!(
        registry.create_all(&["gpu"], 1.0),
        Err(StatsError::UnknownSampler { .. })
    ));
}
