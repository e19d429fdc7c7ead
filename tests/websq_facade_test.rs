//! Facade commands and getters against a loopback device.

#![allow(clippy::unwrap_used, clippy::expect_used, missing_docs)]

mod common;

use common::{push_message, read_messages, socket_pair, within};
use serde_json::json;
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::net::{TcpListener, TcpStream};
use websq_control::config::WebSqConfig;
use websq_control::network::{ControlChannel, ControlOptions, CountsChannel, CountsOptions};
use websq_control::analysis::uniform_setting;
use websq_control::{WebSq, WebSqError};

struct Bench {
    websq: WebSq,
    control: TcpStream,
    counts: TcpStream,
}

async fn bench(detectors: usize) -> Bench {
    bench_with_timeout(detectors, Duration::from_secs(2)).await
}

async fn bench_with_timeout(detectors: usize, label_timeout: Duration) -> Bench {
    let (control_client, mut control) = socket_pair().await;
    let (counts_client, counts) = socket_pair().await;

    let options = ControlOptions::default().with_label_timeout(label_timeout);
    let control_channel = ControlChannel::from_stream(control_client, options).unwrap();
    let counts_channel = CountsChannel::from_stream(counts_client, CountsOptions::default()).unwrap();

    push_message(
        &mut control,
        &json!({"label": "NumberOfDetectors", "value": {"value": detectors, "min": 1}}),
    )
    .await;
    let websq = WebSq::from_channels(control_channel, counts_channel)
        .await
        .unwrap();

    Bench {
        websq,
        control,
        counts,
    }
}

#[tokio::test]
async fn test_discovers_detector_count() {
    let bench = bench(4).await;
    assert_eq!(bench.websq.number_of_detectors(), 4);
    assert!(bench.websq.health().is_healthy());
}

#[tokio::test]
async fn test_setters_wire_format() {
    let mut bench = bench(2).await;
    let websq = &bench.websq;

    websq.set_bias_current(&[12.0, 8.5]).await.unwrap();
    websq.set_trigger_level(&[150.0, 140.0]).await.unwrap();
    websq.enable_detectors(true).await.unwrap();
    websq.set_measurement_period(100).await.unwrap();
    websq.trigger_auto_calibration().await.unwrap();

    let sent = read_messages(&mut bench.control, 5).await;
    assert_eq!(
        sent,
        vec![
            json!({"command": "SetAllBiasCurrents", "label": "BiasCurrent", "value": [12.0, 8.5]}),
            json!({"command": "SetAllTriggerLevels", "label": "TriggerLevel", "value": [150.0, 140.0]}),
            json!({"command": "DetectorEnable", "label": "DetectorEnable", "value": true}),
            json!({"command": "SetMeasurementPeriod", "label": "InptMeasurementPeriod", "value": 100}),
            json!({"command": "AutoCaliBiasCurrents", "value": true}),
        ]
    );
}

#[tokio::test]
async fn test_dark_counts_length_mismatch_sends_nothing() {
    let mut bench = bench(4).await;

    let err = bench
        .websq
        .set_dark_counts_for_auto_calibration(&[100.0, 100.0, 100.0])
        .await
        .unwrap_err();
    assert!(matches!(err, WebSqError::InvalidArgument(_)));

    bench
        .websq
        .set_dark_counts_for_auto_calibration(&[100.0; 4])
        .await
        .unwrap();
    let sent = read_messages(&mut bench.control, 1).await;
    assert_eq!(
        sent[0],
        json!({"command": "DarkCountsAutoIV", "label": "DarkCountsAutoIV", "value": [100.0, 100.0, 100.0, 100.0]})
    );
}

#[tokio::test]
async fn test_bias_length_mismatch_rejected() {
    let bench = bench(3).await;
    assert!(matches!(
        bench.websq.set_bias_current(&[1.0]).await,
        Err(WebSqError::InvalidArgument(_))
    ));
    assert!(matches!(
        bench.websq.set_trigger_level(&[]).await,
        Err(WebSqError::InvalidArgument(_))
    ));
}

#[tokio::test]
async fn test_getters_read_descriptor_values() {
    let mut bench = bench(2).await;

    push_message(&mut bench.control, &json!({"label": "BiasCurrent", "value": {"value": [12.0, 8.5], "unit": "uA"}})).await;
    push_message(&mut bench.control, &json!({"label": "TriggerLevel", "value": {"value": [150, 140]}})).await;
    push_message(&mut bench.control, &json!({"label": "InptMeasurementPeriod", "value": {"value": 100}})).await;

    assert_eq!(bench.websq.get_bias_current().await.unwrap(), vec![12.0, 8.5]);
    assert_eq!(bench.websq.get_trigger_level().await.unwrap(), vec![150.0, 140.0]);
    assert_eq!(bench.websq.get_measurement_period().await.unwrap(), 100.0);
}

#[tokio::test]
async fn test_getter_rejects_wrong_shape() {
    let mut bench = bench(2).await;
    push_message(&mut bench.control, &json!({"label": "BiasCurrent", "value": {"value": "n/a"}})).await;

    assert!(matches!(
        bench.websq.get_bias_current().await,
        Err(WebSqError::UnexpectedValue { .. })
    ));
}

#[tokio::test]
async fn test_bias_voltage_is_requested_first() {
    let Bench {
        websq,
        mut control,
        counts: _counts,
    } = bench(2).await;
    let websq = Arc::new(websq);

    let getter = tokio::spawn({
        let websq = websq.clone();
        async move { websq.get_bias_voltage().await }
    });

    let sent = read_messages(&mut control, 1).await;
    assert_eq!(sent[0], json!({"request": "BiasVoltage"}));
    push_message(&mut control, &json!({"label": "BiasVoltage", "value": {"value": [0.91, 0.88]}})).await;

    assert_eq!(getter.await.unwrap().unwrap(), vec![0.91, 0.88]);
}

#[tokio::test]
async fn test_auto_calibration_progress() {
    let mut bench = bench(2).await;

    push_message(&mut bench.control, &json!({"label": "StartAutoIV", "value": {"value": true}})).await;
    assert!(!bench.websq.is_auto_calibration_finished().await.unwrap());

    push_message(&mut bench.control, &json!({"label": "StartAutoIV", "value": false})).await;
    push_message(&mut bench.control, &json!({"label": "Sync", "value": {}})).await;
    bench.websq.control().get("Sync").await.unwrap();
    assert!(bench.websq.is_auto_calibration_finished().await.unwrap());

    let sent = read_messages(&mut bench.control, 2).await;
    assert_eq!(sent, vec![json!({"request": "StartAutoIV"}); 2]);
}

#[tokio::test]
async fn test_calibration_wait_ignores_idle_state_before_start() {
    let Bench {
        websq,
        mut control,
        counts: _counts,
    } = bench(2).await;

    push_message(&mut control, &json!({"label": "StartAutoIV", "value": {"value": false}})).await;
    websq.control().get("StartAutoIV").await.unwrap();
    websq.trigger_auto_calibration().await.unwrap();

    let start = Instant::now();
    let (finished, ()) = tokio::join!(
        within(websq.wait_for_auto_calibration(Duration::from_millis(10))),
        async {
            tokio::time::sleep(Duration::from_millis(100)).await;
            push_message(&mut control, &json!({"label": "StartAutoIV", "value": true})).await;
            tokio::time::sleep(Duration::from_millis(100)).await;
            push_message(&mut control, &json!({"label": "StartAutoIV", "value": false})).await;
        }
    );

    finished.unwrap();
    let elapsed = start.elapsed();
    assert!(elapsed >= Duration::from_millis(200), "finished early: {elapsed:?}");
}

#[tokio::test]
async fn test_calibration_wait_fails_if_never_started() {
    let Bench {
        websq,
        mut control,
        counts: _counts,
    } = bench_with_timeout(2, Duration::from_millis(300)).await;

    push_message(&mut control, &json!({"label": "StartAutoIV", "value": {"value": false}})).await;
    websq.trigger_auto_calibration().await.unwrap();

    let start = Instant::now();
    let err = within(websq.wait_for_auto_calibration(Duration::from_millis(10)))
        .await
        .unwrap_err();

    assert!(matches!(err, WebSqError::Timeout { ref label, .. } if label == "StartAutoIV"));
    assert!(start.elapsed() >= Duration::from_millis(300));
}

#[tokio::test]
async fn test_measurement_period_wait_for_echo() {
    let Bench {
        websq,
        mut control,
        counts: _counts,
    } = bench(2).await;

    push_message(&mut control, &json!({"label": "InptMeasurementPeriod", "value": {"value": 10}})).await;
    websq.set_measurement_period(100).await.unwrap();

    let start = Instant::now();
    let (confirmed, ()) = tokio::join!(websq.wait_for_measurement_period(100), async {
        tokio::time::sleep(Duration::from_millis(50)).await;
        push_message(&mut control, &json!({"label": "InptMeasurementPeriod", "value": 100})).await;
    });

    confirmed.unwrap();
    assert!(start.elapsed() >= Duration::from_millis(50));
    assert_eq!(websq.get_measurement_period().await.unwrap(), 100.0);
}

#[tokio::test]
async fn test_measurement_period_wait_times_out_without_echo() {
    let Bench {
        websq,
        mut control,
        counts: _counts,
    } = bench_with_timeout(2, Duration::from_millis(200)).await;

    push_message(&mut control, &json!({"label": "InptMeasurementPeriod", "value": {"value": 10}})).await;
    websq.set_measurement_period(100).await.unwrap();

    assert!(matches!(
        websq.wait_for_measurement_period(100).await,
        Err(WebSqError::Timeout { .. })
    ));
}

#[tokio::test]
async fn test_uniform_bias_for_every_detector() {
    let mut bench = bench(3).await;

    let values = uniform_setting(bench.websq.number_of_detectors(), 10.0);
    bench.websq.set_bias_current(&values).await.unwrap();

    let sent = read_messages(&mut bench.control, 1).await;
    assert_eq!(sent[0]["value"], json!([10.0, 10.0, 10.0]));
}

#[tokio::test]
async fn test_acquire_counts() {
    let Bench {
        websq,
        control: _control,
        mut counts,
    } = bench(2).await;

    let (samples, ()) = tokio::join!(within(websq.acquire_counts(2)), async {
        for line in ["5.0,1,2\n", "5.1,3,4\n"] {
            tokio::time::sleep(Duration::from_millis(30)).await;
            common::push_raw(&mut counts, line.as_bytes()).await;
        }
    });

    let samples = samples.unwrap();
    assert_eq!(samples.len(), 2);
    assert_eq!(samples[1].counts, vec![3.0, 4.0]);
}

#[tokio::test]
async fn test_connect_from_config() {
    let control_listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let counts_listener = TcpListener::bind("127.0.0.1:0").await.unwrap();

    let mut config = WebSqConfig::default();
    config.device.host = "127.0.0.1".into();
    config.device.control_port = control_listener.local_addr().unwrap().port();
    config.device.counts_port = counts_listener.local_addr().unwrap().port();
    config.channels.label_timeout_ms = 2000;

    let device = tokio::spawn(async move {
        let (mut control, _) = control_listener.accept().await.unwrap();
        let sent = read_messages(&mut control, 1).await;
        assert_eq!(sent[0]["request"], json!("labelProps"));
        let (counts, _) = counts_listener.accept().await.unwrap();
        push_message(&mut control, &json!({"label": "NumberOfDetectors", "value": {"value": 8}})).await;
        (control, counts)
    });

    let websq = WebSq::connect(&config).await.unwrap();
    let _sockets = device.await.unwrap();

    assert_eq!(websq.number_of_detectors(), 8);
    websq.close().await;
}
