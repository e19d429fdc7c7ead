//! Device-level facade over the two WebSQ channels.
//!
//! [`WebSq`] turns the detector vocabulary (bias current, trigger level,
//! measurement period, auto calibration, counts acquisition) into control
//! messages and counts-channel reads. It never parses wire data itself.
//!
//! Setters are fire-and-forget: they serialize a `{command, label, value}`
//! envelope and return once it is written. Getters return the most recent
//! value the device has pushed for the label; call a getter after a setter
//! only once the device has had time to echo the change.
//!
//! # Example
//!
//! ```rust,no_run
//! use websq_control::{config::WebSqConfig, WebSq};
//!
//! # async fn demo() -> websq_control::error::AppResult<()> {
//! let websq = WebSq::connect(&WebSqConfig::default()).await?;
//! websq.set_measurement_period(100).await?;
//! websq.enable_detectors(true).await?;
//! websq.set_bias_current(&[12.0, 8.0, 3.0, 8.0]).await?;
//!
//! let samples = websq.acquire_counts(10).await?;
//! println!("{} samples, bias voltage {:?}", samples.len(), websq.get_bias_voltage().await?);
//! websq.close().await;
//! # Ok(())
//! # }
//! ```

use crate::config::WebSqConfig;
use crate::error::{AppResult, WebSqError};
use crate::network::protocol::{commands, labels, CommandEnvelope, RequestEnvelope};
use crate::network::{
    ChannelHealth, ControlChannel, ControlOptions, CountsChannel, CountsOptions, ErrorCallback,
    Sample,
};
use serde::de::DeserializeOwned;
use serde::Serialize;
use serde_json::Value;
use std::time::Duration;
use tokio::time::{interval, Instant, MissedTickBehavior};

/// Health of both channels.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct WebSqHealth {
    /// Control channel receive task
    pub control: ChannelHealth,
    /// Counts channel receive task
    pub counts: ChannelHealth,
}

impl WebSqHealth {
    /// Whether both receive tasks are alive.
    pub fn is_healthy(&self) -> bool {
        self.control.is_running() && self.counts.is_running()
    }
}

/// Connected WebSQ detector system.
pub struct WebSq {
    control: ControlChannel,
    counts: CountsChannel,
    number_of_detectors: usize,
}

impl WebSq {
    /// Connect both channels and discover the number of detectors.
    ///
    /// Device-reported errors are logged.
    pub async fn connect(config: &WebSqConfig) -> AppResult<Self> {
        Self::connect_with_options(config, control_options(config)).await
    }

    /// Connect both channels, sending device-reported errors to `on_error`.
    pub async fn connect_with_error_handler(
        config: &WebSqConfig,
        on_error: ErrorCallback,
    ) -> AppResult<Self> {
        let options = control_options(config).with_error_callback(on_error);
        Self::connect_with_options(config, options).await
    }

    async fn connect_with_options(
        config: &WebSqConfig,
        options: ControlOptions,
    ) -> AppResult<Self> {
        let control = ControlChannel::connect(&config.device.control_addr(), options).await?;
        let counts =
            CountsChannel::connect(&config.device.counts_addr(), counts_options(config)).await?;
        Self::from_channels(control, counts).await
    }

    /// Wrap already-connected channels and discover the number of detectors.
    pub async fn from_channels(control: ControlChannel, counts: CountsChannel) -> AppResult<Self> {
        let mut websq = Self {
            control,
            counts,
            number_of_detectors: 0,
        };
        websq.number_of_detectors = websq.get_number_of_detectors().await?;
        tracing::info!(
            detectors = websq.number_of_detectors,
            "WebSQ detector system ready"
        );
        Ok(websq)
    }

    /// Detector count discovered at connect time.
    pub fn number_of_detectors(&self) -> usize {
        self.number_of_detectors
    }

    /// Current `NumberOfDetectors` value pushed by the device.
    pub async fn get_number_of_detectors(&self) -> AppResult<usize> {
        let count: f64 = self.value_as(labels::NUMBER_OF_DETECTORS).await?;
        if count < 0.0 || count.fract() != 0.0 {
            return Err(WebSqError::UnexpectedValue {
                label: labels::NUMBER_OF_DETECTORS.to_string(),
                reason: format!("{count} is not a detector count"),
            });
        }
        Ok(count as usize)
    }

    /// Set every detector's bias current, in µA.
    pub async fn set_bias_current(&self, current_ua: &[f64]) -> AppResult<()> {
        self.check_per_detector("bias current", current_ua.len())?;
        self.command(
            commands::SET_ALL_BIAS_CURRENTS,
            Some(labels::BIAS_CURRENT),
            current_ua,
        )
        .await
    }

    /// Last pushed bias current per detector, in µA.
    pub async fn get_bias_current(&self) -> AppResult<Vec<f64>> {
        self.value_as(labels::BIAS_CURRENT).await
    }

    /// Set every detector's trigger level, in mV.
    pub async fn set_trigger_level(&self, level_mv: &[f64]) -> AppResult<()> {
        self.check_per_detector("trigger level", level_mv.len())?;
        self.command(
            commands::SET_ALL_TRIGGER_LEVELS,
            Some(labels::TRIGGER_LEVEL),
            level_mv,
        )
        .await
    }

    /// Last pushed trigger level per detector, in mV.
    pub async fn get_trigger_level(&self) -> AppResult<Vec<f64>> {
        self.value_as(labels::TRIGGER_LEVEL).await
    }

    /// Enable or disable the detectors.
    pub async fn enable_detectors(&self, enabled: bool) -> AppResult<()> {
        self.command(
            commands::DETECTOR_ENABLE,
            Some(labels::DETECTOR_ENABLE),
            enabled,
        )
        .await
    }

    /// Set the counter integration period, in ms.
    pub async fn set_measurement_period(&self, period_ms: u32) -> AppResult<()> {
        self.command(
            commands::SET_MEASUREMENT_PERIOD,
            Some(labels::MEASUREMENT_PERIOD),
            period_ms,
        )
        .await
    }

    /// Wait until the device reports `period_ms` as its measurement period.
    ///
    /// Counts read before this returns may still cover the previous period.
    pub async fn wait_for_measurement_period(&self, period_ms: u32) -> AppResult<()> {
        let expected = f64::from(period_ms);
        self.control
            .wait_for_value(labels::MEASUREMENT_PERIOD, |value| {
                value.as_f64() == Some(expected)
            })
            .await?;
        Ok(())
    }

    /// Last pushed counter integration period, in ms.
    pub async fn get_measurement_period(&self) -> AppResult<f64> {
        self.value_as(labels::MEASUREMENT_PERIOD).await
    }

    /// Ask the device for fresh bias voltages, then return the stored value (mV).
    pub async fn get_bias_voltage(&self) -> AppResult<Vec<f64>> {
        self.request(labels::BIAS_VOLTAGE).await?;
        self.value_as(labels::BIAS_VOLTAGE).await
    }

    /// Set the per-detector dark counts targeted by auto calibration.
    ///
    /// Rejects a slice whose length differs from the detector count before
    /// anything is sent.
    pub async fn set_dark_counts_for_auto_calibration(&self, dark_counts: &[f64]) -> AppResult<()> {
        self.check_per_detector("dark counts", dark_counts.len())?;
        self.command(
            commands::DARK_COUNTS_AUTO_IV,
            Some(labels::DARK_COUNTS_AUTO_IV),
            dark_counts,
        )
        .await
    }

    /// Start automatic bias calibration. Keep light away from the detectors
    /// until [`is_auto_calibration_finished`](Self::is_auto_calibration_finished)
    /// reports completion.
    pub async fn trigger_auto_calibration(&self) -> AppResult<()> {
        self.command(commands::AUTO_CALI_BIAS_CURRENTS, None, true)
            .await
    }

    /// Whether automatic bias calibration has finished.
    ///
    /// The device reports `StartAutoIV = true` while calibration runs.
    pub async fn is_auto_calibration_finished(&self) -> AppResult<bool> {
        self.request(labels::START_AUTO_IV).await?;
        let running = self.control.get_value(labels::START_AUTO_IV).await?;
        truthy(&running)
            .map(|running| !running)
            .ok_or_else(|| WebSqError::UnexpectedValue {
                label: labels::START_AUTO_IV.to_string(),
                reason: format!("{running} is not a boolean"),
            })
    }

    /// Poll every `poll` until an auto calibration started by
    /// [`trigger_auto_calibration`](Self::trigger_auto_calibration) completes.
    ///
    /// Completion only counts once `StartAutoIV` has been seen running: right
    /// after the trigger the stored value can still be the idle state. Fails
    /// with [`WebSqError::Timeout`] if the device does not report a running
    /// calibration within the label timeout.
    pub async fn wait_for_auto_calibration(&self, poll: Duration) -> AppResult<()> {
        let start_deadline = Instant::now() + self.control.label_timeout();
        let mut ticker = interval(poll.max(Duration::from_millis(1)));
        ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
        // first tick completes immediately
        ticker.tick().await;

        let mut started = false;
        loop {
            ticker.tick().await;
            let finished = self.is_auto_calibration_finished().await?;
            if !finished {
                if !started {
                    tracing::info!("auto calibration running");
                }
                started = true;
            } else if started {
                tracing::info!("auto calibration finished");
                return Ok(());
            } else if Instant::now() >= start_deadline {
                return Err(WebSqError::Timeout {
                    label: labels::START_AUTO_IV.to_string(),
                    waited: self.control.label_timeout(),
                });
            }
        }
    }

    /// Wait for `n` new counts samples and return them, oldest first.
    pub async fn acquire_counts(&self, n: usize) -> AppResult<Vec<Sample>> {
        self.counts.wait_for_n(n).await
    }

    /// Health of both receive tasks.
    pub fn health(&self) -> WebSqHealth {
        WebSqHealth {
            control: self.control.health(),
            counts: self.counts.health(),
        }
    }

    /// Underlying control channel.
    pub fn control(&self) -> &ControlChannel {
        &self.control
    }

    /// Underlying counts channel.
    pub fn counts(&self) -> &CountsChannel {
        &self.counts
    }

    /// Close both channels.
    pub async fn close(&self) {
        self.control.close().await;
        self.counts.close().await;
    }

    fn check_per_detector(&self, what: &str, len: usize) -> AppResult<()> {
        if len != self.number_of_detectors {
            return Err(WebSqError::InvalidArgument(format!(
                "{what} has {len} values but the system has {} detectors",
                self.number_of_detectors
            )));
        }
        Ok(())
    }

    async fn command<T: Serialize>(
        &self,
        command: &str,
        label: Option<&str>,
        value: T,
    ) -> AppResult<()> {
        let envelope = match label {
            Some(label) => CommandEnvelope::new(command, label, value),
            None => CommandEnvelope::unlabeled(command, value),
        };
        self.control.send(&envelope.to_json()?).await
    }

    async fn request(&self, label: &str) -> AppResult<()> {
        self.control
            .send(&RequestEnvelope::new(label).to_json()?)
            .await
    }

    async fn value_as<T: DeserializeOwned>(&self, label: &str) -> AppResult<T> {
        let value = self.control.get_value(label).await?;
        serde_json::from_value(value).map_err(|e| WebSqError::UnexpectedValue {
            label: label.to_string(),
            reason: e.to_string(),
        })
    }
}

fn control_options(config: &WebSqConfig) -> ControlOptions {
    ControlOptions {
        connect_timeout: config.device.connect_timeout(),
        label_timeout: config.channels.label_timeout(),
        read_buffer_bytes: config.channels.read_buffer_bytes,
        on_error: None,
    }
}

fn counts_options(config: &WebSqConfig) -> CountsOptions {
    CountsOptions {
        connect_timeout: config.device.connect_timeout(),
        buffer: config.channels.counts_buffer,
        read_buffer_bytes: config.channels.read_buffer_bytes,
    }
}

/// Interpret a device flag, which may arrive as a bool or as 0/1.
fn truthy(value: &Value) -> Option<bool> {
    match value {
        Value::Bool(flag) => Some(*flag),
        Value::Number(n) => n.as_f64().map(|n| n != 0.0),
        _ => None,
    }
}
