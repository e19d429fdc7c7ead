//! WebSQ control-channel messages and the label table.
//!
//! Device pushes look like `{"label": "...", "value": ...}`. A push whose
//! `value` is a JSON object is a *descriptor* (current value plus bounds,
//! units and similar metadata) and replaces the table entry wholesale. Any
//! other push is a plain update and only rewrites the `value` field of a
//! descriptor that is already known.
//!
//! Client messages are either commands
//! (`{"command":"SetAllBiasCurrents","label":"BiasCurrent","value":[...]}`)
//! or requests (`{"request":"BiasVoltage"}`).

use crate::error::AppResult;
use serde::Serialize;
use serde_json::Value;
use std::collections::HashMap;

/// Label names pushed by the device.
pub mod labels {
    /// Number of detector channels in the system
    pub const NUMBER_OF_DETECTORS: &str = "NumberOfDetectors";
    /// Per-detector bias current in µA
    pub const BIAS_CURRENT: &str = "BiasCurrent";
    /// Per-detector bias voltage in mV
    pub const BIAS_VOLTAGE: &str = "BiasVoltage";
    /// Per-detector trigger level in mV
    pub const TRIGGER_LEVEL: &str = "TriggerLevel";
    /// Counter integration period in ms
    pub const MEASUREMENT_PERIOD: &str = "InptMeasurementPeriod";
    /// Detector enable state
    pub const DETECTOR_ENABLE: &str = "DetectorEnable";
    /// Target dark counts for automatic bias calibration
    pub const DARK_COUNTS_AUTO_IV: &str = "DarkCountsAutoIV";
    /// True while automatic bias calibration is running
    pub const START_AUTO_IV: &str = "StartAutoIV";
}

/// Command names understood by the device.
pub mod commands {
    /// Set every detector's bias current
    pub const SET_ALL_BIAS_CURRENTS: &str = "SetAllBiasCurrents";
    /// Set every detector's trigger level
    pub const SET_ALL_TRIGGER_LEVELS: &str = "SetAllTriggerLevels";
    /// Enable or disable the detectors
    pub const DETECTOR_ENABLE: &str = "DetectorEnable";
    /// Set the counter integration period
    pub const SET_MEASUREMENT_PERIOD: &str = "SetMeasurementPeriod";
    /// Set target dark counts for automatic calibration
    pub const DARK_COUNTS_AUTO_IV: &str = "DarkCountsAutoIV";
    /// Start automatic bias calibration
    pub const AUTO_CALI_BIAS_CURRENTS: &str = "AutoCaliBiasCurrents";
}

/// Request asking the device to push every label descriptor.
pub const LABEL_PROPS_REQUEST: &str = "labelProps";

/// A device push carrying a label and its new value.
#[derive(Debug, Clone, PartialEq)]
pub struct LabelUpdate {
    /// Label name
    pub label: String,
    /// Pushed value, either a descriptor object or a plain value
    pub value: Value,
}

impl LabelUpdate {
    /// Extract a label update from a parsed message.
    ///
    /// Returns `None` for messages without a string `label` or without a
    /// `value` field.
    pub fn from_message(message: &Value) -> Option<Self> {
        let label = message.get("label")?.as_str()?;
        let value = message.get("value")?;
        Some(Self {
            label: label.to_string(),
            value: value.clone(),
        })
    }

    /// Whether this push reports a device error.
    pub fn is_error(&self) -> bool {
        self.label.contains("Error")
    }

    /// Whether this push carries a full descriptor.
    pub fn is_descriptor(&self) -> bool {
        self.value.is_object()
    }
}

/// What applying a `LabelUpdate` did to the table.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MergeOutcome {
    /// A descriptor was inserted or replaced.
    Replaced,
    /// The `value` field of an existing descriptor was overwritten.
    Updated,
    /// A plain value arrived for a label with no descriptor; nothing changed.
    Discarded,
}

/// Latest known descriptor per label.
#[derive(Debug, Clone, Default)]
pub struct LabelTable {
    entries: HashMap<String, Value>,
}

impl LabelTable {
    /// Create an empty table.
    pub fn new() -> Self {
        Self::default()
    }

    /// Merge a push into the table.
    pub fn apply(&mut self, update: &LabelUpdate) -> MergeOutcome {
        if update.is_descriptor() {
            self.entries
                .insert(update.label.clone(), update.value.clone());
            return MergeOutcome::Replaced;
        }

        match self
            .entries
            .get_mut(&update.label)
            .and_then(Value::as_object_mut)
        {
            Some(descriptor) => {
                descriptor.insert("value".to_string(), update.value.clone());
                MergeOutcome::Updated
            }
            None => MergeOutcome::Discarded,
        }
    }

    /// Descriptor currently stored for `label`.
    pub fn get(&self, label: &str) -> Option<&Value> {
        self.entries.get(label)
    }

    /// Copy of the whole table.
    pub fn snapshot(&self) -> HashMap<String, Value> {
        self.entries.clone()
    }

    /// Number of known labels.
    pub fn len(&self) -> usize {
        self.entries.len()
    }

    /// Whether no label has been seen yet.
    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }
}

/// `{command, label, value}` message sent to the device.
#[derive(Debug, Clone, Serialize)]
pub struct CommandEnvelope<'a, T: Serialize> {
    /// Command name
    pub command: &'a str,
    /// Label the command targets, if any
    #[serde(skip_serializing_if = "Option::is_none")]
    pub label: Option<&'a str>,
    /// Command argument
    pub value: T,
}

impl<'a, T: Serialize> CommandEnvelope<'a, T> {
    /// Command that targets a label.
    pub fn new(command: &'a str, label: &'a str, value: T) -> Self {
        Self {
            command,
            label: Some(label),
            value,
        }
    }

    /// Command without a label.
    pub fn unlabeled(command: &'a str, value: T) -> Self {
        Self {
            command,
            label: None,
            value,
        }
    }

    /// Serialize to the wire representation.
    pub fn to_json(&self) -> AppResult<String> {
        Ok(serde_json::to_string(self)?)
    }
}

/// `{request[, value]}` message asking the device to push a label.
#[derive(Debug, Clone, Serialize)]
pub struct RequestEnvelope<'a> {
    /// Name of the requested label or property set
    pub request: &'a str,
    /// Optional request argument
    #[serde(skip_serializing_if = "Option::is_none")]
    pub value: Option<&'a str>,
}

impl<'a> RequestEnvelope<'a> {
    /// Request without an argument.
    pub fn new(request: &'a str) -> Self {
        Self {
            request,
            value: None,
        }
    }

    /// The `labelProps` request sent once per connection.
    pub fn label_props() -> Self {
        Self {
            request: LABEL_PROPS_REQUEST,
            value: Some("None"),
        }
    }

    /// Serialize to the wire representation.
    pub fn to_json(&self) -> AppResult<String> {
        Ok(serde_json::to_string(self)?)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn push(label: &str, value: Value) -> LabelUpdate {
        LabelUpdate::from_message(&json!({"label": label, "value": value})).unwrap()
    }

    #[test]
    fn test_descriptor_replaces_entry() {
        let mut table = LabelTable::new();
        let first = push("BiasCurrent", json!({"value": [1.0], "unit": "uA"}));
        let second = push("BiasCurrent", json!({"value": [2.0], "max": 40}));

        assert_eq!(table.apply(&first), MergeOutcome::Replaced);
        assert_eq!(table.apply(&second), MergeOutcome::Replaced);
        assert_eq!(
            table.get("BiasCurrent"),
            Some(&json!({"value": [2.0], "max": 40}))
        );
    }

    #[test]
    fn test_plain_value_merges_into_descriptor() {
        let mut table = LabelTable::new();
        table.apply(&push("TriggerLevel", json!({"value": [0.0, 0.0], "unit": "mV"})));

        let outcome = table.apply(&push("TriggerLevel", json!([23.0, 24.0])));
        assert_eq!(outcome, MergeOutcome::Updated);
        assert_eq!(
            table.get("TriggerLevel"),
            Some(&json!({"value": [23.0, 24.0], "unit": "mV"}))
        );
    }

    #[test]
    fn test_plain_value_without_descriptor_is_discarded() {
        let mut table = LabelTable::new();
        assert_eq!(
            table.apply(&push("NumberOfDetectors", json!(4))),
            MergeOutcome::Discarded
        );
        assert!(table.is_empty());
    }

    #[test]
    fn test_latest_value_wins_per_label() {
        let mut table = LabelTable::new();
        let pushes = [
            push("A", json!({"value": 1})),
            push("B", json!({"value": "x"})),
            push("A", json!(2)),
            push("B", json!({"value": "y", "unit": null})),
            push("A", json!(3)),
            push("C", json!(true)),
        ];
        for update in &pushes {
            table.apply(update);
        }

        let snapshot = table.snapshot();
        assert_eq!(snapshot.len(), 2);
        assert_eq!(snapshot["A"], json!({"value": 3}));
        assert_eq!(snapshot["B"], json!({"value": "y", "unit": null}));
    }

    #[test]
    fn test_messages_without_label_or_value_are_ignored() {
        assert!(LabelUpdate::from_message(&json!({"value": 1})).is_none());
        assert!(LabelUpdate::from_message(&json!({"label": "A"})).is_none());
        assert!(LabelUpdate::from_message(&json!({"label": 7, "value": 1})).is_none());
        assert!(LabelUpdate::from_message(&json!([1, 2])).is_none());
    }

    #[test]
    fn test_error_labels() {
        assert!(push("OverCurrentError", json!("det 2")).is_error());
        assert!(!push("BiasCurrent", json!([1.0])).is_error());
    }

    #[test]
    fn test_command_envelope_wire_format() {
        let json = CommandEnvelope::new(
            commands::SET_ALL_BIAS_CURRENTS,
            labels::BIAS_CURRENT,
            [12.0, 8.0, 3.0, 8.0],
        )
        .to_json()
        .unwrap();
        assert_eq!(
            json,
            r#"{"command":"SetAllBiasCurrents","label":"BiasCurrent","value":[12.0,8.0,3.0,8.0]}"#
        );

        let json = CommandEnvelope::unlabeled(commands::AUTO_CALI_BIAS_CURRENTS, true)
            .to_json()
            .unwrap();
        assert_eq!(json, r#"{"command":"AutoCaliBiasCurrents","value":true}"#);
    }

    #[test]
    fn test_request_envelope_wire_format() {
        assert_eq!(
            RequestEnvelope::new(labels::BIAS_VOLTAGE).to_json().unwrap(),
            r#"{"request":"BiasVoltage"}"#
        );
        assert_eq!(
            RequestEnvelope::label_props().to_json().unwrap(),
            r#"{"request":"labelProps","value":"None"}"#
        );
    }
}
