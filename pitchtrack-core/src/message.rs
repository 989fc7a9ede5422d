//! # Wire Messages
//!
//! Everything that crosses between execution contexts: configuration going
//! in, analysis and status coming out, and raw audio batches for the worker.
//! The JSON forms use camelCase field names and a `type` tag.
//!
//! Inbound messages are decoded leniently. A tuning message carries no tag,
//! and a field holding something other than a number is treated as absent so
//! that the previous value is kept. Tuning fields riding on a typed message
//! are applied as well, so one JSON object may decode to several messages.

use serde::{Deserialize, Serialize};
use serde_json::Value;
use tracing::trace;

use crate::AnalysisResult;
use crate::adapter::LoadStatus;
use crate::config::TuningUpdate;
use crate::error::MessageError;

/// `type` tag of an init message.
pub const INIT_TYPE: &str = "init";
/// `type` tag of a reload request.
pub const RELOAD_TYPE: &str = "reload-detector";
/// `type` tag of an audio batch.
pub const AUDIO_TYPE: &str = "audio";

/// Configuration and control messages for a processor.
#[derive(Debug, Clone, PartialEq)]
pub enum ControlMessage {
    /// Sets the sample rate before first use. `None` selects the default.
    Init { sample_rate: Option<f64> },
    /// Adjusts onset threshold and RMS gate.
    Tuning(TuningUpdate),
    /// Retries loading the external detector.
    Reload,
}

/// Messages accepted by the detection worker.
#[derive(Debug, Clone, PartialEq)]
pub enum WorkerMessage {
    Control(ControlMessage),
    /// One accumulated batch of samples.
    Audio(Vec<f32>),
}

impl From<ControlMessage> for WorkerMessage {
    fn from(message: ControlMessage) -> Self {
        WorkerMessage::Control(message)
    }
}

/// Permissive view of any inbound JSON object.
#[derive(Debug, Default, Deserialize)]
#[serde(default, rename_all = "camelCase")]
struct RawInbound {
    #[serde(rename = "type")]
    kind: Option<String>,
    sample_rate: Option<Value>,
    onset_threshold: Option<Value>,
    rms_gate: Option<Value>,
    audio: Option<Vec<f32>>,
}

fn number(value: Option<&Value>) -> Option<f64> {
    value.and_then(Value::as_f64)
}

impl RawInbound {
    fn tuning(&self) -> TuningUpdate {
        TuningUpdate {
            onset_threshold: number(self.onset_threshold.as_ref()).map(|v| v as f32),
            rms_gate: number(self.rms_gate.as_ref()).map(|v| v as f32),
        }
    }

    /// Tuning fields are honoured on every message, whatever its type. A
    /// typed message yields its tuning first, when it carries any. An
    /// unknown type contributes nothing beyond its tuning.
    fn into_control(self) -> Vec<ControlMessage> {
        let tuning = self.tuning();
        let typed = match self.kind.as_deref() {
            None => return vec![ControlMessage::Tuning(tuning)],
            Some(INIT_TYPE) => Some(ControlMessage::Init {
                sample_rate: number(self.sample_rate.as_ref()),
            }),
            Some(RELOAD_TYPE) => Some(ControlMessage::Reload),
            Some(other) => {
                trace!(kind = other, "ignoring unknown message type");
                None
            }
        };
        let mut messages = Vec::with_capacity(2);
        if !tuning.is_empty() {
            messages.push(ControlMessage::Tuning(tuning));
        }
        messages.extend(typed);
        messages
    }
}

impl ControlMessage {
    /// Decodes the control messages carried by one JSON object, in the
    /// order they should be applied.
    pub fn from_json(json: &str) -> Result<Vec<Self>, MessageError> {
        let raw: RawInbound = serde_json::from_str(json)?;
        Ok(raw.into_control())
    }

    /// Encodes the message in its wire form.
    pub fn to_json(&self) -> String {
        let value = match self {
            ControlMessage::Init { sample_rate } => {
                serde_json::json!({ "type": INIT_TYPE, "sampleRate": sample_rate })
            }
            ControlMessage::Tuning(update) => serde_json::json!(update),
            ControlMessage::Reload => serde_json::json!({ "type": RELOAD_TYPE }),
        };
        value.to_string()
    }
}

impl WorkerMessage {
    /// Decodes the worker messages carried by one JSON object.
    pub fn from_json(json: &str) -> Result<Vec<Self>, MessageError> {
        let raw: RawInbound = serde_json::from_str(json)?;
        if raw.kind.as_deref() == Some(AUDIO_TYPE) {
            return raw
                .audio
                .map(|samples| vec![WorkerMessage::Audio(samples)])
                .ok_or(MessageError::MissingAudio);
        }
        Ok(raw.into_control().into_iter().map(WorkerMessage::Control).collect())
    }

    /// Encodes the message in its wire form.
    pub fn to_json(&self) -> String {
        match self {
            WorkerMessage::Control(control) => control.to_json(),
            WorkerMessage::Audio(samples) => {
                serde_json::json!({ "type": AUDIO_TYPE, "audio": samples }).to_string()
            }
        }
    }
}

/// Analysis payload as delivered to the consumer. Energy and RMS are only
/// present for pipelines that compute them.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Analysis {
    pub freq: Option<f32>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub energy: Option<f32>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub rms: Option<f32>,
    pub onset: bool,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub onset_time: Option<f64>,
}

impl Analysis {
    /// A frequency-only analysis, as produced by the worker.
    pub fn frequency_only(freq: Option<f32>) -> Self {
        Self {
            freq,
            energy: None,
            rms: None,
            onset: false,
            onset_time: None,
        }
    }
}

impl From<AnalysisResult> for Analysis {
    fn from(result: AnalysisResult) -> Self {
        Self {
            freq: result.frequency_hz,
            energy: Some(result.energy),
            rms: Some(result.rms),
            onset: result.onset,
            onset_time: result.onset_time_secs,
        }
    }
}

/// Messages produced by the pipeline.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type")]
pub enum OutputMessage {
    #[serde(rename = "analysis")]
    Analysis(Analysis),
    #[serde(rename = "detector-status")]
    Status(LoadStatus),
}

impl OutputMessage {
    /// Encodes the message as one JSON line (without the newline).
    pub fn to_json(&self) -> Result<String, MessageError> {
        Ok(serde_json::to_string(self)?)
    }

    pub fn from_json(json: &str) -> Result<Self, MessageError> {
        Ok(serde_json::from_str(json)?)
    }
}

impl From<AnalysisResult> for OutputMessage {
    fn from(result: AnalysisResult) -> Self {
        OutputMessage::Analysis(result.into())
    }
}

impl From<LoadStatus> for OutputMessage {
    fn from(status: LoadStatus) -> Self {
        OutputMessage::Status(status)
    }
}
