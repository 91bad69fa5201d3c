use crate::stage::{Sampler, SharedConditioning, StageKind, DEFAULT_COVER_STRENGTH};
use serde::de::{DeserializeOwned, Deserializer};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;

/// Response envelope used by every REST endpoint of the service.
#[derive(Debug, Clone, Deserialize)]
pub struct ApiEnvelope<T> {
    #[serde(default = "default_true")]
    pub success: bool,
    pub data: Option<T>,
    #[serde(default)]
    pub error: Option<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TaskCreated {
    pub task_id: String,
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Default)]
#[serde(rename_all = "lowercase")]
pub enum TaskState {
    #[default]
    Pending,
    Running,
    Completed,
    Error,
}

impl TaskState {
    pub fn is_terminal(&self) -> bool {
        matches!(self, Self::Completed | Self::Error)
    }
}

#[derive(Debug, Clone, Deserialize)]
pub struct TaskStatusResponse {
    pub task_id: String,
    pub status: TaskState,
    #[serde(default)]
    pub progress: f32,
    #[serde(default)]
    pub message: String,
    #[serde(default)]
    pub result: Option<RemoteResult>,
    #[serde(default)]
    pub error: Option<String>,
}

/// Frames delivered on the push websocket.
#[derive(Debug, Clone, Deserialize)]
#[serde(tag = "type", rename_all = "lowercase")]
pub enum PushEvent {
    Progress {
        task_id: String,
        #[serde(default)]
        progress: f32,
        #[serde(default)]
        message: String,
    },
    Completed {
        task_id: String,
        #[serde(default)]
        result: Option<RemoteResult>,
    },
    Error {
        task_id: String,
        #[serde(default)]
        error: String,
        #[serde(default)]
        error_detail: Option<String>,
    },
    /// Snapshot sent right after subscribing and on state changes. Carries
    /// no result payload.
    Status {
        task_id: String,
        status: TaskState,
        #[serde(default)]
        progress: Option<f32>,
        #[serde(default)]
        message: Option<String>,
    },
}

impl PushEvent {
    pub fn task_id(&self) -> &str {
        match self {
            Self::Progress { task_id, .. }
            | Self::Completed { task_id, .. }
            | Self::Error { task_id, .. }
            | Self::Status { task_id, .. } => task_id,
        }
    }
}

/// A finished task's payload. Pipeline results are recognised by their
/// `stages` list; anything else is a single-shot result.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum RemoteResult {
    Pipeline(PipelineResult),
    Single(SingleResult),
}

impl RemoteResult {
    pub fn success(&self) -> bool {
        match self {
            Self::Pipeline(result) => result.success,
            Self::Single(result) => result.success,
        }
    }

    pub fn failure_message(&self) -> Option<String> {
        if self.success() {
            return None;
        }
        let (error, status) = match self {
            Self::Pipeline(result) => (result.error.as_deref(), None),
            Self::Single(result) => (result.error.as_deref(), Some(result.status_message.as_str())),
        };
        let message = error
            .filter(|msg| !msg.trim().is_empty())
            .or(status.filter(|msg| !msg.trim().is_empty()))
            .unwrap_or("generation failed");
        Some(message.to_string())
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PipelineResult {
    pub stages: Vec<PipelineStageOutput>,
    #[serde(default)]
    pub final_stage: Option<usize>,
    #[serde(default)]
    pub time_costs: BTreeMap<String, f64>,
    #[serde(default = "default_true")]
    pub success: bool,
    #[serde(default)]
    pub error: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PipelineStageOutput {
    pub stage: usize,
    #[serde(default)]
    pub batch: usize,
    pub audio_id: String,
    #[serde(default)]
    pub is_final: bool,
    #[serde(default)]
    pub is_preview: bool,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SingleResult {
    #[serde(default)]
    pub audios: Vec<RemoteAudio>,
    #[serde(default)]
    pub status_message: String,
    #[serde(default = "default_true")]
    pub success: bool,
    #[serde(default)]
    pub error: Option<String>,
    #[serde(default, deserialize_with = "lenient")]
    pub extra: Option<RemoteExtra>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RemoteAudio {
    #[serde(default)]
    pub id: String,
    #[serde(default)]
    pub key: String,
    #[serde(default)]
    pub sample_rate: Option<u32>,
    #[serde(default, deserialize_with = "lenient_or_default")]
    pub params: RecordedParams,
    #[serde(default)]
    pub codes: String,
    #[serde(default)]
    pub latent_id: Option<String>,
    #[serde(default)]
    pub checkpoint_latent_id: Option<String>,
    #[serde(default)]
    pub checkpoint_step: Option<u32>,
}

#[derive(Debug, Clone, PartialEq, Default, Serialize, Deserialize)]
pub struct RemoteExtra {
    #[serde(default)]
    pub time_costs: BTreeMap<String, f64>,
    #[serde(default, deserialize_with = "lenient")]
    pub lm_metadata: Option<LmMetadata>,
}

/// Output of the language-model planning phase.
#[derive(Debug, Clone, PartialEq, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct LmMetadata {
    pub bpm: Option<u32>,
    pub keyscale: Option<String>,
    pub duration: Option<f64>,
    pub language: Option<String>,
    pub timesignature: Option<String>,
    pub caption: Option<String>,
    pub thinking_text: Option<String>,
}

/// Parameters the service recorded for one rendered audio. Every field is
/// optional; absent values fall back to form defaults on restore.
#[derive(Debug, Clone, PartialEq, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct RecordedParams {
    pub task_type: Option<String>,
    pub caption: Option<String>,
    pub lyrics: Option<String>,
    pub instrumental: Option<bool>,
    pub vocal_language: Option<String>,
    pub bpm: Option<u32>,
    pub keyscale: Option<String>,
    pub timesignature: Option<String>,
    pub duration: Option<f64>,
    pub inference_steps: Option<u32>,
    pub guidance_scale: Option<f32>,
    pub seed: Option<i64>,
    pub shift: Option<f32>,
    pub infer_method: Option<String>,
    pub timesteps: Option<Vec<f32>>,
    pub use_adg: Option<bool>,
    pub cfg_interval_start: Option<f32>,
    pub cfg_interval_end: Option<f32>,
    pub audio_cover_strength: Option<f32>,
    pub repainting_start: Option<f64>,
    pub repainting_end: Option<f64>,
    pub audio_codes: Option<String>,
    pub src_audio_id: Option<String>,
    pub init_latent_id: Option<String>,
    pub t_start: Option<f32>,
    pub checkpoint_step: Option<u32>,
    pub stage_index: Option<usize>,
}

/// The single-shot generation form. Serialises directly as the body of
/// `POST /api/generation/generate`; the track fields stay client-side and
/// feed the instruction text instead.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct FlatConfig {
    pub caption: String,
    pub lyrics: String,
    pub instrumental: bool,
    pub task_type: String,
    pub instruction: String,
    pub vocal_language: String,
    pub bpm: Option<u32>,
    pub keyscale: String,
    pub timesignature: String,
    pub duration: f64,
    pub reference_audio_id: Option<String>,
    pub src_audio_id: Option<String>,
    pub audio_codes: String,
    pub repainting_start: f64,
    pub repainting_end: f64,
    pub audio_cover_strength: f32,
    pub inference_steps: u32,
    pub guidance_scale: f32,
    pub seed: i64,
    pub use_adg: bool,
    pub cfg_interval_start: f32,
    pub cfg_interval_end: f32,
    pub shift: f32,
    pub infer_method: Sampler,
    pub timesteps: Option<Vec<f32>>,
    pub thinking: bool,
    pub lm_temperature: f32,
    pub lm_cfg_scale: f32,
    pub lm_top_k: u32,
    pub lm_top_p: f32,
    pub lm_negative_prompt: String,
    pub use_cot_metas: bool,
    pub use_cot_caption: bool,
    pub use_cot_language: bool,
    pub use_constrained_decoding: bool,
    pub batch_size: u32,
    pub use_random_seed: bool,
    pub audio_format: String,
    pub auto_score: bool,
    pub auto_lrc: bool,
    pub init_latent_id: Option<String>,
    pub t_start: f32,
    pub checkpoint_step: Option<u32>,
    pub resume_sample_index: Option<u32>,
    #[serde(skip_serializing)]
    pub track_name: Option<String>,
    #[serde(skip_serializing)]
    pub complete_track_classes: Vec<String>,
}

pub const TASK_TYPE_TEXT2MUSIC: &str = "text2music";

impl Default for FlatConfig {
    fn default() -> Self {
        Self {
            caption: String::new(),
            lyrics: String::new(),
            instrumental: false,
            task_type: TASK_TYPE_TEXT2MUSIC.into(),
            instruction: String::new(),
            vocal_language: "unknown".into(),
            bpm: None,
            keyscale: String::new(),
            timesignature: String::new(),
            duration: -1.0,
            reference_audio_id: None,
            src_audio_id: None,
            audio_codes: String::new(),
            repainting_start: 0.0,
            repainting_end: -1.0,
            audio_cover_strength: DEFAULT_COVER_STRENGTH,
            inference_steps: 8,
            guidance_scale: 7.0,
            seed: -1,
            use_adg: false,
            cfg_interval_start: 0.0,
            cfg_interval_end: 1.0,
            shift: 1.0,
            infer_method: Sampler::Ode,
            timesteps: None,
            thinking: true,
            lm_temperature: 0.85,
            lm_cfg_scale: 2.0,
            lm_top_k: 0,
            lm_top_p: 0.9,
            lm_negative_prompt: "NO USER INPUT".into(),
            use_cot_metas: true,
            use_cot_caption: true,
            use_cot_language: true,
            use_constrained_decoding: true,
            batch_size: 2,
            use_random_seed: true,
            audio_format: "flac".into(),
            auto_score: false,
            auto_lrc: false,
            init_latent_id: None,
            t_start: 1.0,
            checkpoint_step: None,
            resume_sample_index: None,
            track_name: None,
            complete_track_classes: Vec::new(),
        }
    }
}

impl FlatConfig {
    /// Request body with the instruction filled in for track-based task
    /// types. An explicit instruction is left alone.
    pub fn to_request(&self) -> FlatConfig {
        let mut request = self.clone();
        if request.instruction.trim().is_empty() {
            if let Some(instruction) = track_instruction(
                &self.task_type,
                self.track_name.as_deref(),
                &self.complete_track_classes,
            ) {
                request.instruction = instruction;
            }
        }
        request
    }
}

fn track_instruction(task_type: &str, track: Option<&str>, classes: &[String]) -> Option<String> {
    let track = track.filter(|name| !name.trim().is_empty()).unwrap_or("track");
    match task_type {
        "extract" => Some(format!("Extract the {track} track from the audio:")),
        "lego" => Some(format!("Generate the {track} track based on the audio context:")),
        "complete" => {
            let classes = if classes.is_empty() {
                "accompaniment".to_string()
            } else {
                classes.join(", ")
            };
            Some(format!("Complete the input track with {classes}:"))
        }
        _ => None,
    }
}

/// Stage as sent to `POST /api/generation/pipeline`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct PipelineStageWire {
    pub r#type: StageKind,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub input_stage: Option<usize>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub caption: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub lyrics: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub src_audio_id: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub src_stage: Option<usize>,
    pub audio_cover_strength: f32,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub audio_code_hints: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub repainting_start: Option<f64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub repainting_end: Option<f64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub track_name: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub complete_track_classes: Option<Vec<String>>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub model: Option<String>,
    pub steps: u32,
    pub shift: f32,
    pub denoise: f32,
    pub seed: i64,
    pub infer_method: Sampler,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub scheduler: Option<String>,
    pub guidance_scale: f32,
    pub use_adg: bool,
    pub cfg_interval_start: f32,
    pub cfg_interval_end: f32,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub timesteps: Option<Vec<f32>>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub checkpoint_step: Option<u32>,
    pub preview: bool,
}

impl Default for PipelineStageWire {
    fn default() -> Self {
        Self {
            r#type: StageKind::Generate,
            input_stage: None,
            caption: None,
            lyrics: None,
            src_audio_id: None,
            src_stage: None,
            audio_cover_strength: DEFAULT_COVER_STRENGTH,
            audio_code_hints: None,
            repainting_start: None,
            repainting_end: None,
            track_name: None,
            complete_track_classes: None,
            model: None,
            steps: crate::stage::DEFAULT_STEPS,
            shift: crate::stage::DEFAULT_SHIFT,
            denoise: 1.0,
            seed: -1,
            infer_method: Sampler::Ode,
            scheduler: None,
            guidance_scale: 1.0,
            use_adg: false,
            cfg_interval_start: 0.0,
            cfg_interval_end: 1.0,
            timesteps: None,
            checkpoint_step: None,
            preview: false,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PipelineRequest {
    #[serde(flatten)]
    pub shared: SharedConditioning,
    pub stages: Vec<PipelineStageWire>,
}

#[derive(Debug, Clone, Serialize)]
pub struct AnalysisRequest {
    pub task_id: String,
    pub sample_index: usize,
    pub vocal_language: String,
    pub inference_steps: u32,
    pub seed: i64,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub total_duration_seconds: Option<f64>,
}

#[derive(Debug, Clone, Deserialize)]
pub struct ScoreResponse {
    #[serde(default)]
    pub lm_score: f64,
    #[serde(default)]
    pub dit_score: f64,
    #[serde(default = "default_true")]
    pub success: bool,
    #[serde(default)]
    pub error: Option<String>,
}

#[derive(Debug, Clone, Deserialize)]
pub struct LyricsTimingResponse {
    #[serde(default)]
    pub lrc_text: String,
    #[serde(default = "default_true")]
    pub success: bool,
    #[serde(default)]
    pub error: Option<String>,
}

fn default_true() -> bool {
    true
}

/// Loosely-typed auxiliary payloads decode to `None` instead of failing the
/// whole status response.
fn lenient<'de, D, T>(deserializer: D) -> Result<Option<T>, D::Error>
where
    D: Deserializer<'de>,
    T: DeserializeOwned,
{
    let value = serde_json::Value::deserialize(deserializer)?;
    Ok(serde_json::from_value(value).ok())
}

fn lenient_or_default<'de, D, T>(deserializer: D) -> Result<T, D::Error>
where
    D: Deserializer<'de>,
    T: DeserializeOwned + Default,
{
    Ok(lenient(deserializer)?.unwrap_or_default())
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn decodes_pipeline_result_by_stages_key() {
        let result: RemoteResult = serde_json::from_value(json!({
            "stages": [
                {"stage": 0, "batch": 0, "audio_id": "a0", "is_final": false, "is_preview": true},
                {"stage": 1, "batch": 0, "audio_id": "a1", "is_final": true, "is_preview": false}
            ],
            "final_stage": 1,
            "time_costs": {"stage_0": 1.5, "vae_decode": 0.3},
            "success": true
        }))
        .unwrap();
        match result {
            RemoteResult::Pipeline(pipeline) => {
                assert_eq!(pipeline.stages.len(), 2);
                assert_eq!(pipeline.final_stage, Some(1));
            }
            other => panic!("expected pipeline result, got {other:?}"),
        }
    }

    #[test]
    fn decodes_single_result_with_loose_params() {
        let result: RemoteResult = serde_json::from_value(json!({
            "audios": [{
                "id": "f1",
                "key": "k",
                "params": {"seed": "not-a-number"},
                "latent_id": "lat-1"
            }],
            "status_message": "ok",
            "success": true,
            "extra": {"time_costs": {"total": 4.0}, "lm_metadata": {"bpm": "fast"}}
        }))
        .unwrap();
        let RemoteResult::Single(single) = result else {
            panic!("expected single result");
        };
        assert_eq!(single.audios[0].params, RecordedParams::default());
        assert_eq!(single.audios[0].latent_id.as_deref(), Some("lat-1"));
        let extra = single.extra.unwrap();
        assert_eq!(extra.time_costs.get("total"), Some(&4.0));
        assert!(extra.lm_metadata.is_none());
    }

    #[test]
    fn failure_message_prefers_error_then_status() {
        let result = RemoteResult::Single(SingleResult {
            audios: Vec::new(),
            status_message: "LM failed".into(),
            success: false,
            error: None,
            extra: None,
        });
        assert_eq!(result.failure_message().as_deref(), Some("LM failed"));
    }

    #[test]
    fn push_events_decode_by_type_tag() {
        let event: PushEvent = serde_json::from_value(json!({
            "type": "error", "task_id": "t1", "error": "boom"
        }))
        .unwrap();
        assert_eq!(event.task_id(), "t1");
        assert!(matches!(event, PushEvent::Error { ref error, .. } if error == "boom"));

        let status: PushEvent = serde_json::from_value(json!({
            "type": "status", "task_id": "t1", "status": "running"
        }))
        .unwrap();
        assert!(matches!(status, PushEvent::Status { status: TaskState::Running, .. }));
    }

    #[test]
    fn flat_request_fills_track_instruction() {
        let flat = FlatConfig {
            task_type: "extract".into(),
            track_name: Some("drums".into()),
            ..FlatConfig::default()
        };
        let request = flat.to_request();
        assert_eq!(request.instruction, "Extract the drums track from the audio:");
        let body = serde_json::to_value(&request).unwrap();
        assert!(body.get("track_name").is_none());
        assert_eq!(body["task_type"], "extract");
    }
}
