use crate::error::GraphError;
use crate::types::PipelineStageWire;
use serde::{Deserialize, Serialize};
use std::collections::BTreeSet;
use std::fmt;

pub const DEFAULT_STEPS: u32 = 8;
pub const DEFAULT_SHIFT: f32 = 3.0;
pub const DEFAULT_TRACK_NAME: &str = "vocals";
pub const DEFAULT_COMPLETE_CLASS: &str = "accompaniment";
pub const DEFAULT_COVER_STRENGTH: f32 = 1.0;

/// Repaint end marker meaning "to the end of the source audio". Values past
/// the source length extend it.
pub const REPAINT_TO_END: f64 = -1.0;

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Hash)]
#[serde(rename_all = "lowercase")]
pub enum StageKind {
    Generate,
    Refine,
    Cover,
    Repaint,
    Extract,
    Lego,
    Complete,
}

impl StageKind {
    pub const ALL: [StageKind; 7] = [
        StageKind::Generate,
        StageKind::Refine,
        StageKind::Cover,
        StageKind::Repaint,
        StageKind::Extract,
        StageKind::Lego,
        StageKind::Complete,
    ];

    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Generate => "generate",
            Self::Refine => "refine",
            Self::Cover => "cover",
            Self::Repaint => "repaint",
            Self::Extract => "extract",
            Self::Lego => "lego",
            Self::Complete => "complete",
        }
    }

    pub fn needs_audio_source(&self) -> bool {
        matches!(self, Self::Cover | Self::Repaint | Self::Extract | Self::Lego | Self::Complete)
    }

    /// Kinds the service only runs on base (non-turbo, non-sft) checkpoints.
    pub fn requires_base_model(&self) -> bool {
        matches!(self, Self::Extract | Self::Lego | Self::Complete)
    }
}

impl fmt::Display for StageKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Default)]
#[serde(rename_all = "lowercase")]
pub enum Sampler {
    #[default]
    Ode,
    Sde,
}

impl Sampler {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Ode => "ode",
            Self::Sde => "sde",
        }
    }

    /// Unknown sampler names fall back to ODE.
    pub fn parse(value: &str) -> Self {
        match value.trim().to_ascii_lowercase().as_str() {
            "sde" => Self::Sde,
            _ => Self::Ode,
        }
    }
}

/// Diffusion parameters every stage carries regardless of kind. These survive
/// a kind change.
#[derive(Debug, Clone, PartialEq)]
pub struct CommonParams {
    pub steps: u32,
    pub shift: f32,
    /// Negative means "pick a random seed".
    pub seed: i64,
    pub infer_method: Sampler,
    pub guidance_scale: f32,
    pub denoise: f32,
    pub timesteps: Option<Vec<f32>>,
    pub checkpoint_step: Option<u32>,
    pub caption: Option<String>,
    pub lyrics: Option<String>,
    pub preview: bool,
    pub model: Option<String>,
    pub scheduler: Option<String>,
    pub use_adg: bool,
    pub cfg_interval_start: f32,
    pub cfg_interval_end: f32,
}

impl Default for CommonParams {
    fn default() -> Self {
        Self {
            steps: DEFAULT_STEPS,
            shift: DEFAULT_SHIFT,
            seed: -1,
            infer_method: Sampler::Ode,
            guidance_scale: 1.0,
            denoise: 1.0,
            timesteps: None,
            checkpoint_step: None,
            caption: None,
            lyrics: None,
            preview: false,
            model: None,
            scheduler: None,
            use_adg: false,
            cfg_interval_start: 0.0,
            cfg_interval_end: 1.0,
        }
    }
}

/// Where an audio-consuming stage reads its source from. The two modes are
/// exclusive by construction.
#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub enum AudioSource {
    #[default]
    Unset,
    Upload(String),
    Stage(usize),
}

impl AudioSource {
    pub fn is_set(&self) -> bool {
        !matches!(self, Self::Unset)
    }

    pub fn upload_id(&self) -> Option<&str> {
        match self {
            Self::Upload(id) => Some(id.as_str()),
            _ => None,
        }
    }

    pub fn stage(&self) -> Option<usize> {
        match self {
            Self::Stage(index) => Some(*index),
            _ => None,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AudioSourceMode {
    FromStage,
    Upload,
}

#[derive(Debug, Clone, Copy, PartialEq)]
pub struct RepaintWindow {
    pub start: f64,
    /// `REPAINT_TO_END` (-1) repaints to the end of the audio.
    pub end: f64,
}

impl RepaintWindow {
    pub fn is_unbounded(&self) -> bool {
        self.end < 0.0
    }
}

impl Default for RepaintWindow {
    fn default() -> Self {
        Self { start: 0.0, end: REPAINT_TO_END }
    }
}

#[derive(Debug, Clone, PartialEq)]
pub enum StageKindConfig {
    Generate,
    Refine { input_stage: Option<usize> },
    Cover { source: AudioSource, cover_strength: f32, audio_code_hints: Option<String> },
    Repaint { source: AudioSource, window: RepaintWindow },
    Extract { source: AudioSource, track_name: String },
    Lego { source: AudioSource, track_name: String },
    Complete { source: AudioSource, track_classes: BTreeSet<String> },
}

impl StageKindConfig {
    /// Declared kind-specific defaults. Sources start unset; wiring to a
    /// previous stage is the graph's job.
    pub fn defaults(kind: StageKind) -> Self {
        match kind {
            StageKind::Generate => Self::Generate,
            StageKind::Refine => Self::Refine { input_stage: None },
            StageKind::Cover => Self::Cover {
                source: AudioSource::Unset,
                cover_strength: DEFAULT_COVER_STRENGTH,
                audio_code_hints: None,
            },
            StageKind::Repaint => {
                Self::Repaint { source: AudioSource::Unset, window: RepaintWindow::default() }
            }
            StageKind::Extract => {
                Self::Extract { source: AudioSource::Unset, track_name: DEFAULT_TRACK_NAME.into() }
            }
            StageKind::Lego => {
                Self::Lego { source: AudioSource::Unset, track_name: DEFAULT_TRACK_NAME.into() }
            }
            StageKind::Complete => Self::Complete {
                source: AudioSource::Unset,
                track_classes: BTreeSet::from([DEFAULT_COMPLETE_CLASS.to_string()]),
            },
        }
    }

    pub fn kind(&self) -> StageKind {
        match self {
            Self::Generate => StageKind::Generate,
            Self::Refine { .. } => StageKind::Refine,
            Self::Cover { .. } => StageKind::Cover,
            Self::Repaint { .. } => StageKind::Repaint,
            Self::Extract { .. } => StageKind::Extract,
            Self::Lego { .. } => StageKind::Lego,
            Self::Complete { .. } => StageKind::Complete,
        }
    }

    pub fn source(&self) -> Option<&AudioSource> {
        match self {
            Self::Cover { source, .. }
            | Self::Repaint { source, .. }
            | Self::Extract { source, .. }
            | Self::Lego { source, .. }
            | Self::Complete { source, .. } => Some(source),
            Self::Generate | Self::Refine { .. } => None,
        }
    }

    pub fn source_mut(&mut self) -> Option<&mut AudioSource> {
        match self {
            Self::Cover { source, .. }
            | Self::Repaint { source, .. }
            | Self::Extract { source, .. }
            | Self::Lego { source, .. }
            | Self::Complete { source, .. } => Some(source),
            Self::Generate | Self::Refine { .. } => None,
        }
    }

    pub fn input_stage(&self) -> Option<usize> {
        match self {
            Self::Refine { input_stage } => *input_stage,
            _ => None,
        }
    }

    pub fn track_name(&self) -> Option<&str> {
        match self {
            Self::Extract { track_name, .. } | Self::Lego { track_name, .. } => {
                Some(track_name.as_str())
            }
            _ => None,
        }
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct StageConfig {
    pub common: CommonParams,
    pub kind: StageKindConfig,
}

impl StageConfig {
    pub fn new(kind: StageKind) -> Self {
        Self { common: CommonParams::default(), kind: StageKindConfig::defaults(kind) }
    }

    pub fn kind(&self) -> StageKind {
        self.kind.kind()
    }

    /// Every stage index this stage points back at.
    pub fn references(&self) -> Vec<usize> {
        let mut refs = Vec::new();
        if let Some(input) = self.kind.input_stage() {
            refs.push(input);
        }
        if let Some(src) = self.kind.source().and_then(AudioSource::stage) {
            refs.push(src);
        }
        refs
    }

    pub fn to_wire(&self) -> PipelineStageWire {
        let common = &self.common;
        let mut wire = PipelineStageWire {
            r#type: self.kind(),
            input_stage: self.kind.input_stage(),
            caption: common.caption.clone(),
            lyrics: common.lyrics.clone(),
            model: common.model.clone(),
            steps: common.steps,
            shift: common.shift,
            denoise: common.denoise,
            seed: common.seed,
            infer_method: common.infer_method,
            scheduler: common.scheduler.clone(),
            guidance_scale: common.guidance_scale,
            use_adg: common.use_adg,
            cfg_interval_start: common.cfg_interval_start,
            cfg_interval_end: common.cfg_interval_end,
            timesteps: common.timesteps.clone(),
            checkpoint_step: common.checkpoint_step,
            preview: common.preview,
            ..PipelineStageWire::default()
        };
        if let Some(source) = self.kind.source() {
            wire.src_audio_id = source.upload_id().map(str::to_string);
            wire.src_stage = source.stage();
        }
        match &self.kind {
            StageKindConfig::Cover { cover_strength, audio_code_hints, .. } => {
                wire.audio_cover_strength = *cover_strength;
                wire.audio_code_hints = audio_code_hints.clone();
            }
            StageKindConfig::Repaint { window, .. } => {
                wire.repainting_start = Some(window.start);
                wire.repainting_end = Some(window.end);
            }
            StageKindConfig::Extract { track_name, .. }
            | StageKindConfig::Lego { track_name, .. } => {
                wire.track_name = Some(track_name.clone());
            }
            StageKindConfig::Complete { track_classes, .. } => {
                wire.complete_track_classes = Some(track_classes.iter().cloned().collect());
            }
            StageKindConfig::Generate | StageKindConfig::Refine { .. } => {}
        }
        wire
    }

    /// Decodes a wire stage. `index` is only used for error reporting;
    /// reference ranges are checked by the graph.
    pub fn from_wire(index: usize, wire: PipelineStageWire) -> Result<Self, GraphError> {
        let source = match (wire.src_audio_id.filter(|id| !id.is_empty()), wire.src_stage) {
            (Some(_), Some(_)) => return Err(GraphError::ConflictingAudioSource { index }),
            (Some(id), None) => AudioSource::Upload(id),
            (None, Some(stage)) => AudioSource::Stage(stage),
            (None, None) => AudioSource::Unset,
        };
        if source.is_set() && !wire.r#type.needs_audio_source() {
            return Err(GraphError::NoAudioSource { index, kind: wire.r#type });
        }

        let kind = match wire.r#type {
            StageKind::Generate => StageKindConfig::Generate,
            StageKind::Refine => StageKindConfig::Refine { input_stage: wire.input_stage },
            StageKind::Cover => StageKindConfig::Cover {
                source,
                cover_strength: wire.audio_cover_strength,
                audio_code_hints: wire.audio_code_hints,
            },
            StageKind::Repaint => {
                let defaults = RepaintWindow::default();
                StageKindConfig::Repaint {
                    source,
                    window: RepaintWindow {
                        start: wire.repainting_start.unwrap_or(defaults.start),
                        end: wire.repainting_end.unwrap_or(defaults.end),
                    },
                }
            }
            StageKind::Extract => StageKindConfig::Extract {
                source,
                track_name: wire.track_name.unwrap_or_else(|| DEFAULT_TRACK_NAME.into()),
            },
            StageKind::Lego => StageKindConfig::Lego {
                source,
                track_name: wire.track_name.unwrap_or_else(|| DEFAULT_TRACK_NAME.into()),
            },
            StageKind::Complete => StageKindConfig::Complete {
                source,
                track_classes: wire
                    .complete_track_classes
                    .map(|classes| classes.into_iter().collect())
                    .unwrap_or_else(|| BTreeSet::from([DEFAULT_COMPLETE_CLASS.to_string()])),
            },
        };

        let common = CommonParams {
            steps: wire.steps,
            shift: wire.shift,
            seed: wire.seed,
            infer_method: wire.infer_method,
            guidance_scale: wire.guidance_scale,
            denoise: wire.denoise,
            timesteps: wire.timesteps,
            checkpoint_step: wire.checkpoint_step,
            caption: wire.caption,
            lyrics: wire.lyrics,
            preview: wire.preview,
            model: wire.model,
            scheduler: wire.scheduler,
            use_adg: wire.use_adg,
            cfg_interval_start: wire.cfg_interval_start,
            cfg_interval_end: wire.cfg_interval_end,
        };
        Ok(Self { common, kind })
    }
}

/// Conditioning every stage falls back to when it has no override.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct SharedConditioning {
    pub caption: String,
    pub lyrics: String,
    pub instrumental: bool,
    pub vocal_language: String,
    pub bpm: Option<u32>,
    pub keyscale: String,
    pub timesignature: String,
    /// Seconds; negative lets the service decide.
    pub duration: f64,
    pub batch_size: u32,
    pub audio_format: String,
    pub thinking: bool,
}

impl Default for SharedConditioning {
    fn default() -> Self {
        Self {
            caption: String::new(),
            lyrics: String::new(),
            instrumental: false,
            vocal_language: "unknown".into(),
            bpm: None,
            keyscale: String::new(),
            timesignature: String::new(),
            duration: -1.0,
            batch_size: 1,
            audio_format: "flac".into(),
            thinking: false,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn source_kinds_match_service_table() {
        let with_source: Vec<_> =
            StageKind::ALL.iter().filter(|kind| kind.needs_audio_source()).collect();
        assert_eq!(with_source.len(), 5);
        assert!(!StageKind::Generate.needs_audio_source());
        assert!(!StageKind::Refine.needs_audio_source());
        for kind in StageKind::ALL {
            let stage = StageConfig::new(kind);
            assert_eq!(stage.kind(), kind);
            assert_eq!(stage.kind.source().is_some(), kind.needs_audio_source());
        }
    }

    #[test]
    fn wire_round_trip_keeps_stage_fields() {
        let mut stage = StageConfig::new(StageKind::Complete);
        stage.common.seed = 7;
        stage.common.preview = true;
        stage.common.model = Some("acestep-v15-base".into());
        if let StageKindConfig::Complete { source, track_classes } = &mut stage.kind {
            *source = AudioSource::Stage(0);
            track_classes.insert("drums".into());
        }
        let decoded = StageConfig::from_wire(1, stage.to_wire()).unwrap();
        assert_eq!(decoded, stage);
    }

    #[test]
    fn from_wire_rejects_both_sources() {
        let wire = PipelineStageWire {
            r#type: StageKind::Cover,
            src_audio_id: Some("abc".into()),
            src_stage: Some(0),
            ..PipelineStageWire::default()
        };
        assert_eq!(
            StageConfig::from_wire(1, wire),
            Err(GraphError::ConflictingAudioSource { index: 1 })
        );
    }

    #[test]
    fn from_wire_rejects_source_on_generate() {
        let wire = PipelineStageWire {
            r#type: StageKind::Generate,
            src_stage: Some(0),
            ..PipelineStageWire::default()
        };
        assert_eq!(
            StageConfig::from_wire(2, wire),
            Err(GraphError::NoAudioSource { index: 2, kind: StageKind::Generate })
        );
    }

    #[test]
    fn repaint_defaults_to_unbounded_end() {
        let stage = StageConfig::new(StageKind::Repaint);
        match stage.kind {
            StageKindConfig::Repaint { window, .. } => assert!(window.is_unbounded()),
            other => panic!("unexpected kind {other:?}"),
        }
    }
}
