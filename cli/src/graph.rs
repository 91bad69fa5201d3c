//! The pipeline stage graph.
//!
//! Stages form a small DAG in which every reference (`input_stage` for
//! refine, `src_stage` for audio-consuming kinds) points at an earlier
//! index. Every mutation either applies completely or returns a
//! [`GraphError`] with the graph untouched.

use crate::error::GraphError;
use crate::stage::{
    AudioSource, AudioSourceMode, RepaintWindow, SharedConditioning, StageConfig, StageKind,
    StageKindConfig,
};
use crate::types::{PipelineRequest, PipelineStageWire};
use std::cmp::Ordering;
use std::collections::BTreeSet;
use tracing::debug;

/// Partial update for [`PipelineGraph::update_stage`]. `None` leaves a field
/// alone; nested options clear optional fields with `Some(None)`.
#[derive(Debug, Clone, Default)]
pub struct StagePatch {
    pub steps: Option<u32>,
    pub shift: Option<f32>,
    pub seed: Option<i64>,
    pub infer_method: Option<crate::stage::Sampler>,
    pub guidance_scale: Option<f32>,
    pub denoise: Option<f32>,
    pub timesteps: Option<Option<Vec<f32>>>,
    pub checkpoint_step: Option<Option<u32>>,
    pub caption: Option<Option<String>>,
    pub lyrics: Option<Option<String>>,
    pub preview: Option<bool>,
    pub model: Option<Option<String>>,
    pub scheduler: Option<Option<String>>,
    pub use_adg: Option<bool>,
    pub cfg_interval_start: Option<f32>,
    pub cfg_interval_end: Option<f32>,
    pub input_stage: Option<Option<usize>>,
    pub src_audio_id: Option<String>,
    pub src_stage: Option<usize>,
    pub cover_strength: Option<f32>,
    pub audio_code_hints: Option<Option<String>>,
    pub repaint_window: Option<RepaintWindow>,
    pub track_name: Option<String>,
    pub track_classes: Option<BTreeSet<String>>,
}

impl StagePatch {
    pub fn upload(asset_id: impl Into<String>) -> Self {
        Self { src_audio_id: Some(asset_id.into()), ..Self::default() }
    }

    pub fn source_stage(index: usize) -> Self {
        Self { src_stage: Some(index), ..Self::default() }
    }

    fn touches_source(&self) -> bool {
        self.src_audio_id.is_some() || self.src_stage.is_some()
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct PipelineGraph {
    shared: SharedConditioning,
    stages: Vec<StageConfig>,
}

impl Default for PipelineGraph {
    fn default() -> Self {
        Self::new()
    }
}

impl PipelineGraph {
    pub fn new() -> Self {
        Self {
            shared: SharedConditioning::default(),
            stages: vec![StageConfig::new(StageKind::Generate)],
        }
    }

    pub fn shared(&self) -> &SharedConditioning {
        &self.shared
    }

    pub fn set_shared(&mut self, shared: SharedConditioning) {
        self.shared = shared;
    }

    pub fn stages(&self) -> &[StageConfig] {
        &self.stages
    }

    pub fn stage(&self, index: usize) -> Option<&StageConfig> {
        self.stages.get(index)
    }

    pub fn len(&self) -> usize {
        self.stages.len()
    }

    /// Always false; kept for API symmetry with `len`.
    pub fn is_empty(&self) -> bool {
        self.stages.is_empty()
    }

    /// Appends a stage of `kind` with its declared defaults and returns its
    /// index. Refine chains to the previous stage; audio-consuming kinds take
    /// the previous stage's output as their source when one exists.
    pub fn add_stage(&mut self, kind: StageKind) -> usize {
        let index = self.stages.len();
        let mut stage = StageConfig::new(kind);
        wire_defaults(index, &mut stage.kind);
        self.stages.push(stage);
        debug!(index, %kind, "added stage");
        index
    }

    /// Removes a stage and repairs every reference that pointed at or past it.
    pub fn remove_stage(&mut self, index: usize) -> Result<(), GraphError> {
        self.check_index(index)?;
        if self.stages.len() == 1 {
            return Err(GraphError::LastStage);
        }
        self.stages.remove(index);
        for stage in &mut self.stages {
            match &mut stage.kind {
                StageKindConfig::Refine { input_stage } => {
                    *input_stage = input_stage.and_then(|r| repair_reference(r, index));
                }
                other => {
                    if let Some(source) = other.source_mut() {
                        if let AudioSource::Stage(r) = *source {
                            *source = repair_reference(r, index)
                                .map(AudioSource::Stage)
                                .unwrap_or(AudioSource::Unset);
                        }
                    }
                }
            }
        }
        debug!(index, remaining = self.stages.len(), "removed stage");
        Ok(())
    }

    /// Switches a stage to `kind`. Common parameters and an existing audio
    /// source are kept; all other kind-specific fields reset to defaults.
    pub fn change_stage_kind(&mut self, index: usize, kind: StageKind) -> Result<(), GraphError> {
        self.check_index(index)?;
        let stage = &mut self.stages[index];
        if stage.kind() == kind {
            return Ok(());
        }
        let previous_source = stage.kind.source().cloned();
        let mut next = StageKindConfig::defaults(kind);
        if let (Some(source), Some(slot)) = (previous_source, next.source_mut()) {
            *slot = source;
        }
        wire_defaults(index, &mut next);
        debug!(index, from = %stage.kind(), to = %kind, "changed stage kind");
        stage.kind = next;
        Ok(())
    }

    /// Shallow-merges `patch` into a stage. Cross-stage references are not
    /// re-validated here; setting one audio source field clears the other.
    pub fn update_stage(&mut self, index: usize, patch: StagePatch) -> Result<(), GraphError> {
        self.check_index(index)?;
        let stage = &mut self.stages[index];
        if patch.src_audio_id.is_some() && patch.src_stage.is_some() {
            return Err(GraphError::ConflictingAudioSource { index });
        }
        if patch.touches_source() && stage.kind.source().is_none() {
            return Err(GraphError::NoAudioSource { index, kind: stage.kind() });
        }

        let common = &mut stage.common;
        if let Some(steps) = patch.steps {
            common.steps = steps;
        }
        if let Some(shift) = patch.shift {
            common.shift = shift;
        }
        if let Some(seed) = patch.seed {
            common.seed = seed;
        }
        if let Some(method) = patch.infer_method {
            common.infer_method = method;
        }
        if let Some(scale) = patch.guidance_scale {
            common.guidance_scale = scale;
        }
        if let Some(denoise) = patch.denoise {
            common.denoise = denoise;
        }
        if let Some(timesteps) = patch.timesteps {
            common.timesteps = timesteps;
        }
        if let Some(step) = patch.checkpoint_step {
            common.checkpoint_step = step;
        }
        if let Some(caption) = patch.caption {
            common.caption = caption;
        }
        if let Some(lyrics) = patch.lyrics {
            common.lyrics = lyrics;
        }
        if let Some(preview) = patch.preview {
            common.preview = preview;
        }
        if let Some(model) = patch.model {
            common.model = model;
        }
        if let Some(scheduler) = patch.scheduler {
            common.scheduler = scheduler;
        }
        if let Some(use_adg) = patch.use_adg {
            common.use_adg = use_adg;
        }
        if let Some(start) = patch.cfg_interval_start {
            common.cfg_interval_start = start;
        }
        if let Some(end) = patch.cfg_interval_end {
            common.cfg_interval_end = end;
        }

        if let Some(source) = stage.kind.source_mut() {
            if let Some(id) = patch.src_audio_id {
                *source = AudioSource::Upload(id);
            } else if let Some(src) = patch.src_stage {
                *source = AudioSource::Stage(src);
            }
        }

        // Fields that do not belong to the stage's kind are ignored.
        match &mut stage.kind {
            StageKindConfig::Refine { input_stage } => {
                if let Some(input) = patch.input_stage {
                    *input_stage = input;
                }
            }
            StageKindConfig::Cover { cover_strength, audio_code_hints, .. } => {
                if let Some(strength) = patch.cover_strength {
                    *cover_strength = strength;
                }
                if let Some(hints) = patch.audio_code_hints {
                    *audio_code_hints = hints;
                }
            }
            StageKindConfig::Repaint { window, .. } => {
                if let Some(next) = patch.repaint_window {
                    *window = next;
                }
            }
            StageKindConfig::Extract { track_name, .. }
            | StageKindConfig::Lego { track_name, .. } => {
                if let Some(name) = patch.track_name {
                    *track_name = name;
                }
            }
            StageKindConfig::Complete { track_classes, .. } => {
                if let Some(classes) = patch.track_classes {
                    *track_classes = classes;
                }
            }
            StageKindConfig::Generate => {}
        }
        Ok(())
    }

    /// Replaces one stage wholesale. An unset refine input or audio source is
    /// wired to the previous stage the same way `add_stage` does.
    pub fn set_stage(&mut self, index: usize, mut stage: StageConfig) -> Result<(), GraphError> {
        self.check_index(index)?;
        wire_defaults(index, &mut stage.kind);
        check_references(index, &stage)?;
        debug!(index, kind = %stage.kind(), "replaced stage");
        self.stages[index] = stage;
        Ok(())
    }

    /// Toggles where a stage reads its audio from, clearing the other mode's
    /// field.
    pub fn set_audio_source_mode(
        &mut self,
        index: usize,
        mode: AudioSourceMode,
    ) -> Result<(), GraphError> {
        self.check_index(index)?;
        let stage = &mut self.stages[index];
        let kind = stage.kind();
        let Some(source) = stage.kind.source_mut() else {
            return Err(GraphError::NoAudioSource { index, kind });
        };
        *source = match (mode, &*source) {
            (AudioSourceMode::FromStage, AudioSource::Stage(src)) => AudioSource::Stage(*src),
            (AudioSourceMode::FromStage, _) => {
                index.checked_sub(1).map(AudioSource::Stage).unwrap_or(AudioSource::Unset)
            }
            (AudioSourceMode::Upload, AudioSource::Upload(id)) => AudioSource::Upload(id.clone()),
            (AudioSourceMode::Upload, _) => AudioSource::Unset,
        };
        Ok(())
    }

    /// Replaces the whole graph after checking that it is non-empty and that
    /// every reference points backwards.
    pub fn replace_all(
        &mut self,
        shared: SharedConditioning,
        stages: Vec<StageConfig>,
    ) -> Result<(), GraphError> {
        if stages.is_empty() {
            return Err(GraphError::Empty);
        }
        for (index, stage) in stages.iter().enumerate() {
            check_references(index, stage)?;
        }
        self.shared = shared;
        self.stages = stages;
        Ok(())
    }

    /// Decodes wire stages and replaces the graph. A refine stage without
    /// `input_stage` reads from the stage before it; audio sources are left
    /// as sent.
    pub fn replace_all_from_wire(
        &mut self,
        shared: SharedConditioning,
        stages: Vec<PipelineStageWire>,
    ) -> Result<(), GraphError> {
        let stages = stages
            .into_iter()
            .enumerate()
            .map(|(index, wire)| {
                let mut stage = StageConfig::from_wire(index, wire)?;
                default_refine_input(index, &mut stage.kind);
                Ok(stage)
            })
            .collect::<Result<Vec<_>, GraphError>>()?;
        self.replace_all(shared, stages)
    }

    /// Dispatch-time check: everything `replace_all` enforces plus the
    /// per-kind requirements the service rejects.
    pub fn validate(&self) -> Result<(), GraphError> {
        for (index, stage) in self.stages.iter().enumerate() {
            check_references(index, stage)?;
            let kind = stage.kind();
            if kind == StageKind::Refine && stage.kind.input_stage().is_none() {
                return Err(GraphError::MissingInputStage { index });
            }
            if let Some(source) = stage.kind.source() {
                if !source.is_set() {
                    return Err(GraphError::MissingAudioSource { index });
                }
            }
            if let Some(track) = stage.kind.track_name() {
                if track.trim().is_empty() {
                    return Err(GraphError::MissingTrackName { index });
                }
            }
            if kind.requires_base_model() {
                if let Some(model) = stage.common.model.as_deref() {
                    if model.contains("turbo") || model.contains("sft") {
                        return Err(GraphError::RequiresBaseModel {
                            index,
                            model: model.to_string(),
                        });
                    }
                }
            }
        }
        Ok(())
    }

    pub fn to_request(&self) -> Result<PipelineRequest, GraphError> {
        self.validate()?;
        Ok(PipelineRequest {
            shared: self.shared.clone(),
            stages: self.stages.iter().map(StageConfig::to_wire).collect(),
        })
    }

    fn check_index(&self, index: usize) -> Result<(), GraphError> {
        if index >= self.stages.len() {
            return Err(GraphError::OutOfRange { index, len: self.stages.len() });
        }
        Ok(())
    }
}

/// Default wiring for a stage at `index`: refine chains to the previous
/// stage, an unset audio source reads the previous stage's output.
fn wire_defaults(index: usize, kind: &mut StageKindConfig) {
    default_refine_input(index, kind);
    if let (Some(source), Some(prev)) = (kind.source_mut(), index.checked_sub(1)) {
        if !source.is_set() {
            *source = AudioSource::Stage(prev);
        }
    }
}

fn default_refine_input(index: usize, kind: &mut StageKindConfig) {
    if let StageKindConfig::Refine { input_stage } = kind {
        if input_stage.is_none() {
            *input_stage = index.checked_sub(1);
        }
    }
}

/// New value of a reference after stage `removed` is deleted. A reference
/// to the removed stage falls back to the one before it, or to nothing when
/// stage 0 was removed.
fn repair_reference(reference: usize, removed: usize) -> Option<usize> {
    match reference.cmp(&removed) {
        Ordering::Less => Some(reference),
        Ordering::Greater => Some(reference - 1),
        Ordering::Equal => removed.checked_sub(1),
    }
}

fn check_references(index: usize, stage: &StageConfig) -> Result<(), GraphError> {
    for reference in stage.references() {
        if reference >= index {
            return Err(GraphError::DanglingReference { index, reference });
        }
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    fn graph_of(kinds: &[StageKind]) -> PipelineGraph {
        let mut graph = PipelineGraph::new();
        for &kind in kinds {
            graph.add_stage(kind);
        }
        graph
    }

    fn assert_references_point_backwards(graph: &PipelineGraph) {
        for (index, stage) in graph.stages().iter().enumerate() {
            for reference in stage.references() {
                assert!(reference < index, "stage {index} references {reference}");
            }
        }
    }

    #[test]
    fn add_stage_wires_refine_and_sources_to_previous() {
        let graph = graph_of(&[StageKind::Refine, StageKind::Cover]);
        assert_eq!(graph.len(), 3);
        assert_eq!(graph.stage(1).unwrap().kind.input_stage(), Some(0));
        assert_eq!(graph.stage(2).unwrap().kind.source(), Some(&AudioSource::Stage(1)));
    }

    #[test]
    fn first_source_stage_starts_in_upload_mode() {
        let mut graph = PipelineGraph::new();
        graph.change_stage_kind(0, StageKind::Cover).unwrap();
        assert_eq!(graph.stage(0).unwrap().kind.source(), Some(&AudioSource::Unset));
        assert_eq!(graph.validate(), Err(GraphError::MissingAudioSource { index: 0 }));
    }

    #[test]
    fn removing_last_stage_is_rejected() {
        let mut graph = PipelineGraph::new();
        assert_eq!(graph.remove_stage(0), Err(GraphError::LastStage));
        assert_eq!(graph.len(), 1);
        assert_eq!(graph.remove_stage(3), Err(GraphError::OutOfRange { index: 3, len: 1 }));
    }

    #[test]
    fn removing_root_clears_refine_input() {
        let mut graph = graph_of(&[StageKind::Refine]);
        graph.remove_stage(0).unwrap();
        assert_eq!(graph.len(), 1);
        let remaining = graph.stage(0).unwrap();
        assert_eq!(remaining.kind(), StageKind::Refine);
        assert_eq!(remaining.kind.input_stage(), None);
        assert_eq!(graph.validate(), Err(GraphError::MissingInputStage { index: 0 }));
    }

    #[test]
    fn removing_middle_stage_repoints_and_shifts_references() {
        // 0 generate, 1 refine(0), 2 cover(src 1), 3 repaint(src 2), 4 refine(1)
        let mut graph = graph_of(&[StageKind::Refine, StageKind::Cover, StageKind::Repaint]);
        let index = graph.add_stage(StageKind::Refine);
        graph.update_stage(index, StagePatch { input_stage: Some(Some(1)), ..Default::default() })
            .unwrap();

        graph.remove_stage(1).unwrap();

        assert_eq!(graph.len(), 4);
        assert_eq!(graph.stage(1).unwrap().kind.source(), Some(&AudioSource::Stage(0)));
        assert_eq!(graph.stage(2).unwrap().kind.source(), Some(&AudioSource::Stage(1)));
        assert_eq!(graph.stage(3).unwrap().kind.input_stage(), Some(0));
        assert_references_point_backwards(&graph);
    }

    #[test]
    fn removing_source_root_falls_back_to_upload_mode() {
        let mut graph = graph_of(&[StageKind::Extract]);
        graph.remove_stage(0).unwrap();
        assert_eq!(graph.stage(0).unwrap().kind.source(), Some(&AudioSource::Unset));
    }

    #[test]
    fn removal_keeps_references_backwards_for_every_position() {
        let chain = [
            StageKind::Refine,
            StageKind::Cover,
            StageKind::Refine,
            StageKind::Repaint,
            StageKind::Complete,
            StageKind::Lego,
        ];
        for len in 1..=chain.len() {
            for removed in 0..=len {
                let mut graph = graph_of(&chain[..len]);
                graph.remove_stage(removed).unwrap();
                assert_eq!(graph.len(), len);
                assert_references_point_backwards(&graph);
            }
        }
    }

    #[test]
    fn kind_change_keeps_upload_source_and_takes_track_default() {
        let mut graph = graph_of(&[StageKind::Cover]);
        graph.update_stage(1, StagePatch::upload("asset-9")).unwrap();
        graph.update_stage(1, StagePatch { seed: Some(1234), ..Default::default() }).unwrap();

        graph.change_stage_kind(1, StageKind::Extract).unwrap();

        let stage = graph.stage(1).unwrap();
        assert_eq!(stage.kind(), StageKind::Extract);
        assert_eq!(stage.kind.source(), Some(&AudioSource::Upload("asset-9".into())));
        assert_eq!(stage.kind.track_name(), Some(crate::stage::DEFAULT_TRACK_NAME));
        assert_eq!(stage.common.seed, 1234);
    }

    #[test]
    fn kind_change_to_source_kind_wires_previous_stage() {
        let mut graph = graph_of(&[StageKind::Generate]);
        graph.change_stage_kind(1, StageKind::Repaint).unwrap();
        assert_eq!(graph.stage(1).unwrap().kind.source(), Some(&AudioSource::Stage(0)));

        graph.change_stage_kind(1, StageKind::Refine).unwrap();
        assert_eq!(graph.stage(1).unwrap().kind.input_stage(), Some(0));
        assert!(graph.stage(1).unwrap().kind.source().is_none());
    }

    #[test]
    fn audio_source_fields_stay_exclusive_across_updates() {
        let mut graph = graph_of(&[StageKind::Cover]);
        let steps: Vec<StagePatch> = vec![
            StagePatch::upload("a"),
            StagePatch::source_stage(0),
            StagePatch::upload("b"),
            StagePatch { steps: Some(30), ..Default::default() },
            StagePatch::source_stage(0),
        ];
        for patch in steps {
            graph.update_stage(1, patch).unwrap();
            let wire = graph.stage(1).unwrap().to_wire();
            assert!(!(wire.src_audio_id.is_some() && wire.src_stage.is_some()));
        }
        graph.set_audio_source_mode(1, AudioSourceMode::Upload).unwrap();
        let wire = graph.stage(1).unwrap().to_wire();
        assert_eq!((wire.src_audio_id, wire.src_stage), (None, None));

        graph.set_audio_source_mode(1, AudioSourceMode::FromStage).unwrap();
        assert_eq!(graph.stage(1).unwrap().kind.source(), Some(&AudioSource::Stage(0)));
    }

    #[test]
    fn conflicting_patch_is_rejected_without_changes() {
        let mut graph = graph_of(&[StageKind::Cover]);
        let before = graph.clone();
        let patch = StagePatch {
            seed: Some(5),
            src_audio_id: Some("x".into()),
            src_stage: Some(0),
            ..Default::default()
        };
        assert_eq!(
            graph.update_stage(1, patch),
            Err(GraphError::ConflictingAudioSource { index: 1 })
        );
        assert_eq!(graph, before);
        assert_eq!(
            graph.update_stage(0, StagePatch::upload("x")),
            Err(GraphError::NoAudioSource { index: 0, kind: StageKind::Generate })
        );
    }

    #[test]
    fn set_stage_wires_defaults_and_rejects_forward_sources() {
        let mut graph = graph_of(&[StageKind::Generate]);
        graph.set_stage(1, StageConfig::new(StageKind::Cover)).unwrap();
        assert_eq!(graph.stage(1).unwrap().kind.source(), Some(&AudioSource::Stage(0)));

        let mut forward = StageConfig::new(StageKind::Repaint);
        if let Some(source) = forward.kind.source_mut() {
            *source = AudioSource::Stage(1);
        }
        let before = graph.clone();
        assert_eq!(
            graph.set_stage(1, forward),
            Err(GraphError::DanglingReference { index: 1, reference: 1 })
        );
        assert_eq!(graph, before);
    }

    #[test]
    fn replace_all_rejects_forward_references() {
        let mut graph = PipelineGraph::new();
        let mut refine = StageConfig::new(StageKind::Refine);
        refine.kind = StageKindConfig::Refine { input_stage: Some(1) };
        let result = graph.replace_all(
            SharedConditioning::default(),
            vec![StageConfig::new(StageKind::Generate), refine],
        );
        assert_eq!(result, Err(GraphError::DanglingReference { index: 1, reference: 1 }));
        assert_eq!(graph.len(), 1);
        assert_eq!(
            graph.replace_all(SharedConditioning::default(), Vec::new()),
            Err(GraphError::Empty)
        );
    }

    #[test]
    fn wire_refine_without_input_reads_previous_stage() {
        let mut graph = PipelineGraph::new();
        let stages = vec![
            PipelineStageWire::default(),
            PipelineStageWire { r#type: StageKind::Refine, ..PipelineStageWire::default() },
            PipelineStageWire { r#type: StageKind::Cover, ..PipelineStageWire::default() },
        ];
        graph.replace_all_from_wire(SharedConditioning::default(), stages).unwrap();

        assert_eq!(graph.stage(1).unwrap().kind.input_stage(), Some(0));
        assert_eq!(graph.stage(2).unwrap().kind.source(), Some(&AudioSource::Unset));
        assert_eq!(graph.validate(), Err(GraphError::MissingAudioSource { index: 2 }));

        graph.update_stage(2, StagePatch::source_stage(1)).unwrap();
        assert_eq!(graph.validate(), Ok(()));
    }

    #[test]
    fn wire_refine_at_root_stays_unwired() {
        let mut graph = PipelineGraph::new();
        let stages =
            vec![PipelineStageWire { r#type: StageKind::Refine, ..PipelineStageWire::default() }];
        graph.replace_all_from_wire(SharedConditioning::default(), stages).unwrap();
        assert_eq!(graph.validate(), Err(GraphError::MissingInputStage { index: 0 }));
    }

    #[test]
    fn validate_enforces_model_and_track_rules() {
        let mut graph = graph_of(&[StageKind::Lego]);
        graph
            .update_stage(
                1,
                StagePatch { model: Some(Some("acestep-v15-turbo".into())), ..Default::default() },
            )
            .unwrap();
        assert!(matches!(graph.validate(), Err(GraphError::RequiresBaseModel { index: 1, .. })));

        graph.update_stage(1, StagePatch { model: Some(None), ..Default::default() }).unwrap();
        graph
            .update_stage(1, StagePatch { track_name: Some(" ".into()), ..Default::default() })
            .unwrap();
        assert_eq!(graph.validate(), Err(GraphError::MissingTrackName { index: 1 }));

        graph
            .update_stage(1, StagePatch { track_name: Some("bass".into()), ..Default::default() })
            .unwrap();
        let request = graph.to_request().unwrap();
        assert_eq!(request.stages.len(), 2);
        assert_eq!(request.stages[1].src_stage, Some(0));
        assert_eq!(request.stages[1].track_name.as_deref(), Some("bass"));
    }
}
