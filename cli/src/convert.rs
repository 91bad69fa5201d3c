//! Mappings between the flat single-shot form, pipeline stages, and the
//! parameters the service recorded for a rendered result.
//!
//! All functions are total: missing input falls back to the declared
//! defaults of the target representation.

use crate::stage::{
    AudioSource, CommonParams, RepaintWindow, Sampler, SharedConditioning, StageConfig, StageKind,
    StageKindConfig, DEFAULT_COMPLETE_CLASS, DEFAULT_TRACK_NAME,
};
use crate::types::{FlatConfig, RecordedParams, TASK_TYPE_TEXT2MUSIC};
use std::collections::BTreeSet;

const TASK_TYPES: &[(&str, StageKind)] = &[
    (TASK_TYPE_TEXT2MUSIC, StageKind::Generate),
    ("cover", StageKind::Cover),
    ("repaint", StageKind::Repaint),
    ("extract", StageKind::Extract),
    ("lego", StageKind::Lego),
    ("complete", StageKind::Complete),
];

/// Stage kind for a flat task type. Unknown task types generate from text.
pub fn kind_for_task_type(task_type: &str) -> StageKind {
    let task_type = task_type.trim();
    TASK_TYPES
        .iter()
        .find(|(name, _)| name.eq_ignore_ascii_case(task_type))
        .map(|(_, kind)| *kind)
        .unwrap_or(StageKind::Generate)
}

/// Flat task type for a stage kind. Refine has no flat equivalent and maps
/// to plain text-to-music.
pub fn task_type_for_kind(kind: StageKind) -> &'static str {
    TASK_TYPES
        .iter()
        .find(|(_, candidate)| *candidate == kind)
        .map(|(name, _)| *name)
        .unwrap_or(TASK_TYPE_TEXT2MUSIC)
}

pub fn flat_to_stage(flat: &FlatConfig) -> StageConfig {
    let kind = kind_for_task_type(&flat.task_type);
    let common = CommonParams {
        steps: flat.inference_steps,
        shift: flat.shift,
        seed: flat.seed,
        infer_method: flat.infer_method,
        guidance_scale: flat.guidance_scale,
        denoise: flat.t_start,
        timesteps: flat.timesteps.clone(),
        checkpoint_step: flat.checkpoint_step,
        caption: non_empty(&flat.caption),
        lyrics: non_empty(&flat.lyrics),
        use_adg: flat.use_adg,
        cfg_interval_start: flat.cfg_interval_start,
        cfg_interval_end: flat.cfg_interval_end,
        ..CommonParams::default()
    };

    let source = flat
        .src_audio_id
        .as_deref()
        .and_then(non_empty)
        .map(AudioSource::Upload)
        .unwrap_or_default();
    let track_name = || {
        flat.track_name
            .as_deref()
            .and_then(non_empty)
            .unwrap_or_else(|| DEFAULT_TRACK_NAME.to_string())
    };

    let kind = match kind {
        StageKind::Generate | StageKind::Refine => StageKindConfig::defaults(kind),
        StageKind::Cover => StageKindConfig::Cover {
            source,
            cover_strength: flat.audio_cover_strength,
            audio_code_hints: non_empty(&flat.audio_codes),
        },
        StageKind::Repaint => StageKindConfig::Repaint {
            source,
            window: RepaintWindow { start: flat.repainting_start, end: flat.repainting_end },
        },
        StageKind::Extract => StageKindConfig::Extract { source, track_name: track_name() },
        StageKind::Lego => StageKindConfig::Lego { source, track_name: track_name() },
        StageKind::Complete => StageKindConfig::Complete {
            source,
            track_classes: track_classes(&flat.complete_track_classes),
        },
    };
    StageConfig { common, kind }
}

/// Caption and lyrics resolve stage override first, then `shared`, then
/// empty.
pub fn stage_to_flat(stage: &StageConfig, shared: Option<&SharedConditioning>) -> FlatConfig {
    let mut flat = FlatConfig::default();
    if let Some(shared) = shared {
        flat.instrumental = shared.instrumental;
        flat.vocal_language = shared.vocal_language.clone();
        flat.bpm = shared.bpm;
        flat.keyscale = shared.keyscale.clone();
        flat.timesignature = shared.timesignature.clone();
        flat.duration = shared.duration;
        flat.batch_size = shared.batch_size;
        flat.audio_format = shared.audio_format.clone();
        flat.thinking = shared.thinking;
    }

    let common = &stage.common;
    flat.caption = resolve_text(common.caption.as_deref(), shared.map(|s| s.caption.as_str()));
    flat.lyrics = resolve_text(common.lyrics.as_deref(), shared.map(|s| s.lyrics.as_str()));
    flat.task_type = task_type_for_kind(stage.kind()).to_string();
    flat.inference_steps = common.steps;
    flat.shift = common.shift;
    flat.seed = common.seed;
    flat.infer_method = common.infer_method;
    flat.guidance_scale = common.guidance_scale;
    flat.t_start = common.denoise;
    flat.timesteps = common.timesteps.clone();
    flat.checkpoint_step = common.checkpoint_step;
    flat.use_adg = common.use_adg;
    flat.cfg_interval_start = common.cfg_interval_start;
    flat.cfg_interval_end = common.cfg_interval_end;

    flat.src_audio_id = stage.kind.source().and_then(AudioSource::upload_id).map(str::to_string);
    match &stage.kind {
        StageKindConfig::Cover { cover_strength, audio_code_hints, .. } => {
            flat.audio_cover_strength = *cover_strength;
            flat.audio_codes = audio_code_hints.clone().unwrap_or_default();
        }
        StageKindConfig::Repaint { window, .. } => {
            flat.repainting_start = window.start;
            flat.repainting_end = window.end;
        }
        StageKindConfig::Extract { track_name, .. } | StageKindConfig::Lego { track_name, .. } => {
            flat.track_name = Some(track_name.clone());
        }
        StageKindConfig::Complete { track_classes, .. } => {
            flat.complete_track_classes = track_classes.iter().cloned().collect();
        }
        StageKindConfig::Generate | StageKindConfig::Refine { .. } => {}
    }
    flat
}

/// Editable form for a previously rendered result. Resume fields always come
/// back inert so restoring never re-activates a stale resume.
pub fn result_params_to_flat(params: &RecordedParams) -> FlatConfig {
    let defaults = FlatConfig::default();
    let task_type = params.task_type.as_deref().unwrap_or(TASK_TYPE_TEXT2MUSIC);
    FlatConfig {
        caption: params.caption.clone().unwrap_or_default(),
        lyrics: params.lyrics.clone().unwrap_or_default(),
        instrumental: params.instrumental.unwrap_or(defaults.instrumental),
        task_type: task_type_for_kind(kind_for_task_type(task_type)).to_string(),
        vocal_language: params
            .vocal_language
            .clone()
            .unwrap_or_else(|| defaults.vocal_language.clone()),
        bpm: params.bpm,
        keyscale: params.keyscale.clone().unwrap_or_default(),
        timesignature: params.timesignature.clone().unwrap_or_default(),
        duration: params.duration.unwrap_or(defaults.duration),
        audio_codes: params.audio_codes.clone().unwrap_or_default(),
        repainting_start: params.repainting_start.unwrap_or(defaults.repainting_start),
        repainting_end: params.repainting_end.unwrap_or(defaults.repainting_end),
        audio_cover_strength: params.audio_cover_strength.unwrap_or(defaults.audio_cover_strength),
        inference_steps: params.inference_steps.unwrap_or(defaults.inference_steps),
        guidance_scale: params.guidance_scale.unwrap_or(defaults.guidance_scale),
        seed: params.seed.unwrap_or(defaults.seed),
        use_adg: params.use_adg.unwrap_or(defaults.use_adg),
        cfg_interval_start: params.cfg_interval_start.unwrap_or(defaults.cfg_interval_start),
        cfg_interval_end: params.cfg_interval_end.unwrap_or(defaults.cfg_interval_end),
        shift: params.shift.unwrap_or(defaults.shift),
        infer_method: params.infer_method.as_deref().map(Sampler::parse).unwrap_or_default(),
        timesteps: params.timesteps.clone(),
        init_latent_id: None,
        t_start: 1.0,
        checkpoint_step: None,
        resume_sample_index: None,
        ..defaults
    }
}

fn resolve_text(stage_override: Option<&str>, shared: Option<&str>) -> String {
    stage_override
        .and_then(non_empty)
        .or_else(|| shared.and_then(non_empty))
        .unwrap_or_default()
}

fn track_classes(classes: &[String]) -> BTreeSet<String> {
    let set: BTreeSet<String> =
        classes.iter().filter_map(|class| non_empty(class)).collect();
    if set.is_empty() {
        BTreeSet::from([DEFAULT_COMPLETE_CLASS.to_string()])
    } else {
        set
    }
}

fn non_empty(value: &str) -> Option<String> {
    if value.trim().is_empty() {
        None
    } else {
        Some(value.to_string())
    }
}
