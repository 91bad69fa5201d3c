use chrono::{DateTime, Utc};
use indexmap::IndexMap;
use std::collections::{BTreeMap, HashMap};
use tracing::{debug, info};

use crate::types::{LmMetadata, PipelineResult, RecordedParams, RemoteResult, SingleResult};

const TOTAL_TIME_KEYS: &[&str] = &["total", "total_time_cost"];

/// Intermediate latent captured partway through the schedule.
#[derive(Debug, Clone, PartialEq)]
pub struct CheckpointLatent {
    pub latent_id: String,
    pub step: Option<u32>,
}

/// Where a pipeline output came from.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct StageTag {
    pub index: usize,
    pub batch: usize,
    pub is_final: bool,
    pub is_preview: bool,
}

#[derive(Debug, Clone, PartialEq)]
pub struct AudioResult {
    pub id: String,
    pub key: String,
    pub sample_rate: Option<u32>,
    pub render_params: RecordedParams,
    pub codes: Option<String>,
    pub latent_id: Option<String>,
    pub checkpoint: Option<CheckpointLatent>,
    pub stage: Option<StageTag>,
}

#[derive(Debug, Clone, PartialEq, Default)]
pub struct BatchExtra {
    pub time_costs: BTreeMap<String, f64>,
    pub lm_metadata: Option<LmMetadata>,
    pub final_stage: Option<usize>,
}

impl BatchExtra {
    pub fn total_time(&self) -> Option<f64> {
        if self.time_costs.is_empty() {
            return None;
        }
        TOTAL_TIME_KEYS
            .iter()
            .find_map(|key| self.time_costs.get(*key).copied())
            .or_else(|| Some(self.time_costs.values().sum()))
    }
}

/// Output of one completed task. Never modified after it is recorded.
#[derive(Debug, Clone, PartialEq)]
pub struct Batch {
    pub index: usize,
    pub task_id: String,
    pub audios: Vec<AudioResult>,
    pub source_params: Option<RecordedParams>,
    pub extra: Option<BatchExtra>,
    pub recorded_at: DateTime<Utc>,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum RecordOutcome {
    Recorded { index: usize },
    /// The task already has a batch; nothing was appended.
    Duplicate { index: usize },
    Failed { message: String },
}

/// Per-item analysis text computed after the batch was recorded.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct DerivedState {
    pub score: Option<String>,
    pub lyrics_timing: Option<String>,
}

/// Ordered history of batches, one per task, with a current selection.
#[derive(Debug, Default)]
pub struct ResultAggregator {
    batches: IndexMap<String, Batch>,
    current: Option<usize>,
    derived: HashMap<String, DerivedState>,
}

impl ResultAggregator {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn record_completion(
        &mut self,
        task_id: &str,
        result: Option<&RemoteResult>,
    ) -> RecordOutcome {
        if let Some(index) = self.batches.get_index_of(task_id) {
            debug!("task {task_id} already recorded as batch {index}");
            return RecordOutcome::Duplicate { index };
        }
        let Some(result) = result else {
            return RecordOutcome::Failed { message: "task completed without a result".into() };
        };
        if let Some(message) = result.failure_message() {
            return RecordOutcome::Failed { message };
        }

        let (audios, source_params, extra) = match result {
            RemoteResult::Pipeline(pipeline) => pipeline_audios(pipeline),
            RemoteResult::Single(single) => single_audios(single),
        };
        if audios.is_empty() {
            return RecordOutcome::Failed { message: "no audio was produced".into() };
        }

        let index = self.batches.len();
        let batch = Batch {
            index,
            task_id: task_id.to_string(),
            audios,
            source_params,
            extra: Some(extra),
            recorded_at: Utc::now(),
        };
        info!("task {task_id} recorded as batch {index} ({} audios)", batch.audios.len());
        self.batches.insert(task_id.to_string(), batch);
        self.current = Some(index);
        RecordOutcome::Recorded { index }
    }

    pub fn len(&self) -> usize {
        self.batches.len()
    }

    pub fn is_empty(&self) -> bool {
        self.batches.is_empty()
    }

    pub fn current_index(&self) -> Option<usize> {
        self.current
    }

    pub fn current(&self) -> Option<&Batch> {
        self.current.and_then(|index| self.batch(index))
    }

    pub fn batch(&self, index: usize) -> Option<&Batch> {
        self.batches.get_index(index).map(|(_, batch)| batch)
    }

    pub fn batch_for_task(&self, task_id: &str) -> Option<&Batch> {
        self.batches.get(task_id)
    }

    pub fn batches(&self) -> impl Iterator<Item = &Batch> {
        self.batches.values()
    }

    /// Returns false and keeps the selection when `index` is out of range.
    pub fn select(&mut self, index: usize) -> bool {
        if index >= self.batches.len() {
            return false;
        }
        self.current = Some(index);
        true
    }

    pub fn select_next(&mut self) {
        if self.batches.is_empty() {
            self.current = None;
            return;
        }
        let last = self.batches.len() - 1;
        self.current = Some(self.current.map(|index| (index + 1).min(last)).unwrap_or(last));
    }

    pub fn select_previous(&mut self) {
        if self.batches.is_empty() {
            self.current = None;
            return;
        }
        self.current = Some(self.current.map(|index| index.saturating_sub(1)).unwrap_or(0));
    }

    pub fn set_score(&mut self, task_id: &str, sample_index: usize, score: String) {
        self.derived.entry(derived_key(task_id, sample_index)).or_default().score = Some(score);
    }

    pub fn set_lyrics_timing(&mut self, task_id: &str, sample_index: usize, lyrics: String) {
        self.derived.entry(derived_key(task_id, sample_index)).or_default().lyrics_timing =
            Some(lyrics);
    }

    pub fn derived(&self, task_id: &str, sample_index: usize) -> Option<&DerivedState> {
        self.derived.get(&derived_key(task_id, sample_index))
    }
}

fn derived_key(task_id: &str, sample_index: usize) -> String {
    format!("{task_id}-{sample_index}")
}

pub fn format_score(lm_score: f64, dit_score: f64) -> String {
    format!("LM {lm_score:.3} / DiT {dit_score:.3}")
}

fn pipeline_audios(
    pipeline: &PipelineResult,
) -> (Vec<AudioResult>, Option<RecordedParams>, BatchExtra) {
    let audios = pipeline
        .stages
        .iter()
        .map(|output| AudioResult {
            id: output.audio_id.clone(),
            key: output.audio_id.clone(),
            sample_rate: None,
            render_params: RecordedParams {
                stage_index: Some(output.stage),
                ..RecordedParams::default()
            },
            codes: None,
            latent_id: None,
            checkpoint: None,
            stage: Some(StageTag {
                index: output.stage,
                batch: output.batch,
                is_final: output.is_final,
                is_preview: output.is_preview,
            }),
        })
        .collect();
    let extra = BatchExtra {
        time_costs: pipeline.time_costs.clone(),
        lm_metadata: None,
        final_stage: pipeline.final_stage,
    };
    (audios, None, extra)
}

fn single_audios(single: &SingleResult) -> (Vec<AudioResult>, Option<RecordedParams>, BatchExtra) {
    let audios: Vec<AudioResult> = single
        .audios
        .iter()
        .map(|audio| AudioResult {
            id: audio.id.clone(),
            key: audio.key.clone(),
            sample_rate: audio.sample_rate,
            render_params: audio.params.clone(),
            codes: Some(audio.codes.clone()).filter(|codes| !codes.is_empty()),
            latent_id: audio.latent_id.clone(),
            checkpoint: audio.checkpoint_latent_id.clone().map(|latent_id| CheckpointLatent {
                latent_id,
                step: audio.checkpoint_step,
            }),
            stage: None,
        })
        .collect();
    let source_params = audios.first().map(|audio| audio.render_params.clone());
    let extra = single
        .extra
        .as_ref()
        .map(|extra| BatchExtra {
            time_costs: extra.time_costs.clone(),
            lm_metadata: extra.lm_metadata.clone(),
            final_stage: None,
        })
        .unwrap_or_default();
    (audios, source_params, extra)
}

/// One-line description of a batch for terminal output.
pub fn batch_summary(batch: &Batch) -> String {
    let mut parts: Vec<String> = Vec::new();

    let count = batch.audios.len();
    parts.push(format!("{count} audio{}", if count == 1 { "" } else { "s" }));

    let extra = batch.extra.as_ref();
    if let Some(stage) = extra.and_then(|extra| extra.final_stage) {
        parts.push(format!("final stage {stage}"));
    }
    let previews = batch.audios.iter().filter(|audio| audio.stage.is_some_and(|s| s.is_preview));
    let previews = previews.count();
    if previews > 0 {
        parts.push(format!("{previews} preview"));
    }

    let latents = batch.audios.iter().filter(|audio| audio.latent_id.is_some()).count();
    let checkpoints = batch.audios.iter().filter(|audio| audio.checkpoint.is_some()).count();
    if latents > 0 || checkpoints > 0 {
        parts.push(format!("latents {latents} (+{checkpoints} checkpoint)"));
    }

    if let Some(bpm) = extra.and_then(|extra| extra.lm_metadata.as_ref()).and_then(|lm| lm.bpm) {
        parts.push(format!("{bpm} bpm"));
    }
    if let Some(total) = extra.and_then(BatchExtra::total_time) {
        parts.push(format!("{total:.1}s"));
    }

    format!("Batch {} for task {} ({})", batch.index + 1, batch.task_id, parts.join(", "))
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn pipeline(stages: serde_json::Value) -> RemoteResult {
        serde_json::from_value(json!({
            "stages": stages,
            "final_stage": 1,
            "time_costs": {"stage_0": 2.0, "stage_1": 3.5},
            "success": true
        }))
        .unwrap()
    }

    fn single(audios: serde_json::Value) -> RemoteResult {
        serde_json::from_value(json!({
            "audios": audios,
            "status_message": "done",
            "success": true,
            "extra": {
                "time_costs": {"total_time_cost": 9.25, "lm_time": 1.0},
                "lm_metadata": {"bpm": 96, "keyscale": "D minor", "thinking_text": "slow groove"}
            }
        }))
        .unwrap()
    }

    fn two_stage_pipeline() -> RemoteResult {
        pipeline(json!([
            {"stage": 0, "batch": 0, "audio_id": "a0", "is_final": false, "is_preview": true},
            {"stage": 1, "batch": 0, "audio_id": "a1", "is_final": true, "is_preview": false}
        ]))
    }

    #[test]
    fn pipeline_result_becomes_tagged_batch() {
        let mut results = ResultAggregator::new();
        let outcome = results.record_completion("t1", Some(&two_stage_pipeline()));
        assert_eq!(outcome, RecordOutcome::Recorded { index: 0 });

        let batch = results.current().unwrap();
        assert_eq!(batch.audios.len(), 2);
        let last = &batch.audios[1];
        assert_eq!(last.id, "a1");
        assert_eq!(last.render_params.stage_index, Some(1));
        assert_eq!(
            last.stage,
            Some(StageTag { index: 1, batch: 0, is_final: true, is_preview: false })
        );
        let extra = batch.extra.as_ref().unwrap();
        assert_eq!(extra.final_stage, Some(1));
        assert_eq!(extra.total_time(), Some(5.5));
    }

    #[test]
    fn single_result_keeps_latents_and_metadata() {
        let result = single(json!([
            {
                "id": "f0", "key": "k0", "sample_rate": 48000,
                "params": {"seed": 7, "caption": "warm synths"},
                "codes": "<|code_3|>",
                "latent_id": "lat-0",
                "checkpoint_latent_id": "ck-0",
                "checkpoint_step": 20
            },
            {"id": "f1", "key": "k1", "params": {"seed": 8}}
        ]));
        let mut results = ResultAggregator::new();
        assert_eq!(
            results.record_completion("t9", Some(&result)),
            RecordOutcome::Recorded { index: 0 }
        );

        let batch = results.batch_for_task("t9").unwrap();
        let first = &batch.audios[0];
        assert_eq!(first.latent_id.as_deref(), Some("lat-0"));
        assert_eq!(
            first.checkpoint,
            Some(CheckpointLatent { latent_id: "ck-0".into(), step: Some(20) })
        );
        assert_eq!(first.codes.as_deref(), Some("<|code_3|>"));
        assert_eq!(batch.audios[1].codes, None);
        assert_eq!(batch.source_params.as_ref().and_then(|p| p.seed), Some(7));

        let extra = batch.extra.as_ref().unwrap();
        let lm = extra.lm_metadata.as_ref().unwrap();
        assert_eq!(lm.thinking_text.as_deref(), Some("slow groove"));
        assert_eq!(extra.total_time(), Some(9.25));
    }

    #[test]
    fn duplicate_completion_is_not_appended() {
        let mut results = ResultAggregator::new();
        let result = two_stage_pipeline();
        results.record_completion("t1", Some(&result));
        assert_eq!(
            results.record_completion("t1", Some(&result)),
            RecordOutcome::Duplicate { index: 0 }
        );
        assert_eq!(results.len(), 1);
    }

    #[test]
    fn failures_append_nothing() {
        let mut results = ResultAggregator::new();
        assert!(matches!(results.record_completion("t1", None), RecordOutcome::Failed { .. }));

        let failed: RemoteResult = serde_json::from_value(json!({
            "audios": [], "status_message": "", "success": false, "error": "out of memory"
        }))
        .unwrap();
        assert_eq!(
            results.record_completion("t2", Some(&failed)),
            RecordOutcome::Failed { message: "out of memory".into() }
        );

        let empty = single(json!([]));
        assert!(matches!(
            results.record_completion("t3", Some(&empty)),
            RecordOutcome::Failed { .. }
        ));
        assert!(results.is_empty());
        assert_eq!(results.current_index(), None);
    }

    #[test]
    fn navigation_clamps_at_both_ends() {
        let mut results = ResultAggregator::new();
        for task in ["t1", "t2", "t3"] {
            results.record_completion(task, Some(&two_stage_pipeline()));
        }
        assert_eq!(results.current_index(), Some(2));

        results.select_next();
        assert_eq!(results.current_index(), Some(2));
        results.select_previous();
        results.select_previous();
        results.select_previous();
        assert_eq!(results.current_index(), Some(0));

        assert!(!results.select(3));
        assert_eq!(results.current_index(), Some(0));
        assert!(results.select(1));
        assert_eq!(results.current().map(|batch| batch.task_id.as_str()), Some("t2"));
    }

    #[test]
    fn derived_state_is_keyed_per_item() {
        let mut results = ResultAggregator::new();
        results.set_score("t1", 0, format_score(0.8123, 0.5));
        results.set_lyrics_timing("t1", 1, "[00:01.00]hello".into());
        results.set_score("t1", 0, format_score(0.9, 0.6));

        let first = results.derived("t1", 0).unwrap();
        assert_eq!(first.score.as_deref(), Some("LM 0.900 / DiT 0.600"));
        assert_eq!(first.lyrics_timing, None);
        assert_eq!(
            results.derived("t1", 1).and_then(|d| d.lyrics_timing.as_deref()),
            Some("[00:01.00]hello")
        );
        assert!(results.derived("t2", 0).is_none());
    }

    #[test]
    fn summary_mentions_stages_and_timing() {
        let mut results = ResultAggregator::new();
        results.record_completion("t1", Some(&two_stage_pipeline()));
        let summary = batch_summary(results.current().unwrap());
        assert!(summary.starts_with("Batch 1 for task t1"));
        assert!(summary.contains("2 audios"));
        assert!(summary.contains("final stage 1"));
        assert!(summary.contains("1 preview"));
        assert!(summary.contains("5.5s"));
    }
}
