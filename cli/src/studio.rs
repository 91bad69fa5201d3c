//! Session context: the stage graph, the flat form, result history and the
//! task currently being tracked.

use anyhow::{anyhow, bail, Context, Result};
use std::sync::Arc;
use tracing::info;

use crate::api::{AnalysisApi, DispatchApi};
use crate::channel::{TaskChannel, TaskEvent, TaskHandle, TerminalOutcome};
use crate::convert::{flat_to_stage, result_params_to_flat};
use crate::graph::{PipelineGraph, StagePatch};
use crate::results::{format_score, AudioResult, RecordOutcome, ResultAggregator};
use crate::stage::DEFAULT_STEPS;
use crate::types::{AnalysisRequest, FlatConfig, RecordedParams};

#[derive(Debug, Clone, PartialEq)]
pub enum StudioOutcome {
    /// The task completed and its result went through the aggregator.
    Finished(RecordOutcome),
    TaskFailed { reason: String, detail: Option<String> },
    /// Tracking ended without a terminal outcome.
    Stopped,
}

pub struct Studio {
    graph: PipelineGraph,
    flat: FlatConfig,
    results: ResultAggregator,
    channel: TaskChannel,
    dispatch: Arc<dyn DispatchApi>,
    analysis: Arc<dyn AnalysisApi>,
    active: Option<TaskHandle>,
}

impl Studio {
    pub fn new(
        channel: TaskChannel,
        dispatch: Arc<dyn DispatchApi>,
        analysis: Arc<dyn AnalysisApi>,
    ) -> Self {
        Self {
            graph: PipelineGraph::new(),
            flat: FlatConfig::default(),
            results: ResultAggregator::new(),
            channel,
            dispatch,
            analysis,
            active: None,
        }
    }

    pub fn graph(&self) -> &PipelineGraph {
        &self.graph
    }

    pub fn graph_mut(&mut self) -> &mut PipelineGraph {
        &mut self.graph
    }

    pub fn flat(&self) -> &FlatConfig {
        &self.flat
    }

    pub fn set_flat(&mut self, flat: FlatConfig) {
        self.flat = flat;
    }

    pub fn results(&self) -> &ResultAggregator {
        &self.results
    }

    pub fn results_mut(&mut self) -> &mut ResultAggregator {
        &mut self.results
    }

    pub fn active_task_id(&self) -> Option<&str> {
        self.active.as_ref().map(TaskHandle::task_id)
    }

    pub async fn dispatch_flat(&mut self) -> Result<String> {
        let task_id = self
            .dispatch
            .start_generation(&self.flat)
            .await
            .context("failed to start generation")?;
        info!("dispatched {} task {task_id}", self.flat.task_type);
        self.track(&task_id);
        Ok(task_id)
    }

    pub async fn dispatch_pipeline(&mut self) -> Result<String> {
        let request = self.graph.to_request().context("pipeline is not ready to dispatch")?;
        let task_id = self
            .dispatch
            .start_pipeline(&request)
            .await
            .context("failed to start pipeline")?;
        info!("dispatched {}-stage pipeline task {task_id}", request.stages.len());
        self.track(&task_id);
        Ok(task_id)
    }

    /// Starts tracking `task_id`, abandoning whatever was tracked before.
    pub fn track(&mut self, task_id: &str) {
        if let Some(previous) = self.active.replace(self.channel.track(task_id)) {
            previous.stop();
        }
    }

    pub fn stop_tracking(&mut self) {
        if let Some(handle) = self.active.take() {
            info!("stopped tracking task {}", handle.task_id());
            handle.stop();
        }
    }

    /// Pumps the active task until it resolves, passing every event to
    /// `on_event` first.
    pub async fn drive_active<F>(&mut self, mut on_event: F) -> Result<StudioOutcome>
    where
        F: FnMut(&TaskEvent),
    {
        let Some(handle) = self.active.as_mut() else {
            bail!("no task is being tracked");
        };
        let task_id = handle.task_id().to_string();
        let mut terminal = None;
        while let Some(event) = handle.next_event().await {
            on_event(&event);
            if let TaskEvent::Terminal(outcome) = event {
                terminal = Some(outcome);
                break;
            }
        }
        self.active = None;

        let outcome = match terminal {
            Some(TerminalOutcome::Completed(result)) => {
                StudioOutcome::Finished(self.results.record_completion(&task_id, result.as_ref()))
            }
            Some(TerminalOutcome::Error { reason, detail }) => {
                StudioOutcome::TaskFailed { reason, detail }
            }
            None => StudioOutcome::Stopped,
        };
        Ok(outcome)
    }

    /// Loads a result's recorded parameters into the flat form.
    pub fn restore_to_flat(&mut self, batch: usize, sample: usize) -> Result<()> {
        let params = self.recorded_params(batch, sample)?;
        self.flat = result_params_to_flat(params);
        Ok(())
    }

    /// Replaces a stage with a result's recorded parameters. Fields the
    /// service does not record (model, scheduler, preview) keep their current
    /// values.
    pub fn restore_to_stage(&mut self, stage: usize, batch: usize, sample: usize) -> Result<()> {
        let current = self
            .graph
            .stage(stage)
            .ok_or_else(|| anyhow!("stage {stage} does not exist"))?
            .common
            .clone();
        let recorded = self.recorded_params(batch, sample)?;
        let mut restored = flat_to_stage(&result_params_to_flat(recorded));
        restored.common.model = current.model;
        restored.common.scheduler = current.scheduler;
        restored.common.preview = current.preview;
        self.graph.set_stage(stage, restored)?;
        Ok(())
    }

    /// Points a stage's audio source at a previously rendered result.
    pub fn use_result_as_source(
        &mut self,
        stage: usize,
        batch: usize,
        sample: usize,
    ) -> Result<()> {
        let audio_id = self.audio(batch, sample)?.id.clone();
        self.graph.update_stage(stage, StagePatch::upload(audio_id))?;
        Ok(())
    }

    pub async fn recompute_score(&mut self, batch: usize, sample: usize) -> Result<String> {
        let (task_id, request) = self.analysis_request(batch, sample)?;
        let response = self.analysis.score(&request).await.context("score request failed")?;
        if !response.success {
            bail!("scoring failed: {}", response.error.unwrap_or_else(|| "unknown error".into()));
        }
        let score = format_score(response.lm_score, response.dit_score);
        self.results.set_score(&task_id, sample, score.clone());
        Ok(score)
    }

    pub async fn recompute_lyrics_timing(&mut self, batch: usize, sample: usize) -> Result<String> {
        let (task_id, request) = self.analysis_request(batch, sample)?;
        let response =
            self.analysis.lyrics_timing(&request).await.context("lyrics timing request failed")?;
        if !response.success {
            bail!(
                "lyrics timing failed: {}",
                response.error.unwrap_or_else(|| "unknown error".into())
            );
        }
        self.results.set_lyrics_timing(&task_id, sample, response.lrc_text.clone());
        Ok(response.lrc_text)
    }

    fn audio(&self, batch: usize, sample: usize) -> Result<&AudioResult> {
        let found =
            self.results.batch(batch).ok_or_else(|| anyhow!("batch {batch} does not exist"))?;
        found
            .audios
            .get(sample)
            .ok_or_else(|| anyhow!("batch {batch} has no sample {sample}"))
    }

    /// Pipeline stage outputs only carry their stage index, so there is
    /// nothing to restore from them.
    fn recorded_params(&self, batch: usize, sample: usize) -> Result<&RecordedParams> {
        let audio = self.audio(batch, sample)?;
        if audio.stage.is_some() {
            bail!("batch {batch} came from a pipeline and has no recorded parameters to restore");
        }
        Ok(&audio.render_params)
    }

    fn analysis_request(&self, batch: usize, sample: usize) -> Result<(String, AnalysisRequest)> {
        let params = &self.audio(batch, sample)?.render_params;
        let task_id = self
            .results
            .batch(batch)
            .map(|found| found.task_id.clone())
            .ok_or_else(|| anyhow!("batch {batch} does not exist"))?;
        let request = AnalysisRequest {
            task_id: task_id.clone(),
            sample_index: sample,
            vocal_language: params
                .vocal_language
                .clone()
                .unwrap_or_else(|| self.graph.shared().vocal_language.clone()),
            inference_steps: params.inference_steps.unwrap_or(DEFAULT_STEPS),
            seed: params.seed.unwrap_or(-1),
            total_duration_seconds: params.duration.filter(|duration| *duration > 0.0),
        };
        Ok((task_id, request))
    }
}
