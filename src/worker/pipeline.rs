//! Resumable per-entry pipeline: fetch → extract → script → synthesize → publish.
//!
//! Every artifact is persisted as soon as its stage succeeds, so a later run
//! skips whatever is already on record.

use crate::budget::{BudgetGate, Usage};
use crate::database::{Database, Entry, NewEpisode};
use crate::error::AppError;
use crate::notify::Notifier;
use crate::stages::{parse_script, ScriptLine, SegmentStore, Stages};
use chrono::{Duration, Utc};
use rand::Rng;
use serde::Serialize;
use std::path::PathBuf;
use std::sync::Arc;

/// Where a run starts. Ordered: every stage at or after the resume point runs.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum ResumePoint {
    Fetch,
    Script,
    Synthesize,
    Publish,
}

/// Outcome of one `process_entry` call. Never an `Err`: failures are
/// recorded on the entry and reported here.
#[derive(Debug, Clone, Serialize)]
pub struct ProcessResult {
    pub entry_id: String,
    pub success: bool,
    pub episode_id: Option<String>,
    pub error: Option<String>,
}

#[derive(Debug, Clone)]
pub struct PipelineSettings {
    pub max_retries: u32,
    pub min_content_length: usize,
}

/// Earliest stage whose artifact is missing or unusable.
pub fn resume_point(entry: &Entry, segments: &SegmentStore) -> ResumePoint {
    let has_content = entry
        .extracted_content
        .as_deref()
        .map(|c| !c.trim().is_empty())
        .unwrap_or(false);
    if !has_content {
        return ResumePoint::Fetch;
    }

    let script_ok = match entry.transcript_json.as_deref() {
        Some(json) => {
            let parsed = parse_script(json).is_some();
            if !parsed {
                log::debug!("Stored script for {} is unusable, regenerating", entry.id);
            }
            parsed
        }
        None => false,
    };
    if !script_ok {
        return ResumePoint::Script;
    }

    match entry.expected_segment_count {
        Some(expected) if segments.is_complete(&entry.id, expected) => ResumePoint::Publish,
        _ => ResumePoint::Synthesize,
    }
}

/// `2^retry_count` minutes plus `jitter_ms`.
pub fn backoff_with_jitter(retry_count: u32, jitter_ms: i64) -> Duration {
    Duration::minutes(1i64 << retry_count.min(20)) + Duration::milliseconds(jitter_ms)
}

/// Backoff with a random jitter in `[0, 30s)`.
pub fn backoff_delay(retry_count: u32) -> Duration {
    let jitter_ms = rand::thread_rng().gen_range(0..30_000);
    backoff_with_jitter(retry_count, jitter_ms)
}

pub struct Pipeline {
    db: Arc<Database>,
    budget: Arc<dyn BudgetGate>,
    notifier: Arc<dyn Notifier>,
    stages: Stages,
    segments: SegmentStore,
    settings: PipelineSettings,
}

impl Pipeline {
    pub fn new(
        db: Arc<Database>,
        budget: Arc<dyn BudgetGate>,
        notifier: Arc<dyn Notifier>,
        stages: Stages,
        segments: SegmentStore,
        settings: PipelineSettings,
    ) -> Self {
        Self {
            db,
            budget,
            notifier,
            stages,
            segments,
            settings,
        }
    }

    /// Run every missing stage for `entry` and record the outcome.
    pub async fn process_entry(&self, entry: &Entry) -> ProcessResult {
        let start = std::time::Instant::now();
        log::info!("Processing entry {} ({})", entry.id, entry.url);

        match self.run_stages(entry).await {
            Ok(episode_id) => {
                log::info!(
                    "Entry {} completed as episode {} in {:.1}s",
                    entry.id,
                    episode_id,
                    start.elapsed().as_secs_f64()
                );
                ProcessResult {
                    entry_id: entry.id.clone(),
                    success: true,
                    episode_id: Some(episode_id),
                    error: None,
                }
            }
            Err(e) => {
                let message = e.to_string();
                self.record_failure(entry, &message).await;
                ProcessResult {
                    entry_id: entry.id.clone(),
                    success: false,
                    episode_id: None,
                    error: Some(message),
                }
            }
        }
    }

    async fn run_stages(&self, entry: &Entry) -> Result<String, AppError> {
        let id = entry.id.as_str();
        self.db.mark_processing(id)?;

        let mut entry = self
            .db
            .get_entry(id)?
            .ok_or_else(|| AppError::NotFound(format!("entry {}", id)))?;

        if entry.force_reprocess {
            log::info!("Force reprocess requested for {}, discarding cached artifacts", id);
            self.db.clear_artifacts(id)?;
            entry.extracted_title = None;
            entry.extracted_content = None;
            entry.transcript_json = None;
            entry.expected_segment_count = None;
            entry.force_reprocess = false;
        }

        let resume = resume_point(&entry, &self.segments);
        log::info!("Entry {} resuming at {:?}", id, resume);

        let (title, body) = if resume == ResumePoint::Fetch {
            let html = self.stages.fetcher.fetch(&entry.url).await?;
            let (title, body) = self.extract(id, &entry.url, &html).await?;
            self.db.save_extracted_content(id, &title, &body)?;
            (title, body)
        } else {
            (
                entry
                    .extracted_title
                    .clone()
                    .unwrap_or_else(|| entry.url.clone()),
                entry.extracted_content.clone().unwrap_or_default(),
            )
        };

        let script: Vec<ScriptLine> = match entry.transcript_json.as_deref().and_then(parse_script) {
            Some(script) if resume > ResumePoint::Script => script,
            _ => {
                let generated = self.stages.script_writer.generate_script(&title, &body).await;
                let output = self.settle_usage(id, generated)?;
                self.log_usage(id, &output.usage)?;
                self.db
                    .save_transcript(id, &serde_json::to_string(&output.script)?)?;
                output.script
            }
        };

        let segment_paths: Vec<PathBuf> = if resume > ResumePoint::Synthesize {
            let expected = entry.expected_segment_count.unwrap_or(0).max(0) as usize;
            self.segments.paths(id, expected)
        } else {
            let stale = self.segments.delete_for_entry(id)?;
            if stale > 0 {
                log::debug!("Removed {} stale segments for {}", stale, id);
            }
            let synthesized = self.stages.synthesizer.synthesize(id, &script).await;
            let output = self.settle_usage(id, synthesized)?;
            self.log_usage(id, &output.usage)?;
            if output.segment_paths.len() != script.len() {
                return Err(AppError::stage(
                    "synthesize",
                    format!(
                        "produced {} segments for {} script lines",
                        output.segment_paths.len(),
                        script.len()
                    ),
                ));
            }
            self.db
                .save_expected_segment_count(id, output.segment_paths.len() as i64)?;
            output.segment_paths
        };

        let episode_id = uuid::Uuid::new_v4().to_string();
        let audio = self
            .stages
            .publisher
            .publish(&episode_id, &segment_paths)
            .await?;

        self.db.complete_entry(
            id,
            &NewEpisode {
                id: episode_id.clone(),
                title,
                audio_ref: audio.audio_ref,
                duration_seconds: audio.duration_seconds,
                size_bytes: audio.size_bytes,
            },
            Utc::now(),
        )?;

        // The episode is on record; leftovers are caught by the orphan sweep.
        if let Err(e) = self.segments.delete_for_entry(id) {
            log::warn!("Failed to delete segments for completed entry {}: {}", id, e);
        }

        Ok(episode_id)
    }

    /// Structural extraction first, the billed fallback only when it comes
    /// up short or fails.
    async fn extract(&self, id: &str, url: &str, html: &str) -> Result<(String, String), AppError> {
        let minimum = self.settings.min_content_length;

        let structural_title = match self.stages.extractor.extract(html) {
            Ok(content) if content.body.chars().count() >= minimum => {
                let title = content.title.unwrap_or_else(|| url.to_string());
                return Ok((title, content.body));
            }
            Ok(content) => {
                log::info!(
                    "Structural extraction for {} found {} characters, trying fallback",
                    id,
                    content.body.chars().count()
                );
                content.title
            }
            Err(e) => {
                log::info!("Structural extraction for {} failed ({}), trying fallback", id, e);
                None
            }
        };

        let fallback = self.stages.extractor.extract_fallback(html).await;
        let fallback = self.settle_usage(id, fallback)?;
        self.log_usage(id, &fallback.usage)?;

        let length = fallback.body.chars().count();
        if length < minimum {
            return Err(AppError::InsufficientContent { length, minimum });
        }
        Ok((structural_title.unwrap_or_else(|| url.to_string()), fallback.body))
    }

    /// Record usage carried by a failed billed stage, then hand back its cause.
    fn settle_usage<T>(&self, entry_id: &str, result: Result<T, AppError>) -> Result<T, AppError> {
        match result {
            Err(AppError::Billed { usage, error }) => {
                if let Err(e) = self.log_usage(entry_id, &usage) {
                    log::error!("Failed to log usage for {}: {}", entry_id, e);
                }
                Err(*error)
            }
            other => other,
        }
    }

    fn log_usage(&self, entry_id: &str, usage: &Usage) -> Result<(), AppError> {
        self.budget.log_usage(Some(entry_id), usage)?;
        Ok(())
    }

    async fn record_failure(&self, entry: &Entry, message: &str) {
        let previous = match self.db.get_retry_count(&entry.id) {
            Ok(count) => count,
            Err(e) => {
                log::error!("Failed to read retry count for {}: {}", entry.id, e);
                entry.retry_count
            }
        };
        let retry_count = previous + 1;

        if retry_count >= self.settings.max_retries {
            log::warn!(
                "Entry {} failed permanently after {} attempts: {}",
                entry.id,
                retry_count,
                message
            );
            if let Err(e) = self.db.record_failure(&entry.id, message, retry_count, None) {
                log::error!("Failed to record failure for {}: {}", entry.id, e);
            }
            self.notifier
                .on_permanent_failure(&entry.id, &entry.url, message)
                .await;
        } else {
            let next_retry_at = Utc::now() + backoff_delay(previous);
            log::info!(
                "Entry {} failed (attempt {}), retrying after {}: {}",
                entry.id,
                retry_count,
                next_retry_at.to_rfc3339(),
                message
            );
            if let Err(e) =
                self.db
                    .record_failure(&entry.id, message, retry_count, Some(next_retry_at))
            {
                log::error!("Failed to record failure for {}: {}", entry.id, e);
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::database::EntryStatus;
    use crate::worker::testing::{FailAt, TestEnv};
    use chrono::SubsecRound;

    fn cached_script(lines: usize) -> String {
        let script: Vec<ScriptLine> = (0..lines)
            .map(|i| ScriptLine {
                speaker: if i % 2 == 0 { "Host" } else { "Guest" }.to_string(),
                text: format!("Line {}", i),
                instruction: String::new(),
            })
            .collect();
        serde_json::to_string(&script).unwrap()
    }

    #[test]
    fn test_backoff_with_jitter() {
        assert_eq!(backoff_with_jitter(0, 0), Duration::minutes(1));
        assert_eq!(backoff_with_jitter(3, 500), Duration::minutes(8) + Duration::milliseconds(500));
        let delay = backoff_delay(1);
        assert!(delay >= Duration::minutes(2));
        assert!(delay < Duration::minutes(2) + Duration::seconds(30));
    }

    #[test]
    fn test_resume_point_progression() {
        let env = TestEnv::new();
        let entry = env.add_entry("https://example.com/a");
        assert_eq!(resume_point(&entry, &env.segments), ResumePoint::Fetch);

        env.db.save_extracted_content(&entry.id, "T", "body").unwrap();
        let entry = env.reload(&entry.id);
        assert_eq!(resume_point(&entry, &env.segments), ResumePoint::Script);

        env.db.save_transcript(&entry.id, &cached_script(2)).unwrap();
        let entry = env.reload(&entry.id);
        assert_eq!(resume_point(&entry, &env.segments), ResumePoint::Synthesize);

        env.db.save_expected_segment_count(&entry.id, 2).unwrap();
        env.write_segments(&entry.id, 1);
        let entry = env.reload(&entry.id);
        assert_eq!(resume_point(&entry, &env.segments), ResumePoint::Synthesize);

        env.write_segments(&entry.id, 2);
        assert_eq!(resume_point(&entry, &env.segments), ResumePoint::Publish);
    }

    #[test]
    fn test_empty_or_corrupt_script_means_script_stage() {
        let env = TestEnv::new();
        let entry = env.add_entry("https://example.com/a");
        env.db.save_extracted_content(&entry.id, "T", "body").unwrap();

        for bad in ["[]", "{oops", r#"{"speaker":"Host"}"#] {
            env.db.save_transcript(&entry.id, bad).unwrap();
            let entry = env.reload(&entry.id);
            assert_eq!(resume_point(&entry, &env.segments), ResumePoint::Script);
        }
    }

    #[tokio::test]
    async fn test_fresh_entry_runs_every_stage() {
        let env = TestEnv::new();
        let entry = env.add_entry("https://example.com/post");

        let result = env.pipeline(3).process_entry(&entry).await;
        assert!(result.success, "{:?}", result.error);

        let calls = env.fakes.calls();
        assert_eq!(
            (calls.fetch, calls.extract, calls.fallback, calls.script, calls.synthesize, calls.publish),
            (1, 1, 0, 1, 1, 1)
        );
        // script + synthesis
        assert_eq!(env.db.count_usage_records().unwrap(), 2);

        let stored = env.reload(&entry.id);
        assert_eq!(stored.status, EntryStatus::Completed);
        assert!(stored.processed_at.is_some());
        assert_eq!(stored.extracted_title.as_deref(), Some("Fake Title"));

        let episode = env.db.get_episode_for_entry(&entry.id).unwrap().unwrap();
        assert_eq!(Some(episode.id), result.episode_id);
        assert_eq!(episode.title, "Fake Title");
        assert_eq!(env.segment_count(&entry.id), 0);
    }

    #[tokio::test]
    async fn test_complete_cache_only_publishes() {
        let env = TestEnv::new();
        let entry = env.add_entry("https://example.com/cached");
        env.db.save_extracted_content(&entry.id, "Cached", "body").unwrap();
        env.db.save_transcript(&entry.id, &cached_script(3)).unwrap();
        env.db.save_expected_segment_count(&entry.id, 3).unwrap();
        env.write_segments(&entry.id, 3);

        let result = env.pipeline(3).process_entry(&env.reload(&entry.id)).await;
        assert!(result.success);

        let calls = env.fakes.calls();
        assert_eq!(
            (calls.fetch, calls.extract, calls.fallback, calls.script, calls.synthesize, calls.publish),
            (0, 0, 0, 0, 0, 1)
        );
        assert_eq!(env.db.count_usage_records().unwrap(), 0);
        assert_eq!(env.fakes.published_segments(), 3);
    }

    #[tokio::test]
    async fn test_corrupt_script_regenerated_once() {
        let env = TestEnv::new();
        let entry = env.add_entry("https://example.com/corrupt");
        env.db.save_extracted_content(&entry.id, "T", "body").unwrap();
        env.db.save_transcript(&entry.id, "not json at all").unwrap();

        let result = env.pipeline(3).process_entry(&entry).await;
        assert!(result.success);

        let calls = env.fakes.calls();
        assert_eq!((calls.fetch, calls.extract, calls.script), (0, 0, 1));
        let services: Vec<String> = env
            .db
            .usage_for_entry(&entry.id)
            .unwrap()
            .into_iter()
            .map(|u| u.service)
            .collect();
        assert_eq!(services, vec!["llm".to_string(), "tts".to_string()]);
    }

    #[tokio::test]
    async fn test_force_reprocess_ignores_cache() {
        let env = TestEnv::new();
        let entry = env.add_entry("https://example.com/force");
        env.db.save_extracted_content(&entry.id, "Old", "old body").unwrap();
        env.db.save_transcript(&entry.id, &cached_script(2)).unwrap();
        env.db.save_expected_segment_count(&entry.id, 2).unwrap();
        env.write_segments(&entry.id, 2);
        env.db.request_reprocess(&entry.id).unwrap();

        let result = env.pipeline(3).process_entry(&entry).await;
        assert!(result.success);

        let calls = env.fakes.calls();
        assert_eq!(
            (calls.fetch, calls.extract, calls.script, calls.synthesize, calls.publish),
            (1, 1, 1, 1, 1)
        );
        assert_eq!(env.db.count_usage_records().unwrap(), 2);

        let stored = env.reload(&entry.id);
        assert!(!stored.force_reprocess);
        assert_eq!(stored.extracted_title.as_deref(), Some("Fake Title"));
    }

    #[tokio::test]
    async fn test_force_flag_cleared_even_on_failure() {
        let env = TestEnv::new();
        let entry = env.add_entry("https://example.com/force-fail");
        env.db.request_reprocess(&entry.id).unwrap();
        env.fakes.fail_at(FailAt::Fetch);

        let result = env.pipeline(3).process_entry(&entry).await;
        assert!(!result.success);
        assert!(!env.reload(&entry.id).force_reprocess);
    }

    #[tokio::test]
    async fn test_retry_schedule_uses_exponential_backoff() {
        let env = TestEnv::new();
        env.fakes.fail_at(FailAt::Fetch);

        for previous in [0u32, 2] {
            let entry = env.add_entry(&format!("https://example.com/retry-{}", previous));
            if previous > 0 {
                env.db
                    .record_failure(&entry.id, "earlier", previous, None)
                    .unwrap();
            }

            let before = Utc::now().trunc_subsecs(3);
            let result = env.pipeline(5).process_entry(&entry).await;
            let after = Utc::now();
            assert!(!result.success);

            let stored = env.reload(&entry.id);
            assert_eq!(stored.status, EntryStatus::Failed);
            assert_eq!(stored.retry_count, previous + 1);
            assert!(stored.error_message.unwrap().contains("fetch failed"));

            let base = Duration::minutes(1i64 << previous);
            let next = stored.next_retry_at.unwrap();
            assert!(next >= before + base, "{} too early", next);
            assert!(next < after + base + Duration::seconds(30), "{} too late", next);
        }
        assert!(env.notifier.failures().is_empty());
    }

    #[tokio::test]
    async fn test_final_attempt_is_terminal_and_notifies_once() {
        let env = TestEnv::new();
        let entry = env.add_entry("https://example.com/doomed");
        env.db.record_failure(&entry.id, "earlier", 2, None).unwrap();
        env.fakes.fail_at(FailAt::Script);

        let result = env.pipeline(3).process_entry(&entry).await;
        assert!(!result.success);

        let stored = env.reload(&entry.id);
        assert_eq!(stored.status, EntryStatus::Failed);
        assert_eq!(stored.retry_count, 3);
        assert!(stored.next_retry_at.is_none());

        let failures = env.notifier.failures();
        assert_eq!(failures.len(), 1);
        assert_eq!(failures[0].0, entry.id);
        assert!(failures[0].1.contains("script failed"));

        // terminal entries are never selected again
        assert!(env.db.eligible_entries(3, Utc::now()).unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_retry_count_read_fresh_from_store() {
        let env = TestEnv::new();
        let stale = env.add_entry("https://example.com/stale");
        env.db.record_failure(&stale.id, "earlier", 1, None).unwrap();
        env.fakes.fail_at(FailAt::Fetch);

        // `stale` still carries retry_count 0
        env.pipeline(5).process_entry(&stale).await;
        assert_eq!(env.reload(&stale.id).retry_count, 2);
    }

    #[tokio::test]
    async fn test_segments_kept_on_failure_deleted_on_success() {
        let env = TestEnv::new();
        let entry = env.add_entry("https://example.com/segments");
        env.fakes.fail_at(FailAt::Publish);

        let result = env.pipeline(3).process_entry(&entry).await;
        assert!(!result.success);
        let stored = env.reload(&entry.id);
        assert_eq!(stored.expected_segment_count, Some(3));
        assert_eq!(env.segment_count(&entry.id), 3);

        // the next attempt reuses the segments and only publishes
        env.fakes.clear_failure();
        env.fakes.reset_calls();
        let result = env.pipeline(3).process_entry(&stored).await;
        assert!(result.success);
        let calls = env.fakes.calls();
        assert_eq!((calls.synthesize, calls.publish), (0, 1));
        assert_eq!(env.segment_count(&entry.id), 0);
    }

    #[tokio::test]
    async fn test_resynthesis_removes_stale_segments() {
        let env = TestEnv::new();
        let entry = env.add_entry("https://example.com/stale-segments");
        env.db.save_extracted_content(&entry.id, "T", "body").unwrap();
        env.db.save_transcript(&entry.id, &cached_script(3)).unwrap();
        // leftovers from an earlier, longer script
        env.write_segments(&entry.id, 6);
        env.fakes.fail_at(FailAt::Publish);

        env.pipeline(3).process_entry(&entry).await;
        assert_eq!(env.segment_count(&entry.id), 3);
        assert!(!env.segments.path(&entry.id, 5).exists());
    }

    #[tokio::test]
    async fn test_short_structural_body_uses_fallback() {
        let env = TestEnv::new();
        env.fakes.set_structural_body("too short");
        let entry = env.add_entry("https://example.com/thin");

        let result = env.pipeline(3).process_entry(&entry).await;
        assert!(result.success, "{:?}", result.error);

        let calls = env.fakes.calls();
        assert_eq!((calls.extract, calls.fallback), (1, 1));
        // fallback + script + synthesis
        assert_eq!(env.db.count_usage_records().unwrap(), 3);
        let stored = env.reload(&entry.id);
        assert_eq!(stored.extracted_title.as_deref(), Some("Fake Title"));
        assert!(stored.extracted_content.unwrap().starts_with("Fallback"));
    }

    #[tokio::test]
    async fn test_extractor_error_falls_back_with_url_title() {
        let env = TestEnv::new();
        env.fakes.fail_at(FailAt::Extract);
        let entry = env.add_entry("https://example.com/broken-html");

        let result = env.pipeline(3).process_entry(&entry).await;
        assert!(result.success, "{:?}", result.error);
        let stored = env.reload(&entry.id);
        assert_eq!(stored.extracted_title.as_deref(), Some("https://example.com/broken-html"));
    }

    #[tokio::test]
    async fn test_insufficient_content_fails_entry() {
        let env = TestEnv::new();
        env.fakes.set_structural_body("short");
        env.fakes.set_fallback_body("also short");
        let entry = env.add_entry("https://example.com/empty");

        let result = env.pipeline(3).process_entry(&entry).await;
        assert!(!result.success);
        assert!(result.error.unwrap().starts_with("Insufficient content"));

        let calls = env.fakes.calls();
        assert_eq!(calls.script, 0);
        // the fallback call was still billed
        assert_eq!(env.db.count_usage_records().unwrap(), 1);
        assert_eq!(env.reload(&entry.id).status, EntryStatus::Failed);
    }

    #[tokio::test]
    async fn test_billed_failures_reach_the_ledger_on_every_attempt() {
        let env = TestEnv::new();
        env.fakes.fail_at(FailAt::Script);
        env.fakes.bill_failures();
        let entry = env.add_entry("https://example.com/unparseable");

        let result = env.pipeline(5).process_entry(&entry).await;
        assert!(!result.success);
        assert_eq!(result.error.as_deref(), Some("script failed: injected failure"));
        let usage = env.db.usage_for_entry(&entry.id).unwrap();
        assert_eq!(usage.len(), 1);
        assert_eq!((usage[0].service.as_str(), usage[0].input_units), ("llm", 100));

        // the retry pays again and is recorded again
        let stored = env.reload(&entry.id);
        env.pipeline(5).process_entry(&stored).await;
        assert_eq!(env.db.usage_for_entry(&entry.id).unwrap().len(), 2);
        assert_eq!(env.reload(&entry.id).retry_count, 2);
    }

    #[tokio::test]
    async fn test_partial_synthesis_is_billed() {
        let env = TestEnv::new();
        env.fakes.fail_at(FailAt::Synthesize);
        env.fakes.bill_failures();
        let entry = env.add_entry("https://example.com/tts-outage");

        let result = env.pipeline(3).process_entry(&entry).await;
        assert!(!result.success);
        let services: Vec<String> = env
            .db
            .usage_for_entry(&entry.id)
            .unwrap()
            .into_iter()
            .map(|u| u.service)
            .collect();
        assert_eq!(services, vec!["llm".to_string(), "tts".to_string()]);
        assert_eq!(env.reload(&entry.id).status, EntryStatus::Failed);
    }

    #[tokio::test]
    async fn test_segments_survive_failure_at_every_early_stage() {
        for stage in [FailAt::Fetch, FailAt::Fallback, FailAt::Script] {
            let env = TestEnv::new();
            let entry = env.add_entry("https://example.com/keep-segments");
            match stage {
                FailAt::Script => {
                    env.db.save_extracted_content(&entry.id, "T", "body").unwrap();
                    env.db.save_transcript(&entry.id, "{corrupt").unwrap();
                }
                FailAt::Fallback => env.fakes.set_structural_body("short"),
                _ => {}
            }
            env.write_segments(&entry.id, 3);
            env.fakes.fail_at(stage);

            let result = env.pipeline(3).process_entry(&env.reload(&entry.id)).await;
            assert!(!result.success, "{:?} should fail", stage);
            assert_eq!(env.segment_count(&entry.id), 3, "segments lost after {:?} failure", stage);
        }
    }
}
