//! Subtitle post-processing nodes. Everything here is pure CPU work over
//! transcript and diarization JSON; no external tools are involved except
//! the optional LLM optimizer endpoint.

use crate::executor::{NodeContext, NodeError, NodeExecutor, NodeOutcome};
use crate::nodes::subtitles::{
    format_srt, format_vtt, overlap, parse_srt, read_diarization, read_transcript,
    segments_to_cues, DiarizationSegment, SrtCue, TranscriptSegment,
};
use mediaflow_common::node::NodeName;
use serde_json::{json, Map, Value};
use std::collections::BTreeMap;
use std::path::Path;

const UNKNOWN_SPEAKER: &str = "UNKNOWN";

fn load_segments(ctx: &NodeContext) -> Result<Vec<TranscriptSegment>, NodeError> {
    if let Some(inline) = ctx
        .inputs
        .get("merged_segments")
        .or_else(|| ctx.inputs.get("segments"))
    {
        return serde_json::from_value(inline.clone()).map_err(|err| {
            NodeError::InvalidInput(format!("inline segments are malformed: {err}"))
        });
    }
    let path = ctx.require_existing_file("segments_file")?;
    Ok(read_transcript(&path)?.segments)
}

fn load_diarization_segments(ctx: &NodeContext) -> Result<Vec<DiarizationSegment>, NodeError> {
    if let Some(inline) = ctx.inputs.get("diarization_segments") {
        return serde_json::from_value(inline.clone()).map_err(|err| {
            NodeError::InvalidInput(format!("inline diarization segments are malformed: {err}"))
        });
    }
    let path = ctx.require_existing_file("diarization_file")?;
    Ok(read_diarization(&path)?.segments)
}

fn write_json(path: &Path, value: &impl serde::Serialize) -> Result<(), NodeError> {
    if let Some(parent) = path.parent() {
        std::fs::create_dir_all(parent)
            .map_err(|err| NodeError::Resource(format!("cannot create output dir: {err}")))?;
    }
    let serialized =
        serde_json::to_string_pretty(value).map_err(|err| NodeError::Compute(err.to_string()))?;
    std::fs::write(path, serialized)
        .map_err(|err| NodeError::Resource(format!("cannot write {}: {err}", path.display())))
}

/// The speaker whose diarization turns overlap the `[start, end)` window the
/// most.
pub fn dominant_speaker(
    diarization: &[DiarizationSegment],
    start: f64,
    end: f64,
) -> Option<String> {
    let mut per_speaker: BTreeMap<&str, f64> = BTreeMap::new();
    for turn in diarization {
        let shared = overlap(start, end, turn.start, turn.end);
        if shared > 0.0 {
            *per_speaker.entry(turn.speaker.as_str()).or_default() += shared;
        }
    }
    per_speaker
        .into_iter()
        .max_by(|a, b| a.1.total_cmp(&b.1))
        .map(|(speaker, _)| speaker.to_string())
}

/// `wservice.generate_subtitle_files`: render a transcript into the full
/// set of subtitle artifacts (SRT, VTT, TXT, JSON).
pub struct GenerateSubtitleFiles;

#[async_trait::async_trait]
impl NodeExecutor for GenerateSubtitleFiles {
    fn name(&self) -> NodeName {
        NodeName::WserviceGenerateSubtitleFiles
    }

    fn validate_input(&self, ctx: &NodeContext) -> Result<(), NodeError> {
        ctx.require_str("segments_file").map(|_| ())
    }

    async fn execute_core_logic(&self, ctx: &NodeContext) -> Result<NodeOutcome, NodeError> {
        let segments = load_segments(ctx)?;
        if segments.is_empty() {
            return Err(NodeError::InvalidInput(
                "segments file contains no segments".to_string(),
            ));
        }
        let cues = segments_to_cues(&segments);

        let subtitles_dir = ctx.out_dir("subtitles");
        let srt_path = subtitles_dir.join("subtitles.srt");
        let vtt_path = subtitles_dir.join("subtitles.vtt");
        let txt_path = subtitles_dir.join("subtitles.txt");
        let json_path = subtitles_dir.join("subtitles.json");

        std::fs::create_dir_all(&subtitles_dir)
            .map_err(|err| NodeError::Resource(format!("cannot create output dir: {err}")))?;
        std::fs::write(&srt_path, format_srt(&cues))
            .map_err(|err| NodeError::Resource(format!("cannot write SRT: {err}")))?;
        std::fs::write(&vtt_path, format_vtt(&cues))
            .map_err(|err| NodeError::Resource(format!("cannot write VTT: {err}")))?;
        let plain: String = cues
            .iter()
            .map(|cue| cue.text.as_str())
            .collect::<Vec<_>>()
            .join("\n");
        std::fs::write(&txt_path, plain)
            .map_err(|err| NodeError::Resource(format!("cannot write TXT: {err}")))?;
        write_json(&json_path, &segments)?;

        let mut output = Map::new();
        output.insert(
            "subtitle_path".to_string(),
            Value::String(srt_path.to_string_lossy().to_string()),
        );
        output.insert(
            "json_path".to_string(),
            Value::String(json_path.to_string_lossy().to_string()),
        );
        output.insert(
            "subtitle_files".to_string(),
            json!({
                "srt": srt_path.to_string_lossy(),
                "vtt": vtt_path.to_string_lossy(),
                "txt": txt_path.to_string_lossy(),
                "json": json_path.to_string_lossy(),
            }),
        );
        output.insert(
            "segments_count".to_string(),
            Value::from(segments.len() as u64),
        );
        Ok(NodeOutcome::Completed(output))
    }
}

const FILLER_WORDS: &[&str] = &["um", "uh", "erm", "嗯", "啊", "呃"];

fn strip_fillers(text: &str) -> String {
    text.split_whitespace()
        .filter(|word| {
            let bare = word
                .trim_matches(|c: char| c.is_ascii_punctuation())
                .to_lowercase();
            !FILLER_WORDS.contains(&bare.as_str())
        })
        .collect::<Vec<_>>()
        .join(" ")
}

/// `wservice.correct_subtitles`: rule-based cleanup of a subtitle file.
/// Disabled configuration makes the whole stage SKIPPED.
pub struct CorrectSubtitles;

#[async_trait::async_trait]
impl NodeExecutor for CorrectSubtitles {
    fn name(&self) -> NodeName {
        NodeName::WserviceCorrectSubtitles
    }

    fn validate_input(&self, ctx: &NodeContext) -> Result<(), NodeError> {
        let enabled = ctx
            .optional_object("subtitle_correction")
            .and_then(|config| config.get("enabled"))
            .and_then(Value::as_bool)
            .unwrap_or(true);
        if enabled {
            ctx.require_str("subtitle_path")?;
        }
        Ok(())
    }

    async fn execute_core_logic(&self, ctx: &NodeContext) -> Result<NodeOutcome, NodeError> {
        let correction = ctx.optional_object("subtitle_correction").cloned();
        let enabled = correction
            .as_ref()
            .and_then(|config| config.get("enabled"))
            .and_then(Value::as_bool)
            .unwrap_or(true);
        if !enabled {
            return Ok(NodeOutcome::Skipped {
                reason: "subtitle correction disabled by configuration".to_string(),
            });
        }
        let remove_fillers = correction
            .as_ref()
            .and_then(|config| config.get("remove_fillers"))
            .and_then(Value::as_bool)
            .unwrap_or(true);
        let min_duration = correction
            .as_ref()
            .and_then(|config| config.get("min_duration"))
            .and_then(Value::as_f64)
            .unwrap_or(0.5);

        let subtitle_path = ctx.require_existing_file("subtitle_path")?;
        let content = std::fs::read_to_string(&subtitle_path)
            .map_err(|err| NodeError::InvalidInput(format!("cannot read subtitles: {err}")))?;
        let cues = parse_srt(&content)?;

        let mut corrected: Vec<SrtCue> = Vec::new();
        let mut corrected_count = 0u64;
        let mut removed_count = 0u64;
        let mut merged_count = 0u64;
        for cue in cues {
            let mut text = cue.text.trim().to_string();
            if remove_fillers {
                let stripped = strip_fillers(&text);
                if stripped != text {
                    corrected_count += 1;
                    text = stripped;
                }
            }
            if text.is_empty() {
                removed_count += 1;
                continue;
            }
            if let Some(last) = corrected.last_mut() {
                if last.text == text {
                    last.end = last.end.max(cue.end);
                    merged_count += 1;
                    continue;
                }
            }
            let mut end = cue.end;
            if end - cue.start < min_duration {
                end = cue.start + min_duration;
                corrected_count += 1;
            }
            corrected.push(SrtCue {
                index: corrected.len() as u64 + 1,
                start: cue.start,
                end,
                text,
            });
        }

        let stem = subtitle_path
            .file_stem()
            .map(|stem| stem.to_string_lossy().to_string())
            .unwrap_or_else(|| "subtitles".to_string());
        let corrected_dir = ctx.out_dir("corrected");
        std::fs::create_dir_all(&corrected_dir)
            .map_err(|err| NodeError::Resource(format!("cannot create output dir: {err}")))?;
        let corrected_path = corrected_dir.join(format!("{stem}.corrected.srt"));
        std::fs::write(&corrected_path, format_srt(&corrected))
            .map_err(|err| NodeError::Resource(format!("cannot write subtitles: {err}")))?;

        let mut output = Map::new();
        output.insert(
            "corrected_subtitle_path".to_string(),
            Value::String(corrected_path.to_string_lossy().to_string()),
        );
        output.insert("corrected_count".to_string(), Value::from(corrected_count));
        output.insert("removed_count".to_string(), Value::from(removed_count));
        output.insert("merged_count".to_string(), Value::from(merged_count));
        output.insert(
            "final_cue_count".to_string(),
            Value::from(corrected.len() as u64),
        );
        Ok(NodeOutcome::Completed(output))
    }
}

/// `wservice.ai_optimize_subtitles`: send the transcript to the configured
/// LLM endpoint for fluency optimization. Disabled config makes the stage
/// SKIPPED.
pub struct AiOptimizeSubtitles;

#[async_trait::async_trait]
impl NodeExecutor for AiOptimizeSubtitles {
    fn name(&self) -> NodeName {
        NodeName::WserviceAiOptimizeSubtitles
    }

    fn validate_input(&self, ctx: &NodeContext) -> Result<(), NodeError> {
        let enabled = ctx
            .optional_object("subtitle_optimization")
            .and_then(|config| config.get("enabled"))
            .and_then(Value::as_bool)
            .unwrap_or(false);
        if enabled {
            ctx.require_str("segments_file")?;
            if ctx.tools.wservice.optimize_endpoint.is_none() {
                return Err(NodeError::InvalidInput(
                    "subtitle optimization enabled but tools.wservice.optimize_endpoint \
                     is not configured"
                        .to_string(),
                ));
            }
        }
        Ok(())
    }

    async fn execute_core_logic(&self, ctx: &NodeContext) -> Result<NodeOutcome, NodeError> {
        let enabled = ctx
            .optional_object("subtitle_optimization")
            .and_then(|config| config.get("enabled"))
            .and_then(Value::as_bool)
            .unwrap_or(false);
        if !enabled {
            return Ok(NodeOutcome::Skipped {
                reason: "subtitle optimization disabled by configuration".to_string(),
            });
        }

        let segments = load_segments(ctx)?;
        let endpoint = ctx
            .tools
            .wservice
            .optimize_endpoint
            .as_deref()
            .ok_or_else(|| {
                NodeError::InvalidInput(
                    "tools.wservice.optimize_endpoint is not configured".to_string(),
                )
            })?;

        let client = reqwest::Client::builder()
            .timeout(ctx.tools.wservice.optimize_timeout)
            .build()
            .map_err(|err| NodeError::Resource(err.to_string()))?;
        let response = client
            .post(endpoint)
            .json(&json!({
                "segments": segments,
                "options": ctx.optional_object("subtitle_optimization"),
            }))
            .send()
            .await
            .map_err(|err| NodeError::Resource(format!("optimizer unreachable: {err}")))?;
        if !response.status().is_success() {
            return Err(NodeError::Compute(format!(
                "optimizer returned {}",
                response.status()
            )));
        }
        let optimized: Vec<TranscriptSegment> = response
            .json::<serde_json::Value>()
            .await
            .ok()
            .and_then(|body| body.get("segments").cloned())
            .and_then(|segments| serde_json::from_value(segments).ok())
            .ok_or_else(|| {
                NodeError::Compute("optimizer response is not a segments object".to_string())
            })?;

        let optimized_dir = ctx.out_dir("optimized");
        let optimized_file_path = optimized_dir.join("optimized_segments.json");
        write_json(&optimized_file_path, &optimized)?;

        let mut output = Map::new();
        output.insert(
            "optimized_file_path".to_string(),
            Value::String(optimized_file_path.to_string_lossy().to_string()),
        );
        output.insert(
            "optimized_count".to_string(),
            Value::from(optimized.len() as u64),
        );
        output.insert(
            "original_count".to_string(),
            Value::from(segments.len() as u64),
        );
        Ok(NodeOutcome::Completed(output))
    }
}

/// Assign each transcript segment the dominant diarization speaker.
pub fn merge_by_overlap(
    segments: &[TranscriptSegment],
    diarization: &[DiarizationSegment],
) -> Vec<TranscriptSegment> {
    segments
        .iter()
        .map(|segment| {
            let speaker = dominant_speaker(diarization, segment.start, segment.end)
                .unwrap_or_else(|| UNKNOWN_SPEAKER.to_string());
            TranscriptSegment {
                speaker: Some(speaker),
                ..segment.clone()
            }
        })
        .collect()
}

/// Split transcript segments at speaker changes using word timestamps, so a
/// sentence shared by two speakers ends up as two segments.
pub fn merge_by_words(
    segments: &[TranscriptSegment],
    diarization: &[DiarizationSegment],
) -> Vec<TranscriptSegment> {
    let mut merged = Vec::new();
    for segment in segments {
        if segment.words.is_empty() {
            merged.extend(merge_by_overlap(std::slice::from_ref(segment), diarization));
            continue;
        }
        let mut current_words: Vec<_> = Vec::new();
        let mut current_speaker: Option<String> = None;
        for word in &segment.words {
            let mid = (word.start + word.end) / 2.0;
            let speaker = dominant_speaker(diarization, mid, mid + f64::EPSILON)
                .or_else(|| dominant_speaker(diarization, word.start, word.end))
                .unwrap_or_else(|| UNKNOWN_SPEAKER.to_string());
            match &current_speaker {
                Some(active) if *active == speaker => current_words.push(word.clone()),
                Some(_) => {
                    merged.push(words_to_segment(&current_words, current_speaker.take()));
                    current_speaker = Some(speaker);
                    current_words = vec![word.clone()];
                }
                None => {
                    current_speaker = Some(speaker);
                    current_words.push(word.clone());
                }
            }
        }
        if !current_words.is_empty() {
            merged.push(words_to_segment(&current_words, current_speaker));
        }
    }
    merged
}

fn words_to_segment(
    words: &[crate::nodes::subtitles::WordTimestamp],
    speaker: Option<String>,
) -> TranscriptSegment {
    let text = words
        .iter()
        .map(|word| word.word.trim())
        .collect::<Vec<_>>()
        .join(" ");
    TranscriptSegment {
        start: words.first().map(|word| word.start).unwrap_or(0.0),
        end: words.last().map(|word| word.end).unwrap_or(0.0),
        text,
        words: words.to_vec(),
        speaker,
    }
}

fn summarize(merged: &[TranscriptSegment]) -> Value {
    let mut per_speaker: BTreeMap<String, u64> = BTreeMap::new();
    for segment in merged {
        let speaker = segment
            .speaker
            .clone()
            .unwrap_or_else(|| UNKNOWN_SPEAKER.to_string());
        *per_speaker.entry(speaker).or_default() += 1;
    }
    json!({
        "speaker_count": per_speaker.len(),
        "per_speaker": per_speaker,
    })
}

fn merged_output(
    ctx: &NodeContext,
    merged: Vec<TranscriptSegment>,
) -> Result<NodeOutcome, NodeError> {
    let merged_dir = ctx.out_dir("merged");
    let merged_file = merged_dir.join("merged_segments.json");
    write_json(&merged_file, &merged)?;

    let mut output = Map::new();
    output.insert(
        "merged_segments".to_string(),
        serde_json::to_value(&merged).map_err(|err| NodeError::Compute(err.to_string()))?,
    );
    output.insert(
        "merged_segments_file".to_string(),
        Value::String(merged_file.to_string_lossy().to_string()),
    );
    output.insert("merged_count".to_string(), Value::from(merged.len() as u64));
    output.insert("summary".to_string(), summarize(&merged));
    Ok(NodeOutcome::Completed(output))
}

fn validate_merge_inputs(ctx: &NodeContext) -> Result<(), NodeError> {
    if ctx.inputs.get("segments").is_none() && ctx.optional_str("segments_file").is_none() {
        return Err(NodeError::InvalidInput(
            "either 'segments_file' or inline 'segments' is required".to_string(),
        ));
    }
    if ctx.inputs.get("diarization_segments").is_none()
        && ctx.optional_str("diarization_file").is_none()
    {
        return Err(NodeError::InvalidInput(
            "either 'diarization_file' or inline 'diarization_segments' is required".to_string(),
        ));
    }
    Ok(())
}

/// `wservice.merge_speaker_segments`: segment-level speaker attribution.
pub struct MergeSpeakerSegments;

#[async_trait::async_trait]
impl NodeExecutor for MergeSpeakerSegments {
    fn name(&self) -> NodeName {
        NodeName::WserviceMergeSpeakerSegments
    }

    fn validate_input(&self, ctx: &NodeContext) -> Result<(), NodeError> {
        validate_merge_inputs(ctx)
    }

    async fn execute_core_logic(&self, ctx: &NodeContext) -> Result<NodeOutcome, NodeError> {
        let segments = load_segments(ctx)?;
        let diarization = load_diarization_segments(ctx)?;
        merged_output(ctx, merge_by_overlap(&segments, &diarization))
    }
}

/// `wservice.merge_with_word_timestamps`: word-level speaker attribution
/// with splits at speaker changes.
pub struct MergeWithWordTimestamps;

#[async_trait::async_trait]
impl NodeExecutor for MergeWithWordTimestamps {
    fn name(&self) -> NodeName {
        NodeName::WserviceMergeWithWordTimestamps
    }

    fn validate_input(&self, ctx: &NodeContext) -> Result<(), NodeError> {
        validate_merge_inputs(ctx)
    }

    async fn execute_core_logic(&self, ctx: &NodeContext) -> Result<NodeOutcome, NodeError> {
        let segments = load_segments(ctx)?;
        let diarization = load_diarization_segments(ctx)?;
        merged_output(ctx, merge_by_words(&segments, &diarization))
    }
}

/// `wservice.prepare_tts_segments`: shape (merged) transcript segments into
/// the synthesis work list consumed by the TTS node.
pub struct PrepareTtsSegments;

#[async_trait::async_trait]
impl NodeExecutor for PrepareTtsSegments {
    fn name(&self) -> NodeName {
        NodeName::WservicePrepareTtsSegments
    }

    fn validate_input(&self, ctx: &NodeContext) -> Result<(), NodeError> {
        if ctx.inputs.get("merged_segments").is_none()
            && ctx.inputs.get("segments").is_none()
            && ctx.optional_str("segments_file").is_none()
        {
            return Err(NodeError::InvalidInput(
                "either 'segments_file' or inline segments are required".to_string(),
            ));
        }
        Ok(())
    }

    async fn execute_core_logic(&self, ctx: &NodeContext) -> Result<NodeOutcome, NodeError> {
        let segments = load_segments(ctx)?;
        if segments.is_empty() {
            return Err(NodeError::InvalidInput(
                "no segments to prepare".to_string(),
            ));
        }

        let mut prepared = Vec::with_capacity(segments.len());
        for (index, segment) in segments.iter().enumerate() {
            let text = segment.text.trim();
            if text.is_empty() {
                continue;
            }
            let pause_after = segments
                .get(index + 1)
                .map(|next| (next.start - segment.end).max(0.0))
                .unwrap_or(0.0);
            prepared.push(json!({
                "index": prepared.len(),
                "text": text,
                "start": segment.start,
                "end": segment.end,
                "speaker": segment.speaker,
                "output_filename": format!("tts_{:04}.wav", prepared.len()),
                "pause_after": pause_after,
            }));
        }

        let prepared_dir = ctx.out_dir("tts");
        let prepared_file = prepared_dir.join("prepared_segments.json");
        write_json(&prepared_file, &prepared)?;

        let mut output = Map::new();
        output.insert("prepared_segments".to_string(), Value::Array(prepared.clone()));
        output.insert(
            "prepared_segments_file".to_string(),
            Value::String(prepared_file.to_string_lossy().to_string()),
        );
        output.insert(
            "prepared_count".to_string(),
            Value::from(prepared.len() as u64),
        );
        Ok(NodeOutcome::Completed(output))
    }
}

#[cfg(test)]
mod tests {
    use test_r::test;

    use super::*;
    use crate::nodes::subtitles::WordTimestamp;

    fn transcript() -> Vec<TranscriptSegment> {
        vec![
            TranscriptSegment {
                start: 0.0,
                end: 2.0,
                text: "hello there".to_string(),
                words: vec![],
                speaker: None,
            },
            TranscriptSegment {
                start: 2.0,
                end: 4.0,
                text: "general kenobi".to_string(),
                words: vec![],
                speaker: None,
            },
        ]
    }

    fn diarization() -> Vec<DiarizationSegment> {
        vec![
            DiarizationSegment {
                start: 0.0,
                end: 1.9,
                speaker: "SPEAKER_00".to_string(),
            },
            DiarizationSegment {
                start: 1.9,
                end: 4.0,
                speaker: "SPEAKER_01".to_string(),
            },
        ]
    }

    #[test]
    fn segments_take_the_dominant_speaker() {
        let merged = merge_by_overlap(&transcript(), &diarization());
        assert_eq!(merged[0].speaker.as_deref(), Some("SPEAKER_00"));
        assert_eq!(merged[1].speaker.as_deref(), Some("SPEAKER_01"));
    }

    #[test]
    fn segments_without_diarization_overlap_are_unknown() {
        let merged = merge_by_overlap(
            &[TranscriptSegment {
                start: 10.0,
                end: 11.0,
                text: "late".to_string(),
                words: vec![],
                speaker: None,
            }],
            &diarization(),
        );
        assert_eq!(merged[0].speaker.as_deref(), Some(UNKNOWN_SPEAKER));
    }

    #[test]
    fn word_level_merge_splits_at_speaker_changes() {
        let segments = vec![TranscriptSegment {
            start: 0.0,
            end: 4.0,
            text: "hello there general kenobi".to_string(),
            words: vec![
                WordTimestamp {
                    start: 0.0,
                    end: 0.8,
                    word: "hello".to_string(),
                },
                WordTimestamp {
                    start: 0.9,
                    end: 1.6,
                    word: "there".to_string(),
                },
                WordTimestamp {
                    start: 2.1,
                    end: 2.9,
                    word: "general".to_string(),
                },
                WordTimestamp {
                    start: 3.0,
                    end: 3.8,
                    word: "kenobi".to_string(),
                },
            ],
            speaker: None,
        }];
        let merged = merge_by_words(&segments, &diarization());
        assert_eq!(merged.len(), 2);
        assert_eq!(merged[0].text, "hello there");
        assert_eq!(merged[0].speaker.as_deref(), Some("SPEAKER_00"));
        assert_eq!(merged[1].text, "general kenobi");
        assert_eq!(merged[1].speaker.as_deref(), Some("SPEAKER_01"));
        assert_eq!(merged[1].start, 2.1);
        assert_eq!(merged[1].end, 3.8);
    }

    #[test]
    fn fillers_are_stripped_but_content_kept() {
        assert_eq!(strip_fillers("um hello uh world"), "hello world");
        assert_eq!(strip_fillers("no fillers here"), "no fillers here");
    }
}
