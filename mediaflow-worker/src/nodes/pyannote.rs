use crate::executor::tool::run_tool;
use crate::executor::{NodeContext, NodeError, NodeExecutor, NodeOutcome};
use crate::nodes::subtitles::{read_diarization, DiarizationFile};
use mediaflow_common::node::NodeName;
use serde_json::{json, Map, Value};
use std::collections::BTreeMap;

/// `pyannote_audio.diarize_speakers`: speaker diarization, either through
/// the local model tool (GPU-bound) or the paid remote API.
pub struct DiarizeSpeakers;

impl DiarizeSpeakers {
    async fn diarize_remote(
        ctx: &NodeContext,
        audio: &std::path::Path,
        output_file: &std::path::Path,
    ) -> Result<(), NodeError> {
        let endpoint = ctx.tools.pyannote.api_endpoint.as_deref().ok_or_else(|| {
            NodeError::InvalidInput(
                "use_paid_api is set but tools.pyannote.api_endpoint is not configured"
                    .to_string(),
            )
        })?;

        let audio_bytes = std::fs::read(audio)
            .map_err(|err| NodeError::Resource(format!("cannot read audio: {err}")))?;
        let client = reqwest::Client::builder()
            .timeout(ctx.tools.pyannote.tool.timeout)
            .build()
            .map_err(|err| NodeError::Resource(err.to_string()))?;
        let response = client
            .post(endpoint)
            .header("content-type", "application/octet-stream")
            .body(audio_bytes)
            .send()
            .await
            .map_err(|err| NodeError::Resource(format!("diarization API unreachable: {err}")))?;
        if !response.status().is_success() {
            return Err(NodeError::Compute(format!(
                "diarization API returned {}",
                response.status()
            )));
        }
        let body = response
            .bytes()
            .await
            .map_err(|err| NodeError::Resource(format!("diarization API read failed: {err}")))?;
        std::fs::write(output_file, &body)
            .map_err(|err| NodeError::Resource(format!("cannot write diarization: {err}")))?;
        Ok(())
    }
}

#[async_trait::async_trait]
impl NodeExecutor for DiarizeSpeakers {
    fn name(&self) -> NodeName {
        NodeName::PyannoteDiarizeSpeakers
    }

    fn validate_input(&self, ctx: &NodeContext) -> Result<(), NodeError> {
        ctx.require_str("audio_path").map(|_| ())
    }

    fn needs_gpu(&self, ctx: &NodeContext) -> bool {
        // the paid API runs remotely; only local diarization touches the GPU
        !ctx.optional_bool("use_paid_api").unwrap_or(false)
    }

    async fn execute_core_logic(&self, ctx: &NodeContext) -> Result<NodeOutcome, NodeError> {
        let audio = ctx.require_existing_file("audio_path")?;
        let use_paid_api = ctx.optional_bool("use_paid_api").unwrap_or(false);

        let diarization_dir = ctx.out_dir("diarization");
        std::fs::create_dir_all(&diarization_dir)
            .map_err(|err| NodeError::Resource(format!("cannot create output dir: {err}")))?;
        let diarization_file = diarization_dir.join("diarization.json");

        if use_paid_api {
            Self::diarize_remote(ctx, &audio, &diarization_file).await?;
        } else {
            let args = vec![
                audio.to_string_lossy().to_string(),
                "--output".to_string(),
                diarization_file.to_string_lossy().to_string(),
            ];
            run_tool(
                &ctx.tools.pyannote.tool.command,
                &args,
                None,
                ctx.tools.pyannote.tool.timeout,
                &ctx.cancel,
            )
            .await?;
        }

        let diarization = read_diarization(&diarization_file)
            .map_err(|err| NodeError::Compute(format!("diarization output unusable: {err}")))?;
        let speakers = speaker_list(&diarization);

        let mut output = Map::new();
        output.insert(
            "diarization_file".to_string(),
            Value::String(diarization_file.to_string_lossy().to_string()),
        );
        output.insert(
            "speaker_count".to_string(),
            Value::from(speakers.len() as u64),
        );
        output.insert(
            "speakers".to_string(),
            Value::Array(speakers.into_iter().map(Value::String).collect()),
        );
        output.insert(
            "segments_count".to_string(),
            Value::from(diarization.segments.len() as u64),
        );
        output.insert("used_paid_api".to_string(), Value::Bool(use_paid_api));
        Ok(NodeOutcome::Completed(output))
    }
}

fn speaker_list(diarization: &DiarizationFile) -> Vec<String> {
    if !diarization.speakers.is_empty() {
        return diarization.speakers.clone();
    }
    let mut speakers: Vec<String> = diarization
        .segments
        .iter()
        .map(|segment| segment.speaker.clone())
        .collect();
    speakers.sort();
    speakers.dedup();
    speakers
}

/// `pyannote_audio.get_speaker_segments`: pure post-processing; project the
/// diarization down to one speaker (or all) and persist the selection.
pub struct GetSpeakerSegments;

#[async_trait::async_trait]
impl NodeExecutor for GetSpeakerSegments {
    fn name(&self) -> NodeName {
        NodeName::PyannoteGetSpeakerSegments
    }

    fn validate_input(&self, ctx: &NodeContext) -> Result<(), NodeError> {
        ctx.require_str("diarization_file").map(|_| ())
    }

    async fn execute_core_logic(&self, ctx: &NodeContext) -> Result<NodeOutcome, NodeError> {
        let diarization_path = ctx.require_existing_file("diarization_file")?;
        let diarization = read_diarization(&diarization_path)?;
        let wanted = ctx.optional_str("speaker");

        let selected: Vec<_> = diarization
            .segments
            .iter()
            .filter(|segment| wanted.map(|w| segment.speaker == w).unwrap_or(true))
            .cloned()
            .collect();

        let mut per_speaker: BTreeMap<String, u64> = BTreeMap::new();
        for segment in &selected {
            *per_speaker.entry(segment.speaker.clone()).or_default() += 1;
        }
        let total_duration: f64 = selected
            .iter()
            .map(|segment| (segment.end - segment.start).max(0.0))
            .sum();

        let out_dir = ctx.out_dir("diarization");
        std::fs::create_dir_all(&out_dir)
            .map_err(|err| NodeError::Resource(format!("cannot create output dir: {err}")))?;
        let speaker_segments_file = out_dir.join(match wanted {
            Some(speaker) => format!("speaker_segments_{speaker}.json"),
            None => "speaker_segments.json".to_string(),
        });
        let serialized = serde_json::to_string_pretty(&selected)
            .map_err(|err| NodeError::Compute(err.to_string()))?;
        std::fs::write(&speaker_segments_file, serialized)
            .map_err(|err| NodeError::Resource(format!("cannot write segments: {err}")))?;

        let mut output = Map::new();
        output.insert(
            "segments".to_string(),
            serde_json::to_value(&selected).map_err(|err| NodeError::Compute(err.to_string()))?,
        );
        output.insert(
            "speaker_segments_file".to_string(),
            Value::String(speaker_segments_file.to_string_lossy().to_string()),
        );
        output.insert(
            "summary".to_string(),
            json!({
                "total_segments": selected.len(),
                "total_speech_seconds": total_duration,
                "per_speaker": per_speaker,
            }),
        );
        Ok(NodeOutcome::Completed(output))
    }
}

/// `pyannote_audio.validate_diarization`: structural checks over a
/// diarization file; never fails the stage for an invalid file, it reports.
pub struct ValidateDiarization;

#[async_trait::async_trait]
impl NodeExecutor for ValidateDiarization {
    fn name(&self) -> NodeName {
        NodeName::PyannoteValidateDiarization
    }

    fn validate_input(&self, ctx: &NodeContext) -> Result<(), NodeError> {
        ctx.require_str("diarization_file").map(|_| ())
    }

    async fn execute_core_logic(&self, ctx: &NodeContext) -> Result<NodeOutcome, NodeError> {
        let diarization_path = ctx.require_existing_file("diarization_file")?;
        let diarization = read_diarization(&diarization_path)?;

        let mut issues: Vec<String> = Vec::new();
        if diarization.segments.is_empty() {
            issues.push("diarization contains no segments".to_string());
        }
        for (index, segment) in diarization.segments.iter().enumerate() {
            if segment.start < 0.0 {
                issues.push(format!("segment {index} has a negative start"));
            }
            if segment.end <= segment.start {
                issues.push(format!("segment {index} has end <= start"));
            }
            if segment.speaker.is_empty() {
                issues.push(format!("segment {index} has an empty speaker label"));
            }
        }

        let speakers = speaker_list(&diarization);
        let mut output = Map::new();
        output.insert(
            "validation".to_string(),
            json!({
                "valid": issues.is_empty(),
                "segments_count": diarization.segments.len(),
                "speaker_count": speakers.len(),
                "issues": issues,
            }),
        );
        Ok(NodeOutcome::Completed(output))
    }
}

#[cfg(test)]
mod tests {
    use test_r::test;

    use super::*;
    use crate::nodes::subtitles::DiarizationSegment;

    fn diarization() -> DiarizationFile {
        DiarizationFile {
            speakers: vec![],
            segments: vec![
                DiarizationSegment {
                    start: 0.0,
                    end: 2.0,
                    speaker: "SPEAKER_00".to_string(),
                },
                DiarizationSegment {
                    start: 2.0,
                    end: 3.0,
                    speaker: "SPEAKER_01".to_string(),
                },
                DiarizationSegment {
                    start: 3.0,
                    end: 5.5,
                    speaker: "SPEAKER_00".to_string(),
                },
            ],
        }
    }

    #[test]
    fn speaker_list_is_derived_and_deduplicated() {
        let speakers = speaker_list(&diarization());
        assert_eq!(speakers, vec!["SPEAKER_00", "SPEAKER_01"]);
    }
}
