use crate::executor::tool::run_tool;
use crate::executor::{NodeContext, NodeError, NodeExecutor, NodeOutcome};
use crate::nodes::subtitles::{format_srt, SrtCue};
use mediaflow_common::node::NodeName;
use serde::{Deserialize, Serialize};
use serde_json::{json, Map, Value};
use std::collections::BTreeMap;
use std::path::Path;

/// `paddleocr.detect_subtitle_area`: let the OCR tool scan the keyframes and
/// report the stable subtitle band. The tool prints a JSON object on stdout.
pub struct DetectSubtitleArea;

#[derive(Deserialize)]
struct DetectedArea {
    subtitle_area: [i64; 4],
    confidence: f64,
    #[serde(default)]
    sampled_frames: u64,
}

#[async_trait::async_trait]
impl NodeExecutor for DetectSubtitleArea {
    fn name(&self) -> NodeName {
        NodeName::PaddleocrDetectSubtitleArea
    }

    fn validate_input(&self, ctx: &NodeContext) -> Result<(), NodeError> {
        ctx.require_str("keyframe_dir").map(|_| ())
    }

    async fn execute_core_logic(&self, ctx: &NodeContext) -> Result<NodeOutcome, NodeError> {
        let keyframe_dir = ctx.require_existing_dir("keyframe_dir")?;

        let args = vec![
            "--mode".to_string(),
            "detect-area".to_string(),
            keyframe_dir.to_string_lossy().to_string(),
        ];
        let tool_output = run_tool(
            &ctx.tools.paddleocr.command,
            &args,
            None,
            ctx.tools.paddleocr.timeout,
            &ctx.cancel,
        )
        .await?;

        let detected: DetectedArea = serde_json::from_str(tool_output.stdout.trim())
            .map_err(|err| {
                NodeError::Compute(format!("area detector produced unusable output: {err}"))
            })?;

        let mut output = Map::new();
        output.insert(
            "subtitle_area".to_string(),
            json!(detected.subtitle_area),
        );
        output.insert("confidence".to_string(), Value::from(detected.confidence));
        output.insert(
            "sampled_frames".to_string(),
            Value::from(detected.sampled_frames),
        );
        Ok(NodeOutcome::Completed(output))
    }
}

/// `paddleocr.create_stitched_images`: stack cropped subtitle strips into
/// tall composite images so one OCR pass covers many frames, and write the
/// frame manifest mapping strip rows back to timestamps.
pub struct CreateStitchedImages;

#[async_trait::async_trait]
impl NodeExecutor for CreateStitchedImages {
    fn name(&self) -> NodeName {
        NodeName::PaddleocrCreateStitchedImages
    }

    fn validate_input(&self, ctx: &NodeContext) -> Result<(), NodeError> {
        ctx.require_str("cropped_images_path")?;
        if ctx.inputs.get("subtitle_area").is_none() {
            return Err(NodeError::InvalidInput(
                "required parameter 'subtitle_area' is missing".to_string(),
            ));
        }
        Ok(())
    }

    async fn execute_core_logic(&self, ctx: &NodeContext) -> Result<NodeOutcome, NodeError> {
        let cropped = ctx.require_existing_dir("cropped_images_path")?;
        let stitched_dir = ctx.out_dir("stitched");
        std::fs::create_dir_all(&stitched_dir)
            .map_err(|err| NodeError::Resource(format!("cannot create output dir: {err}")))?;
        let manifest_path = stitched_dir.join("manifest.json");

        let args = vec![
            "--mode".to_string(),
            "stitch".to_string(),
            cropped.to_string_lossy().to_string(),
            "--output-dir".to_string(),
            stitched_dir.to_string_lossy().to_string(),
            "--manifest".to_string(),
            manifest_path.to_string_lossy().to_string(),
        ];
        run_tool(
            &ctx.tools.paddleocr.command,
            &args,
            None,
            ctx.tools.paddleocr.timeout,
            &ctx.cancel,
        )
        .await?;

        if !manifest_path.is_file() {
            return Err(NodeError::Compute(
                "stitcher did not produce a manifest".to_string(),
            ));
        }

        let mut output = Map::new();
        output.insert(
            "multi_frames_path".to_string(),
            Value::String(stitched_dir.to_string_lossy().to_string()),
        );
        output.insert(
            "manifest_path".to_string(),
            Value::String(manifest_path.to_string_lossy().to_string()),
        );
        Ok(NodeOutcome::Completed(output))
    }
}

/// `paddleocr.perform_ocr`: run OCR over the stitched composites.
pub struct PerformOcr;

#[async_trait::async_trait]
impl NodeExecutor for PerformOcr {
    fn name(&self) -> NodeName {
        NodeName::PaddleocrPerformOcr
    }

    fn validate_input(&self, ctx: &NodeContext) -> Result<(), NodeError> {
        ctx.require_str("manifest_path")?;
        ctx.require_str("multi_frames_path")?;
        Ok(())
    }

    async fn execute_core_logic(&self, ctx: &NodeContext) -> Result<NodeOutcome, NodeError> {
        let manifest = ctx.require_existing_file("manifest_path")?;
        let frames = ctx.require_existing_dir("multi_frames_path")?;
        let ocr_dir = ctx.out_dir("ocr");
        std::fs::create_dir_all(&ocr_dir)
            .map_err(|err| NodeError::Resource(format!("cannot create output dir: {err}")))?;
        let ocr_results_path = ocr_dir.join("ocr_results.json");

        let args = vec![
            "--mode".to_string(),
            "ocr".to_string(),
            "--manifest".to_string(),
            manifest.to_string_lossy().to_string(),
            "--images".to_string(),
            frames.to_string_lossy().to_string(),
            "--output".to_string(),
            ocr_results_path.to_string_lossy().to_string(),
        ];
        run_tool(
            &ctx.tools.paddleocr.command,
            &args,
            None,
            ctx.tools.paddleocr.timeout,
            &ctx.cancel,
        )
        .await?;

        if !ocr_results_path.is_file() {
            return Err(NodeError::Compute(
                "OCR did not produce a results file".to_string(),
            ));
        }

        let mut output = Map::new();
        output.insert(
            "ocr_results_path".to_string(),
            Value::String(ocr_results_path.to_string_lossy().to_string()),
        );
        Ok(NodeOutcome::Completed(output))
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ManifestFrame {
    pub index: u64,
    pub timestamp: f64,
    #[serde(default)]
    pub image: String,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct OcrManifest {
    #[serde(default)]
    pub frames: Vec<ManifestFrame>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct OcrEntry {
    pub frame_start: u64,
    pub frame_end: u64,
    pub text: String,
    #[serde(default = "default_confidence")]
    pub confidence: f64,
}

fn default_confidence() -> f64 {
    1.0
}

const MIN_CONFIDENCE: f64 = 0.5;

/// Turn raw OCR entries into subtitle cues: map frame indices to timestamps
/// through the manifest, drop low-confidence reads, merge consecutive
/// identical texts.
pub fn build_cues(manifest: &OcrManifest, entries: &[OcrEntry]) -> Vec<SrtCue> {
    let timestamps: BTreeMap<u64, f64> = manifest
        .frames
        .iter()
        .map(|frame| (frame.index, frame.timestamp))
        .collect();
    let frame_step = manifest
        .frames
        .windows(2)
        .map(|pair| (pair[1].timestamp - pair[0].timestamp).abs())
        .fold(f64::INFINITY, f64::min);
    let default_span = if frame_step.is_finite() { frame_step } else { 0.5 };

    let mut cues: Vec<SrtCue> = Vec::new();
    for entry in entries {
        if entry.confidence < MIN_CONFIDENCE {
            continue;
        }
        let text = entry.text.trim();
        if text.is_empty() {
            continue;
        }
        let Some(&start) = timestamps.get(&entry.frame_start) else {
            continue;
        };
        let end = timestamps
            .get(&entry.frame_end)
            .copied()
            .map(|end| end + default_span)
            .unwrap_or(start + default_span);

        if let Some(last) = cues.last_mut() {
            if last.text == text && start - last.end <= default_span * 1.5 {
                last.end = last.end.max(end);
                continue;
            }
        }
        cues.push(SrtCue {
            index: cues.len() as u64 + 1,
            start,
            end: end.max(start),
            text: text.to_string(),
        });
    }
    cues
}

/// `paddleocr.postprocess_and_finalize`: pure post-processing from raw OCR
/// results to the final SRT and JSON subtitle artifacts.
pub struct PostprocessAndFinalize;

#[async_trait::async_trait]
impl NodeExecutor for PostprocessAndFinalize {
    fn name(&self) -> NodeName {
        NodeName::PaddleocrPostprocessAndFinalize
    }

    fn validate_input(&self, ctx: &NodeContext) -> Result<(), NodeError> {
        ctx.require_str("ocr_results_file")?;
        ctx.require_str("manifest_file")?;
        ctx.require_str("video_path")?;
        Ok(())
    }

    async fn execute_core_logic(&self, ctx: &NodeContext) -> Result<NodeOutcome, NodeError> {
        let ocr_results_file = ctx.require_existing_file("ocr_results_file")?;
        let manifest_file = ctx.require_existing_file("manifest_file")?;
        let video_stem = Path::new(ctx.require_str("video_path")?)
            .file_stem()
            .map(|stem| stem.to_string_lossy().to_string())
            .unwrap_or_else(|| "video".to_string());

        let manifest: OcrManifest = read_json(&manifest_file)?;
        let entries: Vec<OcrEntry> = read_json(&ocr_results_file)?;
        let cues = build_cues(&manifest, &entries);

        let subtitles_dir = ctx.out_dir("subtitles");
        std::fs::create_dir_all(&subtitles_dir)
            .map_err(|err| NodeError::Resource(format!("cannot create output dir: {err}")))?;
        let srt_file = subtitles_dir.join(format!("{video_stem}.srt"));
        let json_file = subtitles_dir.join(format!("{video_stem}.json"));

        std::fs::write(&srt_file, format_srt(&cues))
            .map_err(|err| NodeError::Resource(format!("cannot write SRT: {err}")))?;
        let cue_objects: Vec<Value> = cues
            .iter()
            .map(|cue| json!({"start": cue.start, "end": cue.end, "text": cue.text}))
            .collect();
        std::fs::write(
            &json_file,
            serde_json::to_string_pretty(&cue_objects)
                .map_err(|err| NodeError::Compute(err.to_string()))?,
        )
        .map_err(|err| NodeError::Resource(format!("cannot write JSON: {err}")))?;

        let mut output = Map::new();
        output.insert(
            "srt_file".to_string(),
            Value::String(srt_file.to_string_lossy().to_string()),
        );
        output.insert(
            "json_file".to_string(),
            Value::String(json_file.to_string_lossy().to_string()),
        );
        output.insert("cue_count".to_string(), Value::from(cues.len() as u64));
        Ok(NodeOutcome::Completed(output))
    }
}

fn read_json<T: serde::de::DeserializeOwned>(path: &Path) -> Result<T, NodeError> {
    let raw = std::fs::read_to_string(path).map_err(|err| {
        NodeError::InvalidInput(format!("cannot read {}: {err}", path.display()))
    })?;
    serde_json::from_str(&raw).map_err(|err| {
        NodeError::InvalidInput(format!("{} is not valid JSON: {err}", path.display()))
    })
}

#[cfg(test)]
mod tests {
    use test_r::test;

    use super::*;

    fn manifest() -> OcrManifest {
        OcrManifest {
            frames: (0..10)
                .map(|index| ManifestFrame {
                    index,
                    timestamp: index as f64 * 0.5,
                    image: format!("frame_{index:05}.jpg"),
                })
                .collect(),
        }
    }

    #[test]
    fn consecutive_identical_texts_merge_into_one_cue() {
        let entries = vec![
            OcrEntry {
                frame_start: 0,
                frame_end: 1,
                text: "hello".to_string(),
                confidence: 0.95,
            },
            OcrEntry {
                frame_start: 2,
                frame_end: 3,
                text: "hello".to_string(),
                confidence: 0.92,
            },
            OcrEntry {
                frame_start: 4,
                frame_end: 5,
                text: "world".to_string(),
                confidence: 0.9,
            },
        ];
        let cues = build_cues(&manifest(), &entries);
        assert_eq!(cues.len(), 2);
        assert_eq!(cues[0].text, "hello");
        assert_eq!(cues[0].start, 0.0);
        assert!(cues[0].end >= 1.5);
        assert_eq!(cues[1].text, "world");
    }

    #[test]
    fn low_confidence_and_empty_reads_are_dropped() {
        let entries = vec![
            OcrEntry {
                frame_start: 0,
                frame_end: 1,
                text: "noise".to_string(),
                confidence: 0.2,
            },
            OcrEntry {
                frame_start: 2,
                frame_end: 3,
                text: "   ".to_string(),
                confidence: 0.9,
            },
            OcrEntry {
                frame_start: 4,
                frame_end: 5,
                text: "kept".to_string(),
                confidence: 0.9,
            },
        ];
        let cues = build_cues(&manifest(), &entries);
        assert_eq!(cues.len(), 1);
        assert_eq!(cues[0].text, "kept");
    }
}
