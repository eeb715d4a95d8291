//! FFmpeg-backed media nodes. Command construction is kept minimal; every
//! invocation goes through the shared tool runner with the configured
//! timeout.

use crate::executor::tool::run_tool;
use crate::executor::{NodeContext, NodeError, NodeExecutor, NodeOutcome};
use crate::nodes::subtitles::parse_srt;
use mediaflow_common::node::NodeName;
use serde_json::{json, Map, Value};
use std::path::Path;

fn file_stem(path: &Path) -> String {
    path.file_stem()
        .map(|stem| stem.to_string_lossy().to_string())
        .unwrap_or_else(|| "output".to_string())
}

fn count_files(dir: &Path) -> Result<u64, NodeError> {
    let entries = std::fs::read_dir(dir)
        .map_err(|err| NodeError::Compute(format!("cannot list {}: {err}", dir.display())))?;
    let mut count = 0;
    for entry in entries {
        let entry =
            entry.map_err(|err| NodeError::Compute(format!("cannot list directory: {err}")))?;
        if entry.file_type().map(|t| t.is_file()).unwrap_or(false) {
            count += 1;
        }
    }
    Ok(count)
}

async fn probe_duration(ctx: &NodeContext, media: &Path) -> Option<f64> {
    let args = vec![
        "-v".to_string(),
        "error".to_string(),
        "-show_entries".to_string(),
        "format=duration".to_string(),
        "-of".to_string(),
        "default=noprint_wrappers=1:nokey=1".to_string(),
        media.to_string_lossy().to_string(),
    ];
    let output = run_tool(
        &ctx.tools.ffmpeg.probe_command,
        &args,
        None,
        ctx.tools.ffmpeg.timeout,
        &ctx.cancel,
    )
    .await
    .ok()?;
    output.stdout.trim().parse().ok()
}

/// `ffmpeg.extract_audio`: demux and resample the audio track to 16 kHz
/// mono PCM, the input format every downstream audio node expects.
pub struct ExtractAudio;

#[async_trait::async_trait]
impl NodeExecutor for ExtractAudio {
    fn name(&self) -> NodeName {
        NodeName::FfmpegExtractAudio
    }

    fn validate_input(&self, ctx: &NodeContext) -> Result<(), NodeError> {
        ctx.require_str("video_path").map(|_| ())
    }

    async fn execute_core_logic(&self, ctx: &NodeContext) -> Result<NodeOutcome, NodeError> {
        let video = ctx.require_existing_file("video_path")?;
        let out_dir = ctx.out_dir("audio");
        std::fs::create_dir_all(&out_dir)
            .map_err(|err| NodeError::Resource(format!("cannot create audio dir: {err}")))?;
        let audio_path = out_dir.join(format!("{}.wav", file_stem(&video)));

        let args = vec![
            "-y".to_string(),
            "-i".to_string(),
            video.to_string_lossy().to_string(),
            "-vn".to_string(),
            "-acodec".to_string(),
            "pcm_s16le".to_string(),
            "-ar".to_string(),
            "16000".to_string(),
            "-ac".to_string(),
            "1".to_string(),
            audio_path.to_string_lossy().to_string(),
        ];
        run_tool(
            &ctx.tools.ffmpeg.command,
            &args,
            None,
            ctx.tools.ffmpeg.timeout,
            &ctx.cancel,
        )
        .await?;

        let mut output = Map::new();
        output.insert(
            "audio_path".to_string(),
            Value::String(audio_path.to_string_lossy().to_string()),
        );
        output.insert("sample_rate".to_string(), Value::from(16000));
        output.insert("channels".to_string(), Value::from(1));
        output.insert("format".to_string(), Value::from("wav"));
        Ok(NodeOutcome::Completed(output))
    }
}

/// `ffmpeg.extract_keyframes`: sample roughly `keyframe_sample_count`
/// frames evenly across the video.
pub struct ExtractKeyframes;

#[async_trait::async_trait]
impl NodeExecutor for ExtractKeyframes {
    fn name(&self) -> NodeName {
        NodeName::FfmpegExtractKeyframes
    }

    fn validate_input(&self, ctx: &NodeContext) -> Result<(), NodeError> {
        ctx.require_str("video_path")?;
        if let Some(count) = ctx.inputs.get("keyframe_sample_count") {
            if count.as_u64().filter(|count| *count > 0).is_none() {
                return Err(NodeError::InvalidInput(
                    "keyframe_sample_count must be a positive integer".to_string(),
                ));
            }
        }
        Ok(())
    }

    async fn execute_core_logic(&self, ctx: &NodeContext) -> Result<NodeOutcome, NodeError> {
        let video = ctx.require_existing_file("video_path")?;
        let sample_count = ctx.optional_u64("keyframe_sample_count").unwrap_or(100);
        let keyframe_dir = ctx.out_dir("keyframes");
        std::fs::create_dir_all(&keyframe_dir)
            .map_err(|err| NodeError::Resource(format!("cannot create keyframe dir: {err}")))?;

        let interval = match probe_duration(ctx, &video).await {
            Some(duration) if duration > 0.0 => (duration / sample_count as f64).max(0.04),
            _ => 2.0,
        };

        let pattern = keyframe_dir.join("keyframe_%04d.jpg");
        let args = vec![
            "-y".to_string(),
            "-i".to_string(),
            video.to_string_lossy().to_string(),
            "-vf".to_string(),
            format!("fps=1/{interval:.6}"),
            "-frames:v".to_string(),
            sample_count.to_string(),
            "-q:v".to_string(),
            "2".to_string(),
            pattern.to_string_lossy().to_string(),
        ];
        run_tool(
            &ctx.tools.ffmpeg.command,
            &args,
            None,
            ctx.tools.ffmpeg.timeout,
            &ctx.cancel,
        )
        .await?;

        let produced = count_files(&keyframe_dir)?;
        let mut output = Map::new();
        output.insert(
            "keyframe_dir".to_string(),
            Value::String(keyframe_dir.to_string_lossy().to_string()),
        );
        output.insert("keyframe_files_count".to_string(), Value::from(produced));
        output.insert(
            "keyframe_dir_files_count".to_string(),
            Value::from(produced),
        );
        Ok(NodeOutcome::Completed(output))
    }
}

/// Pixel bounds of the subtitle band: `[top, bottom, left, right]`.
fn parse_subtitle_area(value: Option<&Vec<Value>>) -> Result<[i64; 4], NodeError> {
    let values = value.ok_or_else(|| {
        NodeError::InvalidInput("subtitle_area must be an array of four integers".to_string())
    })?;
    if values.len() != 4 {
        return Err(NodeError::InvalidInput(format!(
            "subtitle_area must have exactly four entries, got {}",
            values.len()
        )));
    }
    let mut area = [0i64; 4];
    for (slot, value) in area.iter_mut().zip(values) {
        *slot = value.as_i64().ok_or_else(|| {
            NodeError::InvalidInput("subtitle_area entries must be integers".to_string())
        })?;
    }
    let [top, bottom, left, right] = area;
    if bottom <= top || right <= left || top < 0 || left < 0 {
        return Err(NodeError::InvalidInput(format!(
            "subtitle_area [top, bottom, left, right] is degenerate: {area:?}"
        )));
    }
    Ok(area)
}

/// `ffmpeg.crop_subtitle_images`: sample frames and crop them to the
/// subtitle band for OCR. GPU-bound (hardware decode).
pub struct CropSubtitleImages;

#[async_trait::async_trait]
impl NodeExecutor for CropSubtitleImages {
    fn name(&self) -> NodeName {
        NodeName::FfmpegCropSubtitleImages
    }

    fn validate_input(&self, ctx: &NodeContext) -> Result<(), NodeError> {
        ctx.require_str("video_path")?;
        parse_subtitle_area(ctx.optional_array("subtitle_area")).map(|_| ())
    }

    async fn execute_core_logic(&self, ctx: &NodeContext) -> Result<NodeOutcome, NodeError> {
        let video = ctx.require_existing_file("video_path")?;
        let [top, bottom, left, right] = parse_subtitle_area(ctx.optional_array("subtitle_area"))?;
        let cropped_dir = ctx.out_dir("cropped_subtitles");
        std::fs::create_dir_all(&cropped_dir)
            .map_err(|err| NodeError::Resource(format!("cannot create crop dir: {err}")))?;

        let width = right - left;
        let height = bottom - top;
        let pattern = cropped_dir.join("frame_%05d.jpg");
        let args = vec![
            "-y".to_string(),
            "-i".to_string(),
            video.to_string_lossy().to_string(),
            "-vf".to_string(),
            format!("fps=2,crop={width}:{height}:{left}:{top}"),
            "-q:v".to_string(),
            "2".to_string(),
            pattern.to_string_lossy().to_string(),
        ];
        run_tool(
            &ctx.tools.ffmpeg.command,
            &args,
            None,
            ctx.tools.ffmpeg.timeout,
            &ctx.cancel,
        )
        .await?;

        let produced = count_files(&cropped_dir)?;
        let mut output = Map::new();
        output.insert(
            "cropped_images_path".to_string(),
            Value::String(cropped_dir.to_string_lossy().to_string()),
        );
        output.insert("cropped_images_count".to_string(), Value::from(produced));
        output.insert(
            "subtitle_area".to_string(),
            json!([top, bottom, left, right]),
        );
        Ok(NodeOutcome::Completed(output))
    }
}

/// `ffmpeg.split_audio_segments`: cut the audio track along subtitle cues,
/// one WAV per cue.
pub struct SplitAudioSegments;

#[async_trait::async_trait]
impl NodeExecutor for SplitAudioSegments {
    fn name(&self) -> NodeName {
        NodeName::FfmpegSplitAudioSegments
    }

    fn validate_input(&self, ctx: &NodeContext) -> Result<(), NodeError> {
        ctx.require_str("audio_path")?;
        ctx.require_str("subtitle_path")?;
        Ok(())
    }

    async fn execute_core_logic(&self, ctx: &NodeContext) -> Result<NodeOutcome, NodeError> {
        let audio = ctx.require_existing_file("audio_path")?;
        let subtitle = ctx.require_existing_file("subtitle_path")?;
        let min_duration = ctx.optional_f64("min_segment_duration").unwrap_or(0.2);

        let content = std::fs::read_to_string(&subtitle).map_err(|err| {
            NodeError::InvalidInput(format!("cannot read subtitle file: {err}"))
        })?;
        let cues = parse_srt(&content)?;

        let segments_dir = ctx.out_dir("audio_segments");
        std::fs::create_dir_all(&segments_dir)
            .map_err(|err| NodeError::Resource(format!("cannot create segments dir: {err}")))?;

        let mut produced = 0u64;
        let mut skipped = 0u64;
        for (position, cue) in cues.iter().enumerate() {
            if cue.end - cue.start < min_duration {
                skipped += 1;
                continue;
            }
            let segment_path = segments_dir.join(format!("segment_{position:04}.wav"));
            let args = vec![
                "-y".to_string(),
                "-ss".to_string(),
                format!("{:.3}", cue.start),
                "-to".to_string(),
                format!("{:.3}", cue.end),
                "-i".to_string(),
                audio.to_string_lossy().to_string(),
                "-acodec".to_string(),
                "pcm_s16le".to_string(),
                segment_path.to_string_lossy().to_string(),
            ];
            run_tool(
                &ctx.tools.ffmpeg.command,
                &args,
                None,
                ctx.tools.ffmpeg.timeout,
                &ctx.cancel,
            )
            .await?;
            produced += 1;
        }

        let mut output = Map::new();
        output.insert(
            "audio_segments_dir".to_string(),
            Value::String(segments_dir.to_string_lossy().to_string()),
        );
        output.insert("segments_count".to_string(), Value::from(produced));
        output.insert("skipped_segments".to_string(), Value::from(skipped));
        Ok(NodeOutcome::Completed(output))
    }
}

#[cfg(test)]
mod tests {
    use test_r::test;

    use super::*;

    #[test]
    fn subtitle_area_validation_rejects_degenerate_bands() {
        let ok = vec![json!(600), json!(700), json!(0), json!(1280)];
        assert_eq!(parse_subtitle_area(Some(&ok)).unwrap(), [600, 700, 0, 1280]);

        let flipped = vec![json!(700), json!(600), json!(0), json!(1280)];
        assert!(parse_subtitle_area(Some(&flipped)).is_err());

        let short = vec![json!(1), json!(2)];
        assert!(parse_subtitle_area(Some(&short)).is_err());
        assert!(parse_subtitle_area(None).is_err());
    }
}
