use crate::executor::tool::run_tool;
use crate::executor::{NodeContext, NodeError, NodeExecutor, NodeOutcome};
use crate::nodes::subtitles::read_transcript;
use mediaflow_common::node::NodeName;
use serde_json::{Map, Value};

/// `faster_whisper.transcribe_audio`: speech recognition through the
/// configured ASR tool. Serializes on the GPU lock only when the configured
/// device is CUDA.
pub struct TranscribeAudio;

#[async_trait::async_trait]
impl NodeExecutor for TranscribeAudio {
    fn name(&self) -> NodeName {
        NodeName::FasterWhisperTranscribeAudio
    }

    fn validate_input(&self, ctx: &NodeContext) -> Result<(), NodeError> {
        ctx.require_str("audio_path").map(|_| ())
    }

    fn needs_gpu(&self, ctx: &NodeContext) -> bool {
        ctx.tools.whisper.device.eq_ignore_ascii_case("cuda")
    }

    async fn execute_core_logic(&self, ctx: &NodeContext) -> Result<NodeOutcome, NodeError> {
        let audio = ctx.require_existing_file("audio_path")?;
        let word_timestamps = ctx.optional_bool("enable_word_timestamps").unwrap_or(false);

        let transcript_dir = ctx.out_dir("transcript");
        std::fs::create_dir_all(&transcript_dir)
            .map_err(|err| NodeError::Resource(format!("cannot create transcript dir: {err}")))?;
        let segments_file = transcript_dir.join("segments.json");

        let mut args = vec![
            audio.to_string_lossy().to_string(),
            "--output".to_string(),
            segments_file.to_string_lossy().to_string(),
            "--device".to_string(),
            ctx.tools.whisper.device.clone(),
        ];
        if word_timestamps {
            args.push("--word-timestamps".to_string());
        }
        run_tool(
            &ctx.tools.whisper.tool.command,
            &args,
            None,
            ctx.tools.whisper.tool.timeout,
            &ctx.cancel,
        )
        .await?;

        let transcript = read_transcript(&segments_file)
            .map_err(|err| NodeError::Compute(format!("ASR produced no usable output: {err}")))?;

        let mut output = Map::new();
        output.insert(
            "segments_file".to_string(),
            Value::String(segments_file.to_string_lossy().to_string()),
        );
        output.insert(
            "language".to_string(),
            Value::String(transcript.language.unwrap_or_else(|| "unknown".to_string())),
        );
        output.insert(
            "segments_count".to_string(),
            Value::from(transcript.segments.len() as u64),
        );
        output.insert(
            "word_timestamps".to_string(),
            Value::Bool(word_timestamps),
        );
        Ok(NodeOutcome::Completed(output))
    }
}
