use crate::executor::tool::run_tool;
use crate::executor::{NodeContext, NodeError, NodeExecutor, NodeOutcome};
use mediaflow_common::node::NodeName;
use serde_json::{Map, Value};
use std::path::PathBuf;

/// `indextts.generate_speech`: zero-shot TTS through the configured
/// synthesis tool, cloning the timbre of `spk_audio_prompt` and optionally
/// conditioning emotion on a second reference.
pub struct GenerateSpeech;

#[async_trait::async_trait]
impl NodeExecutor for GenerateSpeech {
    fn name(&self) -> NodeName {
        NodeName::IndexttsGenerateSpeech
    }

    fn validate_input(&self, ctx: &NodeContext) -> Result<(), NodeError> {
        let text = ctx.require_str("text")?;
        if text.chars().count() > 10_000 {
            return Err(NodeError::InvalidInput(
                "text is longer than 10000 characters".to_string(),
            ));
        }
        ctx.require_str("output_path")?;
        ctx.require_str("spk_audio_prompt")?;
        Ok(())
    }

    async fn execute_core_logic(&self, ctx: &NodeContext) -> Result<NodeOutcome, NodeError> {
        let text = ctx.require_str("text")?.to_string();
        let speaker_prompt = ctx.require_existing_file("spk_audio_prompt")?;

        let requested = PathBuf::from(ctx.require_str("output_path")?);
        let audio_path = if requested.is_absolute() {
            requested
        } else {
            ctx.out_dir("tts").join(requested)
        };
        if let Some(parent) = audio_path.parent() {
            std::fs::create_dir_all(parent)
                .map_err(|err| NodeError::Resource(format!("cannot create output dir: {err}")))?;
        }

        let mut args = vec![
            "--text".to_string(),
            text,
            "--speaker".to_string(),
            speaker_prompt.to_string_lossy().to_string(),
            "--output".to_string(),
            audio_path.to_string_lossy().to_string(),
        ];
        if let Some(emotion_prompt) = ctx.optional_str("emo_audio_prompt") {
            args.push("--emotion-audio".to_string());
            args.push(emotion_prompt.to_string());
        }
        if let Some(emotion_vector) = ctx.inputs.get("emo_vector") {
            args.push("--emotion-vector".to_string());
            args.push(emotion_vector.to_string());
        }

        run_tool(
            &ctx.tools.indextts.command,
            &args,
            None,
            ctx.tools.indextts.timeout,
            &ctx.cancel,
        )
        .await?;

        if !audio_path.is_file() {
            return Err(NodeError::Compute(format!(
                "synthesis did not produce {}",
                audio_path.display()
            )));
        }

        let mut output = Map::new();
        output.insert(
            "audio_path".to_string(),
            Value::String(audio_path.to_string_lossy().to_string()),
        );
        Ok(NodeOutcome::Completed(output))
    }
}
