use crate::executor::tool::run_tool;
use crate::executor::{NodeContext, NodeError, NodeExecutor, NodeOutcome};
use mediaflow_common::node::NodeName;
use serde_json::{Map, Value};

const DEFAULT_MODEL: &str = "UVR-MDX-NET-Inst_HQ_3";

/// `audio_separator.separate_vocals`: vocal/instrumental separation through
/// the configured UVR tool. Always GPU-bound.
pub struct SeparateVocals;

#[async_trait::async_trait]
impl NodeExecutor for SeparateVocals {
    fn name(&self) -> NodeName {
        NodeName::AudioSeparatorSeparateVocals
    }

    fn validate_input(&self, ctx: &NodeContext) -> Result<(), NodeError> {
        ctx.require_str("audio_path")?;
        if let Some(config) = ctx.inputs.get("audio_separator_config") {
            if !config.is_object() {
                return Err(NodeError::InvalidInput(
                    "audio_separator_config must be an object".to_string(),
                ));
            }
        }
        Ok(())
    }

    async fn execute_core_logic(&self, ctx: &NodeContext) -> Result<NodeOutcome, NodeError> {
        let audio = ctx.require_existing_file("audio_path")?;
        let model = ctx
            .optional_object("audio_separator_config")
            .and_then(|config| config.get("model"))
            .and_then(Value::as_str)
            .unwrap_or(DEFAULT_MODEL)
            .to_string();

        let separated_dir = ctx.out_dir("separated");
        std::fs::create_dir_all(&separated_dir)
            .map_err(|err| NodeError::Resource(format!("cannot create output dir: {err}")))?;

        let args = vec![
            audio.to_string_lossy().to_string(),
            "--output-dir".to_string(),
            separated_dir.to_string_lossy().to_string(),
            "--model".to_string(),
            model.clone(),
        ];
        run_tool(
            &ctx.tools.audio_separator.command,
            &args,
            None,
            ctx.tools.audio_separator.timeout,
            &ctx.cancel,
        )
        .await?;

        let vocal_audio = separated_dir.join("vocals.wav");
        if !vocal_audio.is_file() {
            return Err(NodeError::Compute(format!(
                "separator did not produce {}",
                vocal_audio.display()
            )));
        }

        let mut all_audio_files = Vec::new();
        let entries = std::fs::read_dir(&separated_dir)
            .map_err(|err| NodeError::Compute(format!("cannot list output dir: {err}")))?;
        for entry in entries {
            let entry = entry
                .map_err(|err| NodeError::Compute(format!("cannot list output dir: {err}")))?;
            if entry.file_type().map(|t| t.is_file()).unwrap_or(false) {
                all_audio_files.push(entry.path().to_string_lossy().to_string());
            }
        }
        all_audio_files.sort();

        let mut output = Map::new();
        output.insert(
            "vocal_audio".to_string(),
            Value::String(vocal_audio.to_string_lossy().to_string()),
        );
        output.insert(
            "all_audio_files".to_string(),
            Value::Array(all_audio_files.into_iter().map(Value::String).collect()),
        );
        output.insert("model".to_string(), Value::String(model));
        Ok(NodeOutcome::Completed(output))
    }
}
