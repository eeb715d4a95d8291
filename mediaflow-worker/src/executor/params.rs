use super::NodeError;
use mediaflow_common::model::WorkflowContext;
use mediaflow_common::node::{is_non_empty_output_value, NodeDescriptor};
use serde_json::{Map, Value};
use std::collections::{HashMap, HashSet};

const REF_OPEN: &str = "${{";
const REF_CLOSE: &str = "}}";

/// Resolve the effective inputs of a stage with the fixed priority order:
///
/// 1. the value from the current request's `input_data` (after dynamic
///    reference substitution),
/// 2. a `${{ stages.<stage>.output.<field> }}` reference,
/// 3. the node's declared fallback chain over earlier stages,
/// 4. a global configuration default.
///
/// Minimal hard defaults are applied by the nodes themselves when they read
/// an optional parameter. The first rule yielding a non-empty value wins.
pub fn resolve_parameters(
    descriptor: &NodeDescriptor,
    context: &WorkflowContext,
    global_defaults: &HashMap<String, Value>,
) -> Result<Map<String, Value>, NodeError> {
    let document = serde_json::to_value(context)
        .map_err(|err| NodeError::InvalidInput(format!("workflow context not resolvable: {err}")))?;

    let mut resolved = Map::new();
    for (key, value) in &context.input_params.input_data {
        let mut visited = HashSet::new();
        let value = resolve_value(value, &document, &mut visited)?;
        resolved.insert(key.clone(), value);
    }

    // intelligent fallback over earlier stage outputs
    for fallback in descriptor.fallbacks {
        let missing = resolved
            .get(fallback.input)
            .map(|value| !is_non_empty_output_value(value))
            .unwrap_or(true);
        if !missing {
            continue;
        }
        for source in fallback.sources {
            if let Some(value) = context
                .stage(&source.stage)
                .filter(|stage| stage.status == mediaflow_common::model::StageStatus::Success)
                .and_then(|stage| stage.output.get(source.field))
                .filter(|value| is_non_empty_output_value(value))
            {
                resolved.insert(fallback.input.to_string(), value.clone());
                break;
            }
        }
    }

    // process-wide configuration defaults for the inputs this node keys on
    for field in descriptor.cache_key_fields {
        let missing = resolved
            .get(*field)
            .map(|value| !is_non_empty_output_value(value))
            .unwrap_or(true);
        if missing {
            if let Some(value) = global_defaults.get(*field) {
                resolved.insert(field.to_string(), value.clone());
            }
        }
    }

    Ok(resolved)
}

fn resolve_value(
    value: &Value,
    document: &Value,
    visited: &mut HashSet<String>,
) -> Result<Value, NodeError> {
    match value {
        Value::String(text) => resolve_string(text, document, visited),
        Value::Array(items) => {
            let mut resolved = Vec::with_capacity(items.len());
            for item in items {
                resolved.push(resolve_value(item, document, visited)?);
            }
            Ok(Value::Array(resolved))
        }
        Value::Object(map) => {
            let mut resolved = Map::new();
            for (key, item) in map {
                resolved.insert(key.clone(), resolve_value(item, document, visited)?);
            }
            Ok(Value::Object(resolved))
        }
        other => Ok(other.clone()),
    }
}

fn resolve_string(
    text: &str,
    document: &Value,
    visited: &mut HashSet<String>,
) -> Result<Value, NodeError> {
    let Some(open) = text.find(REF_OPEN) else {
        return Ok(Value::String(text.to_string()));
    };
    if text[open + REF_OPEN.len()..].contains(REF_OPEN) {
        return Err(NodeError::InvalidInput(format!(
            "parameter value contains more than one dynamic reference: {text}"
        )));
    }
    let Some(close_offset) = text[open..].find(REF_CLOSE) else {
        return Err(NodeError::InvalidInput(format!(
            "unterminated dynamic reference in: {text}"
        )));
    };
    let close = open + close_offset;
    let path = text[open + REF_OPEN.len()..close].trim().to_string();

    // one evaluation per reference per request; a repeat means a cycle
    if !visited.insert(path.clone()) {
        return Err(NodeError::InvalidInput(format!(
            "cyclic dynamic reference through '{path}'"
        )));
    }

    let referenced = lookup_path(document, &path).ok_or_else(|| {
        NodeError::InvalidInput(format!("dynamic reference '{path}' could not be resolved"))
    })?;

    let whole_string_is_reference =
        text[..open].trim().is_empty() && text[close + REF_CLOSE.len()..].trim().is_empty();

    if whole_string_is_reference {
        // referenced values may themselves contain references
        resolve_value(&referenced, document, visited)
    } else {
        let rendered = match &referenced {
            Value::String(s) => s.clone(),
            Value::Number(n) => n.to_string(),
            Value::Bool(b) => b.to_string(),
            other => {
                return Err(NodeError::InvalidInput(format!(
                    "dynamic reference '{path}' resolves to a non-scalar value \
                     and cannot be embedded in '{text}': {other}"
                )))
            }
        };
        let mut substituted = String::with_capacity(text.len() + rendered.len());
        substituted.push_str(&text[..open]);
        substituted.push_str(&rendered);
        substituted.push_str(&text[close + REF_CLOSE.len()..]);
        resolve_string(&substituted, document, visited)
    }
}

/// Walk a dotted path against the serialized workflow context. Stage names
/// contain one dot (`ffmpeg.extract_audio`), so when a single segment does
/// not match a key, the walker joins it with the next segment and retries.
fn lookup_path(document: &Value, path: &str) -> Option<Value> {
    let segments: Vec<&str> = path.split('.').collect();
    let mut current = document;
    let mut index = 0;
    while index < segments.len() {
        let object = current.as_object()?;
        if let Some(next) = object.get(segments[index]) {
            current = next;
            index += 1;
            continue;
        }
        if index + 1 < segments.len() {
            let joined = format!("{}.{}", segments[index], segments[index + 1]);
            if let Some(next) = object.get(&joined) {
                current = next;
                index += 2;
                continue;
            }
        }
        return None;
    }
    Some(current.clone())
}

#[cfg(test)]
mod tests {
    use test_r::test;

    use super::*;
    use chrono::Utc;
    use mediaflow_common::model::{InputParams, StageExecution, TaskId};
    use mediaflow_common::node::NodeName;
    use serde_json::json;

    fn context_with_stages(input_data: Value) -> WorkflowContext {
        let mut context = WorkflowContext::new(
            TaskId::new("t1").unwrap(),
            InputParams {
                task_name: NodeName::FasterWhisperTranscribeAudio,
                input_data: input_data.as_object().unwrap().clone(),
                callback_url: "http://cb".to_string(),
            },
            "/share/workflows/t1".to_string(),
            Utc::now(),
        );
        context.set_stage(
            &NodeName::FfmpegExtractAudio,
            StageExecution::success(
                Map::new(),
                json!({"audio_path": "/share/workflows/t1/audio.wav"})
                    .as_object()
                    .unwrap()
                    .clone(),
                1.0,
            ),
            Utc::now(),
        );
        context.set_stage(
            &NodeName::AudioSeparatorSeparateVocals,
            StageExecution::success(
                Map::new(),
                json!({"vocal_audio": "/share/workflows/t1/vocal.wav"})
                    .as_object()
                    .unwrap()
                    .clone(),
                2.0,
            ),
            Utc::now(),
        );
        context
    }

    #[test]
    fn explicit_request_value_wins() {
        let context = context_with_stages(json!({"audio_path": "/explicit.wav"}));
        let resolved = resolve_parameters(
            &NodeName::FasterWhisperTranscribeAudio.descriptor(),
            &context,
            &HashMap::new(),
        )
        .unwrap();
        assert_eq!(resolved.get("audio_path").unwrap(), "/explicit.wav");
    }

    #[test]
    fn dynamic_reference_resolves_against_stage_output() {
        let context = context_with_stages(json!({
            "audio_path": "${{ stages.audio_separator.separate_vocals.output.vocal_audio }}"
        }));
        let resolved = resolve_parameters(
            &NodeName::FasterWhisperTranscribeAudio.descriptor(),
            &context,
            &HashMap::new(),
        )
        .unwrap();
        assert_eq!(
            resolved.get("audio_path").unwrap(),
            "/share/workflows/t1/vocal.wav"
        );
    }

    #[test]
    fn embedded_reference_substitutes_into_the_string() {
        let context = context_with_stages(json!({
            "output_name": "tts_${{ workflow_id }}.wav"
        }));
        let resolved = resolve_parameters(
            &NodeName::FasterWhisperTranscribeAudio.descriptor(),
            &context,
            &HashMap::new(),
        )
        .unwrap();
        assert_eq!(resolved.get("output_name").unwrap(), "tts_t1.wav");
    }

    #[test]
    fn unresolved_reference_is_an_input_error_naming_the_path() {
        let context = context_with_stages(json!({
            "audio_path": "${{ stages.ffmpeg.extract_audio.output.no_such_field }}"
        }));
        let error = resolve_parameters(
            &NodeName::FasterWhisperTranscribeAudio.descriptor(),
            &context,
            &HashMap::new(),
        )
        .unwrap_err();
        let message = error.to_string();
        assert!(message.contains("Input error"));
        assert!(message.contains("stages.ffmpeg.extract_audio.output.no_such_field"));
    }

    #[test]
    fn fallback_prefers_separated_vocals_over_extracted_audio() {
        let context = context_with_stages(json!({}));
        let resolved = resolve_parameters(
            &NodeName::FasterWhisperTranscribeAudio.descriptor(),
            &context,
            &HashMap::new(),
        )
        .unwrap();
        assert_eq!(
            resolved.get("audio_path").unwrap(),
            "/share/workflows/t1/vocal.wav"
        );
    }

    #[test]
    fn fallback_skips_missing_stages() {
        let mut context = context_with_stages(json!({}));
        context.stages.remove(
            NodeName::AudioSeparatorSeparateVocals.as_str(),
        );
        let resolved = resolve_parameters(
            &NodeName::FasterWhisperTranscribeAudio.descriptor(),
            &context,
            &HashMap::new(),
        )
        .unwrap();
        assert_eq!(
            resolved.get("audio_path").unwrap(),
            "/share/workflows/t1/audio.wav"
        );
    }

    #[test]
    fn global_default_fills_cache_key_inputs() {
        let mut context = context_with_stages(json!({}));
        context.input_params.task_name = NodeName::FfmpegExtractKeyframes;
        let mut defaults = HashMap::new();
        defaults.insert("keyframe_sample_count".to_string(), Value::from(100));
        let resolved = resolve_parameters(
            &NodeName::FfmpegExtractKeyframes.descriptor(),
            &context,
            &defaults,
        )
        .unwrap();
        assert_eq!(resolved.get("keyframe_sample_count").unwrap(), 100);
    }

    #[test]
    fn cyclic_references_are_detected() {
        // a stage output that references itself through the request value
        let mut context = context_with_stages(json!({
            "audio_path": "${{ stages.ffmpeg.extract_audio.output.audio_path }}"
        }));
        context.set_stage(
            &NodeName::FfmpegExtractAudio,
            StageExecution::success(
                Map::new(),
                json!({"audio_path": "${{ stages.ffmpeg.extract_audio.output.audio_path }}"})
                    .as_object()
                    .unwrap()
                    .clone(),
                1.0,
            ),
            Utc::now(),
        );
        let error = resolve_parameters(
            &NodeName::FasterWhisperTranscribeAudio.descriptor(),
            &context,
            &HashMap::new(),
        )
        .unwrap_err();
        assert!(error.to_string().contains("cyclic"));
    }

    #[test]
    fn more_than_one_reference_in_a_value_is_rejected() {
        let context = context_with_stages(json!({
            "audio_path": "${{ workflow_id }}_${{ shared_storage_path }}"
        }));
        let error = resolve_parameters(
            &NodeName::FasterWhisperTranscribeAudio.descriptor(),
            &context,
            &HashMap::new(),
        )
        .unwrap_err();
        assert!(error.to_string().contains("more than one"));
    }
}
