// Copyright 2024-2025 Mediaflow
//
// Licensed under the Apache License, Version 2.0 (the "License");
// you may not use this file except in compliance with the License.
// You may obtain a copy of the License at
//
//     http://www.apache.org/licenses/LICENSE-2.0
//
// Unless required by applicable law or agreed to in writing, software
// distributed under the License is distributed on an "AS IS" BASIS,
// WITHOUT WARRANTIES OR CONDITIONS OF ANY KIND, either express or implied.
// See the License for the specific language governing permissions and
// limitations under the License.

use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use std::collections::BTreeMap;
use std::fmt::{Display, Formatter};
use std::str::FromStr;

/// The closed catalog of compute nodes. Any task name outside this list is
/// rejected at the gateway with a 400.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Ord, PartialOrd, Serialize, Deserialize)]
pub enum NodeName {
    #[serde(rename = "ffmpeg.extract_audio")]
    FfmpegExtractAudio,
    #[serde(rename = "ffmpeg.extract_keyframes")]
    FfmpegExtractKeyframes,
    #[serde(rename = "ffmpeg.crop_subtitle_images")]
    FfmpegCropSubtitleImages,
    #[serde(rename = "ffmpeg.split_audio_segments")]
    FfmpegSplitAudioSegments,
    #[serde(rename = "faster_whisper.transcribe_audio")]
    FasterWhisperTranscribeAudio,
    #[serde(rename = "audio_separator.separate_vocals")]
    AudioSeparatorSeparateVocals,
    #[serde(rename = "pyannote_audio.diarize_speakers")]
    PyannoteDiarizeSpeakers,
    #[serde(rename = "pyannote_audio.get_speaker_segments")]
    PyannoteGetSpeakerSegments,
    #[serde(rename = "pyannote_audio.validate_diarization")]
    PyannoteValidateDiarization,
    #[serde(rename = "paddleocr.detect_subtitle_area")]
    PaddleocrDetectSubtitleArea,
    #[serde(rename = "paddleocr.create_stitched_images")]
    PaddleocrCreateStitchedImages,
    #[serde(rename = "paddleocr.perform_ocr")]
    PaddleocrPerformOcr,
    #[serde(rename = "paddleocr.postprocess_and_finalize")]
    PaddleocrPostprocessAndFinalize,
    #[serde(rename = "indextts.generate_speech")]
    IndexttsGenerateSpeech,
    #[serde(rename = "wservice.generate_subtitle_files")]
    WserviceGenerateSubtitleFiles,
    #[serde(rename = "wservice.correct_subtitles")]
    WserviceCorrectSubtitles,
    #[serde(rename = "wservice.ai_optimize_subtitles")]
    WserviceAiOptimizeSubtitles,
    #[serde(rename = "wservice.merge_speaker_segments")]
    WserviceMergeSpeakerSegments,
    #[serde(rename = "wservice.merge_with_word_timestamps")]
    WserviceMergeWithWordTimestamps,
    #[serde(rename = "wservice.prepare_tts_segments")]
    WservicePrepareTtsSegments,
}

pub const ALL_NODE_NAMES: &[NodeName] = &[
    NodeName::FfmpegExtractAudio,
    NodeName::FfmpegExtractKeyframes,
    NodeName::FfmpegCropSubtitleImages,
    NodeName::FfmpegSplitAudioSegments,
    NodeName::FasterWhisperTranscribeAudio,
    NodeName::AudioSeparatorSeparateVocals,
    NodeName::PyannoteDiarizeSpeakers,
    NodeName::PyannoteGetSpeakerSegments,
    NodeName::PyannoteValidateDiarization,
    NodeName::PaddleocrDetectSubtitleArea,
    NodeName::PaddleocrCreateStitchedImages,
    NodeName::PaddleocrPerformOcr,
    NodeName::PaddleocrPostprocessAndFinalize,
    NodeName::IndexttsGenerateSpeech,
    NodeName::WserviceGenerateSubtitleFiles,
    NodeName::WserviceCorrectSubtitles,
    NodeName::WserviceAiOptimizeSubtitles,
    NodeName::WserviceMergeSpeakerSegments,
    NodeName::WserviceMergeWithWordTimestamps,
    NodeName::WservicePrepareTtsSegments,
];

impl NodeName {
    pub fn as_str(&self) -> &'static str {
        match self {
            NodeName::FfmpegExtractAudio => "ffmpeg.extract_audio",
            NodeName::FfmpegExtractKeyframes => "ffmpeg.extract_keyframes",
            NodeName::FfmpegCropSubtitleImages => "ffmpeg.crop_subtitle_images",
            NodeName::FfmpegSplitAudioSegments => "ffmpeg.split_audio_segments",
            NodeName::FasterWhisperTranscribeAudio => "faster_whisper.transcribe_audio",
            NodeName::AudioSeparatorSeparateVocals => "audio_separator.separate_vocals",
            NodeName::PyannoteDiarizeSpeakers => "pyannote_audio.diarize_speakers",
            NodeName::PyannoteGetSpeakerSegments => "pyannote_audio.get_speaker_segments",
            NodeName::PyannoteValidateDiarization => "pyannote_audio.validate_diarization",
            NodeName::PaddleocrDetectSubtitleArea => "paddleocr.detect_subtitle_area",
            NodeName::PaddleocrCreateStitchedImages => "paddleocr.create_stitched_images",
            NodeName::PaddleocrPerformOcr => "paddleocr.perform_ocr",
            NodeName::PaddleocrPostprocessAndFinalize => "paddleocr.postprocess_and_finalize",
            NodeName::IndexttsGenerateSpeech => "indextts.generate_speech",
            NodeName::WserviceGenerateSubtitleFiles => "wservice.generate_subtitle_files",
            NodeName::WserviceCorrectSubtitles => "wservice.correct_subtitles",
            NodeName::WserviceAiOptimizeSubtitles => "wservice.ai_optimize_subtitles",
            NodeName::WserviceMergeSpeakerSegments => "wservice.merge_speaker_segments",
            NodeName::WserviceMergeWithWordTimestamps => "wservice.merge_with_word_timestamps",
            NodeName::WservicePrepareTtsSegments => "wservice.prepare_tts_segments",
        }
    }

    /// Queue topic carrying dispatches for this node.
    pub fn queue_topic(&self) -> String {
        format!("task_queue:{}", self.as_str())
    }
}

impl Display for NodeName {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

impl FromStr for NodeName {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        ALL_NODE_NAMES
            .iter()
            .find(|name| name.as_str() == s)
            .copied()
            .ok_or_else(|| format!("unknown task_name: {s}"))
    }
}

/// Whether a node's core logic needs the GPU lock.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum GpuRequirement {
    Never,
    Always,
    /// Decided at execute time from config or inputs (e.g. ASR on CPU,
    /// diarization through a paid remote API).
    Conditional,
}

/// One fallback source: an earlier stage's output field.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct FallbackSource {
    pub stage: NodeName,
    pub field: &'static str,
}

/// Ordered fallback chain for one logically-optional input.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct InputFallback {
    pub input: &'static str,
    pub sources: &'static [FallbackSource],
}

/// Static execution contract of a node: everything the gateway and the
/// workers need to know about it without touching its core logic.
#[derive(Debug, Clone, Copy)]
pub struct NodeDescriptor {
    pub name: NodeName,
    pub gpu: GpuRequirement,
    /// Input fields whose values together fully determine the output.
    pub cache_key_fields: &'static [&'static str],
    /// Output keys that must be present and non-empty for a valid cache hit.
    pub required_output_fields: &'static [&'static str],
    /// Path fields whose names do not match a standard suffix.
    pub custom_path_fields: &'static [&'static str],
    pub fallbacks: &'static [InputFallback],
}

impl NodeName {
    pub fn descriptor(&self) -> NodeDescriptor {
        use NodeName::*;
        match self {
            FfmpegExtractAudio => NodeDescriptor {
                name: *self,
                gpu: GpuRequirement::Never,
                cache_key_fields: &["video_path"],
                required_output_fields: &["audio_path"],
                custom_path_fields: &[],
                fallbacks: &[],
            },
            FfmpegExtractKeyframes => NodeDescriptor {
                name: *self,
                gpu: GpuRequirement::Never,
                cache_key_fields: &["video_path", "keyframe_sample_count"],
                required_output_fields: &["keyframe_dir"],
                custom_path_fields: &[],
                fallbacks: &[],
            },
            FfmpegCropSubtitleImages => NodeDescriptor {
                name: *self,
                gpu: GpuRequirement::Always,
                cache_key_fields: &["video_path", "subtitle_area"],
                required_output_fields: &["cropped_images_path"],
                custom_path_fields: &[],
                fallbacks: &[InputFallback {
                    input: "subtitle_area",
                    sources: &[FallbackSource {
                        stage: PaddleocrDetectSubtitleArea,
                        field: "subtitle_area",
                    }],
                }],
            },
            FfmpegSplitAudioSegments => NodeDescriptor {
                name: *self,
                gpu: GpuRequirement::Never,
                cache_key_fields: &["audio_path", "subtitle_path"],
                required_output_fields: &["audio_segments_dir"],
                custom_path_fields: &[],
                fallbacks: &[
                    InputFallback {
                        input: "audio_path",
                        sources: &[
                            FallbackSource {
                                stage: AudioSeparatorSeparateVocals,
                                field: "vocal_audio",
                            },
                            FallbackSource {
                                stage: FfmpegExtractAudio,
                                field: "audio_path",
                            },
                        ],
                    },
                    InputFallback {
                        input: "subtitle_path",
                        sources: &[
                            FallbackSource {
                                stage: WserviceCorrectSubtitles,
                                field: "corrected_subtitle_path",
                            },
                            FallbackSource {
                                stage: WserviceGenerateSubtitleFiles,
                                field: "subtitle_path",
                            },
                        ],
                    },
                ],
            },
            FasterWhisperTranscribeAudio => NodeDescriptor {
                name: *self,
                gpu: GpuRequirement::Conditional,
                cache_key_fields: &["audio_path", "enable_word_timestamps"],
                required_output_fields: &["segments_file"],
                custom_path_fields: &[],
                fallbacks: &[InputFallback {
                    input: "audio_path",
                    sources: &[
                        FallbackSource {
                            stage: AudioSeparatorSeparateVocals,
                            field: "vocal_audio",
                        },
                        FallbackSource {
                            stage: FfmpegExtractAudio,
                            field: "audio_path",
                        },
                    ],
                }],
            },
            AudioSeparatorSeparateVocals => NodeDescriptor {
                name: *self,
                gpu: GpuRequirement::Always,
                cache_key_fields: &["audio_path", "audio_separator_config"],
                required_output_fields: &["vocal_audio"],
                custom_path_fields: &["vocal_audio", "all_audio_files"],
                fallbacks: &[InputFallback {
                    input: "audio_path",
                    sources: &[FallbackSource {
                        stage: FfmpegExtractAudio,
                        field: "audio_path",
                    }],
                }],
            },
            PyannoteDiarizeSpeakers => NodeDescriptor {
                name: *self,
                gpu: GpuRequirement::Conditional,
                cache_key_fields: &["audio_path", "use_paid_api"],
                required_output_fields: &["diarization_file"],
                custom_path_fields: &[],
                fallbacks: &[InputFallback {
                    input: "audio_path",
                    sources: &[
                        FallbackSource {
                            stage: AudioSeparatorSeparateVocals,
                            field: "vocal_audio",
                        },
                        FallbackSource {
                            stage: FfmpegExtractAudio,
                            field: "audio_path",
                        },
                    ],
                }],
            },
            PyannoteGetSpeakerSegments => NodeDescriptor {
                name: *self,
                gpu: GpuRequirement::Never,
                cache_key_fields: &["diarization_file", "speaker"],
                required_output_fields: &["speaker_segments_file"],
                custom_path_fields: &[],
                fallbacks: &[InputFallback {
                    input: "diarization_file",
                    sources: &[FallbackSource {
                        stage: PyannoteDiarizeSpeakers,
                        field: "diarization_file",
                    }],
                }],
            },
            PyannoteValidateDiarization => NodeDescriptor {
                name: *self,
                gpu: GpuRequirement::Never,
                cache_key_fields: &["diarization_file"],
                required_output_fields: &["validation"],
                custom_path_fields: &[],
                fallbacks: &[InputFallback {
                    input: "diarization_file",
                    sources: &[FallbackSource {
                        stage: PyannoteDiarizeSpeakers,
                        field: "diarization_file",
                    }],
                }],
            },
            PaddleocrDetectSubtitleArea => NodeDescriptor {
                name: *self,
                gpu: GpuRequirement::Always,
                cache_key_fields: &["keyframe_dir"],
                required_output_fields: &["subtitle_area"],
                custom_path_fields: &[],
                fallbacks: &[InputFallback {
                    input: "keyframe_dir",
                    sources: &[FallbackSource {
                        stage: FfmpegExtractKeyframes,
                        field: "keyframe_dir",
                    }],
                }],
            },
            PaddleocrCreateStitchedImages => NodeDescriptor {
                name: *self,
                gpu: GpuRequirement::Always,
                cache_key_fields: &["cropped_images_path", "subtitle_area"],
                required_output_fields: &["multi_frames_path"],
                custom_path_fields: &[],
                fallbacks: &[
                    InputFallback {
                        input: "cropped_images_path",
                        sources: &[FallbackSource {
                            stage: FfmpegCropSubtitleImages,
                            field: "cropped_images_path",
                        }],
                    },
                    InputFallback {
                        input: "subtitle_area",
                        sources: &[FallbackSource {
                            stage: PaddleocrDetectSubtitleArea,
                            field: "subtitle_area",
                        }],
                    },
                ],
            },
            PaddleocrPerformOcr => NodeDescriptor {
                name: *self,
                gpu: GpuRequirement::Always,
                cache_key_fields: &["manifest_path", "multi_frames_path"],
                required_output_fields: &["ocr_results_path"],
                custom_path_fields: &[],
                fallbacks: &[
                    InputFallback {
                        input: "manifest_path",
                        sources: &[FallbackSource {
                            stage: PaddleocrCreateStitchedImages,
                            field: "manifest_path",
                        }],
                    },
                    InputFallback {
                        input: "multi_frames_path",
                        sources: &[FallbackSource {
                            stage: PaddleocrCreateStitchedImages,
                            field: "multi_frames_path",
                        }],
                    },
                ],
            },
            PaddleocrPostprocessAndFinalize => NodeDescriptor {
                name: *self,
                gpu: GpuRequirement::Never,
                cache_key_fields: &["ocr_results_file", "manifest_file", "video_path"],
                required_output_fields: &["srt_file"],
                custom_path_fields: &[],
                fallbacks: &[
                    InputFallback {
                        input: "ocr_results_file",
                        sources: &[FallbackSource {
                            stage: PaddleocrPerformOcr,
                            field: "ocr_results_path",
                        }],
                    },
                    InputFallback {
                        input: "manifest_file",
                        sources: &[FallbackSource {
                            stage: PaddleocrCreateStitchedImages,
                            field: "manifest_path",
                        }],
                    },
                ],
            },
            IndexttsGenerateSpeech => NodeDescriptor {
                name: *self,
                gpu: GpuRequirement::Always,
                cache_key_fields: &["text", "spk_audio_prompt", "output_path"],
                required_output_fields: &["audio_path"],
                custom_path_fields: &[],
                fallbacks: &[],
            },
            WserviceGenerateSubtitleFiles => NodeDescriptor {
                name: *self,
                gpu: GpuRequirement::Never,
                cache_key_fields: &["segments_file"],
                required_output_fields: &["subtitle_path"],
                custom_path_fields: &[],
                fallbacks: &[InputFallback {
                    input: "segments_file",
                    sources: &[FallbackSource {
                        stage: FasterWhisperTranscribeAudio,
                        field: "segments_file",
                    }],
                }],
            },
            WserviceCorrectSubtitles => NodeDescriptor {
                name: *self,
                gpu: GpuRequirement::Never,
                cache_key_fields: &["subtitle_path", "subtitle_correction"],
                required_output_fields: &["corrected_subtitle_path"],
                custom_path_fields: &[],
                fallbacks: &[InputFallback {
                    input: "subtitle_path",
                    sources: &[FallbackSource {
                        stage: WserviceGenerateSubtitleFiles,
                        field: "subtitle_path",
                    }],
                }],
            },
            WserviceAiOptimizeSubtitles => NodeDescriptor {
                name: *self,
                gpu: GpuRequirement::Never,
                cache_key_fields: &["segments_file", "subtitle_optimization"],
                required_output_fields: &["optimized_file_path"],
                custom_path_fields: &[],
                fallbacks: &[InputFallback {
                    input: "segments_file",
                    sources: &[FallbackSource {
                        stage: FasterWhisperTranscribeAudio,
                        field: "segments_file",
                    }],
                }],
            },
            WserviceMergeSpeakerSegments => NodeDescriptor {
                name: *self,
                gpu: GpuRequirement::Never,
                cache_key_fields: &["segments_file", "diarization_file"],
                required_output_fields: &["merged_segments"],
                custom_path_fields: &[],
                fallbacks: &[
                    InputFallback {
                        input: "segments_file",
                        sources: &[FallbackSource {
                            stage: FasterWhisperTranscribeAudio,
                            field: "segments_file",
                        }],
                    },
                    InputFallback {
                        input: "diarization_file",
                        sources: &[FallbackSource {
                            stage: PyannoteDiarizeSpeakers,
                            field: "diarization_file",
                        }],
                    },
                ],
            },
            WserviceMergeWithWordTimestamps => NodeDescriptor {
                name: *self,
                gpu: GpuRequirement::Never,
                cache_key_fields: &["segments_file", "diarization_file"],
                required_output_fields: &["merged_segments"],
                custom_path_fields: &[],
                fallbacks: &[
                    InputFallback {
                        input: "segments_file",
                        sources: &[FallbackSource {
                            stage: FasterWhisperTranscribeAudio,
                            field: "segments_file",
                        }],
                    },
                    InputFallback {
                        input: "diarization_file",
                        sources: &[FallbackSource {
                            stage: PyannoteDiarizeSpeakers,
                            field: "diarization_file",
                        }],
                    },
                ],
            },
            WservicePrepareTtsSegments => NodeDescriptor {
                name: *self,
                gpu: GpuRequirement::Never,
                cache_key_fields: &["segments_file"],
                required_output_fields: &["prepared_segments"],
                custom_path_fields: &[],
                fallbacks: &[InputFallback {
                    input: "segments_file",
                    sources: &[FallbackSource {
                        stage: FasterWhisperTranscribeAudio,
                        field: "segments_file",
                    }],
                }],
            },
        }
    }
}

/// Well-known suffixes identifying output fields that carry filesystem paths.
pub const PATH_FIELD_SUFFIXES: &[&str] = &[
    "_path", "_file", "_dir", "_data", "_audio", "_video", "_image",
];

/// Duration aliases that must never appear in node outputs; the stage-scope
/// `duration` is the single source of timing.
pub const FORBIDDEN_DURATION_ALIASES: &[&str] =
    &["processing_time", "transcribe_duration", "execution_time"];

pub fn is_path_field(field: &str, custom_path_fields: &[&str]) -> bool {
    if field.ends_with("_minio_url") || field.ends_with("_minio_urls") {
        return false;
    }
    custom_path_fields.contains(&field)
        || PATH_FIELD_SUFFIXES
            .iter()
            .any(|suffix| field.ends_with(suffix))
}

pub fn minio_url_field(field: &str) -> String {
    format!("{field}_minio_url")
}

pub fn minio_urls_field(field: &str) -> String {
    format!("{field}_minio_urls")
}

pub fn compression_info_field(field: &str) -> String {
    format!("{field}_compression_info")
}

/// Non-empty check used by the reuse policy: numeric zero and boolean false
/// are valid values and count as present.
pub fn is_non_empty_output_value(value: &Value) -> bool {
    match value {
        Value::Null => false,
        Value::String(s) => !s.is_empty(),
        Value::Array(a) => !a.is_empty(),
        Value::Object(o) => !o.is_empty(),
        Value::Number(_) | Value::Bool(_) => true,
    }
}

/// A stage is reusable iff it ended in SUCCESS and every required output
/// field is present and non-empty.
pub fn can_reuse(descriptor: &NodeDescriptor, output: &Map<String, Value>) -> bool {
    descriptor.required_output_fields.iter().all(|field| {
        output
            .get(*field)
            .map(is_non_empty_output_value)
            .unwrap_or(false)
    })
}

/// Informational reuse key: md5 over the node name and the sorted JSON of the
/// cache-key field values. The primary reuse mechanism is the presence check
/// in [`can_reuse`]; this key exists for diagnostics and future cross-task
/// sharing.
pub fn cache_key(descriptor: &NodeDescriptor, resolved_inputs: &Map<String, Value>) -> String {
    let mut keyed: BTreeMap<&str, &Value> = BTreeMap::new();
    for field in descriptor.cache_key_fields {
        keyed.insert(field, resolved_inputs.get(*field).unwrap_or(&Value::Null));
    }
    let serialized =
        serde_json::to_string(&keyed).expect("cache key fields are always serializable");
    let digest = md5::compute(format!("{}:{}", descriptor.name.as_str(), serialized));
    format!("{digest:x}")
}

#[cfg(test)]
mod tests {
    use test_r::test;

    use super::*;
    use serde_json::json;

    #[test]
    fn catalog_is_closed_and_round_trips() {
        assert_eq!(ALL_NODE_NAMES.len(), 20);
        for name in ALL_NODE_NAMES {
            assert_eq!(NodeName::from_str(name.as_str()).unwrap(), *name);
            let serialized = serde_json::to_string(name).unwrap();
            assert_eq!(serialized, format!("\"{}\"", name.as_str()));
        }
        assert!(NodeName::from_str("ffmpeg.does_not_exist").is_err());
    }

    #[test]
    fn path_fields_follow_suffixes_and_custom_declarations() {
        assert!(is_path_field("audio_path", &[]));
        assert!(is_path_field("segments_file", &[]));
        assert!(is_path_field("keyframe_dir", &[]));
        assert!(is_path_field("vocal_audio", &[]));
        assert!(is_path_field("all_audio_files", &["all_audio_files"]));
        assert!(!is_path_field("all_audio_files", &[]));
        assert!(!is_path_field("language", &[]));
        assert!(!is_path_field("keyframe_files_count", &[]));
        assert!(!is_path_field("audio_path_minio_url", &[]));
    }

    #[test]
    fn zero_and_false_count_as_present_for_reuse() {
        let descriptor = NodeName::PyannoteValidateDiarization.descriptor();
        let output = json!({"validation": {"valid": false}})
            .as_object()
            .unwrap()
            .clone();
        assert!(can_reuse(&descriptor, &output));

        assert!(is_non_empty_output_value(&json!(0)));
        assert!(is_non_empty_output_value(&json!(false)));
        assert!(!is_non_empty_output_value(&json!("")));
        assert!(!is_non_empty_output_value(&json!([])));
        assert!(!is_non_empty_output_value(&json!(null)));
    }

    #[test]
    fn reuse_requires_every_declared_field() {
        let descriptor = NodeName::FfmpegExtractAudio.descriptor();
        let hit = json!({"audio_path": "/share/workflows/t/audio.wav"})
            .as_object()
            .unwrap()
            .clone();
        let miss = json!({"audio_path": ""}).as_object().unwrap().clone();
        assert!(can_reuse(&descriptor, &hit));
        assert!(!can_reuse(&descriptor, &miss));
        assert!(!can_reuse(&descriptor, &Map::new()));
    }

    #[test]
    fn cache_key_is_stable_under_input_order() {
        let descriptor = NodeName::FfmpegExtractKeyframes.descriptor();
        let a = json!({"video_path": "/v.mp4", "keyframe_sample_count": 100, "noise": 1})
            .as_object()
            .unwrap()
            .clone();
        let b = json!({"keyframe_sample_count": 100, "video_path": "/v.mp4"})
            .as_object()
            .unwrap()
            .clone();
        assert_eq!(cache_key(&descriptor, &a), cache_key(&descriptor, &b));

        let c = json!({"keyframe_sample_count": 200, "video_path": "/v.mp4"})
            .as_object()
            .unwrap()
            .clone();
        assert_ne!(cache_key(&descriptor, &a), cache_key(&descriptor, &c));
    }

    #[test]
    fn transcription_falls_back_to_separated_then_extracted_audio() {
        let descriptor = NodeName::FasterWhisperTranscribeAudio.descriptor();
        let chain = descriptor
            .fallbacks
            .iter()
            .find(|f| f.input == "audio_path")
            .unwrap();
        assert_eq!(
            chain.sources[0].stage,
            NodeName::AudioSeparatorSeparateVocals
        );
        assert_eq!(chain.sources[0].field, "vocal_audio");
        assert_eq!(chain.sources[1].stage, NodeName::FfmpegExtractAudio);
    }
}
