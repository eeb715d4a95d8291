pub mod audio_separator;
pub mod ffmpeg;
pub mod faster_whisper;
pub mod indextts;
pub mod paddleocr;
pub mod pyannote;
pub mod subtitles;
pub mod wservice;

use crate::executor::NodeExecutor;
use mediaflow_common::node::NodeName;
use std::collections::HashMap;
use std::sync::Arc;

/// Maps every catalog name to its executor. The gateway validates names
/// against the same closed catalog, so lookups here only fail for a
/// mis-deployed worker.
pub struct NodeRegistry {
    executors: HashMap<NodeName, Arc<dyn NodeExecutor>>,
}

impl NodeRegistry {
    pub fn new() -> Self {
        let mut executors: HashMap<NodeName, Arc<dyn NodeExecutor>> = HashMap::new();

        executors.insert(
            NodeName::FfmpegExtractAudio,
            Arc::new(ffmpeg::ExtractAudio),
        );
        executors.insert(
            NodeName::FfmpegExtractKeyframes,
            Arc::new(ffmpeg::ExtractKeyframes),
        );
        executors.insert(
            NodeName::FfmpegCropSubtitleImages,
            Arc::new(ffmpeg::CropSubtitleImages),
        );
        executors.insert(
            NodeName::FfmpegSplitAudioSegments,
            Arc::new(ffmpeg::SplitAudioSegments),
        );
        executors.insert(
            NodeName::FasterWhisperTranscribeAudio,
            Arc::new(faster_whisper::TranscribeAudio),
        );
        executors.insert(
            NodeName::AudioSeparatorSeparateVocals,
            Arc::new(audio_separator::SeparateVocals),
        );
        executors.insert(
            NodeName::PyannoteDiarizeSpeakers,
            Arc::new(pyannote::DiarizeSpeakers),
        );
        executors.insert(
            NodeName::PyannoteGetSpeakerSegments,
            Arc::new(pyannote::GetSpeakerSegments),
        );
        executors.insert(
            NodeName::PyannoteValidateDiarization,
            Arc::new(pyannote::ValidateDiarization),
        );
        executors.insert(
            NodeName::PaddleocrDetectSubtitleArea,
            Arc::new(paddleocr::DetectSubtitleArea),
        );
        executors.insert(
            NodeName::PaddleocrCreateStitchedImages,
            Arc::new(paddleocr::CreateStitchedImages),
        );
        executors.insert(
            NodeName::PaddleocrPerformOcr,
            Arc::new(paddleocr::PerformOcr),
        );
        executors.insert(
            NodeName::PaddleocrPostprocessAndFinalize,
            Arc::new(paddleocr::PostprocessAndFinalize),
        );
        executors.insert(
            NodeName::IndexttsGenerateSpeech,
            Arc::new(indextts::GenerateSpeech),
        );
        executors.insert(
            NodeName::WserviceGenerateSubtitleFiles,
            Arc::new(wservice::GenerateSubtitleFiles),
        );
        executors.insert(
            NodeName::WserviceCorrectSubtitles,
            Arc::new(wservice::CorrectSubtitles),
        );
        executors.insert(
            NodeName::WserviceAiOptimizeSubtitles,
            Arc::new(wservice::AiOptimizeSubtitles),
        );
        executors.insert(
            NodeName::WserviceMergeSpeakerSegments,
            Arc::new(wservice::MergeSpeakerSegments),
        );
        executors.insert(
            NodeName::WserviceMergeWithWordTimestamps,
            Arc::new(wservice::MergeWithWordTimestamps),
        );
        executors.insert(
            NodeName::WservicePrepareTtsSegments,
            Arc::new(wservice::PrepareTtsSegments),
        );

        NodeRegistry { executors }
    }

    pub fn get(&self, name: &NodeName) -> Option<Arc<dyn NodeExecutor>> {
        self.executors.get(name).cloned()
    }
}

impl Default for NodeRegistry {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use test_r::test;

    use super::*;
    use mediaflow_common::node::ALL_NODE_NAMES;

    #[test]
    fn every_catalog_node_has_an_executor() {
        let registry = NodeRegistry::new();
        for name in ALL_NODE_NAMES {
            let executor = registry
                .get(name)
                .unwrap_or_else(|| panic!("no executor for {name}"));
            assert_eq!(executor.name(), *name);
        }
    }
}
