//! Shared transcript, diarization and subtitle-file formats used by the
//! post-processing nodes.

use crate::executor::NodeError;
use serde::{Deserialize, Serialize};
use std::path::Path;

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct WordTimestamp {
    pub start: f64,
    pub end: f64,
    pub word: String,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TranscriptSegment {
    pub start: f64,
    pub end: f64,
    pub text: String,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub words: Vec<WordTimestamp>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub speaker: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Default, Serialize, Deserialize)]
pub struct TranscriptFile {
    #[serde(default)]
    pub language: Option<String>,
    #[serde(default)]
    pub segments: Vec<TranscriptSegment>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DiarizationSegment {
    pub start: f64,
    pub end: f64,
    pub speaker: String,
}

#[derive(Debug, Clone, PartialEq, Default, Serialize, Deserialize)]
pub struct DiarizationFile {
    #[serde(default)]
    pub speakers: Vec<String>,
    #[serde(default)]
    pub segments: Vec<DiarizationSegment>,
}

pub fn read_transcript(path: &Path) -> Result<TranscriptFile, NodeError> {
    let raw = std::fs::read_to_string(path).map_err(|err| {
        NodeError::InvalidInput(format!("cannot read segments file {}: {err}", path.display()))
    })?;
    serde_json::from_str(&raw).map_err(|err| {
        NodeError::InvalidInput(format!(
            "segments file {} is not valid transcript JSON: {err}",
            path.display()
        ))
    })
}

pub fn read_diarization(path: &Path) -> Result<DiarizationFile, NodeError> {
    let raw = std::fs::read_to_string(path).map_err(|err| {
        NodeError::InvalidInput(format!(
            "cannot read diarization file {}: {err}",
            path.display()
        ))
    })?;
    serde_json::from_str(&raw).map_err(|err| {
        NodeError::InvalidInput(format!(
            "diarization file {} is not valid JSON: {err}",
            path.display()
        ))
    })
}

/// Overlap in seconds between two `[start, end)` intervals.
pub fn overlap(a_start: f64, a_end: f64, b_start: f64, b_end: f64) -> f64 {
    (a_end.min(b_end) - a_start.max(b_start)).max(0.0)
}

#[derive(Debug, Clone, PartialEq)]
pub struct SrtCue {
    pub index: u64,
    pub start: f64,
    pub end: f64,
    pub text: String,
}

pub fn format_srt_timestamp(seconds: f64) -> String {
    let total_millis = (seconds.max(0.0) * 1000.0).round() as u64;
    let millis = total_millis % 1000;
    let total_seconds = total_millis / 1000;
    format!(
        "{:02}:{:02}:{:02},{:03}",
        total_seconds / 3600,
        (total_seconds % 3600) / 60,
        total_seconds % 60,
        millis
    )
}

pub fn parse_srt_timestamp(raw: &str) -> Result<f64, NodeError> {
    let normalized = raw.trim().replace(',', ".");
    let mut parts = normalized.split(':');
    let (Some(hours), Some(minutes), Some(seconds), None) =
        (parts.next(), parts.next(), parts.next(), parts.next())
    else {
        return Err(NodeError::InvalidInput(format!(
            "invalid SRT timestamp: {raw}"
        )));
    };
    let hours: f64 = hours
        .parse()
        .map_err(|_| NodeError::InvalidInput(format!("invalid SRT timestamp: {raw}")))?;
    let minutes: f64 = minutes
        .parse()
        .map_err(|_| NodeError::InvalidInput(format!("invalid SRT timestamp: {raw}")))?;
    let seconds: f64 = seconds
        .parse()
        .map_err(|_| NodeError::InvalidInput(format!("invalid SRT timestamp: {raw}")))?;
    Ok(hours * 3600.0 + minutes * 60.0 + seconds)
}

pub fn parse_srt(content: &str) -> Result<Vec<SrtCue>, NodeError> {
    let mut cues = Vec::new();
    for block in content.replace("\r\n", "\n").split("\n\n") {
        let block = block.trim();
        if block.is_empty() {
            continue;
        }
        let mut lines = block.lines();
        let index_line = lines.next().unwrap_or_default().trim();
        let timing_line = lines.next().unwrap_or_default().trim();
        let index: u64 = index_line.parse().map_err(|_| {
            NodeError::InvalidInput(format!("invalid SRT cue index: {index_line}"))
        })?;
        let (start_raw, end_raw) = timing_line.split_once("-->").ok_or_else(|| {
            NodeError::InvalidInput(format!("invalid SRT timing line: {timing_line}"))
        })?;
        let text = lines.collect::<Vec<_>>().join("\n");
        cues.push(SrtCue {
            index,
            start: parse_srt_timestamp(start_raw)?,
            end: parse_srt_timestamp(end_raw)?,
            text,
        });
    }
    Ok(cues)
}

pub fn format_srt(cues: &[SrtCue]) -> String {
    let mut out = String::new();
    for (position, cue) in cues.iter().enumerate() {
        out.push_str(&format!(
            "{}\n{} --> {}\n{}\n\n",
            position + 1,
            format_srt_timestamp(cue.start),
            format_srt_timestamp(cue.end),
            cue.text
        ));
    }
    out
}

pub fn format_vtt(cues: &[SrtCue]) -> String {
    let mut out = String::from("WEBVTT\n\n");
    for cue in cues {
        out.push_str(&format!(
            "{} --> {}\n{}\n\n",
            format_srt_timestamp(cue.start).replace(',', "."),
            format_srt_timestamp(cue.end).replace(',', "."),
            cue.text
        ));
    }
    out
}

pub fn segments_to_cues(segments: &[TranscriptSegment]) -> Vec<SrtCue> {
    segments
        .iter()
        .enumerate()
        .map(|(position, segment)| SrtCue {
            index: position as u64 + 1,
            start: segment.start,
            end: segment.end,
            text: segment.text.trim().to_string(),
        })
        .collect()
}

#[cfg(test)]
mod tests {
    use test_r::test;

    use super::*;

    const SAMPLE: &str = "1\n00:00:01,000 --> 00:00:02,500\nhello world\n\n2\n00:00:03,000 --> 00:00:04,000\nsecond line\nwith wrap\n";

    #[test]
    fn srt_round_trips() {
        let cues = parse_srt(SAMPLE).unwrap();
        assert_eq!(cues.len(), 2);
        assert_eq!(cues[0].start, 1.0);
        assert_eq!(cues[0].end, 2.5);
        assert_eq!(cues[1].text, "second line\nwith wrap");

        let formatted = format_srt(&cues);
        let reparsed = parse_srt(&formatted).unwrap();
        assert_eq!(cues, reparsed);
    }

    #[test]
    fn timestamps_format_with_milliseconds() {
        assert_eq!(format_srt_timestamp(3661.25), "01:01:01,250");
        assert_eq!(parse_srt_timestamp("01:01:01,250").unwrap(), 3661.25);
    }

    #[test]
    fn overlap_is_zero_for_disjoint_intervals() {
        assert_eq!(overlap(0.0, 1.0, 2.0, 3.0), 0.0);
        assert_eq!(overlap(0.0, 2.0, 1.0, 3.0), 1.0);
    }
}
