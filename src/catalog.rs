use std::{cmp::Ordering, collections::HashSet};

use serde::Serialize;

use crate::extractor::{MediaKind, RawFormat};

/// A selectable stream variant as shown to the browser.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct FormatDescriptor {
    pub format_id: String,
    pub kind: MediaKind,
    #[serde(rename = "display_name")]
    pub label: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub height: Option<u32>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub fps: Option<u32>,
    #[serde(rename = "abr", skip_serializing_if = "Option::is_none")]
    pub bitrate_kbps: Option<u32>,
    pub ext: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub estimated_size_bytes: Option<u64>,
    pub has_audio: bool,
}

#[derive(Debug, Clone, Serialize)]
pub struct FormatCatalog {
    pub video: Vec<FormatDescriptor>,
    pub audio: Vec<FormatDescriptor>,
}

/// Groups raw formats into one entry per quality tier. Neither list is ever
/// empty: missing tiers are replaced by selector sentinels.
pub fn catalog_formats(formats: &[RawFormat]) -> FormatCatalog {
    let mut video = build_video_options(formats);
    let mut audio = build_audio_options(formats);

    if video.is_empty() {
        video = fallback_video_options();
    }
    if audio.is_empty() {
        audio = fallback_audio_options();
    }

    FormatCatalog { video, audio }
}

fn build_video_options(formats: &[RawFormat]) -> Vec<FormatDescriptor> {
    let mut candidates: Vec<&RawFormat> = formats
        .iter()
        .filter(|item| !item.format_id.is_empty() && item.has_video() && item.height.is_some())
        .collect();

    candidates.sort_by(|a, b| {
        b.height
            .cmp(&a.height)
            .then_with(|| compare_desc(a.fps, b.fps))
            .then_with(|| compare_desc(a.tbr, b.tbr))
    });

    let mut seen_heights = HashSet::new();
    candidates
        .into_iter()
        .filter(|item| seen_heights.insert(item.height))
        .map(|item| {
            let height = item.height.unwrap_or_default();
            let fps = item.fps.filter(|fps| *fps > 0.0).map(|fps| fps.round() as u32);
            let ext = item.ext.clone().unwrap_or_else(|| "mp4".to_string());
            let size = item.estimated_size();

            let mut label = format!("{height}p");
            if let Some(fps) = fps.filter(|fps| *fps > 30) {
                label.push_str(&format!(" {fps}fps"));
            }
            label.push_str(&format!(" ({})", ext.to_uppercase()));
            if let Some(size) = size {
                label.push_str(&format!(" - {}", format_filesize_mb(size)));
            }

            FormatDescriptor {
                format_id: item.format_id.clone(),
                kind: MediaKind::Video,
                label,
                height: Some(height),
                fps,
                bitrate_kbps: None,
                ext,
                estimated_size_bytes: size,
                has_audio: item.has_audio(),
            }
        })
        .collect()
}

fn build_audio_options(formats: &[RawFormat]) -> Vec<FormatDescriptor> {
    let mut candidates: Vec<(u32, &RawFormat)> = formats
        .iter()
        .filter(|item| !item.format_id.is_empty() && item.is_audio_only())
        .map(|item| {
            let bitrate = item
                .abr
                .or(item.tbr)
                .filter(|value| value.is_finite() && *value > 0.0)
                .map(|value| value.round() as u32)
                .unwrap_or_default();
            (bitrate, item)
        })
        .collect();

    candidates.sort_by(|a, b| b.0.cmp(&a.0).then_with(|| compare_desc(a.1.tbr, b.1.tbr)));

    let mut seen_tiers = HashSet::new();
    candidates
        .into_iter()
        .filter(|(bitrate, _)| seen_tiers.insert(*bitrate))
        .map(|(bitrate, item)| {
            let ext = item.ext.clone().unwrap_or_else(|| "m4a".to_string());
            let size = item.estimated_size();

            let mut label = format!("Audio Only ({})", ext.to_uppercase());
            if bitrate > 0 {
                label.push_str(&format!(" - {bitrate}kbps"));
            }
            if let Some(size) = size {
                label.push_str(&format!(" - {}", format_filesize_mb(size)));
            }

            FormatDescriptor {
                format_id: item.format_id.clone(),
                kind: MediaKind::Audio,
                label,
                height: None,
                fps: None,
                bitrate_kbps: (bitrate > 0).then_some(bitrate),
                ext,
                estimated_size_bytes: size,
                has_audio: true,
            }
        })
        .collect()
}

fn fallback_video_options() -> Vec<FormatDescriptor> {
    [("best", "Best Available", 1080), ("worst", "Lowest Quality", 360)]
        .into_iter()
        .map(|(format_id, label, height)| FormatDescriptor {
            format_id: format_id.to_string(),
            kind: MediaKind::Video,
            label: label.to_string(),
            height: Some(height),
            fps: None,
            bitrate_kbps: None,
            ext: "mp4".to_string(),
            estimated_size_bytes: None,
            has_audio: true,
        })
        .collect()
}

fn fallback_audio_options() -> Vec<FormatDescriptor> {
    vec![FormatDescriptor {
        format_id: "bestaudio".to_string(),
        kind: MediaKind::Audio,
        label: "Best Audio (M4A)".to_string(),
        height: None,
        fps: None,
        bitrate_kbps: Some(128),
        ext: "m4a".to_string(),
        estimated_size_bytes: None,
        has_audio: true,
    }]
}

fn compare_desc(a: Option<f32>, b: Option<f32>) -> Ordering {
    b.unwrap_or_default()
        .partial_cmp(&a.unwrap_or_default())
        .unwrap_or(Ordering::Equal)
}

fn format_filesize_mb(bytes: u64) -> String {
    let mb = bytes as f64 / 1_048_576.0;
    if mb > 1024.0 {
        format!("{:.2}GB", mb / 1024.0)
    } else {
        format!("{mb:.1}MB")
    }
}
