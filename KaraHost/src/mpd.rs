//! Minimal reading of DASH manifests: total duration and audio renditions.

use karacontrol::{AudioTrack, PlayerError};
use serde::Deserialize;

#[derive(Debug, Deserialize)]
#[serde(rename = "MPD")]
struct Mpd {
    #[serde(rename = "@mediaPresentationDuration", default)]
    media_presentation_duration: Option<String>,
    #[serde(rename = "Period", default)]
    periods: Vec<Period>,
}

#[derive(Debug, Deserialize)]
struct Period {
    #[serde(rename = "AdaptationSet", default)]
    adaptation_sets: Vec<AdaptationSet>,
}

#[derive(Debug, Deserialize)]
struct AdaptationSet {
    #[serde(rename = "@id", default)]
    id: Option<String>,
    #[serde(rename = "@contentType", default)]
    content_type: Option<String>,
    #[serde(rename = "@mimeType", default)]
    mime_type: Option<String>,
    #[serde(rename = "@lang", default)]
    lang: Option<String>,
    #[serde(rename = "Label", default)]
    label: Option<String>,
    #[serde(rename = "Representation", default)]
    representations: Vec<Representation>,
}

#[derive(Debug, Deserialize)]
struct Representation {
    #[serde(rename = "@mimeType", default)]
    mime_type: Option<String>,
}

impl AdaptationSet {
    fn is_audio(&self) -> bool {
        let audio_mime = |mime: &Option<String>| {
            mime.as_deref()
                .is_some_and(|mime| mime.starts_with("audio/"))
        };
        self.content_type.as_deref() == Some("audio")
            || audio_mime(&self.mime_type)
            || self
                .representations
                .iter()
                .any(|representation| audio_mime(&representation.mime_type))
    }
}

/// What the player needs from a manifest.
#[derive(Clone, Debug, PartialEq)]
pub struct ManifestInfo {
    /// Seconds, `None` when the manifest does not say.
    pub duration: Option<f64>,
    pub audio_tracks: Vec<AudioTrack>,
}

pub fn parse_manifest(xml: &str) -> Result<ManifestInfo, PlayerError> {
    let mpd: Mpd = quick_xml::de::from_str(xml)
        .map_err(|err| PlayerError::Manifest(format!("invalid MPD: {err}")))?;
    if mpd.periods.is_empty() {
        return Err(PlayerError::Manifest("MPD has no Period".to_string()));
    }

    let duration = mpd
        .media_presentation_duration
        .as_deref()
        .and_then(parse_iso_duration);

    let audio_tracks = mpd
        .periods
        .into_iter()
        .flat_map(|period| period.adaptation_sets)
        .filter(AdaptationSet::is_audio)
        .filter_map(|set| {
            // Les pistes sans id numérique ne peuvent pas être sélectionnées.
            let id = set.id.as_deref()?.trim().parse::<u32>().ok()?;
            Some(AudioTrack {
                id,
                lang: set.lang,
                label: set.label,
            })
        })
        .collect();

    Ok(ManifestInfo {
        duration,
        audio_tracks,
    })
}

const DATE_UNITS: &[(char, f64)] = &[('D', 86_400.0)];
const TIME_UNITS: &[(char, f64)] = &[('H', 3_600.0), ('M', 60.0), ('S', 1.0)];

/// Parses an ISO 8601 duration such as `PT3M25.4S` or `P1DT2H`, in seconds.
pub fn parse_iso_duration(s: &str) -> Option<f64> {
    let rest = s.trim().strip_prefix('P')?;
    let (date, time) = match rest.split_once('T') {
        Some((date, time)) => (date, Some(time)),
        None => (rest, None),
    };

    let mut total = 0.0;
    let mut seen = false;

    for (part, units) in [(date, DATE_UNITS), (time.unwrap_or(""), TIME_UNITS)] {
        let mut number = String::new();
        for c in part.chars() {
            if c.is_ascii_digit() || c == '.' {
                number.push(c);
                continue;
            }
            let (_, factor) = units.iter().find(|(unit, _)| *unit == c)?;
            let value: f64 = number.parse().ok()?;
            total += value * factor;
            number.clear();
            seen = true;
        }
        if !number.is_empty() {
            return None;
        }
    }

    if time == Some("") {
        return None;
    }
    seen.then_some(total)
}
