//! Device capability discovery.
//!
//! Capabilities come from OS-level records when available - the HDA codec
//! dump at `/proc/asound/cardN/codec#0` and the USB stream descriptor at
//! `/proc/asound/cardN/stream0` - and otherwise fall back to the active
//! mixer configuration. Every record is tagged with its source so the UI
//! can explain to a user why a device advertises what it does.

use std::path::Path;

use serde::Serialize;

use crate::audio::SampleCodec;

/// Where a capability record came from.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum CapabilitySource {
    /// Parsed from an HDA codec dump.
    HdaCodec,
    /// Parsed from a USB audio stream descriptor.
    UsbStream,
    /// PulseAudio reported its server-side maximums.
    PulseAudioMax,
    /// Fallback: current ALSA mixer configuration.
    Alsa,
}

/// What a playback device advertises.
#[derive(Debug, Clone, Serialize)]
pub struct DeviceCapabilities {
    /// Supported sample rates in Hz, ascending.
    pub sample_rates: Vec<u32>,
    /// Maximum channel count.
    pub max_channels: u16,
    /// Supported sample encodings.
    pub formats: Vec<SampleCodec>,
    /// Where this record came from.
    pub source: CapabilitySource,
}

impl DeviceCapabilities {
    /// Conservative fallback record for the given source tag.
    #[must_use]
    pub fn fallback(source: CapabilitySource) -> Self {
        match source {
            CapabilitySource::PulseAudioMax => Self {
                // The server resamples to anything; these are its defaults.
                sample_rates: vec![44_100, 48_000, 88_200, 96_000, 176_400, 192_000],
                max_channels: 8,
                formats: vec![SampleCodec::S16, SampleCodec::S24, SampleCodec::S32, SampleCodec::F32],
                source,
            },
            _ => Self {
                sample_rates: vec![44_100, 48_000],
                max_channels: 2,
                formats: vec![SampleCodec::S16, SampleCodec::S32],
                source,
            },
        }
    }
}

/// Parses an HDA codec dump (`/proc/asound/cardN/codec#0`).
///
/// The interesting lines look like:
///
/// ```text
///     rates [0x5e0]: 44100 48000 88200 96000 192000
///     bits [0xe]: 16 20 24
/// ```
///
/// Channel count comes from the widget caps `Stereo` / `x-channel` markers;
/// absent those, stereo is assumed.
#[must_use]
pub fn parse_hda_codec(text: &str) -> Option<DeviceCapabilities> {
    let mut sample_rates: Vec<u32> = Vec::new();
    let mut bits: Vec<u32> = Vec::new();
    let mut max_channels: u16 = 2;

    for line in text.lines() {
        let trimmed = line.trim();
        if let Some(rest) = trimmed.strip_prefix("rates ") {
            if let Some((_, values)) = rest.split_once(':') {
                for token in values.split_whitespace() {
                    if let Ok(rate) = token.parse::<u32>() {
                        if !sample_rates.contains(&rate) {
                            sample_rates.push(rate);
                        }
                    }
                }
            }
        } else if let Some(rest) = trimmed.strip_prefix("bits ") {
            if let Some((_, values)) = rest.split_once(':') {
                for token in values.split_whitespace() {
                    if let Ok(b) = token.parse::<u32>() {
                        if !bits.contains(&b) {
                            bits.push(b);
                        }
                    }
                }
            }
        } else if let Some(idx) = trimmed.find("-channel") {
            // e.g. "Pincap ...: 8-channel mapping"
            let prefix = &trimmed[..idx];
            if let Some(num) = prefix.split_whitespace().last() {
                if let Ok(ch) = num.parse::<u16>() {
                    max_channels = max_channels.max(ch);
                }
            }
        }
    }

    if sample_rates.is_empty() {
        return None;
    }
    sample_rates.sort_unstable();

    let mut formats = Vec::new();
    if bits.contains(&16) {
        formats.push(SampleCodec::S16);
    }
    if bits.contains(&24) || bits.contains(&20) {
        formats.push(SampleCodec::S24);
    }
    if bits.contains(&32) {
        formats.push(SampleCodec::S32);
    }
    if formats.is_empty() {
        formats.push(SampleCodec::S16);
    }

    Some(DeviceCapabilities {
        sample_rates,
        max_channels,
        formats,
        source: CapabilitySource::HdaCodec,
    })
}

/// Parses a USB audio stream descriptor (`/proc/asound/cardN/stream0`).
///
/// Playback interfaces list their altsettings as:
///
/// ```text
/// Playback:
///   Interface 1
///     Altset 1
///     Format: S24_3LE
///     Channels: 2
///     Rates: 44100, 48000, 88200, 96000
/// ```
#[must_use]
pub fn parse_usb_stream(text: &str) -> Option<DeviceCapabilities> {
    // Only the Playback half of the descriptor is relevant.
    let playback = match text.split_once("Playback:") {
        Some((_, rest)) => rest.split("Capture:").next().unwrap_or(rest),
        None => return None,
    };

    let mut sample_rates: Vec<u32> = Vec::new();
    let mut formats: Vec<SampleCodec> = Vec::new();
    let mut max_channels: u16 = 0;

    for line in playback.lines() {
        let trimmed = line.trim();
        if let Some(rest) = trimmed.strip_prefix("Rates:") {
            for token in rest.split(',') {
                if let Ok(rate) = token.trim().parse::<u32>() {
                    if !sample_rates.contains(&rate) {
                        sample_rates.push(rate);
                    }
                }
            }
        } else if let Some(rest) = trimmed.strip_prefix("Channels:") {
            if let Ok(ch) = rest.trim().parse::<u16>() {
                max_channels = max_channels.max(ch);
            }
        } else if let Some(rest) = trimmed.strip_prefix("Format:") {
            let codec = match rest.trim() {
                "S16_LE" | "S16_BE" => Some(SampleCodec::S16),
                "S24_LE" | "S24_BE" | "S24_3LE" | "S24_3BE" => Some(SampleCodec::S24),
                "S32_LE" | "S32_BE" => Some(SampleCodec::S32),
                "FLOAT_LE" | "FLOAT_BE" => Some(SampleCodec::F32),
                _ => None,
            };
            if let Some(codec) = codec {
                if !formats.contains(&codec) {
                    formats.push(codec);
                }
            }
        }
    }

    if sample_rates.is_empty() {
        return None;
    }
    sample_rates.sort_unstable();
    if max_channels == 0 {
        max_channels = 2;
    }
    if formats.is_empty() {
        formats.push(SampleCodec::S16);
    }

    Some(DeviceCapabilities {
        sample_rates,
        max_channels,
        formats,
        source: CapabilitySource::UsbStream,
    })
}

/// Reads capabilities for ALSA card `index` from `/proc/asound`.
///
/// HDA codec dumps are preferred; USB stream descriptors second; `None`
/// when neither exists or parses, letting the caller fall back to the
/// mixer configuration.
#[must_use]
pub fn read_card_capabilities(proc_root: &Path, index: u32) -> Option<DeviceCapabilities> {
    let card_dir = proc_root.join(format!("card{index}"));
    if let Ok(text) = std::fs::read_to_string(card_dir.join("codec#0")) {
        if let Some(caps) = parse_hda_codec(&text) {
            return Some(caps);
        }
    }
    if let Ok(text) = std::fs::read_to_string(card_dir.join("stream0")) {
        if let Some(caps) = parse_usb_stream(&text) {
            return Some(caps);
        }
    }
    None
}

/// Probes capabilities for a device id of the form `hw:N` or `hw:N,M`.
#[must_use]
pub fn probe_device(device_id: &str) -> Option<DeviceCapabilities> {
    let index: u32 = device_id
        .strip_prefix("hw:")?
        .split(',')
        .next()?
        .parse()
        .ok()?;
    read_card_capabilities(Path::new("/proc/asound"), index)
}

#[cfg(test)]
mod tests {
    use super::*;

    const HDA_DUMP: &str = r#"Codec: Realtek ALC892
Address: 0
Node 0x02 [Audio Output] wcaps 0x41d: Stereo Amp-Out
  PCM:
    rates [0x560]: 44100 48000 96000 192000
    bits [0xe]: 16 20 24
    formats [0x1]: PCM
Node 0x06 [Audio Output] wcaps 0x411: Stereo
  Pincap 0x00010014: OUT EAPD Detect
  Pin Default 0x01014010: [Jack] Line Out at Ext Rear
    Conn = 1/8, 8-channel mapping
"#;

    const USB_DUMP: &str = r#"HiFi DAC at usb-0000:00:14.0-2, high speed : USB Audio

Playback:
  Status: Stop
  Interface 1
    Altset 1
    Format: S24_3LE
    Channels: 2
    Endpoint: 3 OUT (ASYNC)
    Rates: 44100, 48000, 88200, 96000
  Interface 1
    Altset 2
    Format: S16_LE
    Channels: 2
    Endpoint: 3 OUT (ASYNC)
    Rates: 44100, 48000

Capture:
  Status: Stop
  Interface 2
    Altset 1
    Format: S16_LE
    Channels: 1
    Rates: 48000
"#;

    #[test]
    fn parses_hda_codec_dump() {
        let caps = parse_hda_codec(HDA_DUMP).unwrap();
        assert_eq!(caps.sample_rates, vec![44_100, 48_000, 96_000, 192_000]);
        assert_eq!(caps.max_channels, 8);
        assert_eq!(caps.formats, vec![SampleCodec::S16, SampleCodec::S24]);
        assert_eq!(caps.source, CapabilitySource::HdaCodec);
    }

    #[test]
    fn parses_usb_stream_descriptor() {
        let caps = parse_usb_stream(USB_DUMP).unwrap();
        assert_eq!(caps.sample_rates, vec![44_100, 48_000, 88_200, 96_000]);
        assert_eq!(caps.max_channels, 2);
        assert!(caps.formats.contains(&SampleCodec::S24));
        assert!(caps.formats.contains(&SampleCodec::S16));
        assert_eq!(caps.source, CapabilitySource::UsbStream);
    }

    #[test]
    fn usb_parser_ignores_capture_side() {
        let caps = parse_usb_stream(USB_DUMP).unwrap();
        // Capture lists 1 channel; playback max must win.
        assert_eq!(caps.max_channels, 2);
    }

    #[test]
    fn unparseable_text_yields_none() {
        assert!(parse_hda_codec("not a codec dump").is_none());
        assert!(parse_usb_stream("not a stream file").is_none());
    }

    #[test]
    fn missing_card_falls_back_to_none() {
        let dir = tempfile::tempdir().unwrap();
        assert!(read_card_capabilities(dir.path(), 0).is_none());
    }

    #[test]
    fn reads_codec_dump_from_proc_layout() {
        let dir = tempfile::tempdir().unwrap();
        let card = dir.path().join("card0");
        std::fs::create_dir_all(&card).unwrap();
        std::fs::write(card.join("codec#0"), HDA_DUMP).unwrap();

        let caps = read_card_capabilities(dir.path(), 0).unwrap();
        assert_eq!(caps.source, CapabilitySource::HdaCodec);
    }

    #[test]
    fn pulse_fallback_is_tagged() {
        let caps = DeviceCapabilities::fallback(CapabilitySource::PulseAudioMax);
        assert_eq!(caps.source, CapabilitySource::PulseAudioMax);
        assert_eq!(caps.max_channels, 8);
    }
}
