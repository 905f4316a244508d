//! Waveform decoding.

use std::{fs::File, path::Path};

use anyhow::{bail, Context, Result};
use rubato::{Resampler, SincFixedIn, SincInterpolationParameters};
use symphonia::core::{audio::SampleBuffer, codecs::{DecoderOptions, CODEC_TYPE_NULL}, formats::FormatOptions, io::MediaSourceStream, meta::MetadataOptions, probe::Hint};

/// A single-channel waveform and the rate it was sampled at.
#[derive(Debug, Clone, PartialEq)]
pub struct Waveform {
    pub samples: Vec<f32>,
    pub sample_rate: u32,
}

impl Waveform {
    /// Subtracts the mean so the signal has no DC component.
    pub fn remove_dc(&mut self) {
        remove_dc(&mut self.samples);
    }
}

pub fn remove_dc(samples: &mut [f32]) {
    if samples.is_empty() {
        return;
    }
    let mean = (samples.iter().map(|&s| s as f64).sum::<f64>() / samples.len() as f64) as f32;
    for s in samples {
        *s -= mean;
    }
}

/// Decodes an audio file, keeping only its first channel.
pub fn load_waveform(path: &Path) -> Result<Waveform> {
    let file = File::open(path).with_context(|| format!("cannot open {}", path.display()))?;
    let mss = MediaSourceStream::new(Box::new(file), Default::default());

    let mut hint = Hint::new();
    if let Some(ext) = path.extension().and_then(|e| e.to_str()) {
        hint.with_extension(ext);
    }
    let meta_opts: MetadataOptions = Default::default();
    let fmt_opts: FormatOptions = Default::default();
    let probed = symphonia::default::get_probe().format(&hint, mss, &fmt_opts, &meta_opts)?;

    let mut format = probed.format;
    let track = format.tracks().iter().find(|t| t.codec_params.codec != CODEC_TYPE_NULL).context("No supported audio track!")?;
    let track_id = track.id;

    let sample_rate = track.codec_params.sample_rate.context("Missing sample rate!")?;
    let decode_options = DecoderOptions { verify: true };
    let mut decoder = symphonia::default::get_codecs().make(&track.codec_params, &decode_options)?;

    let mut samples = Vec::new();

    loop {
        match format.next_packet() {
            Ok(packet) => {
                if packet.track_id() != track_id {
                    continue;
                }
                let decoded = decoder.decode(&packet)?;
                let channel_count = decoded.spec().channels.count();
                let mut sample_buf = SampleBuffer::<f32>::new(decoded.capacity() as u64, *decoded.spec());
                sample_buf.copy_interleaved_ref(decoded);

                // The filterbank only ever looks at the first channel.
                samples.extend(sample_buf.samples().iter().step_by(channel_count.max(1)));
            }
            Err(symphonia::core::errors::Error::IoError(_)) => break, // End of stream
            Err(e) => bail!("Error during decoding: {}", e),
        }
    }
    if samples.is_empty() {
        bail!("{} decoded to zero samples", path.display());
    }

    Ok(Waveform { samples, sample_rate })
}

/// Loads a waveform, optionally resampling it to a fixed rate.
pub fn load_waveform_at(path: &Path, resample_to: Option<u32>) -> Result<Waveform> {
    let wav = load_waveform(path)?;
    match resample_to {
        Some(target) if target != wav.sample_rate => Ok(Waveform {
            samples: resample(wav.samples, wav.sample_rate, target)?,
            sample_rate: target,
        }),
        _ => Ok(wav),
    }
}

/// Resamples a single audio array to the target sample rate.
pub fn resample(audio_array: Vec<f32>, original_sr: u32, target_sr: u32) -> Result<Vec<f32>> {
    if original_sr == target_sr {
        return Ok(audio_array);
    }

    // Training data is resampled on every call, so trade a little quality for speed compared
    // to an offline conversion.
    let params = SincInterpolationParameters {
        sinc_len: 128,
        f_cutoff: 0.95,
        interpolation: rubato::SincInterpolationType::Linear,
        oversampling_factor: 128,
        window: rubato::WindowFunction::BlackmanHarris2,
    };

    let mut resampler = SincFixedIn::<f32>::new(
        target_sr as f64 / original_sr as f64,
        2.0,
        params,
        audio_array.len(),
        1, // Number of channels.
    )?;

    // Rubato expects a Vec<Vec<f32>>.
    let waves_in = vec![audio_array];
    let waves_out = resampler.process(&waves_in, None)?;

    waves_out.into_iter().next().context("resampler produced no channels")
}

#[cfg(test)]
mod tests {
    use hound::{SampleFormat, WavSpec, WavWriter};

    use super::*;

    fn write_wav(path: &Path, channels: u16, sample_rate: u32, frames: &[[f32; 2]]) {
        let spec = WavSpec { channels, sample_rate, bits_per_sample: 32, sample_format: SampleFormat::Float };
        let mut writer = WavWriter::create(path, spec).unwrap();
        for frame in frames {
            for &s in &frame[..channels as usize] {
                writer.write_sample(s).unwrap();
            }
        }
        writer.finalize().unwrap();
    }

    #[test]
    fn keeps_first_channel() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("stereo.wav");
        let frames: Vec<[f32; 2]> = (0..100).map(|i| [i as f32 / 100.0, -1.0]).collect();
        write_wav(&path, 2, 8000, &frames);

        let wav = load_waveform(&path).unwrap();
        assert_eq!(wav.sample_rate, 8000);
        assert_eq!(wav.samples.len(), 100);
        assert!((wav.samples[10] - 0.1).abs() < 1e-6);
    }

    #[test]
    fn missing_file_is_an_error() {
        assert!(load_waveform(Path::new("/no/such/file.wav")).is_err());
    }

    #[test]
    fn dc_removal_centres_signal() {
        let mut wav = Waveform { samples: vec![1.0, 2.0, 3.0], sample_rate: 1 };
        wav.remove_dc();
        assert_eq!(wav.samples, vec![-1.0, 0.0, 1.0]);
    }

    #[test]
    fn resampling_changes_length() {
        let samples: Vec<f32> = (0..16000).map(|i| (i as f32 * 0.01).sin()).collect();
        let out = resample(samples, 16000, 8000).unwrap();
        assert!((out.len() as i64 - 8000).abs() < 200, "got {}", out.len());
    }
}
