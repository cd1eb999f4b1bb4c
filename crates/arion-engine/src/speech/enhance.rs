//! Audio preprocessing ahead of transcription
//!
//! Recordings come back from the telephony server as raw telephone-band
//! wav files. Before they are worth a transcription call they are cleaned
//! with ffmpeg (band-pass 120–3800 Hz, FFT denoise, loudness normalize,
//! 16 kHz mono) and gated on a cheap silence check. The enhanced copies
//! are archived for audit.

use std::path::{Path, PathBuf};
use std::process::Stdio;

use tokio::process::Command;
use tracing::debug;

use super::{SpeechError, SpeechResult};

const FFMPEG_FILTER: &str = "highpass=f=120,lowpass=f=3800,afftdn,loudnorm";

/// Minimum usable speech: anything below any of these is treated as silence.
const MIN_DURATION_SECS: f64 = 0.1;
const MIN_RMS: f64 = 0.001;
const MIN_BYTES: u64 = 800;

/// Measurements of an enhanced recording.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct AudioStats {
    pub duration_secs: f64,
    /// RMS amplitude with full scale at 1.0.
    pub rms: f64,
    pub bytes: u64,
}

impl AudioStats {
    /// The pre-filter of the transcription pipeline: true means the
    /// transcription service must not be called at all.
    pub fn is_silent(&self) -> bool {
        self.duration_secs < MIN_DURATION_SECS || self.rms < MIN_RMS || self.bytes < MIN_BYTES
    }
}

/// ffmpeg-backed preprocessor writing enhanced copies into an archive dir.
pub struct Enhancer {
    archive_dir: PathBuf,
}

impl Enhancer {
    pub fn new(archive_dir: impl Into<PathBuf>) -> Self {
        let archive_dir = archive_dir.into();
        if let Err(e) = std::fs::create_dir_all(&archive_dir) {
            tracing::warn!(dir = %archive_dir.display(), error = %e, "cannot create archive dir");
        }
        Self { archive_dir }
    }

    /// Run the enhancement chain; returns the archived enhanced file.
    pub async fn enhance(&self, input: &Path) -> SpeechResult<PathBuf> {
        let stem = input
            .file_stem()
            .and_then(|s| s.to_str())
            .unwrap_or("recording");
        let output = self.archive_dir.join(format!("{stem}.enhanced.wav"));

        let status = Command::new("ffmpeg")
            .arg("-y")
            .arg("-i")
            .arg(input)
            .args(["-af", FFMPEG_FILTER, "-ar", "16000", "-ac", "1"])
            .arg(&output)
            .stdout(Stdio::null())
            .stderr(Stdio::null())
            .status()
            .await
            .map_err(|e| SpeechError::Preprocess(format!("spawning ffmpeg: {e}")))?;

        if !status.success() {
            return Err(SpeechError::Preprocess(format!(
                "ffmpeg exited with {status} for {}",
                input.display()
            )));
        }
        debug!(input = %input.display(), output = %output.display(), "audio enhanced");
        Ok(output)
    }

    /// Measure an enhanced wav file.
    pub fn inspect(path: &Path) -> SpeechResult<AudioStats> {
        let bytes = std::fs::metadata(path)
            .map_err(|e| SpeechError::Preprocess(format!("stat {}: {e}", path.display())))?
            .len();

        let mut reader = hound::WavReader::open(path)
            .map_err(|e| SpeechError::Preprocess(format!("open {}: {e}", path.display())))?;
        let spec = reader.spec();
        let mut sum_squares = 0.0f64;
        let mut count = 0u64;
        match spec.sample_format {
            hound::SampleFormat::Int => {
                let full_scale = (1i64 << (spec.bits_per_sample - 1)) as f64;
                for sample in reader.samples::<i32>() {
                    let sample = sample
                        .map_err(|e| SpeechError::Preprocess(format!("decode: {e}")))?
                        as f64
                        / full_scale;
                    sum_squares += sample * sample;
                    count += 1;
                }
            }
            hound::SampleFormat::Float => {
                for sample in reader.samples::<f32>() {
                    let sample =
                        sample.map_err(|e| SpeechError::Preprocess(format!("decode: {e}")))? as f64;
                    sum_squares += sample * sample;
                    count += 1;
                }
            }
        }

        let duration_secs = if spec.sample_rate == 0 {
            0.0
        } else {
            count as f64 / (spec.sample_rate as f64 * spec.channels as f64)
        };
        let rms = if count == 0 {
            0.0
        } else {
            (sum_squares / count as f64).sqrt()
        };
        Ok(AudioStats {
            duration_secs,
            rms,
            bytes,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn write_wav(path: &Path, samples: &[i16], sample_rate: u32) {
        let spec = hound::WavSpec {
            channels: 1,
            sample_rate,
            bits_per_sample: 16,
            sample_format: hound::SampleFormat::Int,
        };
        let mut writer = hound::WavWriter::create(path, spec).unwrap();
        for &sample in samples {
            writer.write_sample(sample).unwrap();
        }
        writer.finalize().unwrap();
    }

    #[test]
    fn loud_audio_passes_the_gate() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("loud.wav");
        // Half-second 16 kHz square-ish wave at a third of full scale.
        let samples: Vec<i16> = (0..8000)
            .map(|i| if i % 2 == 0 { 11000 } else { -11000 })
            .collect();
        write_wav(&path, &samples, 16000);
        let stats = Enhancer::inspect(&path).unwrap();
        assert!(!stats.is_silent(), "{stats:?}");
        assert!((stats.duration_secs - 0.5).abs() < 0.01);
    }

    #[test]
    fn quiet_audio_is_silent() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("quiet.wav");
        let samples = vec![1i16; 8000];
        write_wav(&path, &samples, 16000);
        let stats = Enhancer::inspect(&path).unwrap();
        assert!(stats.rms < MIN_RMS);
        assert!(stats.is_silent());
    }

    #[test]
    fn short_audio_is_silent() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("short.wav");
        let samples = vec![12000i16; 800]; // 50 ms at 16 kHz
        write_wav(&path, &samples, 16000);
        let stats = Enhancer::inspect(&path).unwrap();
        assert!(stats.duration_secs < MIN_DURATION_SECS);
        assert!(stats.is_silent());
    }

    #[test]
    fn tiny_file_is_silent_by_size() {
        let stats = AudioStats {
            duration_secs: 1.0,
            rms: 0.2,
            bytes: 700,
        };
        assert!(stats.is_silent());
    }
}
