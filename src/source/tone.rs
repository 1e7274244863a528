//! 正弦测试音源

use std::sync::atomic::{AtomicBool, AtomicU32, AtomicU64, Ordering};

use super::{Source, SourceError};
use crate::audio::AudioFormat;

/// 立体声正弦音
///
/// 相位以帧为单位原子推进，`read` 只在播放线程调用
pub struct ToneSource {
    frequency: f64,
    gain_bits: AtomicU32,
    playing: AtomicBool,
    frame_pos: AtomicU64,
}

impl ToneSource {
    pub fn new(frequency: f64, gain: f32) -> Self {
        Self {
            frequency,
            gain_bits: AtomicU32::new(gain.to_bits()),
            playing: AtomicBool::new(true),
            frame_pos: AtomicU64::new(0),
        }
    }

    pub fn frequency(&self) -> f64 {
        self.frequency
    }

    pub fn gain(&self) -> f32 {
        f32::from_bits(self.gain_bits.load(Ordering::Relaxed))
    }

    pub fn set_gain(&self, gain: f32) {
        self.gain_bits.store(gain.to_bits(), Ordering::Relaxed);
    }

    pub fn set_playing(&self, playing: bool) {
        self.playing.store(playing, Ordering::Release);
    }
}

impl Source for ToneSource {
    fn is_playing(&self) -> bool {
        self.playing.load(Ordering::Acquire)
    }

    fn read(&self, buffer: &mut [f32]) -> Result<(), SourceError> {
        let channels = AudioFormat::STREAM.samples_per_frame();
        let frames = buffer.len() / channels;
        let start = self.frame_pos.fetch_add(frames as u64, Ordering::Relaxed);

        let gain = self.gain();
        let step = std::f64::consts::TAU * self.frequency / AudioFormat::STREAM.sample_rate as f64;

        for (i, frame) in buffer.chunks_exact_mut(channels).enumerate() {
            let value = ((start + i as u64) as f64 * step).sin() as f32 * gain;
            frame.fill(value);
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_tone_is_bounded_by_gain() {
        let tone = ToneSource::new(440.0, 0.25);
        let mut buf = vec![0.0f32; 4096];
        tone.read(&mut buf).unwrap();

        assert!(buf.iter().all(|s| s.abs() <= 0.25 + 1e-6));
        assert!(buf.iter().any(|s| s.abs() > 0.2));
        // 左右声道相同
        assert!(buf.chunks_exact(2).all(|f| f[0] == f[1]));
    }

    #[test]
    fn test_phase_continues_across_reads() {
        let a = ToneSource::new(1000.0, 1.0);
        let mut whole = vec![0.0f32; 512];
        a.read(&mut whole).unwrap();

        let b = ToneSource::new(1000.0, 1.0);
        let mut first = vec![0.0f32; 256];
        let mut second = vec![0.0f32; 256];
        b.read(&mut first).unwrap();
        b.read(&mut second).unwrap();

        assert_eq!(&whole[..256], &first[..]);
        assert_eq!(&whole[256..], &second[..]);
    }

    #[test]
    fn test_play_toggle() {
        let tone = ToneSource::new(220.0, 0.5);
        assert!(tone.is_playing());
        tone.set_playing(false);
        assert!(!tone.is_playing());
    }
}
