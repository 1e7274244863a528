//! 输出流格式
//!
//! 引擎只输出一种固定格式：44100 Hz / 16-bit signed / 立体声 / little-endian。
//! 采样率转换不在引擎内完成，需要其他格式的调用方自行转换。

/// 音频格式
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct AudioFormat {
    pub sample_rate: u32,
    pub channels: u16,
    pub bits_per_sample: u16,
}

impl AudioFormat {
    /// 引擎固定输出格式
    pub const STREAM: AudioFormat = AudioFormat {
        sample_rate: 44100,
        channels: 2,
        bits_per_sample: 16,
    };

    /// 每帧的样本数（= 声道数）
    #[inline]
    pub fn samples_per_frame(&self) -> usize {
        self.channels as usize
    }

    /// 每帧的字节数
    #[inline]
    pub fn bytes_per_frame(&self) -> usize {
        (self.bits_per_sample as usize / 8) * self.channels as usize
    }

    /// 每样本的字节数
    #[inline]
    pub fn bytes_per_sample(&self) -> usize {
        self.bits_per_sample as usize / 8
    }

    /// `frames` 帧对应的交织样本数
    #[inline]
    pub fn samples_for_frames(&self, frames: usize) -> usize {
        frames * self.samples_per_frame()
    }

    /// `frames` 帧对应的字节数
    #[inline]
    pub fn bytes_for_frames(&self, frames: usize) -> usize {
        frames * self.bytes_per_frame()
    }

    /// `frames` 帧的播放时长（纳秒）
    pub fn frames_to_ns(&self, frames: usize) -> u64 {
        frames as u64 * 1_000_000_000 / self.sample_rate as u64
    }
}

impl Default for AudioFormat {
    fn default() -> Self {
        Self::STREAM
    }
}

impl std::fmt::Display for AudioFormat {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(
            f,
            "{}Hz {}ch {}bit",
            self.sample_rate, self.channels, self.bits_per_sample
        )
    }
}
