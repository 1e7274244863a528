//! 内存音频片段
//!
//! 使用 symphonia 一次性解码到交织立体声 f32，播放时只做拷贝。
//! 不做采样率转换：只接受 44100 Hz 的文件。

use std::fs::File;
use std::path::Path;
use std::sync::atomic::{AtomicBool, AtomicU32, AtomicUsize, Ordering};

use symphonia::core::audio::SampleBuffer;
use symphonia::core::codecs::{DecoderOptions, CODEC_TYPE_NULL};
use symphonia::core::errors::Error as SymphoniaError;
use symphonia::core::formats::FormatOptions;
use symphonia::core::io::MediaSourceStream;
use symphonia::core::meta::MetadataOptions;
use symphonia::core::probe::Hint;
use thiserror::Error;

use super::{Source, SourceError};
use crate::audio::AudioFormat;

/// 片段加载错误
#[derive(Debug, Error)]
pub enum ClipError {
    #[error("failed to open file: {0}")]
    FileOpen(#[from] std::io::Error),

    #[error("unsupported audio format")]
    UnsupportedFormat,

    #[error("no audio track found")]
    NoAudioTrack,

    #[error("decode failed: {0}")]
    DecodeFailed(String),

    #[error("sample rate {0}Hz not supported (stream runs at {1}Hz)")]
    SampleRate(u32, u32),

    #[error("{0} channels not supported (mono or stereo only)")]
    Channels(usize),
}

/// 内存中的立体声片段
pub struct ClipSource {
    /// 交织立体声样本
    samples: Vec<f32>,
    /// 播放位置（帧）
    position: AtomicUsize,
    playing: AtomicBool,
    looping: AtomicBool,
    gain_bits: AtomicU32,
}

impl ClipSource {
    /// 从交织样本创建片段，单声道会复制到左右声道
    pub fn from_samples(samples: Vec<f32>, channels: usize) -> Result<Self, ClipError> {
        let samples = match channels {
            1 => samples.iter().flat_map(|&s| [s, s]).collect(),
            2 => samples,
            n => return Err(ClipError::Channels(n)),
        };

        Ok(Self {
            samples,
            position: AtomicUsize::new(0),
            playing: AtomicBool::new(true),
            looping: AtomicBool::new(false),
            gain_bits: AtomicU32::new(1.0f32.to_bits()),
        })
    }

    /// 解码音频文件
    pub fn open<P: AsRef<Path>>(path: P) -> Result<Self, ClipError> {
        let path = path.as_ref();
        let file = File::open(path)?;
        let mss = MediaSourceStream::new(Box::new(file), Default::default());

        let mut hint = Hint::new();
        if let Some(ext) = path.extension().and_then(|e| e.to_str()) {
            hint.with_extension(ext);
        }

        let probed = symphonia::default::get_probe()
            .format(
                &hint,
                mss,
                &FormatOptions::default(),
                &MetadataOptions::default(),
            )
            .map_err(|_| ClipError::UnsupportedFormat)?;
        let mut reader = probed.format;

        let track = reader
            .tracks()
            .iter()
            .find(|t| t.codec_params.codec != CODEC_TYPE_NULL)
            .ok_or(ClipError::NoAudioTrack)?;
        let track_id = track.id;
        let codec_params = track.codec_params.clone();

        let sample_rate = codec_params.sample_rate.ok_or(ClipError::NoAudioTrack)?;
        if sample_rate != AudioFormat::STREAM.sample_rate {
            return Err(ClipError::SampleRate(
                sample_rate,
                AudioFormat::STREAM.sample_rate,
            ));
        }

        let mut decoder = symphonia::default::get_codecs()
            .make(&codec_params, &DecoderOptions::default())
            .map_err(|e| ClipError::DecodeFailed(e.to_string()))?;

        let mut samples = Vec::new();
        let mut channels = codec_params.channels.map(|c| c.count()).unwrap_or(0);
        let mut sample_buf: Option<SampleBuffer<f32>> = None;

        loop {
            let packet = match reader.next_packet() {
                Ok(p) => p,
                Err(SymphoniaError::IoError(ref e))
                    if e.kind() == std::io::ErrorKind::UnexpectedEof =>
                {
                    break;
                }
                Err(e) => return Err(ClipError::DecodeFailed(e.to_string())),
            };

            if packet.track_id() != track_id {
                continue;
            }

            let decoded = match decoder.decode(&packet) {
                Ok(d) => d,
                Err(SymphoniaError::DecodeError(_)) => continue, // 跳过损坏的帧
                Err(e) => return Err(ClipError::DecodeFailed(e.to_string())),
            };

            let spec = *decoded.spec();
            channels = spec.channels.count();

            let needs_alloc = sample_buf
                .as_ref()
                .map(|b| b.capacity() < decoded.capacity() * channels)
                .unwrap_or(true);
            if needs_alloc {
                sample_buf = Some(SampleBuffer::new(decoded.capacity() as u64, spec));
            }
            if let Some(buf) = sample_buf.as_mut() {
                buf.copy_interleaved_ref(decoded);
                samples.extend_from_slice(buf.samples());
            }
        }

        let clip = Self::from_samples(samples, channels)?;
        log::info!(
            "Loaded clip {}: {} frames ({:.1}s)",
            path.display(),
            clip.frames(),
            clip.frames() as f64 / AudioFormat::STREAM.sample_rate as f64
        );
        Ok(clip)
    }

    /// 总帧数
    pub fn frames(&self) -> usize {
        self.samples.len() / 2
    }

    pub fn position(&self) -> usize {
        self.position.load(Ordering::Relaxed)
    }

    pub fn gain(&self) -> f32 {
        f32::from_bits(self.gain_bits.load(Ordering::Relaxed))
    }

    /// 线性增益，作用于之后的每次读取
    pub fn set_gain(&self, gain: f32) {
        self.gain_bits.store(gain.to_bits(), Ordering::Relaxed);
    }

    pub fn set_looping(&self, looping: bool) {
        self.looping.store(looping, Ordering::Relaxed);
    }

    /// 从头开始播放
    pub fn play(&self) {
        self.position.store(0, Ordering::Relaxed);
        self.playing.store(true, Ordering::Release);
    }

    pub fn pause(&self) {
        self.playing.store(false, Ordering::Release);
    }

    pub fn resume(&self) {
        if self.position() < self.frames() || self.looping.load(Ordering::Relaxed) {
            self.playing.store(true, Ordering::Release);
        }
    }
}

impl Source for ClipSource {
    fn is_playing(&self) -> bool {
        self.playing.load(Ordering::Acquire)
    }

    fn read(&self, buffer: &mut [f32]) -> Result<(), SourceError> {
        let total = self.samples.len();
        if total == 0 {
            buffer.fill(0.0);
            self.playing.store(false, Ordering::Release);
            return Ok(());
        }

        let looping = self.looping.load(Ordering::Relaxed);
        let mut pos = self.position.load(Ordering::Relaxed) * 2;
        let mut written = 0;

        while written < buffer.len() {
            if pos >= total {
                if !looping {
                    buffer[written..].fill(0.0);
                    self.playing.store(false, Ordering::Release);
                    break;
                }
                pos = 0;
            }
            let n = (buffer.len() - written).min(total - pos);
            buffer[written..written + n].copy_from_slice(&self.samples[pos..pos + n]);
            written += n;
            pos += n;
        }

        self.position.store(pos / 2, Ordering::Relaxed);

        let gain = self.gain();
        if gain != 1.0 {
            buffer[..written].iter_mut().for_each(|s| *s *= gain);
        }
        Ok(())
    }
}
