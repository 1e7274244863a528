//! 音频输出设备
//!
//! 引擎通过 `OutputDevice` / `OutputLine` 两个 trait 访问设备：
//! - `OutputDevice::open` 在播放线程上调用，返回独占的 `OutputLine`
//! - `OutputLine::write` 可以阻塞，直到设备接收整块数据（这是播放循环的节拍来源）
//! - `OutputLine::close` 消费自身，同一个 line 不可能被关闭两次
//!
//! `CpalOutput` 是默认实现：阻塞式 write → lock-free ring buffer → cpal 回调

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};

use cpal::traits::{DeviceTrait, HostTrait, StreamTrait};
use cpal::{FromSample, Sample, SizedSample};
use thiserror::Error;

use super::format::AudioFormat;
use super::ring_buffer::{PcmRing, RingError};
use super::stats::MixStats;

/// 音频输出错误
#[derive(Debug, Error)]
pub enum OutputError {
    #[error("no default audio output device")]
    NoDefaultDevice,

    #[error("output device '{0}' not found")]
    DeviceNotFound(String),

    #[error("format {0} not supported by device: {1}")]
    FormatNotSupported(AudioFormat, String),

    #[error("failed to open output stream: {0}")]
    OpenFailed(String),

    #[error("device write failed: {0}")]
    WriteFailed(String),
}

/// 可打开的输出设备
pub trait OutputDevice: Send + Sync {
    /// 用于日志的设备描述
    fn name(&self) -> String;

    /// 以指定格式打开设备，`buffer_bytes` 为播放循环每次 write 的字节数
    fn open(&self, format: AudioFormat, buffer_bytes: usize)
        -> Result<Box<dyn OutputLine>, OutputError>;
}

/// 已打开的输出通道，只在播放线程上使用
pub trait OutputLine {
    /// 写入整块交织 PCM，设备无空间时阻塞
    fn write(&mut self, bytes: &[u8]) -> Result<(), OutputError>;

    /// 等待已写入的数据播放完
    fn drain(&mut self) -> Result<(), OutputError>;

    /// 关闭设备
    fn close(self: Box<Self>);
}

/// 设备信息
#[derive(Debug, Clone)]
pub struct DeviceInfo {
    pub name: String,
    pub is_default: bool,
}

/// 列出所有输出设备
pub fn list_output_devices() -> Result<Vec<DeviceInfo>, OutputError> {
    let host = cpal::default_host();
    let default_name = host.default_output_device().and_then(|d| d.name().ok());

    let devices = host
        .output_devices()
        .map_err(|e| OutputError::OpenFailed(e.to_string()))?;

    Ok(devices
        .filter_map(|d| d.name().ok())
        .map(|name| DeviceInfo {
            is_default: default_name.as_deref() == Some(name.as_str()),
            name,
        })
        .collect())
}

/// ring buffer 相对单次 write 的倍数（双缓冲）
const RING_BUFFERS: usize = 2;

/// write 在这么久没有任何进展时判定设备失效
const STALL_TIMEOUT: Duration = Duration::from_secs(2);

/// 基于 cpal 的输出设备
pub struct CpalOutput {
    /// 指定设备名（None 表示系统默认设备）
    device_name: Option<String>,
    stats: Option<Arc<MixStats>>,
}

impl CpalOutput {
    pub fn new(device_name: Option<String>) -> Self {
        Self {
            device_name,
            stats: None,
        }
    }

    /// 设备回调中的 underrun 记录到 `stats`
    pub fn with_stats(mut self, stats: Arc<MixStats>) -> Self {
        self.stats = Some(stats);
        self
    }

    fn find_device(&self) -> Result<cpal::Device, OutputError> {
        let host = cpal::default_host();
        match &self.device_name {
            None => host.default_output_device().ok_or(OutputError::NoDefaultDevice),
            Some(name) => host
                .output_devices()
                .map_err(|e| OutputError::OpenFailed(e.to_string()))?
                .find(|d| d.name().map(|n| n == *name).unwrap_or(false))
                .ok_or_else(|| OutputError::DeviceNotFound(name.clone())),
        }
    }

    /// 选择支持目标格式的 stream 配置，优先 i16
    fn select_config(
        device: &cpal::Device,
        format: AudioFormat,
    ) -> Result<cpal::SupportedStreamConfig, OutputError> {
        let rate = cpal::SampleRate(format.sample_rate);
        let ranges: Vec<_> = device
            .supported_output_configs()
            .map_err(|e| OutputError::FormatNotSupported(format, e.to_string()))?
            .filter(|r| {
                r.channels() == format.channels
                    && r.min_sample_rate() <= rate
                    && r.max_sample_rate() >= rate
            })
            .collect();

        let preferred = [
            cpal::SampleFormat::I16,
            cpal::SampleFormat::F32,
            cpal::SampleFormat::U16,
        ];
        preferred
            .iter()
            .find_map(|&fmt| ranges.iter().find(|r| r.sample_format() == fmt))
            .map(|r| r.clone().with_sample_rate(rate))
            .ok_or_else(|| {
                OutputError::FormatNotSupported(format, "no matching stream config".into())
            })
    }
}

impl OutputDevice for CpalOutput {
    fn name(&self) -> String {
        self.device_name
            .clone()
            .unwrap_or_else(|| "default".to_string())
    }

    fn open(
        &self,
        format: AudioFormat,
        buffer_bytes: usize,
    ) -> Result<Box<dyn OutputLine>, OutputError> {
        let device = self.find_device()?;
        let device_name = device.name().unwrap_or_else(|_| "unknown".to_string());
        let supported = Self::select_config(&device, format)?;
        let config = supported.config();

        let buffer_frames = buffer_bytes / format.bytes_per_frame();
        let ring = Arc::new(PcmRing::new(buffer_frames * RING_BUFFERS));

        let shared = CallbackState {
            ring: Arc::clone(&ring),
            failed: Arc::new(AtomicBool::new(false)),
            primed: Arc::new(AtomicBool::new(false)),
            stats: self.stats.clone(),
        };

        let stream = match supported.sample_format() {
            cpal::SampleFormat::I16 => build_stream::<i16>(&device, &config, shared.clone())?,
            cpal::SampleFormat::F32 => build_stream::<f32>(&device, &config, shared.clone())?,
            cpal::SampleFormat::U16 => build_stream::<u16>(&device, &config, shared.clone())?,
            other => {
                return Err(OutputError::FormatNotSupported(
                    format,
                    format!("sample format {:?}", other),
                ))
            }
        };

        stream
            .play()
            .map_err(|e| OutputError::OpenFailed(e.to_string()))?;

        log::info!(
            "Output opened: {} | {} | device format {:?} | ring {} samples",
            device_name,
            format,
            supported.sample_format(),
            ring.capacity()
        );

        Ok(Box::new(CpalLine {
            stream,
            state: shared,
        }))
    }
}

/// 设备回调与播放线程共享的状态
#[derive(Clone)]
struct CallbackState {
    ring: Arc<PcmRing>,
    /// cpal 报告过错误
    failed: Arc<AtomicBool>,
    /// 已经开始写入数据（之前的空读不算 underrun）
    primed: Arc<AtomicBool>,
    stats: Option<Arc<MixStats>>,
}

fn build_stream<T>(
    device: &cpal::Device,
    config: &cpal::StreamConfig,
    state: CallbackState,
) -> Result<cpal::Stream, OutputError>
where
    T: SizedSample + FromSample<i16>,
{
    let failed = Arc::clone(&state.failed);
    let mut pcm: Vec<i16> = Vec::new();

    device
        .build_output_stream(
            config,
            move |data: &mut [T], _: &cpal::OutputCallbackInfo| {
                if pcm.len() < data.len() {
                    pcm.resize(data.len(), 0);
                }
                let pcm = &mut pcm[..data.len()];
                let n = state.ring.pop(pcm);
                if n < pcm.len() {
                    pcm[n..].fill(0);
                    if state.primed.load(Ordering::Relaxed) {
                        if let Some(stats) = &state.stats {
                            stats.record_underrun();
                        }
                    }
                }
                for (out, &s) in data.iter_mut().zip(pcm.iter()) {
                    *out = T::from_sample(s);
                }
            },
            move |err| {
                log::error!("Audio stream error: {}", err);
                failed.store(true, Ordering::Release);
            },
            None,
        )
        .map_err(|e| OutputError::OpenFailed(e.to_string()))
}

/// cpal 输出通道
pub struct CpalLine {
    stream: cpal::Stream,
    state: CallbackState,
}

impl From<RingError> for OutputError {
    fn from(e: RingError) -> Self {
        match e {
            RingError::Aborted => OutputError::WriteFailed("stream reported an error".into()),
            RingError::Stalled(_) => OutputError::WriteFailed(format!("device stopped consuming: {}", e)),
        }
    }
}

impl OutputLine for CpalLine {
    fn write(&mut self, bytes: &[u8]) -> Result<(), OutputError> {
        self.state.primed.store(true, Ordering::Relaxed);
        self.state
            .ring
            .push_blocking(bytes, STALL_TIMEOUT, &self.state.failed)?;
        Ok(())
    }

    fn drain(&mut self) -> Result<(), OutputError> {
        let ring = &self.state.ring;
        let queued_frames = ring.queued() / AudioFormat::STREAM.samples_per_frame();
        let deadline = Instant::now()
            + Duration::from_nanos(AudioFormat::STREAM.frames_to_ns(queued_frames))
            + STALL_TIMEOUT;

        if !ring.wait_empty(deadline, &self.state.failed)? {
            log::warn!("Drain timed out with {} samples queued", ring.queued());
        }
        self.state.primed.store(false, Ordering::Relaxed);
        Ok(())
    }

    fn close(self: Box<Self>) {
        if let Err(e) = self.stream.pause() {
            log::debug!("Failed to pause stream on close: {}", e);
        }
        drop(self);
        log::info!("Output closed");
    }
}
