//! 音频核心模块
//!
//! 包含：
//! - Codec: 归一化样本与 16-bit PCM 的转换、声道增益
//! - Format: 固定输出流格式
//! - Ring Buffer: 播放线程到设备回调的 lock-free PCM 队列
//! - Stats: 混音统计
//! - Output: 输出设备抽象与 cpal 实现

pub mod codec;
pub mod format;
pub mod output;
pub mod ring_buffer;
pub mod stats;

pub use codec::{adjust_volume, device_bytes_to_normalized, normalized_to_device_bytes, CodecError};
pub use format::AudioFormat;
pub use output::{CpalOutput, OutputDevice, OutputError, OutputLine};
pub use ring_buffer::{PcmRing, RingError};
pub use stats::{MixStats, MixStatsReport};
