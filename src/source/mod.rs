//! 可混音音频源
//!
//! 引擎只依赖 `Source` 的两个能力：查询是否在播放、填充一块交织 f32 buffer。
//! 源的生命周期完全由调用方管理，引擎只持有 `Arc` 句柄。

mod clip;
mod tone;

pub use clip::{ClipError, ClipSource};
pub use tone::ToneSource;

use thiserror::Error;

/// 源读取失败
///
/// 只影响当前 tick：该源本 tick 贡献静音，下一 tick 自动重试
#[derive(Debug, Error)]
pub enum SourceError {
    #[error("source read failed: {0}")]
    ReadFailed(String),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
}

/// 可混音音频源
///
/// `read` 在播放线程上调用，应尽量避免分配和加锁。
/// buffer 为交织立体声（LRLR...），长度 = 帧数 × 2。
pub trait Source: Send + Sync {
    /// 当前是否在播放
    fn is_playing(&self) -> bool;

    /// 填充整个 buffer
    fn read(&self, buffer: &mut [f32]) -> Result<(), SourceError>;
}
