//! PCM Mixer Library
//!
//! 实时多源混音引擎：任意数量的音频源在一个高优先级线程上求和，
//! 以固定的 44100 Hz / 16-bit / 立体声格式连续写入输出设备。

pub mod audio;
pub mod engine;
pub mod source;

pub use audio::{AudioFormat, MixStatsReport, OutputDevice, OutputError, OutputLine};
pub use engine::{EngineConfig, EngineError, MixEngine, SourceHandle, ThreadPriority};
pub use source::{Source, SourceError};
