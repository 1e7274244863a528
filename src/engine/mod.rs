//! 混音引擎
//!
//! 整合注册表、播放线程和输出设备
//! 核心设计：调用方线程与播放线程之间唯一的交接是注册表快照，双方都不阻塞对方

mod playback;
mod priority;
mod registry;

#[cfg(test)]
pub(crate) mod testing;

pub use playback::{LoopState, Mixer, PlaybackLoop};
pub use priority::ThreadPriority;
pub use registry::{Snapshot, SourceHandle, SourceRegistry};

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, MutexGuard};
use std::thread::{self, JoinHandle};

use thiserror::Error;

use crate::audio::{AudioFormat, CpalOutput, MixStats, MixStatsReport, OutputDevice, OutputError};
use playback::ThreadContext;

/// 引擎配置
#[derive(Clone, Debug)]
pub struct EngineConfig {
    /// 每个 tick 的帧数，决定延迟和单次设备写入大小
    pub buffer_frames: usize,
    /// 播放线程优先级
    pub thread_priority: ThreadPriority,
    /// 指定输出设备名（None 表示系统默认设备）
    pub device: Option<String>,
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            // 2048 帧 @ 44.1kHz ≈ 46ms
            buffer_frames: 2048,
            thread_priority: ThreadPriority::Highest,
            device: None,
        }
    }
}

impl EngineConfig {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn buffer_frames(mut self, frames: usize) -> Self {
        self.buffer_frames = frames;
        self
    }

    pub fn thread_priority(mut self, priority: ThreadPriority) -> Self {
        self.thread_priority = priority;
        self
    }

    pub fn device(mut self, name: impl Into<String>) -> Self {
        self.device = Some(name.into());
        self
    }
}

/// 引擎错误
#[derive(Debug, Error)]
pub enum EngineError {
    #[error("output device unavailable: {0}")]
    DeviceUnavailable(#[source] OutputError),

    #[error("invalid configuration: {0}")]
    InvalidConfig(&'static str),

    #[error("failed to spawn playback thread: {0}")]
    Spawn(#[from] std::io::Error),
}

/// 一次 start → stop 的播放会话
///
/// 每个会话有独立的 playing 标志，旧线程收尾时不会被新会话的标志重新拉起
struct Session {
    playing: Arc<AtomicBool>,
    thread: JoinHandle<()>,
}

impl Session {
    fn is_playing(&self) -> bool {
        self.playing.load(Ordering::Acquire)
    }

    fn join(self) {
        if self.thread.join().is_err() {
            log::error!("Playback thread panicked");
        }
    }
}

/// 混音引擎
///
/// 所有方法都只需 `&self`，可以放进 `Arc` 在多个线程间共享
pub struct MixEngine {
    config: EngineConfig,
    device: Arc<dyn OutputDevice>,
    registry: Arc<SourceRegistry>,
    stats: Arc<MixStats>,
    /// 串行化 start / close；join 和等待设备打开时只持有它
    lifecycle: Mutex<()>,
    session: Mutex<Option<Session>>,
}

impl MixEngine {
    /// 使用指定输出设备创建引擎
    pub fn new(config: EngineConfig, device: Arc<dyn OutputDevice>) -> Self {
        Self::with_stats(config, device, Arc::new(MixStats::new()))
    }

    /// 使用 cpal 输出（`config.device` 指定的设备或系统默认设备）
    pub fn with_default_output(config: EngineConfig) -> Self {
        let stats = Arc::new(MixStats::new());
        let device = CpalOutput::new(config.device.clone()).with_stats(Arc::clone(&stats));
        Self::with_stats(config, Arc::new(device), stats)
    }

    fn with_stats(config: EngineConfig, device: Arc<dyn OutputDevice>, stats: Arc<MixStats>) -> Self {
        Self {
            config,
            device,
            registry: Arc::new(SourceRegistry::new()),
            stats,
            lifecycle: Mutex::new(()),
            session: Mutex::new(None),
        }
    }

    /// 开始播放
    ///
    /// 已在播放时为 no-op。设备在播放线程上打开，打开结果同步返回；
    /// 打开失败时引擎保持未播放状态。
    pub fn start(&self) -> Result<(), EngineError> {
        let _lifecycle = self.lock_lifecycle();

        let previous = {
            let mut session = self.lock_session();
            if session.as_ref().is_some_and(Session::is_playing) {
                return Ok(());
            }
            if self.config.buffer_frames == 0 {
                return Err(EngineError::InvalidConfig("buffer_frames must be greater than zero"));
            }
            session.take()
        };

        // 上一个会话已经 stop，正在收尾（最多一个 tick + drain），等它释放设备
        if let Some(previous) = previous {
            previous.join();
        }

        let playing = Arc::new(AtomicBool::new(true));
        self.stats.reset();
        self.registry.publish();

        let ctx = ThreadContext {
            frames: self.config.buffer_frames,
            priority: self.config.thread_priority,
            device: Arc::clone(&self.device),
            registry: Arc::clone(&self.registry),
            playing: Arc::clone(&playing),
            stats: Arc::clone(&self.stats),
        };

        let (ready_tx, ready_rx) = crossbeam_channel::bounded(1);
        let thread = thread::Builder::new()
            .name("pcm-mixer-playback".to_string())
            .spawn(move || playback::thread_main(ctx, ready_tx))?;

        match ready_rx.recv() {
            Ok(Ok(())) => {
                log::info!(
                    "Mix engine started: {} | {} frames/tick | {} sources",
                    AudioFormat::STREAM,
                    self.config.buffer_frames,
                    self.registry.len()
                );
                *self.lock_session() = Some(Session { playing, thread });
                Ok(())
            }
            Ok(Err(e)) => {
                let _ = thread.join();
                log::warn!("Failed to open output device {}: {}", self.device.name(), e);
                Err(EngineError::DeviceUnavailable(e))
            }
            Err(_) => {
                // 线程在报告结果前就退出了（open 内部 panic）
                let _ = thread.join();
                Err(EngineError::DeviceUnavailable(OutputError::OpenFailed(
                    "playback thread exited before opening the device".into(),
                )))
            }
        }
    }

    /// 停止播放
    ///
    /// 只翻转标志，不等待：播放线程在下一个 tick 开始时看到它，写完当前 buffer 后 drain 并关闭设备
    pub fn stop(&self) {
        let session = self.lock_session();
        if let Some(s) = session.as_ref() {
            if s.playing.swap(false, Ordering::AcqRel) {
                log::info!("Mix engine stopping");
            }
        }
    }

    /// 停止并等待播放线程退出，可重复调用
    pub fn close(&self) {
        let _lifecycle = self.lock_lifecycle();
        self.stop();
        let previous = self.lock_session().take();
        if let Some(previous) = previous {
            previous.join();
            log::info!("Mix engine closed");
        }
    }

    /// 是否在播放
    ///
    /// 设备写入失败后会自行变为 false
    pub fn is_playing(&self) -> bool {
        self.lock_session().as_ref().is_some_and(Session::is_playing)
    }

    /// 注册一个源，任何时候都可以调用
    ///
    /// 同一个 `Arc` 重复注册返回 false
    pub fn add_source(&self, source: SourceHandle) -> bool {
        self.registry.add(source)
    }

    /// 注销一个源，未注册时返回 false
    pub fn remove_source(&self, source: &SourceHandle) -> bool {
        self.registry.remove(source)
    }

    pub fn source_count(&self) -> usize {
        self.registry.len()
    }

    pub fn config(&self) -> &EngineConfig {
        &self.config
    }

    /// 统计信息
    pub fn stats(&self) -> MixStatsReport {
        self.stats
            .report(AudioFormat::STREAM.frames_to_ns(self.config.buffer_frames))
    }

    fn lock_lifecycle(&self) -> MutexGuard<'_, ()> {
        self.lifecycle.lock().unwrap_or_else(|e| e.into_inner())
    }

    fn lock_session(&self) -> MutexGuard<'_, Option<Session>> {
        self.session.lock().unwrap_or_else(|e| e.into_inner())
    }
}

impl Drop for MixEngine {
    fn drop(&mut self) {
        self.close();
    }
}
