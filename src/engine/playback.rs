//! 播放循环
//!
//! 运行在独占的播放线程上：每个 tick 取一次快照、累加所有正在播放的源、
//! clamp、转换为 16-bit PCM、阻塞写入设备。设备 write 的阻塞就是节拍，没有额外的 sleep。
//!
//! 状态：Idle → Running → Draining → Closed

use std::panic::{self, AssertUnwindSafe};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Instant;

use crossbeam_channel::Sender;

use super::priority::{self, ThreadPriority};
use super::registry::{Snapshot, SourceRegistry};
use crate::audio::{
    normalized_to_device_bytes, AudioFormat, CodecError, MixStats, OutputDevice, OutputError,
    OutputLine,
};
use crate::source::SourceError;

/// 播放循环状态
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LoopState {
    Idle,
    Running,
    Draining,
    Closed,
}

/// 单个 tick 的混音缓冲区和当前生效的快照
///
/// 只属于播放线程，缓冲区在创建时一次性分配
pub struct Mixer {
    frames: usize,
    read_buffer: Vec<f32>,
    accumulator: Vec<f32>,
    device_bytes: Vec<u8>,
    active: Box<Snapshot>,
}

impl Mixer {
    pub fn new(frames: usize) -> Self {
        let format = AudioFormat::STREAM;
        let samples = format.samples_for_frames(frames);
        Self {
            frames,
            read_buffer: vec![0.0; samples],
            accumulator: vec![0.0; samples],
            device_bytes: vec![0; format.bytes_for_frames(frames)],
            active: Box::new(Snapshot::empty()),
        }
    }

    /// 当前生效的源数量
    pub fn active_sources(&self) -> usize {
        self.active.len()
    }

    /// 最近一次 tick 的归一化混音结果（已 clamp）
    pub fn accumulator(&self) -> &[f32] {
        &self.accumulator
    }

    /// 最近一次 tick 的设备 PCM
    pub fn device_bytes(&self) -> &[u8] {
        &self.device_bytes
    }

    /// 混一个 tick
    ///
    /// 注册表的快照交换是唯一的同步点；单个源读取失败只让它本 tick 静音
    pub fn mix(&mut self, registry: &SourceRegistry, stats: &MixStats) -> Result<(), CodecError> {
        if let Some(snapshot) = registry.take_pending() {
            log::debug!(
                "Adopted source snapshot: {} -> {} sources",
                self.active.len(),
                snapshot.len()
            );
            let retired = std::mem::replace(&mut self.active, snapshot);
            registry.retire(retired);
        }

        let started = Instant::now();
        self.accumulator.fill(0.0);

        for source in self.active.iter() {
            let buffer = &mut self.read_buffer;
            // 状态查询和读取都可能 panic，两者都只影响这一个源
            let result = panic::catch_unwind(AssertUnwindSafe(|| {
                if !source.is_playing() {
                    return Ok(false);
                }
                buffer.fill(0.0);
                source.read(buffer).map(|()| true)
            }))
            .unwrap_or_else(|_| Err(SourceError::ReadFailed("source panicked".into())));

            match result {
                Ok(false) => {}
                Ok(true) => {
                    for (acc, &sample) in self.accumulator.iter_mut().zip(self.read_buffer.iter()) {
                        *acc += sample;
                    }
                }
                Err(e) => {
                    stats.record_read_failure();
                    log::debug!("Source read failed, silent for this tick: {}", e);
                }
            }
        }

        let mut peak = 0.0f32;
        let mut clipped = 0usize;
        for sample in self.accumulator.iter_mut() {
            peak = peak.max(sample.abs());
            if sample.abs() > 1.0 {
                clipped += 1;
            }
            *sample = sample.clamp(-1.0, 1.0);
        }

        normalized_to_device_bytes(&mut self.device_bytes, &self.accumulator)?;

        stats.record_tick(
            self.frames,
            started.elapsed().as_nanos() as u64,
            clipped,
            peak,
        );
        Ok(())
    }
}

/// 播放循环
pub struct PlaybackLoop {
    mixer: Mixer,
    registry: Arc<SourceRegistry>,
    playing: Arc<AtomicBool>,
    stats: Arc<MixStats>,
    state: LoopState,
}

impl PlaybackLoop {
    pub fn new(
        frames: usize,
        registry: Arc<SourceRegistry>,
        playing: Arc<AtomicBool>,
        stats: Arc<MixStats>,
    ) -> Self {
        Self {
            mixer: Mixer::new(frames),
            registry,
            playing,
            stats,
            state: LoopState::Idle,
        }
    }

    pub fn state(&self) -> LoopState {
        self.state
    }

    /// 运行直到 `playing` 变为 false 或设备失效，然后 drain 并关闭设备
    ///
    /// 设备在这里恰好关闭一次，循环中途 panic 也一样
    pub fn run(&mut self, mut line: Box<dyn OutputLine>) -> LoopState {
        self.state = LoopState::Running;

        let fatal = match panic::catch_unwind(AssertUnwindSafe(|| self.pump(line.as_mut()))) {
            Ok(fatal) => fatal,
            Err(_) => {
                log::error!("Playback loop panicked, closing output");
                true
            }
        };

        // 设备失效时自行转为非播放状态，调用方通过 is_playing() 观察
        self.playing.store(false, Ordering::Release);
        self.state = LoopState::Draining;

        if !fatal {
            if let Err(e) = line.drain() {
                log::warn!("Drain failed: {}", e);
            }
        }
        line.close();

        self.state = LoopState::Closed;
        self.state
    }

    /// 混音并写入直到停止，返回是否因错误退出
    fn pump(&mut self, line: &mut dyn OutputLine) -> bool {
        while self.playing.load(Ordering::Acquire) {
            if let Err(e) = self.mixer.mix(&self.registry, &self.stats) {
                log::error!("Mix buffer contract violated, stopping playback: {}", e);
                return true;
            }

            if let Err(e) = line.write(self.mixer.device_bytes()) {
                log::error!("Device write failed, stopping playback: {}", e);
                return true;
            }
        }
        false
    }
}

/// 播放线程入口需要的全部上下文
pub(crate) struct ThreadContext {
    pub frames: usize,
    pub priority: ThreadPriority,
    pub device: Arc<dyn OutputDevice>,
    pub registry: Arc<SourceRegistry>,
    pub playing: Arc<AtomicBool>,
    pub stats: Arc<MixStats>,
}

/// 播放线程主函数
///
/// 先设置优先级、打开设备，再通过 `ready` 把打开结果同步回 `start()`，
/// 设备从打开到关闭都只在本线程上使用
pub(crate) fn thread_main(ctx: ThreadContext, ready: Sender<Result<(), OutputError>>) {
    let applied = priority::apply(ctx.priority);
    log::debug!("Playback thread priority: {:?} (requested {:?})", applied, ctx.priority);

    let format = AudioFormat::STREAM;
    let line = match ctx.device.open(format, format.bytes_for_frames(ctx.frames)) {
        Ok(line) => line,
        Err(e) => {
            let _ = ready.send(Err(e));
            return;
        }
    };

    if ready.send(Ok(())).is_err() {
        // start() 已经放弃等待
        line.close();
        return;
    }
    drop(ready);

    log::info!(
        "Playback thread started: {} frames/tick on {}",
        ctx.frames,
        ctx.device.name()
    );

    let mut playback = PlaybackLoop::new(ctx.frames, ctx.registry, ctx.playing, ctx.stats);
    playback.run(line);

    log::info!("Playback thread finished");
}
