//! 混音统计模块
//!
//! 播放线程和设备回调都会更新这里的计数器，所有操作都是 lock-free 的

use std::sync::atomic::{AtomicU32, AtomicU64, Ordering};

/// 混音统计收集器
pub struct MixStats {
    ticks: AtomicU64,
    frames_written: AtomicU64,
    read_failures: AtomicU64,
    clipped_samples: AtomicU64,
    underruns: AtomicU64,

    // 非负 f32 的位模式与数值同序，可以直接 fetch_max
    peak_bits: AtomicU32,

    // 单个 tick 的混音计算耗时（不含设备写入）
    mix_ns_total: AtomicU64,
    mix_ns_max: AtomicU64,
}

impl MixStats {
    pub fn new() -> Self {
        Self {
            ticks: AtomicU64::new(0),
            frames_written: AtomicU64::new(0),
            read_failures: AtomicU64::new(0),
            clipped_samples: AtomicU64::new(0),
            underruns: AtomicU64::new(0),
            peak_bits: AtomicU32::new(0),
            mix_ns_total: AtomicU64::new(0),
            mix_ns_max: AtomicU64::new(0),
        }
    }

    /// 一个 tick 完成（播放线程调用）
    #[inline]
    pub fn record_tick(&self, frames: usize, mix_ns: u64, clipped: usize, peak: f32) {
        self.ticks.fetch_add(1, Ordering::Relaxed);
        self.frames_written.fetch_add(frames as u64, Ordering::Relaxed);
        self.mix_ns_total.fetch_add(mix_ns, Ordering::Relaxed);
        self.mix_ns_max.fetch_max(mix_ns, Ordering::Relaxed);
        if clipped > 0 {
            self.clipped_samples.fetch_add(clipped as u64, Ordering::Relaxed);
        }
        self.peak_bits.fetch_max(peak.abs().to_bits(), Ordering::Relaxed);
    }

    /// 某个源在本 tick 读取失败
    #[inline]
    pub fn record_read_failure(&self) {
        self.read_failures.fetch_add(1, Ordering::Relaxed);
    }

    /// 设备回调发现数据不足（设备回调调用）
    #[inline]
    pub fn record_underrun(&self) {
        self.underruns.fetch_add(1, Ordering::Relaxed);
    }

    #[inline]
    pub fn ticks(&self) -> u64 {
        self.ticks.load(Ordering::Relaxed)
    }

    #[inline]
    pub fn read_failures(&self) -> u64 {
        self.read_failures.load(Ordering::Relaxed)
    }

    #[inline]
    pub fn underruns(&self) -> u64 {
        self.underruns.load(Ordering::Relaxed)
    }

    /// 生成报告
    ///
    /// `tick_budget_ns` 为一个 buffer 的播放时长
    pub fn report(&self, tick_budget_ns: u64) -> MixStatsReport {
        let ticks = self.ticks.load(Ordering::Relaxed);
        let mix_ns_total = self.mix_ns_total.load(Ordering::Relaxed);

        MixStatsReport {
            ticks,
            frames_written: self.frames_written.load(Ordering::Relaxed),
            read_failures: self.read_failures.load(Ordering::Relaxed),
            clipped_samples: self.clipped_samples.load(Ordering::Relaxed),
            underruns: self.underruns.load(Ordering::Relaxed),
            peak: f32::from_bits(self.peak_bits.load(Ordering::Relaxed)),
            mix_ns_avg: if ticks > 0 { mix_ns_total / ticks } else { 0 },
            mix_ns_max: self.mix_ns_max.load(Ordering::Relaxed),
            tick_budget_ns,
        }
    }

    /// 重置统计
    pub fn reset(&self) {
        self.ticks.store(0, Ordering::Relaxed);
        self.frames_written.store(0, Ordering::Relaxed);
        self.read_failures.store(0, Ordering::Relaxed);
        self.clipped_samples.store(0, Ordering::Relaxed);
        self.underruns.store(0, Ordering::Relaxed);
        self.peak_bits.store(0, Ordering::Relaxed);
        self.mix_ns_total.store(0, Ordering::Relaxed);
        self.mix_ns_max.store(0, Ordering::Relaxed);
    }
}

impl Default for MixStats {
    fn default() -> Self {
        Self::new()
    }
}

/// 统计报告
#[derive(Debug, Clone)]
pub struct MixStatsReport {
    pub ticks: u64,
    pub frames_written: u64,
    pub read_failures: u64,
    pub clipped_samples: u64,
    pub underruns: u64,
    /// 混音后（clamp 前）的峰值幅度
    pub peak: f32,
    pub mix_ns_avg: u64,
    pub mix_ns_max: u64,
    pub tick_budget_ns: u64,
}

impl MixStatsReport {
    /// 最慢一次混音占用 tick 时长的比例
    pub fn worst_load(&self) -> f64 {
        if self.tick_budget_ns == 0 {
            return 0.0;
        }
        self.mix_ns_max as f64 / self.tick_budget_ns as f64
    }
}

impl std::fmt::Display for MixStatsReport {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        writeln!(f, "Mix Statistics")?;
        writeln!(f, "==============")?;
        writeln!(f, "Ticks: {}", self.ticks)?;
        writeln!(f, "Frames written: {}", self.frames_written)?;
        writeln!(f)?;

        writeln!(f, "Mix Timing (per tick):")?;
        writeln!(
            f,
            "  Budget: {:.2} ms",
            self.tick_budget_ns as f64 / 1_000_000.0
        )?;
        writeln!(f, "  Avg: {:.3} ms", self.mix_ns_avg as f64 / 1_000_000.0)?;
        writeln!(
            f,
            "  Max: {:.3} ms ({:.1}%)",
            self.mix_ns_max as f64 / 1_000_000.0,
            self.worst_load() * 100.0
        )?;
        writeln!(f)?;

        writeln!(f, "Peak level: {:.3}", self.peak)?;
        writeln!(f, "Clipped samples: {}", self.clipped_samples)?;
        writeln!(f, "Source read failures: {}", self.read_failures)?;
        writeln!(f, "Underruns: {}", self.underruns)?;

        Ok(())
    }
}
