//! 设备 PCM 环形缓冲区
//!
//! 播放线程（唯一生产者）把一个 tick 的 little-endian 字节按整帧压入，
//! cpal 回调（唯一消费者）按样本取出 i16。两端都不加锁、不分配；
//! 生产端的阻塞等待策略也在这里，消费端永远不等待。

use std::cell::UnsafeCell;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::thread;
use std::time::{Duration, Instant};

use crossbeam_utils::CachePadded;
use thiserror::Error;

use super::format::AudioFormat;

/// 阻塞写入 / 等待排空失败
#[derive(Debug, Error, PartialEq, Eq)]
pub enum RingError {
    #[error("consumer made no progress for {0:?}")]
    Stalled(Duration),

    #[error("consumer aborted")]
    Aborted,
}

/// 交织立体声 i16 的 SPSC 环形缓冲区
pub struct PcmRing {
    slots: Box<[UnsafeCell<i16>]>,
    mask: usize,
    /// 两个位置都以样本计，单调递增，取模靠 mask
    write_pos: CachePadded<AtomicUsize>,
    read_pos: CachePadded<AtomicUsize>,
    memory_locked: bool,
}

unsafe impl Send for PcmRing {}
unsafe impl Sync for PcmRing {}

const CHANNELS: usize = AudioFormat::STREAM.channels as usize;

impl PcmRing {
    /// 至少容纳 `frames` 帧，向上取整到 2 的幂个样本
    ///
    /// 顺带尝试 mlock，失败只是失去防 page fault 的保护
    pub fn new(frames: usize) -> Self {
        let capacity = (frames.max(1) * CHANNELS).next_power_of_two();
        let slots: Box<[UnsafeCell<i16>]> = (0..capacity).map(|_| UnsafeCell::new(0)).collect();

        let mut ring = Self {
            slots,
            mask: capacity - 1,
            write_pos: CachePadded::new(AtomicUsize::new(0)),
            read_pos: CachePadded::new(AtomicUsize::new(0)),
            memory_locked: false,
        };
        ring.memory_locked = ring.lock_memory();
        ring
    }

    #[cfg(unix)]
    fn lock_memory(&self) -> bool {
        let len = self.slots.len() * std::mem::size_of::<i16>();
        if unsafe { libc::mlock(self.slots.as_ptr() as *const libc::c_void, len) } == 0 {
            log::debug!("PCM ring locked in memory: {} bytes", len);
            true
        } else {
            log::warn!("Failed to lock PCM ring: {}", std::io::Error::last_os_error());
            false
        }
    }

    #[cfg(not(unix))]
    fn lock_memory(&self) -> bool {
        false
    }

    /// 容量（样本）
    #[inline]
    pub fn capacity(&self) -> usize {
        self.slots.len()
    }

    /// 已排队、尚未被消费的样本数
    #[inline]
    pub fn queued(&self) -> usize {
        let write = self.write_pos.load(Ordering::Acquire);
        let read = self.read_pos.load(Ordering::Acquire);
        write.wrapping_sub(read)
    }

    /// 压入尽可能多的整帧（生产者调用），返回消耗的字节数
    pub fn push_le(&self, bytes: &[u8]) -> usize {
        let write = self.write_pos.load(Ordering::Relaxed);
        let read = self.read_pos.load(Ordering::Acquire);
        let free = self.capacity() - write.wrapping_sub(read);

        let samples = (bytes.len() / 2).min(free);
        let samples = samples - samples % CHANNELS;

        for (i, pair) in bytes[..samples * 2].chunks_exact(2).enumerate() {
            let idx = (write + i) & self.mask;
            unsafe {
                *self.slots[idx].get() = i16::from_le_bytes([pair[0], pair[1]]);
            }
        }

        self.write_pos.store(write.wrapping_add(samples), Ordering::Release);
        samples * 2
    }

    /// 取出样本（消费者调用），返回取出的样本数，不足部分由调用方补静音
    pub fn pop(&self, out: &mut [i16]) -> usize {
        let read = self.read_pos.load(Ordering::Relaxed);
        let write = self.write_pos.load(Ordering::Acquire);
        let n = out.len().min(write.wrapping_sub(read));

        for (i, slot) in out[..n].iter_mut().enumerate() {
            *slot = unsafe { *self.slots[(read + i) & self.mask].get() };
        }

        self.read_pos.store(read.wrapping_add(n), Ordering::Release);
        n
    }

    /// 阻塞直到整块字节都压入
    ///
    /// `aborted` 由消费端置位；在 `stall_timeout` 内没有任何进展视为消费端失效
    pub fn push_blocking(
        &self,
        bytes: &[u8],
        stall_timeout: Duration,
        aborted: &AtomicBool,
    ) -> Result<(), RingError> {
        let mut offset = 0;
        let mut last_progress = Instant::now();

        while offset < bytes.len() {
            let n = self.push_le(&bytes[offset..]);
            if n > 0 {
                offset += n;
                last_progress = Instant::now();
                continue;
            }

            if aborted.load(Ordering::Acquire) {
                return Err(RingError::Aborted);
            }
            if last_progress.elapsed() > stall_timeout {
                return Err(RingError::Stalled(stall_timeout));
            }

            // 等到剩余数据（最多半个 ring）放得下，避免每次只挤进几帧
            let wanted = ((bytes.len() - offset) / 2).min(self.capacity() / 2);
            self.wait_for_space(wanted.saturating_sub(self.capacity() - self.queued()).max(CHANNELS));
        }
        Ok(())
    }

    /// 等待消费端取空，超过 `deadline` 返回 Ok(false)
    pub fn wait_empty(&self, deadline: Instant, aborted: &AtomicBool) -> Result<bool, RingError> {
        while self.queued() > 0 {
            if aborted.load(Ordering::Acquire) {
                return Err(RingError::Aborted);
            }
            if Instant::now() > deadline {
                return Ok(false);
            }
            thread::sleep(Duration::from_millis(1));
        }
        Ok(true)
    }

    /// 按设备消耗 `samples` 个样本的预计时间自适应等待
    ///
    /// - < 50µs: 仅自旋
    /// - 50-500µs: yield + 短自旋
    /// - > 500µs: 睡眠 70% 的预计时间
    fn wait_for_space(&self, samples: usize) {
        let wait_us = AudioFormat::STREAM.frames_to_ns(samples / CHANNELS) / 1_000;

        if wait_us < 50 {
            for _ in 0..64 {
                std::hint::spin_loop();
            }
        } else if wait_us < 500 {
            thread::yield_now();
            for _ in 0..32 {
                std::hint::spin_loop();
            }
        } else {
            let sleep_us = (wait_us * 7 / 10).clamp(100, 10_000);
            thread::sleep(Duration::from_micros(sleep_us));
        }
    }
}

impl Drop for PcmRing {
    fn drop(&mut self) {
        #[cfg(unix)]
        {
            if self.memory_locked {
                let len = self.slots.len() * std::mem::size_of::<i16>();
                unsafe {
                    libc::munlock(self.slots.as_ptr() as *const libc::c_void, len);
                }
            }
        }
    }
}
