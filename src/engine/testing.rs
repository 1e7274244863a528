//! 测试用的源和输出设备

use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use crossbeam_channel::{Receiver, Sender};

use crate::audio::{AudioFormat, OutputDevice, OutputError, OutputLine};
use crate::source::{Source, SourceError};

/// 左右声道各输出一个常数
pub struct ConstSource {
    left: f32,
    right: f32,
    playing: AtomicBool,
    reads: AtomicUsize,
}

impl ConstSource {
    pub fn new(left: f32, right: f32) -> Self {
        Self {
            left,
            right,
            playing: AtomicBool::new(true),
            reads: AtomicUsize::new(0),
        }
    }

    pub fn set_playing(&self, playing: bool) {
        self.playing.store(playing, Ordering::Release);
    }

    pub fn reads(&self) -> usize {
        self.reads.load(Ordering::Relaxed)
    }
}

impl Source for ConstSource {
    fn is_playing(&self) -> bool {
        self.playing.load(Ordering::Acquire)
    }

    fn read(&self, buffer: &mut [f32]) -> Result<(), SourceError> {
        self.reads.fetch_add(1, Ordering::Relaxed);
        for frame in buffer.chunks_exact_mut(2) {
            frame[0] = self.left;
            frame[1] = self.right;
        }
        Ok(())
    }
}

/// 第 1、3、5... 次读取成功，其余失败
pub struct FlakySource {
    value: f32,
    calls: AtomicUsize,
    fill_before_fail: bool,
}

impl FlakySource {
    pub fn new(value: f32) -> Self {
        Self {
            value,
            calls: AtomicUsize::new(0),
            fill_before_fail: false,
        }
    }

    /// 失败前先把 buffer 写满
    pub fn failing_after_fill(mut self) -> Self {
        self.fill_before_fail = true;
        self
    }
}

impl Source for FlakySource {
    fn is_playing(&self) -> bool {
        true
    }

    fn read(&self, buffer: &mut [f32]) -> Result<(), SourceError> {
        let call = self.calls.fetch_add(1, Ordering::Relaxed);
        if call % 2 == 1 {
            if self.fill_before_fail {
                buffer.fill(self.value);
            }
            return Err(SourceError::ReadFailed(format!("injected failure #{}", call)));
        }
        buffer.fill(self.value);
        Ok(())
    }
}

/// 在状态查询或读取中 panic 的源
pub struct PanickingSource {
    in_state_query: bool,
}

impl PanickingSource {
    pub fn in_state_query() -> Self {
        Self {
            in_state_query: true,
        }
    }

    pub fn in_read() -> Self {
        Self {
            in_state_query: false,
        }
    }
}

impl Source for PanickingSource {
    fn is_playing(&self) -> bool {
        if self.in_state_query {
            panic!("state query bug");
        }
        true
    }

    fn read(&self, _buffer: &mut [f32]) -> Result<(), SourceError> {
        panic!("decoder bug");
    }
}

/// 一次 write 的记录
pub struct Tick {
    /// 从 1 开始的 write 序号
    pub index: usize,
    pub bytes: Vec<u8>,
}

impl Tick {
    pub fn sample(&self, i: usize) -> i16 {
        i16::from_le_bytes([self.bytes[i * 2], self.bytes[i * 2 + 1]])
    }

    pub fn all_samples_eq(&self, value: i16) -> bool {
        self.bytes
            .chunks_exact(2)
            .all(|c| i16::from_le_bytes([c[0], c[1]]) == value)
    }
}

/// 设备调用计数
#[derive(Default)]
pub struct DeviceCounters {
    pub opens: AtomicUsize,
    pub writes_started: AtomicUsize,
    pub writes_completed: AtomicUsize,
    pub drains: AtomicUsize,
    pub closes: AtomicUsize,
    pub fail_open: AtomicBool,
    /// 第 N 次 write 返回错误（0 表示从不）
    pub fail_write_at: AtomicUsize,
    /// 已打开且尚未关闭的 line 数量，正常运行时最多为 1
    pub open_lines: AtomicUsize,
    pub max_open_lines: AtomicUsize,
}

/// 记录所有调用的输出设备，write 按固定延迟阻塞以模拟设备节拍
pub struct MockDevice {
    pub counters: Arc<DeviceCounters>,
    write_delay: Duration,
    ticks: Sender<Tick>,
    formats: Mutex<Vec<(AudioFormat, usize)>>,
}

impl MockDevice {
    pub fn new(write_delay: Duration) -> (Arc<Self>, Receiver<Tick>) {
        let (tx, rx) = crossbeam_channel::unbounded();
        let device = Arc::new(Self {
            counters: Arc::new(DeviceCounters::default()),
            write_delay,
            ticks: tx,
            formats: Mutex::new(Vec::new()),
        });
        (device, rx)
    }

    pub fn opened_with(&self) -> Vec<(AudioFormat, usize)> {
        self.formats.lock().unwrap().clone()
    }
}

impl OutputDevice for MockDevice {
    fn name(&self) -> String {
        "mock".to_string()
    }

    fn open(
        &self,
        format: AudioFormat,
        buffer_bytes: usize,
    ) -> Result<Box<dyn OutputLine>, OutputError> {
        let c = &self.counters;
        if c.fail_open.load(Ordering::SeqCst) {
            return Err(OutputError::DeviceNotFound("mock".into()));
        }
        c.opens.fetch_add(1, Ordering::SeqCst);
        let open = c.open_lines.fetch_add(1, Ordering::SeqCst) + 1;
        c.max_open_lines.fetch_max(open, Ordering::SeqCst);
        self.formats.lock().unwrap().push((format, buffer_bytes));

        Ok(Box::new(MockLine {
            counters: Arc::clone(&self.counters),
            write_delay: self.write_delay,
            ticks: self.ticks.clone(),
        }))
    }
}

struct MockLine {
    counters: Arc<DeviceCounters>,
    write_delay: Duration,
    ticks: Sender<Tick>,
}

impl OutputLine for MockLine {
    fn write(&mut self, bytes: &[u8]) -> Result<(), OutputError> {
        let c = &self.counters;
        let index = c.writes_started.fetch_add(1, Ordering::SeqCst) + 1;
        if c.fail_write_at.load(Ordering::SeqCst) == index {
            return Err(OutputError::WriteFailed("mock unplugged".into()));
        }
        let _ = self.ticks.send(Tick {
            index,
            bytes: bytes.to_vec(),
        });
        std::thread::sleep(self.write_delay);
        c.writes_completed.fetch_add(1, Ordering::SeqCst);
        Ok(())
    }

    fn drain(&mut self) -> Result<(), OutputError> {
        self.counters.drains.fetch_add(1, Ordering::SeqCst);
        Ok(())
    }

    fn close(self: Box<Self>) {
        self.counters.open_lines.fetch_sub(1, Ordering::SeqCst);
        self.counters.closes.fetch_add(1, Ordering::SeqCst);
    }
}
