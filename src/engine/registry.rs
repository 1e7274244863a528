//! 音频源注册表
//!
//! 写入方（add/remove 调用方）修改受 Mutex 保护的 live 列表，然后发布一份不可变快照；
//! 播放线程只通过 `take_pending` 原子地取走最新快照，永远不碰写入方的锁。
//!
//! 宁可旧一个 tick，也不阻塞：新注册的源最多晚一个 tick 生效。
//!
//! 播放线程换下的旧快照通过 `retire` 交回，由下一次发布的写入方释放，
//! 被移除源的最后一个 `Arc` 不会在 tick 中途析构。

use std::sync::{Arc, Mutex, MutexGuard};

use crossbeam_channel::{Receiver, Sender};
use crossbeam_utils::atomic::AtomicCell;

use crate::source::Source;

/// 引擎持有的源句柄（不拥有源的生命周期语义）
pub type SourceHandle = Arc<dyn Source>;

/// 一份发布后不再修改的源列表
pub struct Snapshot {
    sources: Box<[SourceHandle]>,
}

impl Snapshot {
    pub fn empty() -> Self {
        Self {
            sources: Box::new([]),
        }
    }

    #[inline]
    pub fn len(&self) -> usize {
        self.sources.len()
    }

    #[inline]
    pub fn is_empty(&self) -> bool {
        self.sources.is_empty()
    }

    #[inline]
    pub fn iter(&self) -> impl Iterator<Item = &SourceHandle> {
        self.sources.iter()
    }
}

/// 线程安全的源注册表
pub struct SourceRegistry {
    live: Mutex<Vec<SourceHandle>>,
    /// 待采纳的快照；非空即 dirty，快照与 dirty 标志一次原子交换
    pending: AtomicCell<Option<Box<Snapshot>>>,
    /// 播放线程换下、等待写入方释放的快照
    retired_tx: Sender<Box<Snapshot>>,
    retired_rx: Receiver<Box<Snapshot>>,
}

/// 每次发布前都会清空，两次发布之间播放线程最多交回一份
const RETIRED_SLOTS: usize = 4;

impl SourceRegistry {
    pub fn new() -> Self {
        let (retired_tx, retired_rx) = crossbeam_channel::bounded(RETIRED_SLOTS);
        Self {
            live: Mutex::new(Vec::new()),
            pending: AtomicCell::new(None),
            retired_tx,
            retired_rx,
        }
    }

    /// 注册一个源，已注册（同一个 Arc）时返回 false
    pub fn add(&self, source: SourceHandle) -> bool {
        let mut live = self.lock_live();
        if live.iter().any(|s| Arc::ptr_eq(s, &source)) {
            return false;
        }
        live.push(source);
        self.publish_locked(&live);
        true
    }

    /// 注销一个源，未注册时返回 false
    pub fn remove(&self, source: &SourceHandle) -> bool {
        let mut live = self.lock_live();
        let Some(idx) = live.iter().position(|s| Arc::ptr_eq(s, source)) else {
            return false;
        };
        live.remove(idx);
        self.publish_locked(&live);
        true
    }

    /// 把当前 live 列表复制成新快照并发布
    pub fn publish(&self) {
        let live = self.lock_live();
        self.publish_locked(&live);
    }

    /// 取走待采纳的快照（只由播放线程调用）
    ///
    /// 没有新快照时返回 None，调用方继续使用上一份
    #[inline]
    pub fn take_pending(&self) -> Option<Box<Snapshot>> {
        self.pending.swap(None)
    }

    /// 交回不再使用的快照（只由播放线程调用）
    ///
    /// bounded channel 的 try_send 不分配；满了才在调用方就地释放
    #[inline]
    pub fn retire(&self, snapshot: Box<Snapshot>) {
        if let Err(e) = self.retired_tx.try_send(snapshot) {
            log::debug!("Retired snapshot slots full, releasing on playback thread");
            drop(e.into_inner());
        }
    }

    pub fn len(&self) -> usize {
        self.lock_live().len()
    }

    pub fn is_empty(&self) -> bool {
        self.lock_live().is_empty()
    }

    /// 必须在持有 live 锁时调用，保证快照按修改顺序发布
    fn publish_locked(&self, live: &[SourceHandle]) {
        for retired in self.retired_rx.try_iter() {
            drop(retired);
        }

        let snapshot = Box::new(Snapshot {
            sources: live.to_vec().into_boxed_slice(),
        });
        // 未被采纳的旧快照直接丢弃
        drop(self.pending.swap(Some(snapshot)));
    }

    fn lock_live(&self) -> MutexGuard<'_, Vec<SourceHandle>> {
        // 持锁期间只做 Vec 操作，不会在不一致状态下 panic
        self.live.lock().unwrap_or_else(|e| e.into_inner())
    }
}

impl Default for SourceRegistry {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::source::SourceError;

    struct Silent;

    impl Source for Silent {
        fn is_playing(&self) -> bool {
            true
        }

        fn read(&self, buffer: &mut [f32]) -> Result<(), SourceError> {
            buffer.fill(0.0);
            Ok(())
        }
    }

    fn handle() -> SourceHandle {
        Arc::new(Silent)
    }

    #[test]
    fn test_pending_cell_is_lock_free() {
        assert!(AtomicCell::<Option<Box<Snapshot>>>::is_lock_free());
    }

    #[test]
    fn test_add_publishes_snapshot() {
        let registry = SourceRegistry::new();
        assert!(registry.take_pending().is_none());

        let a = handle();
        assert!(registry.add(Arc::clone(&a)));

        let snapshot = registry.take_pending().unwrap();
        assert_eq!(snapshot.len(), 1);
        assert!(Arc::ptr_eq(snapshot.iter().next().unwrap(), &a));

        // 取走后不再 dirty
        assert!(registry.take_pending().is_none());
    }

    #[test]
    fn test_only_latest_snapshot_is_kept() {
        let registry = SourceRegistry::new();
        let a = handle();
        let b = handle();
        registry.add(Arc::clone(&a));
        registry.add(Arc::clone(&b));
        registry.remove(&a);

        let snapshot = registry.take_pending().unwrap();
        assert_eq!(snapshot.len(), 1);
        assert!(Arc::ptr_eq(snapshot.iter().next().unwrap(), &b));
    }

    #[test]
    fn test_duplicate_and_unknown() {
        let registry = SourceRegistry::new();
        let a = handle();
        assert!(registry.add(Arc::clone(&a)));
        assert!(!registry.add(Arc::clone(&a)));
        assert_eq!(registry.len(), 1);

        assert!(!registry.remove(&handle()));
        assert!(registry.remove(&a));
        assert!(registry.is_empty());
    }

    #[test]
    fn test_published_snapshot_is_immutable() {
        let registry = SourceRegistry::new();
        registry.add(handle());
        let snapshot = registry.take_pending().unwrap();

        registry.add(handle());
        registry.add(handle());

        // 已取走的快照不受后续修改影响
        assert_eq!(snapshot.len(), 1);
        assert_eq!(registry.take_pending().unwrap().len(), 3);
    }

    #[test]
    fn test_retired_snapshot_released_on_next_publish() {
        let registry = SourceRegistry::new();
        let a = handle();
        registry.add(Arc::clone(&a));
        registry.remove(&a);

        let stale = Box::new(Snapshot {
            sources: vec![Arc::clone(&a)].into_boxed_slice(),
        });
        registry.retire(stale);
        assert_eq!(Arc::strong_count(&a), 2);

        registry.add(handle());
        assert_eq!(Arc::strong_count(&a), 1);
    }

    #[test]
    fn test_retire_never_blocks_when_slots_full() {
        let registry = SourceRegistry::new();
        for _ in 0..RETIRED_SLOTS * 2 {
            registry.retire(Box::new(Snapshot::empty()));
        }
        assert_eq!(registry.retired_rx.len(), RETIRED_SLOTS);
    }

    #[test]
    fn test_concurrent_writers_converge() {
        let registry = Arc::new(SourceRegistry::new());
        let writers: Vec<_> = (0..8)
            .map(|_| {
                let registry = Arc::clone(&registry);
                std::thread::spawn(move || {
                    for _ in 0..50 {
                        registry.add(handle());
                    }
                })
            })
            .collect();

        // 读取方持续取快照，永不阻塞
        let mut seen = 0;
        while seen < 400 {
            if let Some(snapshot) = registry.take_pending() {
                assert!(snapshot.len() >= seen);
                seen = snapshot.len();
            }
            std::thread::yield_now();
        }

        for w in writers {
            w.join().unwrap();
        }
        assert_eq!(registry.len(), 400);
    }
}
