//! 播放线程优先级
//!
//! 在播放线程启动时调用 `apply`，失败只记录日志，绝不中断播放

/// 播放线程优先级
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum ThreadPriority {
    /// 保持系统默认调度
    Normal,
    /// 提高 nice 值，不申请实时调度
    Elevated,
    /// 尽可能申请实时调度（失败时回退到 Elevated）
    #[default]
    Highest,
}

impl std::str::FromStr for ThreadPriority {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_ascii_lowercase().as_str() {
            "normal" => Ok(Self::Normal),
            "elevated" => Ok(Self::Elevated),
            "highest" => Ok(Self::Highest),
            other => Err(format!("unknown thread priority '{}'", other)),
        }
    }
}

/// Elevated 模式使用的 nice 值
#[cfg(unix)]
const ELEVATED_NICE: libc::c_int = -10;

/// 设置当前线程优先级
///
/// 返回最终生效的级别
pub fn apply(priority: ThreadPriority) -> ThreadPriority {
    match priority {
        ThreadPriority::Normal => ThreadPriority::Normal,
        ThreadPriority::Elevated => {
            if set_elevated() {
                ThreadPriority::Elevated
            } else {
                ThreadPriority::Normal
            }
        }
        ThreadPriority::Highest => {
            #[cfg(target_os = "macos")]
            set_qos_class();

            if set_realtime() {
                ThreadPriority::Highest
            } else if set_elevated() {
                log::warn!("Realtime scheduling unavailable, playback thread runs at elevated priority");
                ThreadPriority::Elevated
            } else {
                log::warn!("Could not raise playback thread priority, using default scheduling");
                ThreadPriority::Normal
            }
        }
    }
}

/// 设置 QoS 类为 User Interactive
///
/// 告诉系统调度器这是用户交互敏感任务，减少被抢占概率
#[cfg(target_os = "macos")]
fn set_qos_class() {
    // QOS_CLASS_USER_INTERACTIVE = 0x21
    const QOS_CLASS_USER_INTERACTIVE: u32 = 0x21;

    extern "C" {
        fn pthread_set_qos_class_self_np(qos_class: u32, relative_priority: i32) -> i32;
    }

    let result = unsafe { pthread_set_qos_class_self_np(QOS_CLASS_USER_INTERACTIVE, 0) };
    if result == 0 {
        log::debug!("QoS class set to USER_INTERACTIVE");
    } else {
        log::debug!("Failed to set QoS class (errno: {})", result);
    }
}

/// SCHED_FIFO 最高优先级，通常需要 CAP_SYS_NICE 或 rtprio limit
#[cfg(all(unix, not(target_os = "macos")))]
fn set_realtime() -> bool {
    unsafe {
        let max = libc::sched_get_priority_max(libc::SCHED_FIFO);
        if max < 0 {
            return false;
        }
        let mut param: libc::sched_param = std::mem::zeroed();
        param.sched_priority = max;

        let result = libc::pthread_setschedparam(libc::pthread_self(), libc::SCHED_FIFO, &param);
        if result == 0 {
            log::debug!("Realtime priority set: SCHED_FIFO {}", max);
            true
        } else {
            log::debug!("Failed to set SCHED_FIFO (errno: {})", result);
            false
        }
    }
}

// macOS 上 QoS 已经是用户态能拿到的最高档
#[cfg(target_os = "macos")]
fn set_realtime() -> bool {
    false
}

#[cfg(not(unix))]
fn set_realtime() -> bool {
    false
}

#[cfg(unix)]
fn set_elevated() -> bool {
    let result = unsafe { libc::setpriority(libc::PRIO_PROCESS, 0, ELEVATED_NICE) };
    if result == 0 {
        log::debug!("Playback thread nice set to {}", ELEVATED_NICE);
        true
    } else {
        log::debug!(
            "Failed to set nice {}: {}",
            ELEVATED_NICE,
            std::io::Error::last_os_error()
        );
        false
    }
}

#[cfg(not(unix))]
fn set_elevated() -> bool {
    false
}
