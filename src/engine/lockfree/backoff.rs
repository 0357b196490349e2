//! ### English
//! Spin-then-yield backoff for CAS retry loops.
//!
//! A failed compare-exchange on the swapper state means the other side just moved; it will be
//! done within a few instructions, so spin first and only yield once the budget is spent.
//!
//! ### 中文
//! CAS 重试循环使用的“短自旋 + 让出调度”退避。
//!
//! 交换器状态上的 compare-exchange 失败意味着另一侧刚刚完成一次转换，通常几条指令内即可结束，
//! 因此先短暂自旋，预算用完后再让出调度。

use std::thread;

/// ### English
/// Spin budget before switching to `yield_now()`.
///
/// ### 中文
/// 在切换到 `yield_now()` 之前允许的自旋次数预算。
const SPIN_LIMIT: u32 = 32;

pub(crate) struct Backoff {
    step: u32,
}

impl Backoff {
    #[inline]
    pub(crate) fn new() -> Self {
        Self { step: 0 }
    }

    /// ### English
    /// Waits a little before the next retry.
    ///
    /// ### 中文
    /// 在下一次重试前稍作等待。
    #[inline]
    pub(crate) fn snooze(&mut self) {
        if self.step < SPIN_LIMIT {
            std::hint::spin_loop();
        } else {
            thread::yield_now();
        }
        self.step = self.step.saturating_add(1);
    }

    /// ### English
    /// Whether the spin budget is exhausted (the next `snooze` yields).
    ///
    /// ### 中文
    /// 自旋预算是否已耗尽（下一次 `snooze` 将让出调度）。
    #[inline]
    pub(crate) fn is_yielding(&self) -> bool {
        self.step >= SPIN_LIMIT
    }
}
