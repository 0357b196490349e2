//! ### English
//! Buffer swappers: the ownership hand-off between one client (producer) and one
//! compositor (consumer).
//!
//! - `BufferSwapperDouble`: two buffers, one atomic state word, never blocks.
//! - `BufferSwapperMulti`: N buffers, mutex + condvar, client back-pressure.
//!
//! ### 中文
//! 缓冲区交换器：在一个客户端（生产者）与一个合成器（消费者）之间移交所有权。
//!
//! - `BufferSwapperDouble`：两个缓冲区、单个原子状态字，从不阻塞。
//! - `BufferSwapperMulti`：N 个缓冲区、互斥锁 + 条件变量，对客户端施加背压。
mod double;
mod factory;
mod multi;

pub use double::BufferSwapperDouble;
pub use factory::{BufferingPolicy, SwapperFactory};
pub use multi::BufferSwapperMulti;

use super::buffer::{BufferHandle, BufferId};
use super::error::SwapperError;

/// ### English
/// What a retiring swapper still owes: buffers held by either side when it was drained.
///
/// ### 中文
/// 退役的交换器在清空时仍未归还的部分：被某一侧持有的缓冲区。
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct Handover {
    /// ### English
    /// Total number of buffers the swapper was responsible for.
    ///
    /// ### 中文
    /// 交换器负责的缓冲区总数。
    pub swapper_size: usize,
    /// ### English
    /// Buffers checked out by the client; they come back through `client_release`.
    ///
    /// ### 中文
    /// 客户端借出的缓冲区；之后会通过 `client_release` 归还。
    pub client_held: Vec<BufferId>,
    /// ### English
    /// Buffers held by the compositor; they come back through `compositor_release`.
    ///
    /// ### 中文
    /// 合成器持有的缓冲区；之后会通过 `compositor_release` 归还。
    pub compositor_held: Vec<BufferId>,
}

impl Handover {
    pub fn client_outstanding(&self) -> usize {
        self.client_held.len()
    }

    pub fn compositor_outstanding(&self) -> usize {
        self.compositor_held.len()
    }

    pub fn outstanding(&self) -> usize {
        self.client_held.len() + self.compositor_held.len()
    }
}

/// ### English
/// Ownership contract between the client and the compositor of one surface.
///
/// Call discipline: one client thread and one compositor thread. Every `*_acquire` is paired
/// with exactly one `*_release` of the same buffer from the same side.
///
/// ### 中文
/// 单个 surface 的客户端与合成器之间的所有权契约。
///
/// 调用约束：一个客户端线程、一个合成器线程。每次 `*_acquire` 必须由同一侧对同一缓冲区
/// 恰好调用一次 `*_release`。
pub trait BufferSwapper: Send + Sync {
    /// ### English
    /// Hands the client a buffer to render into. May block (multi-buffer back-pressure).
    ///
    /// ### 中文
    /// 向客户端交付一个用于渲染的缓冲区。可能阻塞（多缓冲背压）。
    fn client_acquire(&self) -> Result<BufferHandle, SwapperError>;

    /// ### English
    /// Returns a rendered buffer; it becomes the newest completed frame.
    ///
    /// ### 中文
    /// 归还渲染完成的缓冲区；它成为最新的已完成帧。
    fn client_release(&self, buffer: BufferHandle) -> Result<(), SwapperError>;

    /// ### English
    /// Hands the compositor a completed frame. Never blocks.
    ///
    /// ### 中文
    /// 向合成器交付一个已完成的帧。从不阻塞。
    fn compositor_acquire(&self) -> Result<BufferHandle, SwapperError>;

    fn compositor_release(&self, buffer: BufferHandle) -> Result<(), SwapperError>;

    /// ### English
    /// Irreversibly fails pending and future client acquires so teardown cannot deadlock.
    ///
    /// ### 中文
    /// 不可逆地让挂起及后续的客户端 acquire 失败，保证销毁过程不会死锁。
    fn force_client_completion(&self);

    /// ### English
    /// Retires the swapper and moves every buffer it still holds into `buffers`
    /// (the newest completed frame last).
    ///
    /// ### 中文
    /// 让交换器退役，并将其仍持有的所有缓冲区移入 `buffers`（最新完成的帧位于末尾）。
    fn end_responsibility(&self, buffers: &mut Vec<BufferHandle>) -> Handover;

    /// ### English
    /// Number of buffers currently held by the client or the compositor.
    ///
    /// ### 中文
    /// 当前被客户端或合成器持有的缓冲区数量。
    fn buffers_outstanding(&self) -> usize;

    /// ### English
    /// Whether client and compositor swap without taking a lock.
    ///
    /// ### 中文
    /// 客户端与合成器交换时是否无需加锁。
    fn lock_free(&self) -> bool {
        false
    }

    fn swapper_size(&self) -> usize;
}
