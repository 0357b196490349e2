//! ### English
//! N-buffer swapper (N >= 2) guarded by a mutex and a condition variable.
//!
//! Buffers cycle `client_queue -> client -> compositor_queue -> compositor -> client_queue`.
//! The client blocks instead of taking the last buffer the compositor could show. With frame
//! dropping enabled it takes the oldest unshown frame instead, as long as a newer one stays queued.
//!
//! ### 中文
//! 由互斥锁与条件变量保护的 N 缓冲交换器（N >= 2）。
//!
//! 缓冲区循环路径：`client_queue -> 客户端 -> compositor_queue -> 合成器 -> client_queue`。
//! 客户端宁可阻塞，也不会拿走合成器最后一个可显示的缓冲区。开启丢帧后，只要队列中还留有
//! 更新的帧，客户端会改为取走最旧的未显示帧。

use std::collections::VecDeque;
use std::sync::{Condvar, Mutex, MutexGuard, PoisonError};

use crate::engine::buffer::{BufferHandle, BufferId};
use crate::engine::error::SwapperError;

use super::{BufferSwapper, Handover};

/// ### English
/// Smallest buffer count a swapper can run with.
///
/// ### 中文
/// 交换器可运行的最小缓冲区数量。
pub(super) const MIN_BUFFER_COUNT: usize = 2;

struct MultiQueues {
    /// ### English
    /// Buffers available to the client (front = next to hand out).
    ///
    /// ### 中文
    /// 客户端可用的缓冲区（队首 = 下一个交付的）。
    client_queue: VecDeque<BufferHandle>,
    /// ### English
    /// Completed frames not yet shown (front = oldest).
    ///
    /// ### 中文
    /// 已完成但尚未显示的帧（队首 = 最旧）。
    compositor_queue: VecDeque<BufferHandle>,
    /// ### English
    /// Ids checked out by the client, including ones inherited from a predecessor swapper.
    ///
    /// ### 中文
    /// 客户端借出的缓冲区 id，包括从前任交换器继承的。
    client_held: Vec<BufferId>,
    /// ### English
    /// Ids held by the compositor, including ones inherited from a predecessor swapper.
    ///
    /// ### 中文
    /// 合成器持有的缓冲区 id，包括从前任交换器继承的。
    compositor_held: Vec<BufferId>,
    force_completion: bool,
}

fn take_id(held: &mut Vec<BufferId>, id: BufferId) -> bool {
    match held.iter().position(|owned| *owned == id) {
        Some(pos) => {
            held.swap_remove(pos);
            true
        }
        None => false,
    }
}

/// ### English
/// General N-buffer swapper with client back-pressure and forced shutdown.
///
/// ### 中文
/// 带客户端背压与强制关闭能力的通用 N 缓冲交换器。
pub struct BufferSwapperMulti {
    queues: Mutex<MultiQueues>,
    /// ### English
    /// Signalled when a buffer returns to `client_queue` or on forced completion.
    ///
    /// ### 中文
    /// 当缓冲区回到 `client_queue` 或强制完成时发出通知。
    client_available: Condvar,
    swapper_size: usize,
    frame_dropping: bool,
}

impl BufferSwapperMulti {
    /// ### English
    /// Creates a swapper owning `buffers`; all start out available to the client.
    ///
    /// ### 中文
    /// 创建持有 `buffers` 的交换器；初始时全部可供客户端使用。
    pub fn new(buffers: Vec<BufferHandle>) -> Result<Self, SwapperError> {
        let handover = Handover {
            swapper_size: buffers.len(),
            ..Default::default()
        };
        Self::from_handover(buffers, handover)
    }

    /// ### English
    /// Creates a successor for buffers handed over by `end_responsibility`.
    ///
    /// Buffers still held by either side when the predecessor retired are released into this
    /// swapper later; `handover` names them per side, and only those ids are accepted back.
    ///
    /// #### Parameters
    /// - `buffers`: Free buffers, newest completed frame last.
    /// - `handover`: Size and outstanding ids. `buffers.len() + outstanding` must equal
    ///   `swapper_size`.
    ///
    /// ### 中文
    /// 为 `end_responsibility` 移交的缓冲区创建后继交换器。
    ///
    /// 前任退役时仍被某一侧持有的缓冲区，之后会释放到本交换器；`handover` 按侧列出这些 id，
    /// 只有它们会被接受归还。
    ///
    /// #### 参数
    /// - `buffers`：空闲缓冲区，最新完成的帧位于末尾。
    /// - `handover`：总数与未归还的 id。`buffers.len() + outstanding` 必须等于 `swapper_size`。
    pub fn from_handover(
        buffers: Vec<BufferHandle>,
        handover: Handover,
    ) -> Result<Self, SwapperError> {
        let swapper_size = handover.swapper_size;
        if swapper_size < MIN_BUFFER_COUNT {
            return Err(SwapperError::InvalidBufferCount {
                count: swapper_size,
            });
        }
        if buffers.len() + handover.outstanding() != swapper_size {
            return Err(SwapperError::InvalidBufferCount {
                count: buffers.len() + handover.outstanding(),
            });
        }
        if handover.client_outstanding() >= swapper_size {
            return Err(SwapperError::HandoverIncomplete {
                outstanding: handover.client_outstanding(),
            });
        }

        log::debug!(
            "multi swapper created: size={} free={} client_out={} compositor_out={}",
            swapper_size,
            buffers.len(),
            handover.client_outstanding(),
            handover.compositor_outstanding()
        );

        let Handover {
            client_held,
            mut compositor_held,
            ..
        } = handover;
        compositor_held.reserve(swapper_size);

        Ok(Self {
            queues: Mutex::new(MultiQueues {
                client_queue: buffers.into(),
                compositor_queue: VecDeque::with_capacity(swapper_size),
                client_held,
                compositor_held,
                force_completion: false,
            }),
            client_available: Condvar::new(),
            swapper_size,
            frame_dropping: false,
        })
    }

    /// ### English
    /// Lets the client recycle the oldest unshown frame instead of waiting for the compositor.
    ///
    /// ### 中文
    /// 允许客户端回收最旧的未显示帧，而不是等待合成器。
    pub fn with_frame_dropping(mut self, enabled: bool) -> Self {
        self.frame_dropping = enabled;
        self
    }

    pub fn drops_frames(&self) -> bool {
        self.frame_dropping
    }

    #[inline]
    fn lock(&self) -> MutexGuard<'_, MultiQueues> {
        // Critical sections never panic, so a poisoned queue state is still consistent.
        self.queues.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// ### English
    /// Pops the buffer the client may take next, if any, without starving the compositor.
    ///
    /// ### 中文
    /// 在不饿死合成器的前提下，取出客户端下一个可用的缓冲区（如有）。
    fn next_client_buffer(&self, queues: &mut MultiQueues) -> Option<BufferHandle> {
        if queues.client_held.len() + 1 >= self.swapper_size {
            return None;
        }
        if let Some(buffer) = queues.client_queue.pop_front() {
            return Some(buffer);
        }
        // The newest frame always stays queued for the compositor.
        if self.frame_dropping && queues.compositor_queue.len() > 1 {
            let dropped = queues.compositor_queue.pop_front();
            if let Some(buffer) = &dropped {
                log::trace!("dropping unshown frame {}", buffer.id());
            }
            return dropped;
        }
        None
    }

    /// ### English
    /// Number of buffers currently checked out by the client.
    ///
    /// ### 中文
    /// 客户端当前借出的缓冲区数量。
    pub fn client_buffers_in_use(&self) -> usize {
        self.lock().client_held.len()
    }
}

impl BufferSwapper for BufferSwapperMulti {
    fn client_acquire(&self) -> Result<BufferHandle, SwapperError> {
        let mut queues = self.lock();
        let buffer = loop {
            if queues.force_completion {
                return Err(SwapperError::ForcedCompletion);
            }
            if let Some(buffer) = self.next_client_buffer(&mut queues) {
                break buffer;
            }
            queues = self
                .client_available
                .wait(queues)
                .unwrap_or_else(PoisonError::into_inner);
        };

        queues.client_held.push(buffer.id());
        log::trace!(
            "client acquired {} ({} in use)",
            buffer.id(),
            queues.client_held.len()
        );
        Ok(buffer)
    }

    fn client_release(&self, buffer: BufferHandle) -> Result<(), SwapperError> {
        let id = buffer.id();
        let mut queues = self.lock();
        if !take_id(&mut queues.client_held, id) {
            log::error!("client released {id} it does not own");
            return Err(SwapperError::UnexpectedRelease { id });
        }

        queues.compositor_queue.push_back(buffer);
        // No notify: the compositor never waits, and a blocked client is woken by
        // `compositor_release` once a buffer actually comes back.
        Ok(())
    }

    fn compositor_acquire(&self) -> Result<BufferHandle, SwapperError> {
        let mut queues = self.lock();
        let buffer = match queues.compositor_queue.pop_front() {
            Some(buffer) => buffer,
            None => match queues.client_queue.pop_back() {
                Some(buffer) => {
                    log::trace!("no new frame, compositor re-shows {}", buffer.id());
                    buffer
                }
                None => {
                    log::error!(
                        "compositor found both queues empty (client holds {}, forced={})",
                        queues.client_held.len(),
                        queues.force_completion
                    );
                    return Err(SwapperError::NoBufferForCompositor);
                }
            },
        };
        queues.compositor_held.push(buffer.id());
        Ok(buffer)
    }

    fn compositor_release(&self, buffer: BufferHandle) -> Result<(), SwapperError> {
        let id = buffer.id();
        let mut queues = self.lock();
        if !take_id(&mut queues.compositor_held, id) {
            log::error!("compositor released {id} it does not own");
            return Err(SwapperError::UnexpectedRelease { id });
        }

        queues.client_queue.push_back(buffer);
        drop(queues);
        // Each release frees exactly one slot.
        self.client_available.notify_one();
        Ok(())
    }

    fn force_client_completion(&self) {
        self.lock().force_completion = true;
        self.client_available.notify_all();
        log::debug!("multi swapper: forced client completion");
    }

    fn end_responsibility(&self, buffers: &mut Vec<BufferHandle>) -> Handover {
        let mut queues = self.lock();
        queues.force_completion = true;

        buffers.extend(queues.client_queue.drain(..));
        buffers.extend(queues.compositor_queue.drain(..));

        let handover = Handover {
            swapper_size: self.swapper_size,
            client_held: queues.client_held.clone(),
            compositor_held: queues.compositor_held.clone(),
        };
        drop(queues);

        self.client_available.notify_all();
        log::debug!("multi swapper retired: {handover:?}");
        handover
    }

    fn buffers_outstanding(&self) -> usize {
        let queues = self.lock();
        queues.client_held.len() + queues.compositor_held.len()
    }

    fn swapper_size(&self) -> usize {
        self.swapper_size
    }
}
