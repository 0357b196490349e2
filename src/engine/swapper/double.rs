//! ### English
//! Lock-free, allocation-free two-buffer swapper.
//!
//! The whole ownership state lives in one atomic byte and every operation is a CAS retry loop
//! over a small transition table:
//!
//! | op      | before                        | after                                      |
//! |---------|-------------------------------|--------------------------------------------|
//! | dequeue | `dequeued = Free(p)`          | `Held(p)`, or `Held(!p)` if the compositor holds `p` |
//! | queue   | `dequeued = Held(x)`          | `Free(!x)`, newest frame = `x`             |
//! | grab    | `grabbed = Free(n)`           | `Held(n)`                                  |
//! | ungrab  | `grabbed = Held(_)`           | `Free(newest)`                             |
//!
//! ### 中文
//! 无锁、无分配的双缓冲交换器。
//!
//! 全部所有权状态存放在一个原子字节中，每个操作都是对一张小型状态转换表的 CAS 重试循环
//! （见上表）。

use std::sync::atomic::{AtomicU8, Ordering};

use crate::engine::buffer::BufferHandle;
use crate::engine::cache::pad_after;
use crate::engine::error::SwapperError;
use crate::engine::lockfree::Backoff;

use super::{BufferSwapper, Handover};

const DOUBLE_BUFFER_COUNT: usize = 2;

const TAG_FREE_0: u8 = 0;
const TAG_FREE_1: u8 = 1;
const TAG_HELD_A: u8 = 2;
const TAG_HELD_B: u8 = 3;
const TAG_MASK: u8 = 0b11;

const DEQUEUED_SHIFT: u8 = 0;
const GRABBED_SHIFT: u8 = 2;
const POSTED_BIT: u8 = 1 << 4;
const RETIRED_BIT: u8 = 1 << 5;

const STATE_PAD_BYTES: usize = pad_after::<AtomicU8>();

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
enum Slot {
    A,
    B,
}

impl Slot {
    #[inline]
    fn other(self) -> Self {
        match self {
            Slot::A => Slot::B,
            Slot::B => Slot::A,
        }
    }

    #[inline]
    fn index(self) -> usize {
        match self {
            Slot::A => 0,
            Slot::B => 1,
        }
    }
}

/// ### English
/// Per-side tag. A free tag's parity names the buffer that side gets next.
///
/// ### 中文
/// 每一侧的标签。空闲标签的奇偶性指明该侧下一次拿到的缓冲区。
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
enum Tag {
    Free(Slot),
    Held(Slot),
}

impl Tag {
    #[inline]
    fn encode(self) -> u8 {
        match self {
            Tag::Free(Slot::A) => TAG_FREE_0,
            Tag::Free(Slot::B) => TAG_FREE_1,
            Tag::Held(Slot::A) => TAG_HELD_A,
            Tag::Held(Slot::B) => TAG_HELD_B,
        }
    }

    #[inline]
    fn decode(bits: u8) -> Self {
        match bits & TAG_MASK {
            TAG_FREE_0 => Tag::Free(Slot::A),
            TAG_FREE_1 => Tag::Free(Slot::B),
            TAG_HELD_A => Tag::Held(Slot::A),
            _ => Tag::Held(Slot::B),
        }
    }

    #[inline]
    fn held(self) -> Option<Slot> {
        match self {
            Tag::Held(slot) => Some(slot),
            Tag::Free(_) => None,
        }
    }
}

/// ### English
/// Unpacked view of the state byte.
///
/// Invariants:
/// - `dequeued` and `grabbed` never hold the same slot.
/// - `dequeued` never holds `posted`.
/// - `grabbed == Free(p)` implies `p == posted`.
///
/// ### 中文
/// 状态字节的解包视图。
///
/// 不变式：
/// - `dequeued` 与 `grabbed` 从不持有同一槽位。
/// - `dequeued` 从不持有 `posted`。
/// - `grabbed == Free(p)` 时必有 `p == posted`。
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
struct DoubleState {
    dequeued: Tag,
    grabbed: Tag,
    /// ### English
    /// Newest completed frame. Tracked separately so a queue while the compositor is reading
    /// does not rewrite the compositor's held tag.
    ///
    /// ### 中文
    /// 最新完成的帧。单独记录，以便合成器读取期间发生的 queue 不会改写其持有标签。
    posted: Slot,
    retired: bool,
}

impl DoubleState {
    const INITIAL: Self = Self {
        dequeued: Tag::Free(Slot::A),
        grabbed: Tag::Free(Slot::B),
        posted: Slot::B,
        retired: false,
    };

    #[inline]
    fn pack(self) -> u8 {
        let mut bits =
            (self.dequeued.encode() << DEQUEUED_SHIFT) | (self.grabbed.encode() << GRABBED_SHIFT);
        if self.posted == Slot::B {
            bits |= POSTED_BIT;
        }
        if self.retired {
            bits |= RETIRED_BIT;
        }
        bits
    }

    #[inline]
    fn unpack(bits: u8) -> Self {
        Self {
            dequeued: Tag::decode(bits >> DEQUEUED_SHIFT),
            grabbed: Tag::decode(bits >> GRABBED_SHIFT),
            posted: if bits & POSTED_BIT != 0 { Slot::B } else { Slot::A },
            retired: bits & RETIRED_BIT != 0,
        }
    }

    fn dequeue(self) -> Result<(Self, Slot), SwapperError> {
        if self.retired {
            return Err(SwapperError::ForcedCompletion);
        }

        let next = match self.dequeued {
            Tag::Free(next) => next,
            Tag::Held(slot) => {
                debug_assert!(false, "dequeue while the client already holds a buffer");
                return Ok((self, slot));
            }
        };

        let slot = if self.grabbed == Tag::Held(next) {
            next.other()
        } else {
            next
        };

        let mut state = self;
        state.dequeued = Tag::Held(slot);
        if slot == self.posted {
            // The client overwrites a frame that was never shown; fall back to the older one.
            state.posted = slot.other();
            if let Tag::Free(_) = state.grabbed {
                state.grabbed = Tag::Free(state.posted);
            }
        }
        Ok((state, slot))
    }

    fn queue(self) -> Self {
        let Tag::Held(slot) = self.dequeued else {
            debug_assert!(false, "queue without a dequeued buffer");
            return self;
        };

        let mut state = self;
        state.dequeued = Tag::Free(slot.other());
        state.posted = slot;
        if let Tag::Free(_) = state.grabbed {
            state.grabbed = Tag::Free(slot);
        }
        state
    }

    fn grab(self) -> (Self, Slot) {
        match self.grabbed {
            Tag::Free(newest) => {
                let mut state = self;
                state.grabbed = Tag::Held(newest);
                (state, newest)
            }
            Tag::Held(slot) => {
                debug_assert!(false, "grab while the compositor already holds a buffer");
                (self, slot)
            }
        }
    }

    fn ungrab(self) -> Self {
        let mut state = self;
        state.grabbed = Tag::Free(self.posted);
        state
    }
}

#[repr(C, align(64))]
struct StateWord {
    word: AtomicU8,
    _padding: [u8; STATE_PAD_BYTES],
}

/// ### English
/// Two-buffer swapper with no locks and no allocation on the hot path.
///
/// Never blocks: when the compositor is still reading the buffer the client would get next,
/// the client is handed the other buffer and the unshown frame in it is dropped.
/// Safe for one client thread and one compositor thread.
///
/// ### 中文
/// 热路径无锁、无分配的双缓冲交换器。
///
/// 从不阻塞：若合成器仍在读取客户端下一个要拿到的缓冲区，则把另一个缓冲区交给客户端，
/// 其中尚未显示的帧被丢弃。仅对一个客户端线程 + 一个合成器线程安全。
pub struct BufferSwapperDouble {
    buffers: [BufferHandle; DOUBLE_BUFFER_COUNT],
    state: StateWord,
}

impl BufferSwapperDouble {
    /// ### English
    /// Creates a swapper that owns `buffer_a` and `buffer_b`. The client gets `buffer_a` first.
    ///
    /// ### 中文
    /// 创建持有 `buffer_a` 与 `buffer_b` 的交换器。客户端首先拿到 `buffer_a`。
    pub fn new(buffer_a: BufferHandle, buffer_b: BufferHandle) -> Self {
        log::debug!(
            "double swapper created with {} and {}",
            buffer_a.id(),
            buffer_b.id()
        );
        Self {
            buffers: [buffer_a, buffer_b],
            state: StateWord {
                word: AtomicU8::new(DoubleState::INITIAL.pack()),
                _padding: [0; STATE_PAD_BYTES],
            },
        }
    }

    #[inline]
    fn load(&self) -> DoubleState {
        DoubleState::unpack(self.state.word.load(Ordering::Acquire))
    }

    #[inline]
    fn buffer(&self, slot: Slot) -> BufferHandle {
        self.buffers[slot.index()].clone()
    }

    fn transition<R>(
        &self,
        mut step: impl FnMut(DoubleState) -> Result<(DoubleState, R), SwapperError>,
    ) -> Result<R, SwapperError> {
        let mut backoff = Backoff::new();
        let mut current = self.state.word.load(Ordering::Acquire);
        loop {
            let (next, out) = step(DoubleState::unpack(current))?;
            match self.state.word.compare_exchange_weak(
                current,
                next.pack(),
                Ordering::AcqRel,
                Ordering::Acquire,
            ) {
                Ok(_) => return Ok(out),
                Err(actual) => {
                    current = actual;
                    if backoff.is_yielding() {
                        log::trace!("double swapper state contended, yielding");
                    }
                    backoff.snooze();
                }
            }
        }
    }

    /// ### English
    /// Client side: takes the buffer to render into.
    ///
    /// Fails only with `ForcedCompletion` after the swapper was retired.
    ///
    /// ### 中文
    /// 客户端：取得用于渲染的缓冲区。
    ///
    /// 仅在交换器退役后以 `ForcedCompletion` 失败。
    pub fn dequeue_free_buffer(&self) -> Result<BufferHandle, SwapperError> {
        let slot = self.transition(DoubleState::dequeue)?;
        Ok(self.buffer(slot))
    }

    /// ### English
    /// Client side: posts the dequeued buffer as the newest completed frame.
    ///
    /// ### 中文
    /// 客户端：将已 dequeue 的缓冲区发布为最新完成的帧。
    pub fn queue_finished_buffer(&self) {
        let _ = self.transition(|state| Ok((state.queue(), ())));
    }

    /// ### English
    /// Compositor side: takes the newest completed frame. Never blocks, never fails.
    ///
    /// ### 中文
    /// 合成器：取得最新完成的帧。从不阻塞，也不会失败。
    pub fn grab_last_posted(&self) -> BufferHandle {
        let slot = self
            .transition(|state| Ok(state.grab()))
            .unwrap_or(Slot::A);
        self.buffer(slot)
    }

    /// ### English
    /// Compositor side: gives the grabbed buffer back.
    ///
    /// ### 中文
    /// 合成器：归还已 grab 的缓冲区。
    pub fn ungrab(&self) {
        let _ = self.transition(|state| Ok((state.ungrab(), ())));
    }

    fn held_by(&self, tag: Tag, buffer: &BufferHandle) -> bool {
        tag.held()
            .is_some_and(|slot| self.buffers[slot.index()].id() == buffer.id())
    }
}

impl BufferSwapper for BufferSwapperDouble {
    fn client_acquire(&self) -> Result<BufferHandle, SwapperError> {
        self.dequeue_free_buffer()
    }

    fn client_release(&self, buffer: BufferHandle) -> Result<(), SwapperError> {
        if !self.held_by(self.load().dequeued, &buffer) {
            return Err(SwapperError::UnexpectedRelease { id: buffer.id() });
        }
        self.queue_finished_buffer();
        Ok(())
    }

    fn compositor_acquire(&self) -> Result<BufferHandle, SwapperError> {
        Ok(self.grab_last_posted())
    }

    fn compositor_release(&self, buffer: BufferHandle) -> Result<(), SwapperError> {
        if !self.held_by(self.load().grabbed, &buffer) {
            return Err(SwapperError::UnexpectedRelease { id: buffer.id() });
        }
        self.ungrab();
        Ok(())
    }

    fn force_client_completion(&self) {
        self.state.word.fetch_or(RETIRED_BIT, Ordering::AcqRel);
    }

    fn end_responsibility(&self, buffers: &mut Vec<BufferHandle>) -> Handover {
        let previous = DoubleState::unpack(self.state.word.fetch_or(RETIRED_BIT, Ordering::AcqRel));

        let client = previous.dequeued.held();
        let compositor = previous.grabbed.held();
        for slot in [previous.posted.other(), previous.posted] {
            if client != Some(slot) && compositor != Some(slot) {
                buffers.push(self.buffer(slot));
            }
        }

        let handover = Handover {
            swapper_size: DOUBLE_BUFFER_COUNT,
            client_held: client.map(|slot| self.buffer(slot).id()).into_iter().collect(),
            compositor_held: compositor
                .map(|slot| self.buffer(slot).id())
                .into_iter()
                .collect(),
        };
        log::debug!("double swapper retired: {handover:?}");
        handover
    }

    fn buffers_outstanding(&self) -> usize {
        let state = self.load();
        usize::from(state.dequeued.held().is_some()) + usize::from(state.grabbed.held().is_some())
    }

    fn lock_free(&self) -> bool {
        true
    }

    fn swapper_size(&self) -> usize {
        DOUBLE_BUFFER_COUNT
    }
}

#[cfg(test)]
mod tests {
    use std::sync::Arc;

    use super::*;
    use crate::engine::buffer::BufferId;
    use crate::engine::swapper::test_support::stub_buffers;

    fn swapper() -> (BufferSwapperDouble, BufferId, BufferId) {
        let mut buffers = stub_buffers(2);
        let b = buffers.pop().unwrap();
        let a = buffers.pop().unwrap();
        let (id_a, id_b) = (a.id(), b.id());
        (BufferSwapperDouble::new(a, b), id_a, id_b)
    }

    #[test]
    fn state_word_is_padded_to_a_cache_line() {
        assert_eq!(std::mem::size_of::<StateWord>(), 64);
    }

    #[test]
    fn end_to_end_sequence() {
        let (swapper, a, b) = swapper();

        assert_eq!(swapper.dequeue_free_buffer().unwrap().id(), a);
        swapper.queue_finished_buffer();
        assert_eq!(swapper.grab_last_posted().id(), a);
        assert_eq!(swapper.dequeue_free_buffer().unwrap().id(), b);
        swapper.ungrab();
        swapper.queue_finished_buffer();
        assert_eq!(swapper.grab_last_posted().id(), b);
    }

    #[test]
    fn compositor_gets_a_buffer_before_any_frame_is_posted() {
        let (swapper, a, b) = swapper();

        let client = swapper.dequeue_free_buffer().unwrap();
        let compositor = swapper.grab_last_posted();
        assert_eq!(client.id(), a);
        assert_eq!(compositor.id(), b);
    }

    #[test]
    fn client_never_takes_the_buffer_being_read() {
        let (swapper, a, b) = swapper();

        swapper.dequeue_free_buffer().unwrap();
        swapper.queue_finished_buffer();
        assert_eq!(swapper.grab_last_posted().id(), a);

        assert_eq!(swapper.dequeue_free_buffer().unwrap().id(), b);
        swapper.queue_finished_buffer();

        // Next in turn is `a`, which the compositor still reads: the unshown `b` is reused.
        assert_eq!(swapper.dequeue_free_buffer().unwrap().id(), b);
        swapper.ungrab();

        // `b` is being rendered again, so the compositor re-shows `a`.
        assert_eq!(swapper.grab_last_posted().id(), a);
        swapper.ungrab();

        swapper.queue_finished_buffer();
        assert_eq!(swapper.grab_last_posted().id(), b);
    }

    #[test]
    fn posting_while_grabbed_keeps_the_held_tag() {
        let (swapper, a, b) = swapper();

        swapper.dequeue_free_buffer().unwrap();
        swapper.queue_finished_buffer();
        let grabbed = swapper.grab_last_posted();
        assert_eq!(grabbed.id(), a);

        swapper.dequeue_free_buffer().unwrap();
        swapper.queue_finished_buffer();

        assert!(BufferSwapper::compositor_release(&swapper, grabbed).is_ok());
        assert_eq!(swapper.grab_last_posted().id(), b);
    }

    #[test]
    fn release_of_a_foreign_buffer_is_reported() {
        let (swapper, _, _) = swapper();
        let client = swapper.client_acquire().unwrap();
        let stranger = stub_buffers(1).pop().unwrap();

        let err = swapper.client_release(stranger).unwrap_err();
        assert!(matches!(err, SwapperError::UnexpectedRelease { .. }));
        assert!(swapper.client_release(client).is_ok());

        let compositor = swapper.compositor_acquire().unwrap();
        let other = swapper.client_acquire().unwrap();
        assert!(swapper.compositor_release(Arc::clone(&other)).is_err());
        assert!(swapper.compositor_release(compositor).is_ok());
    }

    #[test]
    fn forced_completion_fails_client_but_not_compositor() {
        let (swapper, _, _) = swapper();
        swapper.force_client_completion();

        assert!(matches!(
            swapper.client_acquire(),
            Err(SwapperError::ForcedCompletion)
        ));
        let frame = swapper.compositor_acquire().unwrap();
        assert!(swapper.compositor_release(frame).is_ok());
    }

    #[test]
    fn end_responsibility_reports_outstanding_buffers() {
        let (swapper, a, b) = swapper();
        let client = swapper.client_acquire().unwrap();
        assert_eq!(client.id(), a);
        assert_eq!(swapper.buffers_outstanding(), 1);

        let mut buffers = Vec::new();
        let handover = swapper.end_responsibility(&mut buffers);
        assert_eq!(
            handover,
            Handover {
                swapper_size: 2,
                client_held: vec![a],
                compositor_held: Vec::new(),
            }
        );
        assert_eq!(buffers.iter().map(|buf| buf.id()).collect::<Vec<_>>(), [b]);
        assert!(swapper.client_acquire().is_err());
    }

    #[test]
    fn end_responsibility_puts_newest_frame_last() {
        let (swapper, a, b) = swapper();
        swapper.dequeue_free_buffer().unwrap();
        swapper.queue_finished_buffer();

        let mut buffers = Vec::new();
        let handover = swapper.end_responsibility(&mut buffers);
        assert_eq!(handover.outstanding(), 0);
        assert_eq!(
            buffers.iter().map(|buf| buf.id()).collect::<Vec<_>>(),
            [b, a]
        );
    }
}
