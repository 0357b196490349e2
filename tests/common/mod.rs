//! Shared fixtures for the integration tests.

#![allow(dead_code)]

use std::sync::Arc;
use std::sync::atomic::{AtomicU8, AtomicUsize, Ordering};

use compositor_swap::{
    AllocationError, Buffer, BufferHandle, BufferId, BufferProperties, BufferUsage,
    GraphicBufferAllocator, PhysicalSize, PixelFormat,
};

pub struct TestBuffer {
    id: BufferId,
    properties: BufferProperties,
}

impl Buffer for TestBuffer {
    fn id(&self) -> BufferId {
        self.id
    }

    fn size(&self) -> PhysicalSize<u32> {
        self.properties.size
    }

    fn stride(&self) -> u32 {
        self.properties.min_stride()
    }

    fn pixel_format(&self) -> PixelFormat {
        self.properties.format
    }
}

pub fn properties() -> BufferProperties {
    BufferProperties::new(
        PhysicalSize::new(640, 480),
        PixelFormat::Xrgb8888,
        BufferUsage::Software,
    )
}

pub fn test_buffers(count: usize) -> Vec<BufferHandle> {
    (0..count)
        .map(|_| {
            Arc::new(TestBuffer {
                id: BufferId::new(),
                properties: properties(),
            }) as BufferHandle
        })
        .collect()
}

#[derive(Default)]
pub struct TestAllocator {
    pub allocated: AtomicUsize,
}

impl GraphicBufferAllocator for TestAllocator {
    fn alloc_buffer(&self, properties: &BufferProperties) -> Result<BufferHandle, AllocationError> {
        self.allocated.fetch_add(1, Ordering::Relaxed);
        Ok(Arc::new(TestBuffer {
            id: BufferId::new(),
            properties: *properties,
        }))
    }

    fn supported_pixel_formats(&self) -> Vec<PixelFormat> {
        vec![PixelFormat::Xrgb8888]
    }
}

pub const FREE: u8 = 0;
pub const CLIENT: u8 = 1;
pub const COMPOSITOR: u8 = 2;

/// Records which side owns each buffer and fails on a second owner.
pub struct OwnershipTable {
    ids: Vec<BufferId>,
    owners: Vec<AtomicU8>,
}

impl OwnershipTable {
    pub fn new(buffers: &[BufferHandle]) -> Self {
        Self {
            ids: buffers.iter().map(|buffer| buffer.id()).collect(),
            owners: buffers.iter().map(|_| AtomicU8::new(FREE)).collect(),
        }
    }

    fn slot(&self, id: BufferId) -> &AtomicU8 {
        let index = self
            .ids
            .iter()
            .position(|known| *known == id)
            .unwrap_or_else(|| panic!("{id} does not belong to the swapper"));
        &self.owners[index]
    }

    pub fn take(&self, id: BufferId, side: u8) {
        let previous = self.slot(id).swap(side, Ordering::AcqRel);
        assert_eq!(previous, FREE, "{id} handed to side {side} while owned by {previous}");
    }

    pub fn give_back(&self, id: BufferId, side: u8) {
        let previous = self.slot(id).swap(FREE, Ordering::AcqRel);
        assert_eq!(previous, side, "{id} released by side {side} but owned by {previous}");
    }
}
