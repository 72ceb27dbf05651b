//! Bottom-level acceleration structures and batched builds.
//!
//! Structures are requested for building with
//! [`AccelerationStructureBatcher::build_blas`] and built together on the next
//! [`execute`](AccelerationStructureBatcher::execute). All builds of a batch share
//! one scratch buffer. Each build gets its own aligned range of that buffer, so
//! builds never overlap in scratch memory.
//!
//! ```
//! # use ash::vk;
//! # use scoria::{Device, backend::headless::HeadlessBackend};
//! # use scoria::command::{CommandBuffer, CommandBufferKind};
//! # use scoria::rtx::{AccelerationStructure, AccelerationStructureBatcher, BlasGeometry};
//! # use std::sync::Arc;
//! let device = Device::new(HeadlessBackend::new());
//! let geometry = BlasGeometry::Aabbs {
//!     data: 0x1000,
//!     stride: 24,
//!     flags: vk::GeometryFlagsKHR::OPAQUE,
//! };
//! let blas = Arc::new(
//!     AccelerationStructure::new_bottom_level(
//!         device.clone(),
//!         &[geometry],
//!         &[16],
//!         vk::BuildAccelerationStructureFlagsKHR::PREFER_FAST_TRACE,
//!     )
//!     .unwrap(),
//! );
//! let range = vk::AccelerationStructureBuildRangeInfoKHR {
//!     primitive_count: 16,
//!     ..Default::default()
//! };
//!
//! let mut batcher = AccelerationStructureBatcher::new(device.clone());
//! batcher.build_blas(blas.clone(), vec![geometry], vec![range]).unwrap();
//!
//! let mut cmd = CommandBuffer::new_primary(device, CommandBufferKind::Compute, u64::MAX).unwrap();
//! cmd.begin_recording().unwrap();
//! batcher.execute(&mut cmd).unwrap();
//! assert!(blas.is_built());
//! assert_eq!(batcher.pending(), 0);
//! ```

use std::{
    fmt::Debug,
    ops::Range,
    sync::{
        Arc,
        atomic::{AtomicBool, Ordering},
    },
};

use ash::vk;
use smallvec::SmallVec;

use crate::{
    Device, HasDevice,
    backend::RawAccelerationStructure,
    buffer::Buffer,
    command::{CommandBuffer, CommandBufferState},
    error::{Error, Result},
    tracking::Access,
    utils::AsVkHandle,
};

/// Memory requirements of an acceleration structure build.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct BuildSizes {
    pub acceleration_structure_size: vk::DeviceSize,
    pub build_scratch_size: vk::DeviceSize,
    pub update_scratch_size: vk::DeviceSize,
}

impl From<vk::AccelerationStructureBuildSizesInfoKHR<'_>> for BuildSizes {
    fn from(info: vk::AccelerationStructureBuildSizesInfoKHR<'_>) -> Self {
        Self {
            acceleration_structure_size: info.acceleration_structure_size,
            build_scratch_size: info.build_scratch_size,
            update_scratch_size: info.update_scratch_size,
        }
    }
}

/// Geometry source of a bottom-level build. Every address is a device address.
#[derive(Debug, Clone, Copy)]
pub enum BlasGeometry {
    Triangles {
        vertex_format: vk::Format,
        vertex_data: vk::DeviceAddress,
        vertex_stride: vk::DeviceSize,
        max_vertex: u32,
        index_type: vk::IndexType,
        index_data: vk::DeviceAddress,
        /// Zero for no transform.
        transform_data: vk::DeviceAddress,
        flags: vk::GeometryFlagsKHR,
    },
    Aabbs {
        data: vk::DeviceAddress,
        stride: vk::DeviceSize,
        flags: vk::GeometryFlagsKHR,
    },
}

impl BlasGeometry {
    pub fn to_vk(&self) -> vk::AccelerationStructureGeometryKHR<'static> {
        match *self {
            Self::Triangles {
                vertex_format,
                vertex_data,
                vertex_stride,
                max_vertex,
                index_type,
                index_data,
                transform_data,
                flags,
            } => vk::AccelerationStructureGeometryKHR {
                geometry_type: vk::GeometryTypeKHR::TRIANGLES,
                geometry: vk::AccelerationStructureGeometryDataKHR {
                    triangles: vk::AccelerationStructureGeometryTrianglesDataKHR {
                        vertex_format,
                        vertex_data: vk::DeviceOrHostAddressConstKHR {
                            device_address: vertex_data,
                        },
                        vertex_stride,
                        max_vertex,
                        index_type,
                        index_data: vk::DeviceOrHostAddressConstKHR {
                            device_address: index_data,
                        },
                        transform_data: vk::DeviceOrHostAddressConstKHR {
                            device_address: transform_data,
                        },
                        ..Default::default()
                    },
                },
                flags,
                ..Default::default()
            },
            Self::Aabbs {
                data,
                stride,
                flags,
            } => vk::AccelerationStructureGeometryKHR {
                geometry_type: vk::GeometryTypeKHR::AABBS,
                geometry: vk::AccelerationStructureGeometryDataKHR {
                    aabbs: vk::AccelerationStructureGeometryAabbsDataKHR {
                        data: vk::DeviceOrHostAddressConstKHR {
                            device_address: data,
                        },
                        stride,
                        ..Default::default()
                    },
                },
                flags,
                ..Default::default()
            },
        }
    }
}

pub struct AccelerationStructure {
    device: Device,
    raw: RawAccelerationStructure,
    ty: vk::AccelerationStructureTypeKHR,
    flags: vk::BuildAccelerationStructureFlagsKHR,
    build_sizes: BuildSizes,
    built: AtomicBool,
}

impl AccelerationStructure {
    /// Creates an unbuilt acceleration structure with storage for
    /// `build_sizes.acceleration_structure_size` bytes.
    pub fn new(
        device: Device,
        ty: vk::AccelerationStructureTypeKHR,
        flags: vk::BuildAccelerationStructureFlagsKHR,
        build_sizes: BuildSizes,
    ) -> Result<Self> {
        let size = build_sizes.acceleration_structure_size;
        let raw = device
            .create_acceleration_structure(ty, size)
            .map_err(|err| match err {
                vk::Result::ERROR_OUT_OF_DEVICE_MEMORY | vk::Result::ERROR_OUT_OF_HOST_MEMORY => {
                    Error::OutOfDeviceMemory {
                        what: "acceleration structure",
                        size,
                    }
                }
                err => Error::Vulkan(err),
            })?;
        Ok(Self {
            device,
            raw,
            ty,
            flags,
            build_sizes,
            built: AtomicBool::new(false),
        })
    }

    /// Creates a bottom-level structure sized for `geometries`, where geometry `i`
    /// holds at most `max_primitive_counts[i]` primitives.
    pub fn new_bottom_level(
        device: Device,
        geometries: &[BlasGeometry],
        max_primitive_counts: &[u32],
        flags: vk::BuildAccelerationStructureFlagsKHR,
    ) -> Result<Self> {
        debug_assert_eq!(geometries.len(), max_primitive_counts.len());
        let geometries: SmallVec<[vk::AccelerationStructureGeometryKHR; 4]> =
            geometries.iter().map(BlasGeometry::to_vk).collect();
        let info = vk::AccelerationStructureBuildGeometryInfoKHR::default()
            .ty(vk::AccelerationStructureTypeKHR::BOTTOM_LEVEL)
            .flags(flags)
            .mode(vk::BuildAccelerationStructureModeKHR::BUILD)
            .geometries(&geometries);
        let build_sizes = device.acceleration_structure_build_sizes(&info, max_primitive_counts);
        Self::new(
            device,
            vk::AccelerationStructureTypeKHR::BOTTOM_LEVEL,
            flags,
            build_sizes.into(),
        )
    }

    pub fn ty(&self) -> vk::AccelerationStructureTypeKHR {
        self.ty
    }

    pub fn flags(&self) -> vk::BuildAccelerationStructureFlagsKHR {
        self.flags
    }

    pub fn device_address(&self) -> vk::DeviceAddress {
        self.raw.device_address
    }

    pub fn build_sizes(&self) -> BuildSizes {
        self.build_sizes
    }

    /// Whether a build of this structure has been recorded.
    pub fn is_built(&self) -> bool {
        self.built.load(Ordering::Acquire)
    }

    fn mark_built(&self) {
        self.built.store(true, Ordering::Release);
    }
}

impl Debug for AccelerationStructure {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("AccelerationStructure")
            .field("raw", &self.raw.raw)
            .field("ty", &self.ty)
            .field("device_address", &self.raw.device_address)
            .field("built", &self.is_built())
            .finish_non_exhaustive()
    }
}
impl HasDevice for AccelerationStructure {
    fn device(&self) -> &Device {
        &self.device
    }
}
impl AsVkHandle for AccelerationStructure {
    type Handle = vk::AccelerationStructureKHR;
    fn vk_handle(&self) -> Self::Handle {
        self.raw.raw
    }
}
impl Drop for AccelerationStructure {
    fn drop(&mut self) {
        self.device.destroy_acceleration_structure(&self.raw);
    }
}

/// Placement of a batch of builds in one scratch buffer.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ScratchLayout {
    /// Byte range of each build, in request order.
    pub ranges: Vec<Range<u64>>,
    /// Size the scratch buffer needs.
    pub total: u64,
}

/// Places builds of the given scratch sizes back to back, starting each one at a
/// multiple of `alignment`.
pub fn scratch_layout(sizes: impl IntoIterator<Item = u64>, alignment: u64) -> ScratchLayout {
    let alignment = alignment.max(1);
    let mut total = 0;
    let ranges = sizes
        .into_iter()
        .map(|size| {
            let start = total;
            total += size.next_multiple_of(alignment);
            start..start + size
        })
        .collect();
    ScratchLayout { ranges, total }
}

/// Grow-only scratch buffer.
struct ScratchArena {
    buffer: Option<Buffer>,
    alignment: vk::DeviceSize,
}

impl ScratchArena {
    fn capacity(&self) -> vk::DeviceSize {
        self.buffer.as_ref().map_or(0, Buffer::size)
    }

    /// Makes room for `size` bytes. Returns the replaced buffer when the arena
    /// had to grow.
    fn reserve(&mut self, device: &Device, size: vk::DeviceSize) -> Result<Option<Buffer>> {
        if size <= self.capacity() {
            return Ok(None);
        }
        let buffer = Buffer::new_private(
            device.clone(),
            size,
            self.alignment,
            vk::BufferUsageFlags::STORAGE_BUFFER | vk::BufferUsageFlags::SHADER_DEVICE_ADDRESS,
        )?;
        tracing::debug!(old = self.capacity(), new = size, "Growing scratch arena");
        Ok(self.buffer.replace(buffer))
    }

    fn device_address(&self) -> vk::DeviceAddress {
        self.buffer.as_ref().map_or(0, Buffer::device_address)
    }
}

struct BuildRequest {
    target: Arc<AccelerationStructure>,
    geometries: Vec<BlasGeometry>,
    ranges: Vec<vk::AccelerationStructureBuildRangeInfoKHR>,
}

/// Collects bottom-level builds and records them together.
pub struct AccelerationStructureBatcher {
    device: Device,
    requests: Vec<BuildRequest>,
    arena: ScratchArena,
}

impl AccelerationStructureBatcher {
    pub fn new(device: Device) -> Self {
        let alignment = device
            .limits()
            .min_acceleration_structure_scratch_offset_alignment;
        Self {
            device,
            requests: Vec::new(),
            arena: ScratchArena {
                buffer: None,
                alignment,
            },
        }
    }

    /// Queues a build of `target`. `ranges[i]` describes the primitives taken
    /// from `geometries[i]`, so both lists must have the same, non-zero length.
    pub fn build_blas(
        &mut self,
        target: Arc<AccelerationStructure>,
        geometries: Vec<BlasGeometry>,
        ranges: Vec<vk::AccelerationStructureBuildRangeInfoKHR>,
    ) -> Result<()> {
        if geometries.is_empty() && ranges.is_empty() {
            tracing::error!(target = ?target.vk_handle(), "BLAS build requested without geometries");
            return Err(Error::EmptyBuildRequest);
        }
        if geometries.len() != ranges.len() {
            tracing::error!(
                target = ?target.vk_handle(),
                geometries = geometries.len(),
                ranges = ranges.len(),
                "Geometry and build range counts differ"
            );
            return Err(Error::MismatchedBuildRanges {
                geometries: geometries.len(),
                ranges: ranges.len(),
            });
        }
        self.requests.push(BuildRequest {
            target,
            geometries,
            ranges,
        });
        Ok(())
    }

    /// Number of builds waiting for the next [`execute`](Self::execute).
    pub fn pending(&self) -> usize {
        self.requests.len()
    }

    pub fn scratch_capacity(&self) -> vk::DeviceSize {
        self.arena.capacity()
    }

    /// Records every queued build into `cmd`, which must be recording.
    pub fn execute(&mut self, cmd: &mut CommandBuffer) -> Result<()> {
        if self.requests.is_empty() {
            return Ok(());
        }
        if cmd.state() != CommandBufferState::Recording {
            tracing::error!(state = ?cmd.state(), "Cannot build acceleration structures outside recording");
            return Err(Error::InvalidState {
                operation: "execute",
                state: cmd.state(),
            });
        }
        tracing::info!("Building {} BLAS", self.requests.len());

        let layout = scratch_layout(
            self.requests
                .iter()
                .map(|request| request.target.build_sizes().build_scratch_size),
            self.arena.alignment,
        );
        if let Some(retired) = self.arena.reserve(&self.device, layout.total)? {
            // Earlier submissions may still be reading it.
            cmd.retain(retired);
        }
        let base = self.arena.device_address();

        // Pending transitions must land before the first build.
        cmd.emit_barriers()?;
        for (request, range) in self.requests.iter().zip(&layout.ranges) {
            let geometries: SmallVec<[vk::AccelerationStructureGeometryKHR; 4]> =
                request.geometries.iter().map(BlasGeometry::to_vk).collect();
            let info = vk::AccelerationStructureBuildGeometryInfoKHR::default()
                .ty(vk::AccelerationStructureTypeKHR::BOTTOM_LEVEL)
                .flags(request.target.flags())
                .mode(vk::BuildAccelerationStructureModeKHR::BUILD)
                .dst_acceleration_structure(request.target.vk_handle())
                .geometries(&geometries)
                .scratch_data(vk::DeviceOrHostAddressKHR {
                    device_address: base + range.start,
                });
            self.device.cmd_build_acceleration_structures(
                cmd.vk_handle(),
                std::slice::from_ref(&info),
                &[request.ranges.as_slice()],
            );
            cmd.memory_barrier(
                Access::ACCELERATION_STRUCTURE_BUILD,
                Access::ACCELERATION_STRUCTURE_BUILD,
            );
            cmd.emit_barriers()?;
            request.target.mark_built();
            cmd.retain(request.target.clone());
        }
        self.requests.clear();
        Ok(())
    }
}

impl HasDevice for AccelerationStructureBatcher {
    fn device(&self) -> &Device {
        &self.device
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{
        backend::headless::{Call, FailurePoint, HeadlessBackend},
        command::CommandBufferKind,
    };

    fn aabbs() -> BlasGeometry {
        BlasGeometry::Aabbs {
            data: 0x2000,
            stride: 24,
            flags: vk::GeometryFlagsKHR::OPAQUE,
        }
    }

    fn range(primitive_count: u32) -> vk::AccelerationStructureBuildRangeInfoKHR {
        vk::AccelerationStructureBuildRangeInfoKHR {
            primitive_count,
            ..Default::default()
        }
    }

    fn blas(device: &Device, primitives: u32) -> Arc<AccelerationStructure> {
        Arc::new(
            AccelerationStructure::new_bottom_level(
                device.clone(),
                &[aabbs()],
                &[primitives],
                vk::BuildAccelerationStructureFlagsKHR::PREFER_FAST_TRACE,
            )
            .unwrap(),
        )
    }

    fn recording(device: &Device) -> CommandBuffer {
        let mut cmd =
            CommandBuffer::new_primary(device.clone(), CommandBufferKind::Compute, u64::MAX)
                .unwrap();
        cmd.begin_recording().unwrap();
        cmd
    }

    #[test]
    fn test_scratch_layout_aligns_each_start() {
        let layout = scratch_layout([136, 236, 336], 128);
        assert_eq!(layout.ranges, vec![0..136, 256..492, 512..848]);
        assert_eq!(layout.total, 256 + 256 + 384);
        for pair in layout.ranges.windows(2) {
            assert!(pair[0].end <= pair[1].start);
        }
        assert_eq!(scratch_layout([], 128).total, 0);
    }

    #[test]
    fn test_batched_builds_use_disjoint_scratch() {
        let backend = HeadlessBackend::new();
        let device = Device::new(backend.clone());
        let structures = [blas(&device, 1), blas(&device, 2), blas(&device, 3)];

        let mut batcher = AccelerationStructureBatcher::new(device.clone());
        for (i, target) in structures.iter().enumerate() {
            batcher
                .build_blas(target.clone(), vec![aabbs()], vec![range(i as u32 + 1)])
                .unwrap();
        }
        assert_eq!(batcher.pending(), 3);

        let mut cmd = recording(&device);
        backend.clear_calls();
        batcher.execute(&mut cmd).unwrap();

        // Scratch sizes are 136, 236 and 336 bytes with a 128 byte alignment.
        let expected_total = 256 + 256 + 384;
        assert_eq!(batcher.scratch_capacity(), expected_total);
        assert_eq!(batcher.pending(), 0);

        let builds: Vec<(vk::AccelerationStructureKHR, u64, u32)> = backend
            .calls()
            .into_iter()
            .filter_map(|call| match call {
                Call::BuildAccelerationStructure {
                    dst,
                    scratch_address,
                    primitive_count,
                    ..
                } => Some((dst, scratch_address, primitive_count)),
                _ => None,
            })
            .collect();
        assert_eq!(builds.len(), 3);
        let base = builds[0].1;
        let offsets: Vec<u64> = builds.iter().map(|b| b.1 - base).collect();
        assert_eq!(offsets, vec![0, 256, 512]);
        for ((dst, _, primitives), (i, target)) in builds.iter().zip(structures.iter().enumerate()) {
            assert_eq!(*dst, target.vk_handle());
            assert_eq!(*primitives, i as u32 + 1);
            assert!(target.is_built());
        }
        // One barrier after every build.
        assert_eq!(
            backend.count(|c| matches!(c, Call::PipelineBarrier { .. })),
            3
        );
    }

    #[test]
    fn test_empty_request_is_rejected() {
        let device = Device::new(HeadlessBackend::new());
        let target = blas(&device, 4);
        let mut batcher = AccelerationStructureBatcher::new(device);
        assert!(matches!(
            batcher.build_blas(target, Vec::new(), Vec::new()),
            Err(Error::EmptyBuildRequest)
        ));
        assert_eq!(batcher.pending(), 0);
    }

    #[test]
    fn test_mismatched_ranges_are_rejected() {
        let backend = HeadlessBackend::new();
        let device = Device::new(backend.clone());
        let target = blas(&device, 4);
        let mut batcher = AccelerationStructureBatcher::new(device.clone());
        assert!(matches!(
            batcher.build_blas(target.clone(), vec![aabbs()], Vec::new()),
            Err(Error::MismatchedBuildRanges {
                geometries: 1,
                ranges: 0
            })
        ));
        assert!(matches!(
            batcher.build_blas(target.clone(), Vec::new(), vec![range(4)]),
            Err(Error::MismatchedBuildRanges {
                geometries: 0,
                ranges: 1
            })
        ));
        assert!(matches!(
            batcher.build_blas(target.clone(), vec![aabbs()], vec![range(2), range(2)]),
            Err(Error::MismatchedBuildRanges { .. })
        ));
        assert_eq!(batcher.pending(), 0);

        // Nothing reaches the device.
        let mut cmd = recording(&device);
        backend.clear_calls();
        batcher.execute(&mut cmd).unwrap();
        assert_eq!(
            backend.count(|c| matches!(c, Call::BuildAccelerationStructure { .. })),
            0
        );
        assert!(!target.is_built());
    }

    #[test]
    fn test_arena_only_grows() {
        let backend = HeadlessBackend::new();
        let device = Device::new(backend.clone());
        let large = blas(&device, 10);
        let small = blas(&device, 1);
        let mut batcher = AccelerationStructureBatcher::new(device.clone());

        let mut cmd = recording(&device);
        batcher
            .build_blas(large, vec![aabbs()], vec![range(10)])
            .unwrap();
        batcher.execute(&mut cmd).unwrap();
        let capacity = batcher.scratch_capacity();
        assert_eq!(capacity, 1036u64.next_multiple_of(128));

        backend.clear_calls();
        batcher
            .build_blas(small, vec![aabbs()], vec![range(1)])
            .unwrap();
        batcher.execute(&mut cmd).unwrap();
        assert_eq!(batcher.scratch_capacity(), capacity);
        assert_eq!(
            backend.count(|c| matches!(c, Call::CreateBuffer { .. })),
            0
        );
    }

    #[test]
    fn test_execute_outside_recording_keeps_requests() {
        let device = Device::new(HeadlessBackend::new());
        let target = blas(&device, 2);
        let mut batcher = AccelerationStructureBatcher::new(device.clone());
        batcher
            .build_blas(target.clone(), vec![aabbs()], vec![range(2)])
            .unwrap();

        let mut cmd =
            CommandBuffer::new_primary(device, CommandBufferKind::Compute, u64::MAX).unwrap();
        assert!(matches!(
            batcher.execute(&mut cmd),
            Err(Error::InvalidState { .. })
        ));
        assert_eq!(batcher.pending(), 1);
        assert!(!target.is_built());
    }

    #[test]
    fn test_scratch_allocation_failure_propagates() {
        let backend = HeadlessBackend::new();
        let device = Device::new(backend.clone());
        let target = blas(&device, 2);
        let mut batcher = AccelerationStructureBatcher::new(device.clone());
        batcher
            .build_blas(target, vec![aabbs()], vec![range(2)])
            .unwrap();

        let mut cmd = recording(&device);
        backend.fail_next(FailurePoint::CreateBuffer);
        assert!(matches!(
            batcher.execute(&mut cmd),
            Err(Error::OutOfDeviceMemory { what: "buffer", .. })
        ));
        assert_eq!(batcher.pending(), 1);
        assert_eq!(batcher.scratch_capacity(), 0);
    }
}
