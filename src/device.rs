//! V4L2 device implementation using the v4l crate.
//!
//! Format, frame rate and controls go through the v4l crate's safe API.
//! The buffer queue is driven with raw ioctls so that every slot can be
//! queued, dequeued and read individually.
#![allow(unsafe_code)]

use std::alloc::{self, Layout};
use std::ffi::c_void;
use std::ptr::{self, NonNull};
use std::time::{Duration, Instant};
use std::{io, mem, slice};

use log::{debug, warn};
use v4l::buffer::Type;
use v4l::capability::Flags as CapabilityFlags;
use v4l::control::{self, Control, MenuItem, Value};
use v4l::v4l_sys::{v4l2_buffer, v4l2_requestbuffers};
use v4l::video::capture::Parameters;
use v4l::video::Capture;
use v4l::{v4l2, Device, Memory};

use crate::error::{CameraError, Result};
use crate::traits::{
    BufferInfo, CameraDevice, ControlDescription, ControlKind, ControlValue, DeviceCapabilities,
    Format, FourCC, IoMethod,
};

/// A driver buffer mapped into the process. Unmapped on drop.
struct MappedRegion {
    ptr: NonNull<u8>,
    len: usize,
}

impl MappedRegion {
    fn map(fd: i32, index: u32) -> io::Result<Self> {
        let mut buf = v4l2_buffer {
            index,
            type_: Type::VideoCapture as u32,
            memory: Memory::Mmap as u32,
            // SAFETY: v4l2_buffer is plain old data; all-zero is a valid value.
            ..unsafe { mem::zeroed() }
        };
        // SAFETY: `buf` is a valid, exclusively borrowed v4l2_buffer.
        unsafe {
            v4l2::ioctl(
                fd,
                v4l2::vidioc::VIDIOC_QUERYBUF,
                ptr::addr_of_mut!(buf).cast::<c_void>(),
            )?;
        }

        let len = buf.length as usize;
        // SAFETY: QUERYBUF filled `m.offset` for an MMAP buffer.
        let offset = unsafe { buf.m.offset };
        // SAFETY: maps a driver-described region; the result is checked below.
        let addr = unsafe {
            libc::mmap(
                ptr::null_mut(),
                len,
                libc::PROT_READ | libc::PROT_WRITE,
                libc::MAP_SHARED,
                fd,
                libc::off_t::from(offset),
            )
        };
        if addr == libc::MAP_FAILED {
            return Err(io::Error::last_os_error());
        }
        let ptr = NonNull::new(addr.cast::<u8>())
            .ok_or_else(|| io::Error::other("mmap returned null"))?;
        Ok(Self { ptr, len })
    }

    const fn len(&self) -> usize {
        self.len
    }

    fn as_slice(&self) -> &[u8] {
        // SAFETY: the mapping is `len` bytes long and lives as long as `self`.
        // Callers only read slots the driver has handed back.
        unsafe { slice::from_raw_parts(self.ptr.as_ptr(), self.len) }
    }
}

impl Drop for MappedRegion {
    fn drop(&mut self) {
        // SAFETY: `ptr`/`len` came from a successful mmap and are unmapped once.
        if unsafe { libc::munmap(self.ptr.as_ptr().cast::<c_void>(), self.len) } != 0 {
            warn!("munmap failed: {}", io::Error::last_os_error());
        }
    }
}

/// A page-aligned, zeroed process buffer handed to the driver by address.
/// Freed on drop.
struct UserRegion {
    ptr: NonNull<u8>,
    layout: Layout,
}

impl UserRegion {
    fn allocate(len: usize, align: usize) -> io::Result<Self> {
        let layout = Layout::from_size_align(len, align)
            .map_err(|err| io::Error::new(io::ErrorKind::InvalidInput, err))?;
        if layout.size() == 0 {
            return Err(io::Error::new(
                io::ErrorKind::InvalidInput,
                "zero-length user buffer",
            ));
        }
        // SAFETY: `layout` has a non-zero size.
        let ptr = unsafe { alloc::alloc_zeroed(layout) };
        let ptr = NonNull::new(ptr).ok_or_else(|| io::Error::from(io::ErrorKind::OutOfMemory))?;
        Ok(Self { ptr, layout })
    }

    const fn len(&self) -> usize {
        self.layout.size()
    }

    fn as_slice(&self) -> &[u8] {
        // SAFETY: the allocation is `len` initialised bytes owned by `self`.
        unsafe { slice::from_raw_parts(self.ptr.as_ptr(), self.layout.size()) }
    }

    fn address(&self) -> std::os::raw::c_ulong {
        self.ptr.as_ptr() as std::os::raw::c_ulong
    }
}

impl Drop for UserRegion {
    fn drop(&mut self) {
        // SAFETY: `ptr` came from `alloc_zeroed` with this exact layout.
        unsafe { alloc::dealloc(self.ptr.as_ptr(), self.layout) };
    }
}

enum DeviceBuffers {
    None,
    Mapped(Vec<MappedRegion>),
    User(Vec<UserRegion>),
}

impl DeviceBuffers {
    const fn memory(&self) -> Option<Memory> {
        match self {
            Self::None => None,
            Self::Mapped(_) => Some(Memory::Mmap),
            Self::User(_) => Some(Memory::UserPtr),
        }
    }

    /// Drop the buffers once the driver queue is gone.
    ///
    /// If the driver may still hold user buffers, their memory is leaked
    /// rather than handed back to the allocator. Returns the leaked bytes.
    fn retire(self, driver_released: bool) -> usize {
        match self {
            Self::User(regions) if !driver_released => regions
                .into_iter()
                .map(|region| {
                    let len = region.len();
                    mem::forget(region);
                    len
                })
                .sum(),
            _ => 0,
        }
    }
}

/// V4L2 device implementation wrapping the v4l crate.
pub struct V4L2Device {
    device: Option<Device>,
    path: String,
    capabilities: DeviceCapabilities,
    buffers: DeviceBuffers,
}

impl std::fmt::Debug for V4L2Device {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("V4L2Device")
            .field("path", &self.path)
            .field("open", &self.device.is_some())
            .field("capabilities", &self.capabilities)
            .finish_non_exhaustive()
    }
}

impl V4L2Device {
    /// Open a V4L2 capture device by path (e.g., "/dev/video0").
    pub fn open(path: &str) -> Result<Self> {
        let device = Device::with_path(path)
            .map_err(|err| CameraError::Device(format!("cannot open {path}: {err}")))?;

        let caps = device
            .query_caps()
            .map_err(|err| CameraError::Device(format!("{path} is not a V4L2 device: {err}")))?;

        let capabilities = DeviceCapabilities {
            driver: caps.driver,
            card: caps.card,
            bus_info: caps.bus,
            can_capture: caps.capabilities.contains(CapabilityFlags::VIDEO_CAPTURE),
            can_stream: caps.capabilities.contains(CapabilityFlags::STREAMING),
            can_read: caps.capabilities.contains(CapabilityFlags::READ_WRITE),
        };
        if !capabilities.can_capture {
            return Err(CameraError::Device(format!(
                "{path} is not a video capture device"
            )));
        }

        debug!(
            "opened {path}: {} ({})",
            capabilities.card, capabilities.driver
        );
        Ok(Self {
            device: Some(device),
            path: path.to_owned(),
            capabilities,
            buffers: DeviceBuffers::None,
        })
    }

    /// Path the device was opened from.
    pub fn path(&self) -> &str {
        &self.path
    }

    fn device(&self) -> Result<&Device> {
        self.device
            .as_ref()
            .ok_or_else(|| CameraError::Device(format!("{} is closed", self.path)))
    }

    fn fd(&self) -> Result<i32> {
        Ok(self.device()?.handle().fd())
    }

    fn request(fd: i32, memory: Memory, count: u32) -> io::Result<u32> {
        let mut req = v4l2_requestbuffers {
            count,
            type_: Type::VideoCapture as u32,
            memory: memory as u32,
            // SAFETY: v4l2_requestbuffers is plain old data.
            ..unsafe { mem::zeroed() }
        };
        // SAFETY: `req` is a valid, exclusively borrowed v4l2_requestbuffers.
        unsafe {
            v4l2::ioctl(
                fd,
                v4l2::vidioc::VIDIOC_REQBUFS,
                ptr::addr_of_mut!(req).cast::<c_void>(),
            )?;
        }
        Ok(req.count)
    }

    fn set_streaming(&self, on: bool) -> Result<()> {
        let fd = self.fd()?;
        let mut typ = Type::VideoCapture as u32;
        let typ = ptr::addr_of_mut!(typ).cast::<c_void>();
        // SAFETY: STREAMON/STREAMOFF take a pointer to the buffer type.
        let result = unsafe {
            if on {
                v4l2::ioctl(fd, v4l2::vidioc::VIDIOC_STREAMON, typ)
            } else {
                v4l2::ioctl(fd, v4l2::vidioc::VIDIOC_STREAMOFF, typ)
            }
        };
        result.map_err(|err| CameraError::Device(err.to_string()))
    }

    /// Wait until the fd is readable. `Ok(false)` on timeout.
    fn poll_readable(fd: i32, timeout: Duration) -> Result<bool> {
        let mut pollfd = libc::pollfd {
            fd,
            events: libc::POLLIN,
            revents: 0,
        };
        let deadline = Instant::now().checked_add(timeout);
        loop {
            // Round up so a sub-millisecond remainder does not spin.
            let remaining = deadline.map_or(timeout, |deadline| {
                deadline.saturating_duration_since(Instant::now())
            });
            let millis = i32::try_from(remaining.as_micros().div_ceil(1000)).unwrap_or(i32::MAX);
            // SAFETY: one valid pollfd.
            let ready = unsafe { libc::poll(&mut pollfd, 1, millis) };
            if ready >= 0 {
                return Ok(ready > 0);
            }
            let err = io::Error::last_os_error();
            if err.kind() != io::ErrorKind::Interrupted {
                return Err(CameraError::Device(format!("poll failed: {err}")));
            }
        }
    }
}

fn page_size() -> usize {
    // SAFETY: sysconf has no preconditions.
    let size = unsafe { libc::sysconf(libc::_SC_PAGESIZE) };
    usize::try_from(size).unwrap_or(4096)
}

fn frame_error(err: io::Error, timeout: Duration) -> CameraError {
    match err.kind() {
        io::ErrorKind::WouldBlock | io::ErrorKind::TimedOut => CameraError::Timeout(timeout),
        _ => CameraError::Device(err.to_string()),
    }
}

impl CameraDevice for V4L2Device {
    fn capabilities(&self) -> &DeviceCapabilities {
        &self.capabilities
    }

    fn format(&self) -> Result<Format> {
        let fmt = self
            .device()?
            .format()
            .map_err(|err| CameraError::Device(err.to_string()))?;

        Ok(Format {
            width: fmt.width,
            height: fmt.height,
            fourcc: FourCC::from(fmt.fourcc),
            stride: fmt.stride,
            size: fmt.size,
        })
    }

    fn set_format(&mut self, format: &Format) -> Result<Format> {
        let device = self.device()?;
        let mut fmt = device
            .format()
            .map_err(|err| CameraError::Device(err.to_string()))?;

        fmt.width = format.width;
        fmt.height = format.height;
        fmt.fourcc = format.fourcc.into();

        let fmt = device
            .set_format(&fmt)
            .map_err(|err| CameraError::Device(err.to_string()))?;

        Ok(Format {
            width: fmt.width,
            height: fmt.height,
            fourcc: FourCC::from(fmt.fourcc),
            stride: fmt.stride,
            size: fmt.size,
        })
    }

    fn set_frame_rate(&mut self, fps: u32) -> Result<u32> {
        let params = self
            .device()?
            .set_params(&Parameters::with_fps(fps))
            .map_err(|err| CameraError::Device(err.to_string()))?;
        let interval = params.interval;
        if interval.numerator == 0 {
            return Ok(fps);
        }
        Ok(interval.denominator / interval.numerator)
    }

    fn controls(&self) -> Result<Vec<ControlDescription>> {
        let descriptions = self
            .device()?
            .query_controls()
            .map_err(|err| CameraError::Device(err.to_string()))?;

        Ok(descriptions
            .into_iter()
            .map(|desc| {
                let items = desc.items.unwrap_or_default();
                let kind = match desc.typ {
                    control::Type::Integer | control::Type::Integer64 => ControlKind::Integer,
                    control::Type::Boolean => ControlKind::Boolean,
                    control::Type::Menu => ControlKind::Menu(
                        items
                            .into_iter()
                            .filter_map(|(index, item)| match item {
                                MenuItem::Name(name) => Some((index, name)),
                                MenuItem::Value(_) => None,
                            })
                            .collect(),
                    ),
                    control::Type::IntegerMenu => ControlKind::IntegerMenu(
                        items
                            .into_iter()
                            .filter_map(|(index, item)| match item {
                                MenuItem::Value(value) => Some((index, value)),
                                MenuItem::Name(_) => None,
                            })
                            .collect(),
                    ),
                    control::Type::String => ControlKind::String,
                    control::Type::Button => ControlKind::Button,
                    _ => ControlKind::Other,
                };
                ControlDescription {
                    id: desc.id,
                    name: desc.name,
                    kind,
                    minimum: desc.minimum,
                    maximum: desc.maximum,
                    step: desc.step,
                    default: desc.default,
                }
            })
            .collect())
    }

    fn set_control(&mut self, id: u32, value: ControlValue) -> Result<()> {
        let value = match value {
            ControlValue::Integer(value) => Value::Integer(value),
            ControlValue::Boolean(value) => Value::Boolean(value),
            ControlValue::String(value) => Value::String(value),
        };
        self.device()?
            .set_control(Control { id, value })
            .map_err(|err| CameraError::Device(format!("control {id:#x}: {err}")))
    }

    fn request_buffers(&mut self, method: IoMethod, size: usize, count: u32) -> Result<Vec<usize>> {
        self.release_buffers()?;
        let fd = self.fd()?;

        match method {
            IoMethod::MemoryMapped => {
                let granted = Self::request(fd, Memory::Mmap, count)
                    .map_err(|err| CameraError::Buffer(format!("REQBUFS: {err}")))?;
                let mut regions = Vec::with_capacity(granted as usize);
                for index in 0..granted {
                    match MappedRegion::map(fd, index) {
                        Ok(region) => regions.push(region),
                        Err(err) => {
                            drop(regions);
                            if let Err(free_err) = Self::request(fd, Memory::Mmap, 0) {
                                warn!("freeing driver buffers failed: {free_err}");
                            }
                            return Err(CameraError::Buffer(format!(
                                "mapping buffer {index}: {err}"
                            )));
                        }
                    }
                }
                let lengths = regions.iter().map(MappedRegion::len).collect();
                self.buffers = DeviceBuffers::Mapped(regions);
                Ok(lengths)
            }
            IoMethod::UserPointer => {
                let granted = Self::request(fd, Memory::UserPtr, count)
                    .map_err(|err| CameraError::Buffer(format!("REQBUFS: {err}")))?;
                let page = page_size();
                let length = size.max(1).div_ceil(page) * page;
                let buffers = (0..granted)
                    .map(|_| UserRegion::allocate(length, page))
                    .collect::<io::Result<Vec<_>>>();
                let buffers = match buffers {
                    Ok(buffers) => buffers,
                    Err(err) => {
                        if let Err(free_err) = Self::request(fd, Memory::UserPtr, 0) {
                            warn!("freeing driver buffers failed: {free_err}");
                        }
                        return Err(CameraError::Buffer(format!(
                            "allocating {length} byte user buffer: {err}"
                        )));
                    }
                };
                let lengths = buffers.iter().map(UserRegion::len).collect();
                self.buffers = DeviceBuffers::User(buffers);
                Ok(lengths)
            }
            IoMethod::Read | IoMethod::Unknown => Err(CameraError::Buffer(format!(
                "{method} i/o has no driver buffers"
            ))),
        }
    }

    fn queue_buffer(&mut self, index: usize) -> Result<()> {
        let fd = self.fd()?;
        let memory = self
            .buffers
            .memory()
            .ok_or_else(|| CameraError::Buffer("no buffers requested".to_owned()))?;
        let mut buf = v4l2_buffer {
            index: u32::try_from(index)
                .map_err(|_| CameraError::Buffer(format!("buffer index {index}")))?,
            type_: Type::VideoCapture as u32,
            memory: memory as u32,
            // SAFETY: v4l2_buffer is plain old data.
            ..unsafe { mem::zeroed() }
        };
        if let DeviceBuffers::User(buffers) = &self.buffers {
            let user = buffers
                .get(index)
                .ok_or_else(|| CameraError::Buffer(format!("no buffer {index}")))?;
            buf.m.userptr = user.address();
            buf.length = u32::try_from(user.len())
                .map_err(|_| CameraError::Buffer(format!("buffer {index} too large")))?;
        }
        // SAFETY: `buf` is valid; for USERPTR it points at a buffer this
        // device owns until `release_buffers`.
        unsafe {
            v4l2::ioctl(
                fd,
                v4l2::vidioc::VIDIOC_QBUF,
                ptr::addr_of_mut!(buf).cast::<c_void>(),
            )
        }
        .map_err(|err| CameraError::Device(format!("QBUF {index}: {err}")))
    }

    fn dequeue_buffer(&mut self, timeout: Duration) -> Result<BufferInfo> {
        let fd = self.fd()?;
        let memory = self
            .buffers
            .memory()
            .ok_or_else(|| CameraError::Buffer("no buffers requested".to_owned()))?;
        if !Self::poll_readable(fd, timeout)? {
            return Err(CameraError::Timeout(timeout));
        }

        let mut buf = v4l2_buffer {
            type_: Type::VideoCapture as u32,
            memory: memory as u32,
            // SAFETY: v4l2_buffer is plain old data.
            ..unsafe { mem::zeroed() }
        };
        // SAFETY: `buf` is a valid, exclusively borrowed v4l2_buffer.
        unsafe {
            v4l2::ioctl(
                fd,
                v4l2::vidioc::VIDIOC_DQBUF,
                ptr::addr_of_mut!(buf).cast::<c_void>(),
            )
        }
        .map_err(|err| frame_error(err, timeout))?;

        let secs = u64::try_from(buf.timestamp.tv_sec).unwrap_or(0);
        let micros = u64::try_from(buf.timestamp.tv_usec).unwrap_or(0);
        Ok(BufferInfo {
            index: buf.index as usize,
            bytes_used: buf.bytesused as usize,
            sequence: buf.sequence,
            timestamp: Duration::from_secs(secs) + Duration::from_micros(micros),
        })
    }

    fn buffer(&self, index: usize) -> Option<&[u8]> {
        match &self.buffers {
            DeviceBuffers::None => None,
            DeviceBuffers::Mapped(regions) => regions.get(index).map(MappedRegion::as_slice),
            DeviceBuffers::User(buffers) => buffers.get(index).map(UserRegion::as_slice),
        }
    }

    fn read_frame(&mut self, dst: &mut [u8], timeout: Duration) -> Result<usize> {
        let fd = self.fd()?;
        if !Self::poll_readable(fd, timeout)? {
            return Err(CameraError::Timeout(timeout));
        }
        // SAFETY: `dst` is valid for `dst.len()` writable bytes.
        let read = unsafe { libc::read(fd, dst.as_mut_ptr().cast::<c_void>(), dst.len()) };
        usize::try_from(read).map_err(|_| frame_error(io::Error::last_os_error(), timeout))
    }

    fn stream_on(&mut self) -> Result<()> {
        self.set_streaming(true)
    }

    fn stream_off(&mut self) -> Result<()> {
        self.set_streaming(false)
    }

    fn release_buffers(&mut self) -> Result<()> {
        let Some(memory) = self.buffers.memory() else {
            return Ok(());
        };
        // Unmap before freeing: drivers refuse REQBUFS(0) on mapped buffers.
        if let DeviceBuffers::Mapped(regions) = &mut self.buffers {
            regions.clear();
        }
        let freed = match self.fd() {
            Ok(fd) => Self::request(fd, memory, 0)
                .map(|_| ())
                .map_err(|err| CameraError::Buffer(format!("REQBUFS(0): {err}"))),
            Err(_) => Ok(()),
        };
        let leaked = mem::replace(&mut self.buffers, DeviceBuffers::None).retire(freed.is_ok());
        if leaked > 0 {
            warn!("{}: driver kept user buffers, leaking {leaked} bytes", self.path);
        }
        freed
    }

    fn close(&mut self) {
        if let Err(err) = self.release_buffers() {
            warn!("{}: {err}", self.path);
        }
        if self.device.take().is_some() {
            debug!("closed {}", self.path);
        }
    }
}

impl Drop for V4L2Device {
    fn drop(&mut self) {
        self.close();
    }
}
