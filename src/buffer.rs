//! Capture buffer pool.
//!
//! Every slot carries an ownership tag. A slot handed to the driver may be
//! overwritten at any time and is never read; a slot handed back by the
//! driver is readable until it is requeued. Dequeuing yields a
//! [`DequeuedBuffer`] token that must be given back to [`BufferPool::requeue`],
//! so a slot cannot be requeued twice or read after requeue.

use std::time::{Duration, SystemTime, UNIX_EPOCH};

use log::{debug, warn};

use crate::error::{CameraError, Result};
use crate::traits::{BufferInfo, CameraDevice, IoMethod};

/// Fewest driver buffers a streaming pool accepts.
pub const MIN_STREAMING_BUFFERS: usize = 2;

/// Who may touch a slot.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Ownership {
    /// Allocated, not queued.
    Idle,
    /// Queued; the driver may be writing to it.
    Driver,
    /// Dequeued; safe to read until requeued.
    Process,
}

#[derive(Debug)]
struct BufferSlot {
    length: usize,
    owner: Ownership,
}

/// A filled buffer lent to the process.
#[derive(Debug)]
#[must_use = "a dequeued buffer must be requeued"]
pub struct DequeuedBuffer {
    info: BufferInfo,
}

impl DequeuedBuffer {
    /// Slot index.
    pub const fn index(&self) -> usize {
        self.info.index
    }

    /// Valid bytes in the slot.
    pub const fn bytes_used(&self) -> usize {
        self.info.bytes_used
    }

    /// Frame sequence number.
    pub const fn sequence(&self) -> u32 {
        self.info.sequence
    }

    /// Capture timestamp.
    pub const fn timestamp(&self) -> Duration {
        self.info.timestamp
    }
}

/// The set of capture buffers for one session.
#[derive(Debug)]
pub struct BufferPool {
    method: IoMethod,
    slots: Vec<BufferSlot>,
    scratch: Vec<u8>,
    read_sequence: u32,
    released: bool,
}

impl BufferPool {
    /// Allocate buffers for `method`.
    ///
    /// `Read` gets one process-owned scratch buffer of `buffer_size` bytes.
    /// Streaming methods ask the driver for `requested` slots and accept
    /// whatever it grants, provided it is enough and every slot can hold a
    /// frame. Any failure releases what the driver already reserved.
    pub fn allocate<D: CameraDevice>(
        device: &mut D,
        method: IoMethod,
        buffer_size: usize,
        requested: u32,
    ) -> Result<Self> {
        if method == IoMethod::Unknown {
            return Err(CameraError::invalid_value("io_method", "unknown io method"));
        }
        if !device.capabilities().supports(method) {
            return Err(CameraError::Device(format!(
                "device does not support {method} i/o"
            )));
        }

        if method == IoMethod::Read {
            debug!("read i/o: one {buffer_size} byte scratch buffer");
            return Ok(Self {
                method,
                slots: vec![BufferSlot {
                    length: buffer_size,
                    owner: Ownership::Process,
                }],
                scratch: vec![0; buffer_size],
                read_sequence: 0,
                released: false,
            });
        }

        let lengths = device
            .request_buffers(method, buffer_size, requested)
            .map_err(|err| match err {
                CameraError::Device(msg) => CameraError::Buffer(msg),
                other => other,
            })?;

        let check = if lengths.len() < MIN_STREAMING_BUFFERS {
            Err(CameraError::Buffer(format!(
                "insufficient buffer memory: driver granted {} of {requested} buffers",
                lengths.len()
            )))
        } else if let Some((index, length)) = lengths
            .iter()
            .enumerate()
            .find(|(_, length)| **length < buffer_size)
        {
            Err(CameraError::Buffer(format!(
                "buffer {index} holds {length} bytes, frame needs {buffer_size}"
            )))
        } else {
            Ok(())
        };
        if let Err(err) = check {
            if let Err(release_err) = device.release_buffers() {
                warn!("releasing rejected buffers failed: {release_err}");
            }
            return Err(err);
        }

        debug!(
            "{method} i/o: {} buffers of {buffer_size} bytes (requested {requested})",
            lengths.len()
        );

        Ok(Self {
            method,
            slots: lengths
                .into_iter()
                .map(|length| BufferSlot {
                    length,
                    owner: Ownership::Idle,
                })
                .collect(),
            scratch: Vec::new(),
            read_sequence: 0,
            released: false,
        })
    }

    /// Buffer strategy of this pool.
    pub const fn method(&self) -> IoMethod {
        self.method
    }

    /// Number of slots.
    pub fn len(&self) -> usize {
        self.slots.len()
    }

    /// Whether the pool has no slots (after `release`).
    pub fn is_empty(&self) -> bool {
        self.slots.is_empty()
    }

    /// Length of slot `index`.
    pub fn slot_length(&self, index: usize) -> Option<usize> {
        self.slots.get(index).map(|slot| slot.length)
    }

    /// Ownership tag of slot `index`.
    pub fn ownership(&self, index: usize) -> Option<Ownership> {
        self.slots.get(index).map(|slot| slot.owner)
    }

    /// Submit every idle slot to the driver. No-op for `Read`.
    pub fn queue_all<D: CameraDevice>(&mut self, device: &mut D) -> Result<()> {
        if !self.method.is_streaming() {
            return Ok(());
        }
        for (index, slot) in self.slots.iter_mut().enumerate() {
            match slot.owner {
                Ownership::Idle => {
                    device.queue_buffer(index)?;
                    slot.owner = Ownership::Driver;
                }
                Ownership::Driver => {}
                Ownership::Process => {
                    return Err(CameraError::Buffer(format!(
                        "buffer {index} is still held by the process"
                    )));
                }
            }
        }
        Ok(())
    }

    /// Wait up to `timeout` for one filled buffer.
    pub fn dequeue_one<D: CameraDevice>(
        &mut self,
        device: &mut D,
        timeout: Duration,
    ) -> Result<DequeuedBuffer> {
        if self.released {
            return Err(CameraError::Buffer("buffer pool released".to_owned()));
        }

        if self.method == IoMethod::Read {
            let bytes_used = device.read_frame(&mut self.scratch, timeout)?;
            let sequence = self.read_sequence;
            self.read_sequence = self.read_sequence.wrapping_add(1);
            return Ok(DequeuedBuffer {
                info: BufferInfo {
                    index: 0,
                    bytes_used,
                    sequence,
                    timestamp: SystemTime::now()
                        .duration_since(UNIX_EPOCH)
                        .unwrap_or_default(),
                },
            });
        }

        let mut info = device.dequeue_buffer(timeout)?;
        let slot = self.slots.get_mut(info.index).ok_or_else(|| {
            CameraError::Buffer(format!("driver returned unknown buffer {}", info.index))
        })?;
        if slot.owner != Ownership::Driver {
            return Err(CameraError::Buffer(format!(
                "driver returned buffer {} which it did not own",
                info.index
            )));
        }
        slot.owner = Ownership::Process;
        info.bytes_used = info.bytes_used.min(slot.length);

        Ok(DequeuedBuffer { info })
    }

    /// Valid bytes of a dequeued buffer.
    pub fn frame<'a, D: CameraDevice>(
        &'a self,
        device: &'a D,
        buffer: &DequeuedBuffer,
    ) -> Result<&'a [u8]> {
        let len = buffer.bytes_used();
        if self.method == IoMethod::Read {
            return self
                .scratch
                .get(..len)
                .ok_or_else(|| CameraError::Buffer("read past scratch buffer".to_owned()));
        }

        if self.ownership(buffer.index()) != Some(Ownership::Process) {
            return Err(CameraError::Buffer(format!(
                "buffer {} is not held by the process",
                buffer.index()
            )));
        }
        device
            .buffer(buffer.index())
            .and_then(|data| data.get(..len))
            .ok_or_else(|| CameraError::Buffer(format!("buffer {} unavailable", buffer.index())))
    }

    /// Give a consumed buffer back to the driver. No-op for `Read`.
    pub fn requeue<D: CameraDevice>(&mut self, device: &mut D, buffer: DequeuedBuffer) -> Result<()> {
        if !self.method.is_streaming() {
            return Ok(());
        }
        let index = buffer.index();
        let slot = self
            .slots
            .get_mut(index)
            .ok_or_else(|| CameraError::Buffer(format!("no buffer {index}")))?;
        if slot.owner != Ownership::Process {
            return Err(CameraError::Buffer(format!(
                "buffer {index} is not held by the process"
            )));
        }
        device.queue_buffer(index)?;
        slot.owner = Ownership::Driver;
        Ok(())
    }

    /// Mark every slot idle after the driver dropped its queue (stream off).
    pub fn reclaim(&mut self) {
        if !self.method.is_streaming() {
            return;
        }
        for slot in &mut self.slots {
            slot.owner = Ownership::Idle;
        }
    }

    /// Unmap and free every buffer. Safe to call more than once.
    pub fn release<D: CameraDevice>(&mut self, device: &mut D) {
        if self.released {
            return;
        }
        if self.method.is_streaming() {
            if let Err(err) = device.release_buffers() {
                warn!("releasing {} buffers failed: {err}", self.method);
            }
        }
        self.slots.clear();
        self.scratch = Vec::new();
        self.released = true;
        debug!("{} buffer pool released", self.method);
    }
}
