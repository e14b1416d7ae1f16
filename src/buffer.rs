//! Per-frame transmit buffers with optional segmentation metadata
//!
//! The guest device fills one of these between `begin_xmit` and
//! `end_xmit`, then hands ownership back through `send`. An ordinary
//! buffer carries exactly one Ethernet frame. A buffer with a
//! segmentation descriptor carries a super-frame that is carved into
//! wire-legal segments on the NAT thread just before it reaches the
//! engine.

use log::debug;

use crate::error::NatError;

/// Frames at or above this size are rejected outright.
pub const MAX_FRAME_SIZE: usize = 16 * 1024;

/// Buffer sizes are rounded up to this granularity.
const SIZE_ALIGN: usize = 128;

const BUF_MAGIC: u32 = 0x4e41_5442;

/// Who currently holds the buffer.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BufOwner {
    /// The guest device is filling the buffer.
    Device,
    /// The buffer was submitted and belongs to the driver.
    Driver,
}

/// Segmentation-offload hint for a super-frame.
///
/// `hdrs_total` bytes of protocol headers precede the payload; no
/// segment may carry more than `max_seg` payload bytes.
#[derive(Debug, Clone, Copy, PartialEq, Eq, serde::Serialize, serde::Deserialize)]
pub struct GsoDescriptor {
    pub hdrs_total: usize,
    pub max_seg: usize,
}

impl GsoDescriptor {
    /// Sanity check against the frame about to be segmented.
    pub fn is_valid(&self, frame_len: usize) -> bool {
        self.max_seg > 0
            && self.hdrs_total > 0
            && self.hdrs_total < frame_len
            && self.hdrs_total + self.max_seg < MAX_FRAME_SIZE
    }

    /// Number of wire segments the frame will be carved into.
    pub fn segment_count(&self, frame_len: usize) -> usize {
        let payload = frame_len - self.hdrs_total;
        (payload + self.max_seg - 1) / self.max_seg
    }
}

/// A single-segment scatter/gather buffer.
#[derive(Debug)]
pub struct FrameBuf {
    data: Vec<u8>,
    used: usize,
    gso: Option<GsoDescriptor>,
    owner: BufOwner,
    magic: u32,
}

impl FrameBuf {
    /// Allocates a buffer of at least `min_size` bytes, rounded up to a
    /// 128-byte multiple. Over-sized requests are refused before any
    /// allocation happens.
    pub(crate) fn alloc(min_size: usize, gso: Option<GsoDescriptor>) -> Result<Self, NatError> {
        match &gso {
            None => {
                if min_size >= MAX_FRAME_SIZE {
                    debug!(
                        "dropping over-sized frame ({} bytes)",
                        min_size
                    );
                    return Err(NatError::InvalidParameter);
                }
            }
            Some(g) => {
                if g.hdrs_total + g.max_seg >= MAX_FRAME_SIZE {
                    debug!(
                        "dropping over-sized segment ({} bytes)",
                        g.hdrs_total + g.max_seg
                    );
                    return Err(NatError::InvalidParameter);
                }
            }
        }
        let size = round_up(min_size);
        Ok(Self {
            data: vec![0u8; size],
            used: 0,
            gso,
            owner: BufOwner::Device,
            magic: BUF_MAGIC,
        })
    }

    /// Usable capacity of the segment.
    pub fn capacity(&self) -> usize {
        self.data.len()
    }

    /// Mutable view of the whole segment for the device to fill.
    pub fn as_mut_slice(&mut self) -> &mut [u8] {
        debug_assert_eq!(self.owner, BufOwner::Device);
        &mut self.data
    }

    /// Records how many bytes of the segment are in use.
    pub fn set_used(&mut self, used: usize) {
        assert!(used <= self.data.len());
        self.used = used;
    }

    pub fn used(&self) -> usize {
        self.used
    }

    /// The filled portion of the segment.
    pub fn frame(&self) -> &[u8] {
        &self.data[..self.used]
    }

    pub fn gso(&self) -> Option<&GsoDescriptor> {
        self.gso.as_ref()
    }

    pub(crate) fn owner(&self) -> BufOwner {
        self.owner
    }

    /// Marks the hand-off from the device to the driver.
    pub(crate) fn submit(&mut self) {
        debug_assert_eq!(self.magic, BUF_MAGIC);
        debug_assert_eq!(self.owner, BufOwner::Device);
        self.owner = BufOwner::Driver;
    }
}

fn round_up(size: usize) -> usize {
    (size + SIZE_ALIGN - 1) / SIZE_ALIGN * SIZE_ALIGN
}

/// Copies the headers and one payload slice of a super-frame into
/// `scratch`, returning the length of the resulting wire segment.
pub(crate) fn carve_segment(
    frame: &[u8],
    gso: &GsoDescriptor,
    segment: usize,
    scratch: &mut [u8],
) -> usize {
    let offset = gso.hdrs_total + segment * gso.max_seg;
    let end = (offset + gso.max_seg).min(frame.len());
    let payload = end - offset;
    scratch[..gso.hdrs_total].copy_from_slice(&frame[..gso.hdrs_total]);
    scratch[gso.hdrs_total..gso.hdrs_total + payload].copy_from_slice(&frame[offset..end]);
    gso.hdrs_total + payload
}
