// Copyright (c) Microsoft Corporation.
// Licensed under the MIT License.

//! The VMBus ring buffer and its packet format.
//!
//! A ring buffer is a control page followed by a circular data region in
//! memory shared with the host. The sender advances the `In` offset after
//! writing packets, the receiver advances `Out` after consuming them, and
//! neither side ever takes a lock. Each side also publishes advisory hints
//! (the interrupt mask and the pending send size) that let the peer skip
//! interrupts that would not make progress.
//!
//! Packets start with a descriptor, are padded to a multiple of 8 bytes, and
//! are followed by a footer recording where the packet started. A packet may
//! physically wrap from the end of the data region back to its start; the
//! [`RingRange`] type hides that from callers.
//!
//! Rings come in pairs, one per direction, but the types here handle one
//! direction each.

#![forbid(unsafe_code)]

pub mod gparange;
mod mem;

pub use mem::CONTROL_WORD_COUNT;
pub use mem::PagedRingMem;
pub use mem::RingMem;
pub use mem::SharedPages;
pub use mem::split_wrapped;
pub use pipe_protocol::*;
pub use protocol::PacketType;
pub use protocol::TransferPageRange;

use gparange::GpaRange;
use gparange::PagedRange;
use protocol::*;
use std::fmt::Debug;
use std::sync::atomic::AtomicU64;
use std::sync::atomic::Ordering;
use std::sync::atomic::fence;
use thiserror::Error;
use zerocopy::FromZeros;
use zerocopy::IntoBytes;

/// Ring buffers, GPADLs and GPA ranges are built from 4KB pages.
pub const PAGE_SIZE: usize = 4096;

mod pipe_protocol {
    use zerocopy::FromBytes;
    use zerocopy::Immutable;
    use zerocopy::IntoBytes;
    use zerocopy::KnownLayout;

    /// Prefix of each in-band payload on a channel offered in pipe mode.
    /// Allows payloads whose length is not a multiple of 8.
    #[repr(C)]
    #[derive(Debug, Copy, Clone, IntoBytes, Immutable, KnownLayout, FromBytes)]
    pub struct PipeHeader {
        /// One of the `PIPE_PACKET_TYPE_*` values.
        pub packet_type: u32,
        /// The number of payload bytes following the header.
        pub len: u32,
    }

    /// A data packet.
    pub const PIPE_PACKET_TYPE_DATA: u32 = 1;
    /// Sets up a GPA direct buffer.
    pub const PIPE_PACKET_TYPE_SETUP_GPA_DIRECT: u32 = 3;
    /// Tears down a GPA direct buffer.
    pub const PIPE_PACKET_TYPE_TEARDOWN_GPA_DIRECT: u32 = 4;
}

mod protocol {
    use open_enum::open_enum;
    use std::sync::atomic::AtomicU32;
    use zerocopy::FromBytes;
    use zerocopy::Immutable;
    use zerocopy::IntoBytes;
    use zerocopy::KnownLayout;

    open_enum! {
        /// The `packet_type` field of a packet descriptor.
        pub enum PacketType: u16 {
            #![expect(missing_docs)]
            INVALID = 0,
            IN_BAND = 6,
            TRANSFER_PAGES = 7,
            GPA_DIRECT = 9,
            CANCEL_REQUEST = 0xa,
            COMPLETION = 0xb,
        }
    }

    /// The descriptor that starts every packet.
    #[repr(C)]
    #[derive(Copy, Clone, Debug, IntoBytes, Immutable, KnownLayout, FromBytes)]
    pub struct PacketDescriptor {
        pub packet_type: u16,
        /// The offset of the payload, in 8-byte units.
        pub data_offset8: u16,
        /// The length of the packet without its footer, in 8-byte units.
        pub length8: u16,
        pub flags: u16,
        pub transaction_id: u64,
    }

    pub const PACKET_FLAG_COMPLETION_REQUESTED: u16 = 1;

    /// Accessors for the words of a ring control page.
    pub struct Control<'a>(pub &'a [AtomicU32]);

    impl Control<'_> {
        pub fn inp(&self) -> &AtomicU32 {
            &self.0[0]
        }
        pub fn outp(&self) -> &AtomicU32 {
            &self.0[1]
        }
        pub fn interrupt_mask(&self) -> &AtomicU32 {
            &self.0[2]
        }
        pub fn pending_send_size(&self) -> &AtomicU32 {
            &self.0[3]
        }
        /// At byte offset 64 of the control page.
        pub fn feature_bits(&self) -> &AtomicU32 {
            &self.0[16]
        }
    }

    /// Set by the sender if it publishes a pending send size and expects a
    /// signal when that much space frees up.
    pub const FEATURE_SUPPORTS_PENDING_SEND_SIZE: u32 = 1;

    /// A byte range within a transfer page set.
    #[repr(C)]
    #[derive(Debug, Copy, Clone, PartialEq, Eq, IntoBytes, Immutable, KnownLayout, FromBytes)]
    pub struct TransferPageRange {
        /// The length of the range.
        pub byte_count: u32,
        /// The offset of the range within the transfer page set.
        pub byte_offset: u32,
    }

    #[repr(C)]
    #[derive(Copy, Clone, Debug, IntoBytes, Immutable, KnownLayout, FromBytes)]
    pub struct TransferPageHeader {
        pub transfer_page_set_id: u16,
        pub sender_owns_set: u8,
        pub reserved: u8,
        pub range_count: u32,
    }

    #[repr(C)]
    #[derive(Copy, Clone, Debug, IntoBytes, Immutable, KnownLayout, FromBytes)]
    pub struct GpaDirectHeader {
        pub reserved: u32,
        pub range_count: u32,
    }

    #[repr(C)]
    #[derive(Copy, Clone, Debug, IntoBytes, Immutable, KnownLayout, FromBytes)]
    pub struct Footer {
        pub reserved: u32,
        /// The ring offset of the start of the packet.
        pub offset: u32,
    }

    static_assertions::const_assert_eq!(size_of::<PacketDescriptor>(), 16);
}

const DESCRIPTOR_SIZE: usize = size_of::<PacketDescriptor>();
const FOOTER_SIZE: usize = size_of::<Footer>();
/// The size of a descriptor plus a transfer page or GPA direct header.
const EXTENDED_HEADER_SIZE: usize = DESCRIPTOR_SIZE + 8;

/// Ring corruption: the peer wrote something inconsistent. Fatal to the
/// channel.
#[derive(Copy, Clone, Debug, Error, PartialEq, Eq)]
pub enum Error {
    /// `In` or `Out` is outside the data region or misaligned.
    #[error("invalid ring buffer pointer")]
    InvalidRingPointer,
    /// A packet is shorter than a descriptor or longer than the available
    /// data.
    #[error("invalid message length")]
    InvalidMessageLength,
    /// The ring memory is not a usable size.
    #[error("invalid ring memory")]
    InvalidRingMemory,
    /// The descriptor's data offset and length are inconsistent.
    #[error("invalid descriptor offset or length")]
    InvalidDescriptorLengths,
    /// The descriptor has unknown flags set.
    #[error("unknown packet descriptor flags")]
    InvalidDescriptorFlags,
    /// The descriptor has an unknown packet type.
    #[error("unknown packet descriptor type {0:?}")]
    InvalidDescriptorType(PacketType),
    /// A GPA direct packet's range count does not fit its header.
    #[error("invalid range count for gpa direct packet")]
    InvalidDescriptorGpaDirectRangeCount,
    /// A transfer page packet's range count does not match its header size.
    #[error("transfer page range count does not match the descriptor")]
    InvalidTransferPageRangeCount,
}

/// An error reading a packet.
#[derive(Copy, Clone, Debug, Error, PartialEq, Eq)]
pub enum ReadError {
    /// No packets are available.
    #[error("ring buffer empty")]
    Empty,
    /// The ring is corrupt.
    #[error(transparent)]
    Corrupt(#[from] Error),
}

/// An error writing a packet.
#[derive(Copy, Clone, Debug, Error, PartialEq, Eq)]
pub enum WriteError {
    /// There is not enough free space right now. The payload is the total
    /// number of ring bytes the packet needs.
    #[error("ring buffer full, {0} bytes needed")]
    Full(usize),
    /// The packet can never fit in this ring.
    #[error("packet of {0} bytes too large for the ring")]
    TooLarge(usize),
    /// The ring is corrupt.
    #[error(transparent)]
    Corrupt(#[from] Error),
}

/// An access past the end of a [`RingRange`].
#[derive(Debug, Error)]
#[error("access of {len} bytes at offset {offset} exceeds range of {size} bytes")]
pub struct AccessError {
    offset: usize,
    len: usize,
    size: usize,
}

/// A logically contiguous range of ring bytes that may physically wrap
/// around the end of the data region.
#[derive(Copy, Clone, Debug, PartialEq, Eq)]
pub struct RingRange {
    off: u32,
    size: u32,
}

impl RingRange {
    /// The empty range.
    pub fn empty() -> Self {
        RingRange { off: 0, size: 0 }
    }

    /// The length of the range.
    pub fn len(&self) -> usize {
        self.size as usize
    }

    /// Returns true if the range is empty.
    pub fn is_empty(&self) -> bool {
        self.size == 0
    }

    /// Returns the part of this range starting at `offset`, or `None` if
    /// `offset` is past the end.
    pub fn skip(&self, offset: usize) -> Option<Self> {
        let offset = u32::try_from(offset).ok().filter(|&o| o <= self.size)?;
        Some(RingRange {
            off: self.off + offset,
            size: self.size - offset,
        })
    }

    fn check(&self, offset: usize, len: usize) -> Result<(), AccessError> {
        if offset.checked_add(len).is_none_or(|end| end > self.len()) {
            return Err(AccessError {
                offset,
                len,
                size: self.len(),
            });
        }
        Ok(())
    }

    /// Reads `data.len()` bytes at `offset` within the range.
    pub fn read_at<T: Ring>(
        &self,
        ring: &T,
        offset: usize,
        data: &mut [u8],
    ) -> Result<(), AccessError> {
        self.check(offset, data.len())?;
        ring.mem().read_at(self.off as usize + offset, data);
        Ok(())
    }

    /// Writes `data` at `offset` within the range.
    pub fn write_at<T: Ring>(&self, ring: &T, offset: usize, data: &[u8]) -> Result<(), AccessError> {
        self.check(offset, data.len())?;
        ring.mem().write_at(self.off as usize + offset, data);
        Ok(())
    }

    /// Copies the whole range out of the ring.
    pub fn read_all<T: Ring>(&self, ring: &T) -> Vec<u8> {
        let mut data = vec![0; self.len()];
        ring.mem().read_at(self.off as usize, &mut data);
        data
    }
}

/// The kind-specific part of an incoming packet. Ranges cover the extended
/// header's variable-length portion.
#[derive(Debug, Copy, Clone, PartialEq, Eq)]
pub enum IncomingPacketType {
    /// Data carried in the packet.
    InBand,
    /// A completion for the packet with the same transaction ID.
    Completion,
    /// A request to cancel the transaction with the same ID.
    CancelRequest,
    /// Data referenced by GPA ranges: the range count and the encoded
    /// ranges.
    GpaDirect(u32, RingRange),
    /// Data in a transfer page set: the set ID, the range count, and the
    /// encoded [`TransferPageRange`]s.
    TransferPages(u16, u32, RingRange),
}

/// A packet read from an [`IncomingRing`].
#[derive(Debug)]
pub struct IncomingPacket {
    /// Set if the sender requested a completion, or for completion and cancel
    /// packets.
    pub transaction_id: Option<u64>,
    /// The packet kind.
    pub typ: IncomingPacketType,
    /// The inline payload.
    pub payload: RingRange,
}

/// Parses the packet at `ring_off`, with `avail` bytes available to read.
/// Returns the total packet size including the footer.
fn parse_packet<M: RingMem>(
    ring: &M,
    ring_off: u32,
    avail: u32,
) -> Result<(u32, IncomingPacket), Error> {
    let mut desc = PacketDescriptor::new_zeroed();
    ring.read_aligned(ring_off as usize, desc.as_mut_bytes());
    let len = desc.length8 as u32 * 8;
    if len < DESCRIPTOR_SIZE as u32 || len + FOOTER_SIZE as u32 > avail {
        return Err(Error::InvalidMessageLength);
    }
    if desc.length8 < desc.data_offset8 || desc.data_offset8 < 2 {
        return Err(Error::InvalidDescriptorLengths);
    }
    if desc.flags & !PACKET_FLAG_COMPLETION_REQUESTED != 0 {
        return Err(Error::InvalidDescriptorFlags);
    }

    let packet_type = PacketType(desc.packet_type);
    let header_len = desc.data_offset8 as u32 * 8;
    let extended = |ring_off: u32| -> Result<RingRange, Error> {
        if header_len < EXTENDED_HEADER_SIZE as u32 {
            return Err(Error::InvalidDescriptorLengths);
        }
        Ok(RingRange {
            off: ring_off + EXTENDED_HEADER_SIZE as u32,
            size: header_len - EXTENDED_HEADER_SIZE as u32,
        })
    };

    let typ = match packet_type {
        PacketType::IN_BAND => IncomingPacketType::InBand,
        PacketType::COMPLETION => IncomingPacketType::Completion,
        PacketType::CANCEL_REQUEST => IncomingPacketType::CancelRequest,
        PacketType::TRANSFER_PAGES => {
            let ranges = extended(ring_off)?;
            let mut tph = TransferPageHeader::new_zeroed();
            ring.read_aligned(ring_off as usize + DESCRIPTOR_SIZE, tph.as_mut_bytes());
            if tph.range_count as usize * size_of::<TransferPageRange>() != ranges.len() {
                return Err(Error::InvalidTransferPageRangeCount);
            }
            IncomingPacketType::TransferPages(tph.transfer_page_set_id, tph.range_count, ranges)
        }
        PacketType::GPA_DIRECT => {
            let ranges = extended(ring_off)?;
            let mut gph = GpaDirectHeader::new_zeroed();
            ring.read_aligned(ring_off as usize + DESCRIPTOR_SIZE, gph.as_mut_bytes());
            // Each range takes at least a header and one page number.
            if gph.range_count == 0 || gph.range_count as usize * 16 > ranges.len() {
                return Err(Error::InvalidDescriptorGpaDirectRangeCount);
            }
            IncomingPacketType::GpaDirect(gph.range_count, ranges)
        }
        typ => return Err(Error::InvalidDescriptorType(typ)),
    };

    let transaction_id = (desc.flags & PACKET_FLAG_COMPLETION_REQUESTED != 0
        || matches!(
            packet_type,
            PacketType::COMPLETION | PacketType::CANCEL_REQUEST
        ))
    .then_some(desc.transaction_id);

    let payload = RingRange {
        off: ring_off + header_len,
        size: len - header_len,
    };
    Ok((
        len + FOOTER_SIZE as u32,
        IncomingPacket {
            transaction_id,
            typ,
            payload,
        },
    ))
}

/// A packet to write to an [`OutgoingRing`].
#[derive(Debug)]
pub struct OutgoingPacket<'a> {
    /// Echoed by the peer's completion.
    pub transaction_id: u64,
    /// The size of the inline payload.
    pub size: usize,
    /// The packet kind.
    pub typ: OutgoingPacketType<'a>,
}

/// The kinds of outgoing packet.
#[derive(Debug, Copy, Clone)]
pub enum OutgoingPacketType<'a> {
    /// A data packet with no completion.
    InBandNoCompletion,
    /// A data packet that asks the peer for a completion.
    InBandWithCompletion,
    /// A completion for a packet received from the peer.
    Completion,
    /// Asks the peer to abandon a transaction. Best effort.
    CancelRequest,
    /// A packet referencing memory outside the ring by guest page number.
    /// Always asks for a completion, which tells the sender the memory is no
    /// longer in use.
    GpaDirect(&'a [PagedRange<'a>]),
    /// A packet referencing byte ranges of a transfer page set previously
    /// shared with the peer. Always asks for a completion.
    TransferPages(u16, &'a [TransferPageRange]),
}

impl OutgoingPacketType<'_> {
    fn header(&self) -> (PacketType, usize, u16) {
        match *self {
            Self::InBandNoCompletion => (PacketType::IN_BAND, DESCRIPTOR_SIZE, 0),
            Self::InBandWithCompletion => (
                PacketType::IN_BAND,
                DESCRIPTOR_SIZE,
                PACKET_FLAG_COMPLETION_REQUESTED,
            ),
            Self::Completion => (PacketType::COMPLETION, DESCRIPTOR_SIZE, 0),
            Self::CancelRequest => (PacketType::CANCEL_REQUEST, DESCRIPTOR_SIZE, 0),
            Self::GpaDirect(ranges) => (
                PacketType::GPA_DIRECT,
                EXTENDED_HEADER_SIZE + ranges.iter().map(|r| r.encoded_len()).sum::<usize>(),
                PACKET_FLAG_COMPLETION_REQUESTED,
            ),
            Self::TransferPages(_, ranges) => (
                PacketType::TRANSFER_PAGES,
                EXTENDED_HEADER_SIZE + size_of_val(ranges),
                PACKET_FLAG_COMPLETION_REQUESTED,
            ),
        }
    }
}

/// Computes the ring space packets occupy, including padding and footer.
pub struct PacketSize(());

impl PacketSize {
    /// An in-band packet.
    pub const fn in_band(payload_len: usize) -> usize {
        (DESCRIPTOR_SIZE + payload_len).next_multiple_of(8) + FOOTER_SIZE
    }

    /// A completion packet.
    pub const fn completion(payload_len: usize) -> usize {
        Self::in_band(payload_len)
    }

    /// A GPA direct packet.
    pub fn gpa_direct(ranges: &[PagedRange<'_>], payload_len: usize) -> usize {
        Self::in_band(
            8 + ranges.iter().map(|r| r.encoded_len()).sum::<usize>() + payload_len,
        )
    }

    /// A transfer page packet.
    pub const fn transfer_pages(count: usize, payload_len: usize) -> usize {
        Self::in_band(8 + count * size_of::<TransferPageRange>() + payload_len)
    }
}

/// Implemented by both ring directions, for use with [`RingRange`].
pub trait Ring {
    /// The backing memory.
    type Memory: RingMem;

    /// Returns the backing memory.
    fn mem(&self) -> &Self::Memory;
}

struct InnerRing<M: RingMem> {
    mem: M,
    size: u32,
}

impl<M: RingMem> Debug for InnerRing<M> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let control = self.control();
        f.debug_struct("InnerRing")
            .field("size", &self.size)
            .field("in", &control.inp().load(Ordering::Relaxed))
            .field("out", &control.outp().load(Ordering::Relaxed))
            .field(
                "interrupt_mask",
                &control.interrupt_mask().load(Ordering::Relaxed),
            )
            .field(
                "pending_send_size",
                &control.pending_send_size().load(Ordering::Relaxed),
            )
            .finish()
    }
}

impl<M: RingMem> InnerRing<M> {
    fn new(mem: M) -> Result<Self, Error> {
        // Offsets are 32 bits and sums of two of them must not overflow.
        let size = u32::try_from(mem.len())
            .ok()
            .filter(|&s| s != 0 && s % PAGE_SIZE as u32 == 0 && s < 0x8000_0000)
            .ok_or(Error::InvalidRingMemory)?;
        if mem.control().len() < CONTROL_WORD_COUNT {
            return Err(Error::InvalidRingMemory);
        }
        let ring = Self { mem, size };
        let control = ring.control();
        ring.validate(control.inp().load(Ordering::Relaxed))?;
        ring.validate(control.outp().load(Ordering::Relaxed))?;
        Ok(ring)
    }

    fn control(&self) -> Control<'_> {
        Control(self.mem.control())
    }

    fn validate(&self, p: u32) -> Result<u32, Error> {
        if p >= self.size || p % 8 != 0 {
            Err(Error::InvalidRingPointer)
        } else {
            Ok(p)
        }
    }

    fn add_pointer(&self, p: u32, off: u32) -> u32 {
        let np = p + off;
        if np >= self.size { np - self.size } else { np }
    }

    /// Bytes written but not yet read.
    fn available(&self, inp: u32, outp: u32) -> u32 {
        if inp >= outp {
            inp - outp
        } else {
            self.size - outp + inp
        }
    }

    /// Bytes that can be written. One byte is always left unused so that a
    /// full ring is distinguishable from an empty one.
    fn free(&self, inp: u32, outp: u32) -> u32 {
        self.size - self.available(inp, outp) - 1
    }
}

/// The receive position within an [`IncomingRing`].
#[derive(Debug, Clone)]
pub struct IncomingOffset {
    cached_in: u32,
    committed_out: u32,
    next_out: u32,
}

impl IncomingOffset {
    /// Forgets packets read since the last commit, so they are read again.
    pub fn revert(&mut self) {
        self.next_out = self.committed_out;
    }
}

/// The result of [`IncomingRing::commit_read`].
#[derive(Debug, Copy, Clone, PartialEq, Eq)]
pub struct ReadCommit {
    /// The sender is waiting for the space that was just freed.
    pub signal: bool,
    /// The ring is now empty.
    pub empty: bool,
}

/// The receiving end of a ring.
#[derive(Debug)]
pub struct IncomingRing<M: RingMem> {
    inner: InnerRing<M>,
}

impl<M: RingMem> Ring for IncomingRing<M> {
    type Memory = M;

    fn mem(&self) -> &M {
        &self.inner.mem
    }
}

impl<M: RingMem> IncomingRing<M> {
    /// Wraps `mem`, failing if it is not a valid ring. Interrupts start
    /// unmasked.
    pub fn new(mem: M) -> Result<Self, Error> {
        let inner = InnerRing::new(mem)?;
        inner.control().interrupt_mask().store(0, Ordering::Relaxed);
        Ok(Self { inner })
    }

    /// The size of the data region.
    pub fn len(&self) -> usize {
        self.inner.size as usize
    }

    /// Returns true if the sender publishes a pending send size.
    pub fn supports_pending_send_size(&self) -> bool {
        self.inner.control().feature_bits().load(Ordering::Relaxed)
            & FEATURE_SUPPORTS_PENDING_SEND_SIZE
            != 0
    }

    /// Masks or unmasks the sender's empty-to-non-empty signal.
    ///
    /// After unmasking, the receiver must check the ring again, since the
    /// sender may have written without signaling while it was masked.
    pub fn set_interrupt_mask(&self, masked: bool) {
        self.inner
            .control()
            .interrupt_mask()
            .store(masked as u32, Ordering::SeqCst);
    }

    /// Returns the current receive position.
    pub fn incoming(&self) -> Result<IncomingOffset, Error> {
        let control = self.inner.control();
        let next_out = self.inner.validate(control.outp().load(Ordering::Relaxed))?;
        let cached_in = self.inner.validate(control.inp().load(Ordering::Acquire))?;
        Ok(IncomingOffset {
            cached_in,
            committed_out: next_out,
            next_out,
        })
    }

    /// Returns true if a packet is available.
    pub fn can_read(&self, ptrs: &mut IncomingOffset) -> Result<bool, Error> {
        if ptrs.next_out != ptrs.cached_in {
            return Ok(true);
        }
        ptrs.cached_in = self
            .inner
            .validate(self.inner.control().inp().load(Ordering::Acquire))?;
        Ok(ptrs.next_out != ptrs.cached_in)
    }

    /// Parses the next packet. The packet's bytes stay valid until the read
    /// is committed with [`IncomingRing::commit_read`].
    pub fn read(&self, ptrs: &mut IncomingOffset) -> Result<IncomingPacket, ReadError> {
        let outp = ptrs.next_out;
        if ptrs.cached_in == outp {
            ptrs.cached_in = self
                .inner
                .validate(self.inner.control().inp().load(Ordering::Acquire))?;
            if ptrs.cached_in == outp {
                return Err(ReadError::Empty);
            }
        }
        let avail = self.inner.available(ptrs.cached_in, outp);
        let (len, packet) = parse_packet(&self.inner.mem, outp, avail)?;
        ptrs.next_out = self.inner.add_pointer(outp, len);
        Ok(packet)
    }

    /// Releases the space of the packets read since the last commit.
    pub fn commit_read(&self, ptrs: &mut IncomingOffset) -> Result<ReadCommit, Error> {
        if ptrs.committed_out == ptrs.next_out {
            return Ok(ReadCommit {
                signal: false,
                empty: ptrs.cached_in == ptrs.next_out,
            });
        }
        let control = self.inner.control();
        control.outp().store(ptrs.next_out, Ordering::Release);
        // Order the Out store before reading the sender's hint, pairing with
        // the fence in `OutgoingRing::write`.
        fence(Ordering::SeqCst);
        let pending_send_size = control.pending_send_size().load(Ordering::Relaxed);
        let inp = self
            .inner
            .validate(control.inp().load(Ordering::Acquire))?;
        let signal = pending_send_size != 0
            && self.inner.free(inp, ptrs.committed_out) < pending_send_size
            && self.inner.free(inp, ptrs.next_out) >= pending_send_size;
        ptrs.committed_out = ptrs.next_out;
        ptrs.cached_in = inp;
        Ok(ReadCommit {
            signal,
            empty: inp == ptrs.next_out,
        })
    }
}

/// The send position within an [`OutgoingRing`].
#[derive(Debug, Clone)]
pub struct OutgoingOffset {
    cached_out: u32,
    committed_in: u32,
    next_in: u32,
}

impl OutgoingOffset {
    /// Forgets packets written since the last commit.
    pub fn revert(&mut self) {
        self.next_in = self.committed_in;
    }
}

/// The sending end of a ring.
#[derive(Debug)]
pub struct OutgoingRing<M: RingMem> {
    inner: InnerRing<M>,
    interrupt_mask_skips: AtomicU64,
}

impl<M: RingMem> Ring for OutgoingRing<M> {
    type Memory = M;

    fn mem(&self) -> &M {
        &self.inner.mem
    }
}

impl<M: RingMem> OutgoingRing<M> {
    /// Wraps `mem`, failing if it is not a valid ring.
    pub fn new(mem: M) -> Result<Self, Error> {
        let inner = InnerRing::new(mem)?;
        let control = inner.control();
        control.pending_send_size().store(0, Ordering::Relaxed);
        control
            .feature_bits()
            .store(FEATURE_SUPPORTS_PENDING_SEND_SIZE, Ordering::Relaxed);
        Ok(Self {
            inner,
            interrupt_mask_skips: AtomicU64::new(0),
        })
    }

    /// The size of the data region.
    pub fn len(&self) -> usize {
        self.inner.size as usize
    }

    /// Returns the current send position.
    pub fn outgoing(&self) -> Result<OutgoingOffset, Error> {
        let control = self.inner.control();
        let next_in = self.inner.validate(control.inp().load(Ordering::Relaxed))?;
        let cached_out = self.inner.validate(control.outp().load(Ordering::Relaxed))?;
        Ok(OutgoingOffset {
            cached_out,
            committed_in: next_in,
            next_in,
        })
    }

    /// The largest packet, including descriptor, padding and footer, the ring
    /// can ever hold.
    pub fn maximum_packet_size(&self) -> usize {
        self.inner.size as usize - 8
    }

    /// The number of bytes that can be written now.
    pub fn free_bytes(&self, ptrs: &mut OutgoingOffset) -> Result<usize, Error> {
        ptrs.cached_out = self
            .inner
            .validate(self.inner.control().outp().load(Ordering::Relaxed))?;
        Ok(self.inner.free(ptrs.next_in, ptrs.cached_out) as usize)
    }

    /// The number of commits that found the ring empty but did not signal
    /// because the receiver had masked interrupts.
    pub fn interrupt_mask_skips(&self) -> u64 {
        self.interrupt_mask_skips.load(Ordering::Relaxed)
    }

    /// Makes room for `total` bytes at `ptrs.next_in`.
    ///
    /// When there is not enough room, publishes the pending send size so the
    /// receiver signals once the packet (and anything written but not yet
    /// committed) fits, then checks once more in case the receiver freed
    /// space concurrently.
    fn reserve(&self, ptrs: &mut OutgoingOffset, total: u32) -> Result<(), WriteError> {
        let inner = &self.inner;
        let control = inner.control();
        if inner.free(ptrs.next_in, ptrs.cached_out) < total {
            ptrs.cached_out = inner.validate(control.outp().load(Ordering::Relaxed))?;
            if inner.free(ptrs.next_in, ptrs.cached_out) < total {
                let pending = (inner.available(ptrs.next_in, ptrs.committed_in) + total)
                    .min(inner.size - 1);
                control
                    .pending_send_size()
                    .store(pending, Ordering::Relaxed);
                fence(Ordering::SeqCst);
                ptrs.cached_out = inner.validate(control.outp().load(Ordering::Relaxed))?;
                if inner.free(ptrs.next_in, ptrs.cached_out) < total {
                    return Err(WriteError::Full(total as usize));
                }
            }
        }
        if control.pending_send_size().load(Ordering::Relaxed) != 0 {
            control.pending_send_size().store(0, Ordering::Relaxed);
        }
        Ok(())
    }

    /// Writes the descriptor and headers of the next packet and returns the
    /// range the caller must fill with the payload. The packet becomes
    /// visible to the receiver when committed with
    /// [`OutgoingRing::commit_write`].
    pub fn write(
        &self,
        ptrs: &mut OutgoingOffset,
        packet: &OutgoingPacket<'_>,
    ) -> Result<RingRange, WriteError> {
        let (packet_type, header_size, flags) = packet.typ.header();
        let msg_len = (header_size + packet.size).next_multiple_of(8);
        let total = msg_len + FOOTER_SIZE;
        if total >= self.inner.size as usize || msg_len / 8 > u16::MAX as usize {
            return Err(WriteError::TooLarge(total));
        }
        self.reserve(ptrs, total as u32)?;

        let mem = &self.inner.mem;
        let off = ptrs.next_in as usize;
        // Clear the padding. The payload is written after this.
        mem.write_aligned(off + msg_len - 8, &[0; 8]);

        let desc = PacketDescriptor {
            packet_type: packet_type.0,
            data_offset8: (header_size / 8) as u16,
            length8: (msg_len / 8) as u16,
            flags,
            transaction_id: packet.transaction_id,
        };
        mem.write_aligned(off, desc.as_bytes());

        let mut pos = off + DESCRIPTOR_SIZE;
        match packet.typ {
            OutgoingPacketType::GpaDirect(ranges) => {
                let header = GpaDirectHeader {
                    reserved: 0,
                    range_count: ranges.len() as u32,
                };
                mem.write_aligned(pos, header.as_bytes());
                pos += size_of_val(&header);
                for range in ranges {
                    let gpa_range = GpaRange {
                        len: range.len() as u32,
                        offset: range.offset() as u32,
                    };
                    mem.write_aligned(pos, gpa_range.as_bytes());
                    pos += size_of_val(&gpa_range);
                    mem.write_aligned(pos, range.gpns().as_bytes());
                    pos += size_of_val(range.gpns());
                }
            }
            OutgoingPacketType::TransferPages(id, ranges) => {
                let header = TransferPageHeader {
                    transfer_page_set_id: id,
                    sender_owns_set: 0,
                    reserved: 0,
                    range_count: ranges.len() as u32,
                };
                mem.write_aligned(pos, header.as_bytes());
                pos += size_of_val(&header);
                mem.write_aligned(pos, ranges.as_bytes());
            }
            OutgoingPacketType::InBandNoCompletion
            | OutgoingPacketType::InBandWithCompletion
            | OutgoingPacketType::Completion
            | OutgoingPacketType::CancelRequest => {}
        }

        let footer = Footer {
            reserved: 0,
            offset: off as u32,
        };
        mem.write_aligned(off + msg_len, footer.as_bytes());
        ptrs.next_in = self.inner.add_pointer(off as u32, total as u32);
        Ok(RingRange {
            off: (off + header_size) as u32,
            size: packet.size as u32,
        })
    }

    /// Publishes the packets written since the last commit. Returns true if
    /// the receiver must be signaled: the ring was empty before this commit
    /// and the receiver has not masked interrupts.
    pub fn commit_write(&self, ptrs: &mut OutgoingOffset) -> Result<bool, Error> {
        if ptrs.committed_in == ptrs.next_in {
            return Ok(false);
        }
        let old_in = ptrs.committed_in;
        let control = self.inner.control();
        control.inp().store(ptrs.next_in, Ordering::Release);
        fence(Ordering::SeqCst);
        let masked = control.interrupt_mask().load(Ordering::Relaxed) != 0;
        let outp = self.inner.validate(control.outp().load(Ordering::Relaxed))?;
        ptrs.committed_in = ptrs.next_in;
        ptrs.cached_out = outp;
        if old_in != outp {
            // The receiver has not caught up, so it will see this packet
            // without a signal.
            return Ok(false);
        }
        if masked {
            self.interrupt_mask_skips.fetch_add(1, Ordering::Relaxed);
            return Ok(false);
        }
        Ok(true)
    }
}

/// The maximum number of interrupts considered outstanding at once.
pub const MAX_EXPECTED_INTERRUPTS: u64 = 64;

/// Why an interrupt from the peer is expected.
#[derive(Debug, Copy, Clone, PartialEq, Eq)]
pub enum InterruptReason {
    /// The incoming ring was drained, so the next packet will be signaled.
    RingEmpty,
    /// A send found the outgoing ring full and published a pending send
    /// size.
    RingFull,
}

/// Counts interrupts the ring state says should arrive, to tell real
/// interrupts from spurious ones. Tuning data only.
#[derive(Debug, Default)]
pub struct InterruptAccounting {
    empty_ring: AtomicU64,
    full_ring: AtomicU64,
    nonspurious: AtomicU64,
    spurious: AtomicU64,
}

/// A snapshot of [`InterruptAccounting`].
#[derive(Debug, Copy, Clone, Default, PartialEq, Eq)]
#[expect(missing_docs)]
pub struct InterruptStats {
    pub empty_ring: u64,
    pub full_ring: u64,
    pub nonspurious: u64,
    pub spurious: u64,
}

impl InterruptAccounting {
    /// The number of interrupts currently expected.
    pub fn expected(&self) -> u64 {
        (self.empty_ring.load(Ordering::Relaxed) + self.full_ring.load(Ordering::Relaxed))
            .saturating_sub(self.nonspurious.load(Ordering::Relaxed))
    }

    /// Records that an interrupt should arrive.
    pub fn expect(&self, reason: InterruptReason) {
        if self.expected() >= MAX_EXPECTED_INTERRUPTS {
            return;
        }
        let counter = match reason {
            InterruptReason::RingEmpty => &self.empty_ring,
            InterruptReason::RingFull => &self.full_ring,
        };
        counter.fetch_add(1, Ordering::Relaxed);
    }

    /// Records an interrupt. Returns false if none was expected.
    pub fn interrupt_received(&self) -> bool {
        if self.expected() > 0 {
            self.nonspurious.fetch_add(1, Ordering::Relaxed);
            true
        } else {
            self.spurious.fetch_add(1, Ordering::Relaxed);
            false
        }
    }

    /// Returns the counters.
    pub fn stats(&self) -> InterruptStats {
        InterruptStats {
            empty_ring: self.empty_ring.load(Ordering::Relaxed),
            full_ring: self.full_ring.load(Ordering::Relaxed),
            nonspurious: self.nonspurious.load(Ordering::Relaxed),
            spurious: self.spurious.load(Ordering::Relaxed),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::gparange::MultiPagedRangeBuf;
    use test_with_tracing::test;

    /// A ring whose sending and receiving ends share one memory, with
    /// `data_pages` pages of data.
    fn loopback(data_pages: usize) -> (OutgoingRing<PagedRingMem>, IncomingRing<PagedRingMem>) {
        let mem = PagedRingMem::new(SharedPages::new(0x1000, data_pages + 1)).unwrap();
        let in_ring = IncomingRing::new(mem.clone()).unwrap();
        let out_ring = OutgoingRing::new(mem).unwrap();
        (out_ring, in_ring)
    }

    fn write_packet<M: RingMem>(
        ring: &OutgoingRing<M>,
        typ: OutgoingPacketType<'_>,
        transaction_id: u64,
        payload: &[u8],
    ) -> Result<bool, WriteError> {
        let mut outgoing = ring.outgoing()?;
        let range = ring.write(
            &mut outgoing,
            &OutgoingPacket {
                transaction_id,
                size: payload.len(),
                typ,
            },
        )?;
        range.write_at(ring, 0, payload).unwrap();
        Ok(ring.commit_write(&mut outgoing)?)
    }

    fn write_simple<M: RingMem>(ring: &OutgoingRing<M>, payload: &[u8]) -> Option<bool> {
        match write_packet(ring, OutgoingPacketType::InBandNoCompletion, 0, payload) {
            Ok(signal) => Some(signal),
            Err(WriteError::Full(_)) => None,
            Err(err) => panic!("{err}"),
        }
    }

    fn read_one<M: RingMem>(ring: &IncomingRing<M>) -> (IncomingPacket, Vec<u8>, ReadCommit) {
        let mut incoming = ring.incoming().unwrap();
        let packet = ring.read(&mut incoming).unwrap();
        let data = packet.payload.read_all(ring);
        let commit = ring.commit_read(&mut incoming).unwrap();
        (packet, data, commit)
    }

    fn in_flight<M: RingMem>(ring: &OutgoingRing<M>) -> u32 {
        let control = ring.inner.control();
        ring.inner.available(
            control.inp().load(Ordering::Relaxed),
            control.outp().load(Ordering::Relaxed),
        )
    }

    /// Moves both offsets to `offset` with the ring empty.
    fn position_at<M: RingMem>(ring: &OutgoingRing<M>, offset: u32) {
        let control = ring.inner.control();
        control.inp().store(offset, Ordering::Relaxed);
        control.outp().store(offset, Ordering::Relaxed);
    }

    #[test]
    fn test_ring() {
        let (out_ring, in_ring) = loopback(1);
        let p = &[1, 2, 3, 4, 5, 6, 7, 8];
        assert!(write_simple(&out_ring, p).unwrap());
        let (packet, msg, commit) = read_one(&in_ring);
        assert_eq!(packet.typ, IncomingPacketType::InBand);
        assert_eq!(packet.transaction_id, None);
        assert_eq!(&msg[..], p);
        assert!(!commit.signal);
        assert!(commit.empty);
        assert!(in_ring.supports_pending_send_size());
    }

    #[test]
    fn test_interrupt_mask() {
        let (out_ring, in_ring) = loopback(1);

        in_ring.set_interrupt_mask(true);
        assert!(!write_simple(&out_ring, &[1, 2, 3]).unwrap());
        assert_eq!(out_ring.interrupt_mask_skips(), 1);
        read_one(&in_ring);

        in_ring.set_interrupt_mask(false);
        assert!(write_simple(&out_ring, &[1, 2, 3]).unwrap());
        // Not empty any more, so no signal for the second packet.
        assert!(!write_simple(&out_ring, &[4, 5, 6]).unwrap());
        assert_eq!(out_ring.interrupt_mask_skips(), 1);
    }

    #[test]
    fn test_pending_send_size() {
        let (out_ring, in_ring) = loopback(4);

        for i in 0..4 {
            write_simple(&out_ring, &[i; 4000]).unwrap();
        }
        assert!(write_simple(&out_ring, &[4; 4000]).is_none());
        assert_eq!(
            out_ring
                .inner
                .control()
                .pending_send_size()
                .load(Ordering::Relaxed),
            PacketSize::in_band(4000) as u32
        );

        // The first read frees enough space for the blocked packet.
        assert!(read_one(&in_ring).2.signal);
        assert!(!read_one(&in_ring).2.signal);

        // A successful write clears the request.
        write_simple(&out_ring, &[4; 4000]).unwrap();
        assert_eq!(
            out_ring
                .inner
                .control()
                .pending_send_size()
                .load(Ordering::Relaxed),
            0
        );
        assert!(!read_one(&in_ring).2.signal);
    }

    #[test]
    fn round_trip_all_kinds_across_wrap() {
        let (out_ring, in_ring) = loopback(1);
        let gpns_a = [0x10, 0x11];
        let gpns_b = [0x20];
        let ranges = [
            PagedRange::new(0x10, 0x1000, &gpns_a).unwrap(),
            PagedRange::new(0, 0x200, &gpns_b).unwrap(),
        ];
        let tp_ranges = [
            TransferPageRange {
                byte_count: 100,
                byte_offset: 0,
            },
            TransferPageRange {
                byte_count: 200,
                byte_offset: 4096,
            },
        ];

        // Start each packet at several positions, including ones that force
        // the packet to straddle the end of the ring.
        for start in (0..PAGE_SIZE as u32).step_by(8 * 61) {
            for kind in 0..6 {
                position_at(&out_ring, start);
                let payload: Vec<u8> = (0..(37 + kind * 13) as u8).collect();
                let (typ, txid) = match kind {
                    0 => (OutgoingPacketType::InBandNoCompletion, 0),
                    1 => (OutgoingPacketType::InBandWithCompletion, 11),
                    2 => (OutgoingPacketType::Completion, 12),
                    3 => (OutgoingPacketType::CancelRequest, 13),
                    4 => (OutgoingPacketType::GpaDirect(&ranges), 14),
                    _ => (OutgoingPacketType::TransferPages(3, &tp_ranges), 15),
                };
                write_packet(&out_ring, typ, txid, &payload).unwrap();
                let (packet, data, _) = read_one(&in_ring);
                assert_eq!(data, payload);
                match (kind, packet.typ) {
                    (0, IncomingPacketType::InBand) => assert_eq!(packet.transaction_id, None),
                    (1, IncomingPacketType::InBand)
                    | (2, IncomingPacketType::Completion)
                    | (3, IncomingPacketType::CancelRequest) => {
                        assert_eq!(packet.transaction_id, Some(txid))
                    }
                    (4, IncomingPacketType::GpaDirect(count, range)) => {
                        assert_eq!(packet.transaction_id, Some(14));
                        let values: Vec<u64> = range
                            .read_all(&in_ring)
                            .chunks_exact(8)
                            .map(|c| u64::from_le_bytes(c.try_into().unwrap()))
                            .collect();
                        let parsed =
                            MultiPagedRangeBuf::new(count as usize, values.as_slice()).unwrap();
                        assert_eq!(parsed.iter().collect::<Vec<_>>(), ranges);
                    }
                    (5, IncomingPacketType::TransferPages(id, count, range)) => {
                        assert_eq!((id, count), (3, 2));
                        let raw = range.read_all(&in_ring);
                        assert_eq!(raw, tp_ranges.as_bytes());
                    }
                    (kind, typ) => panic!("kind {kind} parsed as {typ:?}"),
                }
            }
        }
    }

    #[test]
    fn capacity_invariant() {
        let (out_ring, in_ring) = loopback(2);
        let size = out_ring.len() as u32;
        let mut written = 0;
        while write_simple(&out_ring, &[0xaa; 1000]).is_some() {
            written += 1;
            assert!(in_flight(&out_ring) < size);
        }
        let before = in_flight(&out_ring);
        // A failed write leaves the ring as it was.
        assert!(write_simple(&out_ring, &[0xbb; 1000]).is_none());
        assert_eq!(in_flight(&out_ring), before);
        assert_eq!(written, (size as usize - 1) / PacketSize::in_band(1000));

        read_one(&in_ring);
        write_simple(&out_ring, &[0xcc; 1000]).unwrap();
        for _ in 0..written - 1 {
            assert_eq!(read_one(&in_ring).1, [0xaa; 1000]);
        }
        assert_eq!(read_one(&in_ring).1, [0xcc; 1000]);
    }

    #[test]
    fn too_large() {
        let (out_ring, _in_ring) = loopback(1);
        let max_payload = out_ring.maximum_packet_size() - DESCRIPTOR_SIZE - FOOTER_SIZE;
        assert!(matches!(
            write_packet(
                &out_ring,
                OutgoingPacketType::InBandNoCompletion,
                0,
                &vec![0; max_payload + 1]
            ),
            Err(WriteError::TooLarge(_))
        ));
        write_packet(
            &out_ring,
            OutgoingPacketType::InBandNoCompletion,
            0,
            &vec![0; max_payload],
        )
        .unwrap();
    }

    #[test]
    fn fifo_order_with_wraparound() {
        let (out_ring, in_ring) = loopback(1);
        let mut next_read = 0u32;
        let mut incoming = in_ring.incoming().unwrap();
        for tag in 0..500u32 {
            let len = 4 + (tag as usize * 37) % 600;
            let mut payload = vec![tag as u8; len];
            payload[..4].copy_from_slice(&tag.to_le_bytes());
            while write_simple(&out_ring, &payload).is_none() {
                // Drain a few packets to make room.
                for _ in 0..3 {
                    let Ok(packet) = in_ring.read(&mut incoming) else {
                        break;
                    };
                    let data = packet.payload.read_all(&in_ring);
                    assert_eq!(u32::from_le_bytes(data[..4].try_into().unwrap()), next_read);
                    next_read += 1;
                }
                in_ring.commit_read(&mut incoming).unwrap();
            }
        }
        loop {
            match in_ring.read(&mut incoming) {
                Ok(packet) => {
                    let data = packet.payload.read_all(&in_ring);
                    assert_eq!(u32::from_le_bytes(data[..4].try_into().unwrap()), next_read);
                    next_read += 1;
                }
                Err(ReadError::Empty) => break,
                Err(err) => panic!("{err}"),
            }
        }
        assert_eq!(next_read, 500);
    }

    #[test]
    fn three_page_scenario() {
        let (out_ring, in_ring) = loopback(3);
        assert_eq!(out_ring.len(), 12288);

        write_packet(
            &out_ring,
            OutgoingPacketType::InBandWithCompletion,
            0x1234,
            &[1; 100],
        )
        .unwrap();
        write_packet(&out_ring, OutgoingPacketType::InBandNoCompletion, 0, &[2; 50]).unwrap();

        let (first, data, _) = read_one(&in_ring);
        assert_eq!(first.transaction_id, Some(0x1234));
        assert_eq!(data, [1; 100]);
        let (second, data, _) = read_one(&in_ring);
        assert_eq!(second.transaction_id, None);
        assert_eq!(data, [2; 50]);

        // The peer's completion echoes the transaction ID.
        write_packet(&out_ring, OutgoingPacketType::Completion, 0x1234, &[9; 8]).unwrap();
        let (completion, _, _) = read_one(&in_ring);
        assert_eq!(completion.typ, IncomingPacketType::Completion);
        assert_eq!(completion.transaction_id, Some(0x1234));

        // Advance close to the end, then write a packet that must wrap.
        let inp = out_ring.outgoing().unwrap().next_in;
        let filler = 12288 - inp as usize - 40 - DESCRIPTOR_SIZE - FOOTER_SIZE;
        write_simple(&out_ring, &vec![3; filler]).unwrap();
        read_one(&in_ring);
        assert_eq!(out_ring.outgoing().unwrap().next_in, 12288 - 40);

        let wrapping: Vec<u8> = (0..200).map(|i| i as u8).collect();
        write_simple(&out_ring, &wrapping).unwrap();
        assert!(out_ring.outgoing().unwrap().next_in < 12288 - 40);
        let (_, data, commit) = read_one(&in_ring);
        assert_eq!(data, wrapping);
        assert!(commit.empty);
    }

    #[test]
    fn corrupt_pointers() {
        let (out_ring, in_ring) = loopback(1);
        let mut incoming = in_ring.incoming().unwrap();
        out_ring.inner.control().inp().store(12, Ordering::Relaxed);
        assert_eq!(
            in_ring.read(&mut incoming).unwrap_err(),
            ReadError::Corrupt(Error::InvalidRingPointer)
        );
        assert_eq!(
            in_ring.incoming().unwrap_err(),
            Error::InvalidRingPointer
        );
        out_ring
            .inner
            .control()
            .outp()
            .store(PAGE_SIZE as u32, Ordering::Relaxed);
        assert_eq!(
            OutgoingRing::new(out_ring.mem().clone()).unwrap_err(),
            Error::InvalidRingPointer
        );
    }

    #[test]
    fn corrupt_descriptors() {
        let cases: [(fn(&mut PacketDescriptor), Error); 5] = [
            (|d| d.length8 = 1, Error::InvalidMessageLength),
            (|d| d.length8 = 200, Error::InvalidMessageLength),
            (|d| d.data_offset8 = 1, Error::InvalidDescriptorLengths),
            (|d| d.flags = 2, Error::InvalidDescriptorFlags),
            (
                |d| d.packet_type = 3,
                Error::InvalidDescriptorType(PacketType(3)),
            ),
        ];
        for (corrupt, expected) in cases {
            let (out_ring, in_ring) = loopback(1);
            write_simple(&out_ring, &[0; 32]).unwrap();
            let mem = out_ring.mem();
            let mut desc = PacketDescriptor::new_zeroed();
            mem.read_at(0, desc.as_mut_bytes());
            corrupt(&mut desc);
            mem.write_at(0, desc.as_bytes());
            let mut incoming = in_ring.incoming().unwrap();
            assert_eq!(
                in_ring.read(&mut incoming).unwrap_err(),
                ReadError::Corrupt(expected)
            );
        }
    }

    #[test]
    fn corrupt_transfer_page_count() {
        let (out_ring, in_ring) = loopback(1);
        let ranges = [TransferPageRange {
            byte_count: 1,
            byte_offset: 0,
        }];
        write_packet(
            &out_ring,
            OutgoingPacketType::TransferPages(1, &ranges),
            1,
            &[],
        )
        .unwrap();
        let mut tph = TransferPageHeader::new_zeroed();
        out_ring.mem().read_at(DESCRIPTOR_SIZE, tph.as_mut_bytes());
        tph.range_count = 2;
        out_ring.mem().write_at(DESCRIPTOR_SIZE, tph.as_bytes());
        let mut incoming = in_ring.incoming().unwrap();
        assert_eq!(
            in_ring.read(&mut incoming).unwrap_err(),
            ReadError::Corrupt(Error::InvalidTransferPageRangeCount)
        );
    }

    #[test]
    fn interrupt_accounting() {
        let accounting = InterruptAccounting::default();
        assert!(!accounting.interrupt_received());
        accounting.expect(InterruptReason::RingEmpty);
        accounting.expect(InterruptReason::RingFull);
        assert_eq!(accounting.expected(), 2);
        assert!(accounting.interrupt_received());
        assert!(accounting.interrupt_received());
        assert!(!accounting.interrupt_received());
        for _ in 0..100 {
            accounting.expect(InterruptReason::RingEmpty);
        }
        assert_eq!(accounting.expected(), MAX_EXPECTED_INTERRUPTS);
        assert_eq!(
            accounting.stats(),
            InterruptStats {
                empty_ring: 65,
                full_ring: 1,
                nonspurious: 2,
                spurious: 2,
            }
        );
    }

    #[test]
    fn packet_sizes() {
        assert_eq!(PacketSize::in_band(0), 24);
        assert_eq!(PacketSize::in_band(100), 16 + 104 + 8);
        assert_eq!(PacketSize::transfer_pages(2, 0), 16 + 8 + 16 + 8);
        let gpns = [1, 2];
        let ranges = [PagedRange::new(0, 0x2000, &gpns).unwrap()];
        assert_eq!(PacketSize::gpa_direct(&ranges, 8), 16 + 8 + 24 + 8 + 8);
    }
}
