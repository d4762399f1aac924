// Copyright (c) Microsoft Corporation.
// Licensed under the MIT License.

//! A VMBus channel endpoint for device drivers.
//!
//! An [`Endpoint`] owns one offered channel. Starting it creates a GPADL
//! holding both ring buffers, opens the channel, and hooks the channel
//! interrupt so that incoming packets are dispatched to the registered
//! receive callback and completions to the routine given when the packet was
//! sent. Packets that do not fit in the outgoing ring are queued and sent
//! once the host frees space.
//!
//! The send state and the receive state are each guarded by their own lock,
//! so a receive callback may send packets but must not start or stop the
//! endpoint.

#![forbid(unsafe_code)]

mod bounce;

pub use bounce::BOUNCE_BLOCK_PAGES;

use bitfield_struct::bitfield;
use bounce::BounceBuffer;
use bounce::BouncePool;
use parking_lot::Mutex;
use std::collections::BTreeMap;
use std::collections::VecDeque;
use std::sync::Arc;
use std::sync::Weak;
use std::sync::atomic::AtomicBool;
use std::sync::atomic::Ordering;
use thiserror::Error;
use vmbus_client::ChannelError;
use vmbus_client::Gpadl;
use vmbus_client::GpadlError;
use vmbus_client::GpadlFlags;
use vmbus_client::MemoryError;
use vmbus_client::OfferInfo;
use vmbus_client::OpenError;
use vmbus_client::OpenRequest;
use vmbus_client::VmbusClient;
use vmbus_core::protocol::ChannelId;
use vmbus_core::protocol::GpadlId;
use vmbus_core::protocol::UserDefinedData;
use vmbus_ring::IncomingPacketType;
use vmbus_ring::IncomingRing;
use vmbus_ring::InterruptAccounting;
use vmbus_ring::InterruptReason;
use vmbus_ring::InterruptStats;
use vmbus_ring::OutgoingPacket;
use vmbus_ring::OutgoingPacketType;
use vmbus_ring::OutgoingRing;
use vmbus_ring::PAGE_SIZE;
use vmbus_ring::PacketSize;
use vmbus_ring::PagedRingMem;
use vmbus_ring::PipeHeader;
use vmbus_ring::ReadError;
use vmbus_ring::RingRange;
use vmbus_ring::SharedPages;
use vmbus_ring::TransferPageRange;
use vmbus_ring::WriteError;
use vmbus_ring::gparange::GpnList;
use vmbus_ring::gparange::MultiPagedRangeBuf;
use vmbus_ring::gparange::PagedRange;
use vmbus_ring::gparange::page_span;
use zerocopy::FromBytes;
use zerocopy::FromZeros;
use zerocopy::Immutable;
use zerocopy::IntoBytes;
use zerocopy::KnownLayout;

/// A UEFI task priority level.
#[derive(Debug, Copy, Clone, PartialEq, Eq, PartialOrd, Ord)]
pub struct Tpl(pub usize);

#[expect(missing_docs)]
impl Tpl {
    pub const APPLICATION: Self = Self(4);
    pub const CALLBACK: Self = Self(8);
    pub const NOTIFY: Self = Self(16);
    pub const HIGH_LEVEL: Self = Self(31);
}

impl Tpl {
    /// The level at which channel state is manipulated.
    pub const CHANNEL: Self = Self(Self::HIGH_LEVEL.0 - 1);
}

/// Options for [`Endpoint::send_packet_ex`].
#[bitfield(u32)]
pub struct SendFlags {
    /// The host only writes the external buffers, so their contents need
    /// not be sent.
    pub data_in_only: bool,
    /// The host only reads the external buffers, so their contents need not
    /// be copied back on completion.
    pub data_out_only: bool,
    #[bits(30)]
    _reserved: u32,
}

/// A byte range of guest memory referenced by a GPA direct packet.
#[derive(Debug, Clone)]
pub struct ExternalBuffer {
    /// The pages holding the buffer.
    pub pages: SharedPages,
    /// The offset of the buffer within `pages`.
    pub offset: usize,
    /// The length of the buffer.
    pub len: usize,
}

impl ExternalBuffer {
    fn validate(&self) -> Result<(), SendError> {
        if self.len == 0
            || self.len > u32::MAX as usize
            || self
                .offset
                .checked_add(self.len)
                .is_none_or(|end| end > self.pages.len())
        {
            return Err(SendError::InvalidBuffer {
                offset: self.offset,
                len: self.len,
            });
        }
        Ok(())
    }

    fn gpns(&self) -> GpnList {
        let first = self.pages.gpn() + (self.offset / PAGE_SIZE) as u64;
        (first..first + page_span(self.offset, self.len) as u64).collect()
    }
}

/// Called with the inline payload of the host's completion.
pub type CompletionRoutine = Box<dyn FnOnce(&[u8]) + Send>;

/// Called for each data packet received from the host.
pub type ReceiveCallback = Arc<dyn Fn(&Endpoint, ReceivedPacket) + Send + Sync>;

/// Identifies a received packet to [`Endpoint::complete_packet`].
#[derive(Debug)]
#[must_use]
pub struct PacketContext {
    transaction_id: u64,
    completion_requested: bool,
}

impl PacketContext {
    /// The host's transaction ID.
    pub fn transaction_id(&self) -> u64 {
        self.transaction_id
    }

    /// Returns true if the host expects a completion.
    pub fn completion_requested(&self) -> bool {
        self.completion_requested
    }
}

/// Ranges of a transfer page set referenced by a received packet.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TransferPages {
    /// The transfer page set.
    pub set_id: u16,
    /// The referenced ranges.
    pub ranges: Vec<TransferPageRange>,
}

/// A data packet received from the host.
#[derive(Debug)]
pub struct ReceivedPacket {
    /// Pass to [`Endpoint::complete_packet`] when done with the packet.
    pub context: PacketContext,
    /// The inline payload, without any pipe header.
    pub data: Vec<u8>,
    /// The transfer page ranges, for transfer page packets.
    pub transfer_pages: Option<TransferPages>,
}

/// A failure to start an endpoint.
#[derive(Debug, Error)]
pub enum StartError {
    /// The endpoint is already running.
    #[error("channel is already running")]
    Running,
    /// The ring GPADL of a previous run has not been destroyed.
    #[error("ring gpadl {0} of the previous run has not been destroyed")]
    RingGpadlExists(GpadlId),
    /// A ring size is zero or too large.
    #[error("invalid ring sizes: {incoming} incoming pages, {outgoing} outgoing pages")]
    InvalidRingSize {
        /// The requested incoming ring pages.
        incoming: u32,
        /// The requested outgoing ring pages.
        outgoing: u32,
    },
    /// The ring pages could not be allocated.
    #[error("failed to allocate ring pages")]
    Memory(#[source] MemoryError),
    /// The ring GPADL could not be created.
    #[error("failed to create ring gpadl")]
    Gpadl(#[source] GpadlError),
    /// The ring memory is not usable.
    #[error("invalid ring memory")]
    Ring(#[source] vmbus_ring::Error),
    /// The channel interrupt could not be registered.
    #[error("failed to register channel interrupt")]
    Interrupt(#[source] ChannelError),
    /// The channel could not be opened.
    #[error("failed to open channel")]
    Open(#[source] OpenError),
}

/// A failure to send a packet.
#[derive(Debug, Error)]
pub enum SendError {
    /// The endpoint is not running.
    #[error("channel is not running")]
    NotRunning,
    /// The ring was corrupted by the host and the channel is unusable.
    #[error("channel failed")]
    ChannelFailed,
    /// The packet can never fit in the outgoing ring.
    #[error("packet of {0} bytes too large for the ring")]
    TooLarge(usize),
    /// An external buffer is empty or outside its pages.
    #[error("invalid external buffer at offset {offset:#x} with length {len:#x}")]
    InvalidBuffer {
        /// The buffer offset.
        offset: usize,
        /// The buffer length.
        len: usize,
    },
    /// Pipe channels only carry inline data.
    #[error("external buffers are not supported in pipe mode")]
    PipeExternalBuffers,
    /// The operation requires a pipe channel.
    #[error("channel is not in pipe mode")]
    NotPipe,
    /// Every transaction ID has been used.
    #[error("transaction ids exhausted")]
    TransactionIdsExhausted,
    /// Bounce pages could not be allocated.
    #[error("failed to allocate bounce pages")]
    Bounce(#[source] MemoryError),
    /// The ring is corrupt.
    #[error("ring corrupt")]
    Corrupt(#[source] vmbus_ring::Error),
    /// The payload did not fit the range reserved for it.
    #[error("failed to write payload")]
    Payload(#[source] vmbus_ring::AccessError),
}

/// A failed endpoint operation.
#[derive(Debug, Error)]
pub enum EndpointError {
    /// The channel is not offered.
    #[error("unknown channel {0}")]
    UnknownChannel(ChannelId),
    /// The operation is not allowed while the endpoint is running.
    #[error("channel is running")]
    Running,
    /// The channel could not be closed.
    #[error("failed to close channel")]
    Close(#[source] ChannelError),
    /// The ring GPADL could not be destroyed.
    #[error("failed to destroy ring gpadl")]
    Gpadl(#[source] GpadlError),
}

/// Endpoint counters.
#[derive(Debug, Copy, Clone, Default, PartialEq, Eq)]
pub struct EndpointStats {
    /// Interrupt accounting.
    pub interrupts: InterruptStats,
    /// Commits that did not signal because the host masked interrupts.
    pub interrupt_mask_skips: u64,
    /// Free bytes in the outgoing ring, if running.
    pub outgoing_free_bytes: Option<usize>,
    /// Packets waiting for ring space.
    pub queued: usize,
    /// Transactions waiting for a completion.
    pub pending_completions: usize,
}

#[repr(C)]
#[derive(Debug, Copy, Clone, IntoBytes, Immutable, KnownLayout, FromBytes)]
struct PipeSetupGpaDirect {
    handle: u32,
    is_writable: u8,
    reserved: [u8; 3],
    range_count: u32,
    padding: u32,
}

#[repr(C)]
#[derive(Debug, Copy, Clone, IntoBytes, Immutable, KnownLayout, FromBytes)]
struct PipeTeardownGpaDirect {
    handle: u32,
}

#[derive(Debug, Copy, Clone)]
enum PacketKind {
    InBand { completion_requested: bool },
    Completion,
    CancelRequest,
    GpaDirect,
}

/// An encoded packet, owned so that it can wait in the send queue.
struct PendingPacket {
    transaction_id: u64,
    kind: PacketKind,
    ranges: MultiPagedRangeBuf<GpnList>,
    payload: Vec<u8>,
    /// Hold back a required signal until the next packet that does not
    /// defer.
    defer_interrupt: bool,
}

impl PendingPacket {
    fn new(transaction_id: u64, kind: PacketKind, payload: Vec<u8>) -> Self {
        Self {
            transaction_id,
            kind,
            ranges: MultiPagedRangeBuf::default(),
            payload,
            defer_interrupt: false,
        }
    }

    fn deferring_interrupt(mut self) -> Self {
        self.defer_interrupt = true;
        self
    }

    fn ring_size(&self) -> usize {
        match self.kind {
            PacketKind::GpaDirect => {
                let ranges: Vec<_> = self.ranges.iter().collect();
                PacketSize::gpa_direct(&ranges, self.payload.len())
            }
            _ => PacketSize::in_band(self.payload.len()),
        }
    }
}

enum WriteOutcome {
    Sent { signal: bool },
    Full,
}

fn write_packet(
    ring: &OutgoingRing<PagedRingMem>,
    packet: &PendingPacket,
) -> Result<WriteOutcome, SendError> {
    let ranges: Vec<PagedRange<'_>> = packet.ranges.iter().collect();
    let typ = match packet.kind {
        PacketKind::InBand {
            completion_requested: false,
        } => OutgoingPacketType::InBandNoCompletion,
        PacketKind::InBand {
            completion_requested: true,
        } => OutgoingPacketType::InBandWithCompletion,
        PacketKind::Completion => OutgoingPacketType::Completion,
        PacketKind::CancelRequest => OutgoingPacketType::CancelRequest,
        PacketKind::GpaDirect => OutgoingPacketType::GpaDirect(&ranges),
    };
    let mut ptrs = ring.outgoing().map_err(SendError::Corrupt)?;
    let range = match ring.write(
        &mut ptrs,
        &OutgoingPacket {
            transaction_id: packet.transaction_id,
            size: packet.payload.len(),
            typ,
        },
    ) {
        Ok(range) => range,
        Err(WriteError::Full(_)) => return Ok(WriteOutcome::Full),
        Err(WriteError::TooLarge(len)) => return Err(SendError::TooLarge(len)),
        Err(WriteError::Corrupt(err)) => return Err(SendError::Corrupt(err)),
    };
    range
        .write_at(ring, 0, &packet.payload)
        .map_err(SendError::Payload)?;
    let signal = ring.commit_write(&mut ptrs).map_err(SendError::Corrupt)?;
    Ok(WriteOutcome::Sent { signal })
}

struct PendingCompletion {
    routine: Option<CompletionRoutine>,
    bounce: Vec<BounceBuffer>,
    flags: SendFlags,
    cancelled: bool,
}

struct Completions {
    last_transaction_id: u64,
    pending: BTreeMap<u64, PendingCompletion>,
}

struct SendState {
    ring: OutgoingRing<PagedRingMem>,
    queue: VecDeque<PendingPacket>,
    interrupt_deferred: bool,
}

struct ReceiveState {
    ring: IncomingRing<PagedRingMem>,
    callback: Option<ReceiveCallback>,
}

#[derive(Default)]
struct Lifecycle {
    ring_gpadl: Option<Gpadl>,
    receive_callback: Option<ReceiveCallback>,
}

/// Snapshot of the lifecycle for the getters. Guarded by a leaf lock: no
/// other lock is taken while it is held, so receive callbacks may query it.
#[derive(Copy, Clone, Default)]
struct Status {
    running: bool,
    ring_gpadl_id: Option<GpadlId>,
    receive_tpl: Option<Tpl>,
}

#[derive(Debug, Error)]
enum DispatchError {
    #[error("ring corrupt")]
    Ring(#[from] vmbus_ring::Error),
    #[error("pipe packet of {len} bytes exceeds the {available} bytes available")]
    PipeLength { len: u32, available: usize },
    #[error("pipe packet shorter than its header")]
    PipeHeader,
}

/// The driver's end of a channel. See the crate documentation.
pub struct Endpoint {
    this: Weak<Endpoint>,
    client: Arc<VmbusClient>,
    offer: OfferInfo,
    lifecycle: Mutex<Lifecycle>,
    status: Mutex<Status>,
    send: Mutex<Option<SendState>>,
    receive: Mutex<Option<ReceiveState>>,
    completions: Mutex<Completions>,
    bounce: Mutex<BouncePool>,
    accounting: InterruptAccounting,
    failed: AtomicBool,
}

impl Endpoint {
    /// Creates an endpoint for an offered channel.
    pub fn new(
        client: Arc<VmbusClient>,
        channel_id: ChannelId,
    ) -> Result<Arc<Self>, EndpointError> {
        let offer = client
            .offer(channel_id)
            .ok_or(EndpointError::UnknownChannel(channel_id))?;
        let bounce = BouncePool::new(client.memory().clone());
        Ok(Arc::new_cyclic(|this| Self {
            this: this.clone(),
            client,
            offer,
            lifecycle: Mutex::new(Lifecycle::default()),
            status: Mutex::new(Status::default()),
            send: Mutex::new(None),
            receive: Mutex::new(None),
            completions: Mutex::new(Completions {
                last_transaction_id: 0,
                pending: BTreeMap::new(),
            }),
            bounce: Mutex::new(bounce),
            accounting: InterruptAccounting::default(),
            failed: AtomicBool::new(false),
        }))
    }

    /// The channel ID.
    pub fn channel_id(&self) -> ChannelId {
        self.offer.channel_id()
    }

    /// The channel's offer.
    pub fn offer(&self) -> &OfferInfo {
        &self.offer
    }

    /// Returns true between a successful [`Endpoint::start_channel`] and
    /// [`Endpoint::stop_channel`].
    pub fn is_running(&self) -> bool {
        self.status.lock().running
    }

    /// Returns true if the host corrupted a ring. A failed endpoint drops
    /// all traffic until it is stopped and started again.
    pub fn is_failed(&self) -> bool {
        self.failed.load(Ordering::Relaxed)
    }

    /// The ring GPADL, kept from start until [`Endpoint::destroy_ring_gpadl`].
    pub fn ring_gpadl_id(&self) -> Option<GpadlId> {
        self.status.lock().ring_gpadl_id
    }

    /// Sets the callback for received data packets. Only allowed while
    /// stopped. `None` removes the callback, after which received data
    /// packets are dropped.
    pub fn set_receive_callback(
        &self,
        callback: Option<ReceiveCallback>,
        tpl: Tpl,
    ) -> Result<(), EndpointError> {
        if self.is_running() {
            return Err(EndpointError::Running);
        }
        let mut lifecycle = self.lifecycle.lock();
        let mut status = self.status.lock();
        if status.running {
            return Err(EndpointError::Running);
        }
        status.receive_tpl = callback.is_some().then_some(tpl);
        lifecycle.receive_callback = callback;
        Ok(())
    }

    /// The priority level the receive callback was registered with.
    pub fn receive_tpl(&self) -> Option<Tpl> {
        self.status.lock().receive_tpl
    }

    /// Creates the ring buffers and opens the channel.
    ///
    /// The ring GPADL holds the outgoing ring (a control page followed by
    /// `outgoing_pages` data pages) and then the incoming ring. Every step is
    /// undone if a later one fails.
    pub fn start_channel(
        &self,
        incoming_pages: u32,
        outgoing_pages: u32,
    ) -> Result<(), StartError> {
        let channel_id = self.channel_id();
        let mut lifecycle = self.lifecycle.lock();
        if self.is_running() {
            return Err(StartError::Running);
        }
        if let Some(gpadl) = &lifecycle.ring_gpadl {
            return Err(StartError::RingGpadlExists(gpadl.id()));
        }
        let invalid_size = || StartError::InvalidRingSize {
            incoming: incoming_pages,
            outgoing: outgoing_pages,
        };
        if incoming_pages == 0 || outgoing_pages == 0 {
            return Err(invalid_size());
        }
        let outgoing_total = outgoing_pages as usize + 1;
        let incoming_total = incoming_pages as usize + 1;

        let pages = self
            .client
            .memory()
            .allocate_pages(outgoing_total + incoming_total)
            .map_err(StartError::Memory)?;
        let gpadl = self
            .client
            .create_gpadl(
                channel_id,
                pages.clone(),
                GpadlFlags::new()
                    .with_zero_pages(true)
                    .with_allow_encrypted(true),
            )
            .map_err(StartError::Gpadl)?;

        let callback = lifecycle.receive_callback.clone();
        match self.open(&pages, outgoing_total, incoming_total, gpadl.id(), callback) {
            Ok(()) => {
                self.failed.store(false, Ordering::Relaxed);
                {
                    let mut status = self.status.lock();
                    status.running = true;
                    status.ring_gpadl_id = Some(gpadl.id());
                }
                lifecycle.ring_gpadl = Some(gpadl);
                tracing::info!(%channel_id, incoming_pages, outgoing_pages, "channel started");
                Ok(())
            }
            Err(err) => {
                if let Err(destroy_err) = self.client.destroy_gpadl(&gpadl) {
                    tracing::error!(
                        %channel_id,
                        error = &destroy_err as &dyn std::error::Error,
                        "failed to destroy ring gpadl after start failure"
                    );
                }
                Err(err)
            }
        }
    }

    fn open(
        &self,
        pages: &SharedPages,
        outgoing_total: usize,
        incoming_total: usize,
        ring_gpadl_id: GpadlId,
        callback: Option<ReceiveCallback>,
    ) -> Result<(), StartError> {
        let channel_id = self.channel_id();
        let ring_mem = |first, count| {
            pages
                .subrange(first, count)
                .and_then(PagedRingMem::new)
                .ok_or(StartError::Ring(vmbus_ring::Error::InvalidRingMemory))
        };
        let outgoing = OutgoingRing::new(ring_mem(0, outgoing_total)?).map_err(StartError::Ring)?;
        let incoming =
            IncomingRing::new(ring_mem(outgoing_total, incoming_total)?).map_err(StartError::Ring)?;
        let downstream_ring_buffer_page_offset = u32::try_from(outgoing_total)
            .map_err(|_| StartError::Ring(vmbus_ring::Error::InvalidRingMemory))?;

        {
            let mut send = self.send.lock();
            *send = Some(SendState {
                ring: outgoing,
                queue: VecDeque::new(),
                interrupt_deferred: false,
            });
        }
        {
            let mut receive = self.receive.lock();
            *receive = Some(ReceiveState {
                ring: incoming,
                callback,
            });
        }

        let this = self.this.clone();
        let result = self
            .client
            .register_isr(
                channel_id,
                Arc::new(move || {
                    if let Some(endpoint) = this.upgrade() {
                        endpoint.handle_interrupt();
                    }
                }),
            )
            .map_err(StartError::Interrupt)
            .and_then(|()| {
                self.client
                    .open_channel(&OpenRequest {
                        channel_id,
                        ring_gpadl_id,
                        downstream_ring_buffer_page_offset,
                        user_data: UserDefinedData::default(),
                    })
                    .map_err(|err| {
                        self.client.unregister_isr(channel_id);
                        StartError::Open(err)
                    })
            });

        if result.is_err() {
            self.send.lock().take();
            self.receive.lock().take();
        }
        result
    }

    /// Closes the channel. Queued packets and outstanding completions are
    /// dropped without calling their routines. The ring GPADL stays until
    /// [`Endpoint::destroy_ring_gpadl`]. Does nothing if not running.
    ///
    /// A receive callback running concurrently still observes the endpoint
    /// as running until it returns.
    pub fn stop_channel(&self) -> Result<(), EndpointError> {
        let channel_id = self.channel_id();
        let _lifecycle = self.lifecycle.lock();
        if !self.is_running() {
            return Ok(());
        }

        let result = self.client.close_channel(channel_id);
        self.client.unregister_isr(channel_id);
        let queued = {
            let mut send = self.send.lock();
            send.take().map_or(0, |s| s.queue.len())
        };
        {
            // Waits for any callback in progress.
            let mut receive = self.receive.lock();
            receive.take();
        }
        self.status.lock().running = false;

        let pending = {
            let mut completions = self.completions.lock();
            std::mem::take(&mut completions.pending)
        };
        if !pending.is_empty() || queued != 0 {
            tracing::debug!(
                %channel_id,
                pending = pending.len(),
                queued,
                "dropping outstanding packets"
            );
        }
        {
            let mut bounce = self.bounce.lock();
            for completion in pending.into_values() {
                for buffer in completion.bounce {
                    bounce.release(buffer);
                }
            }
        }

        tracing::info!(%channel_id, "channel stopped");
        result.map_err(EndpointError::Close)
    }

    /// Destroys the ring GPADL of a stopped endpoint. Rejected while running;
    /// does nothing if already destroyed.
    pub fn destroy_ring_gpadl(&self) -> Result<(), EndpointError> {
        let mut lifecycle = self.lifecycle.lock();
        if self.is_running() {
            return Err(EndpointError::Running);
        }
        let Some(gpadl) = lifecycle.ring_gpadl.take() else {
            return Ok(());
        };
        if let Err(err) = self.client.destroy_gpadl(&gpadl) {
            lifecycle.ring_gpadl = Some(gpadl);
            return Err(EndpointError::Gpadl(err));
        }
        self.status.lock().ring_gpadl_id = None;
        Ok(())
    }

    /// Creates a GPADL on this channel, for buffers shared with the host
    /// outside the rings.
    pub fn create_gpadl(&self, pages: SharedPages, flags: GpadlFlags) -> Result<Gpadl, GpadlError> {
        self.client.create_gpadl(self.channel_id(), pages, flags)
    }

    /// Destroys a GPADL created with [`Endpoint::create_gpadl`].
    pub fn destroy_gpadl(&self, gpadl: &Gpadl) -> Result<(), GpadlError> {
        self.client.destroy_gpadl(gpadl)
    }

    /// Sends a packet with no special handling of external buffers.
    ///
    /// See [`Endpoint::send_packet_ex`].
    pub fn send_packet(
        &self,
        inline: &[u8],
        external: &[ExternalBuffer],
        completion: Option<CompletionRoutine>,
    ) -> Result<Option<u64>, SendError> {
        self.send_packet_ex(inline, external, SendFlags::new(), completion)
    }

    /// Sends `inline` and, as a GPA direct packet, `external`.
    ///
    /// If `completion` is set, the host is asked for a completion and the
    /// routine is called exactly once with its payload. Returns the
    /// transaction ID if the packet is tracked for completion, which is
    /// always the case for GPA direct packets.
    ///
    /// A packet that does not fit in the ring right now is queued and sent
    /// once the host frees space, so success means the packet will be sent.
    pub fn send_packet_ex(
        &self,
        inline: &[u8],
        external: &[ExternalBuffer],
        flags: SendFlags,
        completion: Option<CompletionRoutine>,
    ) -> Result<Option<u64>, SendError> {
        if self.offer.is_pipe() && !external.is_empty() {
            return Err(SendError::PipeExternalBuffers);
        }
        for buffer in external {
            buffer.validate()?;
        }

        let payload = self.inline_payload(inline, vmbus_ring::PIPE_PACKET_TYPE_DATA);
        let mut bounce = Vec::new();
        let gpns: Vec<GpnList> = if self.client.memory().is_isolated() && !external.is_empty() {
            let mut pool = self.bounce.lock();
            for buffer in external {
                match pool.bounce(buffer, !flags.data_in_only()) {
                    Ok(b) => bounce.push(b),
                    Err(err) => {
                        for b in bounce {
                            pool.release(b);
                        }
                        return Err(SendError::Bounce(err));
                    }
                }
            }
            bounce
                .iter()
                .map(|b| b.pages().iter().map(|p| pool.visible_gpn(p)).collect())
                .collect()
        } else {
            external.iter().map(ExternalBuffer::gpns).collect()
        };
        let ranges = paged_ranges(external, &gpns);

        let kind = if external.is_empty() {
            PacketKind::InBand {
                completion_requested: completion.is_some(),
            }
        } else {
            PacketKind::GpaDirect
        };
        let tracked = completion.is_some() || !external.is_empty();
        let transaction_id = if tracked {
            match self.track(PendingCompletion {
                routine: completion,
                bounce,
                flags,
                cancelled: false,
            }) {
                Ok(id) => id,
                Err((err, completion)) => {
                    self.release_bounce(completion.bounce);
                    return Err(err);
                }
            }
        } else {
            0
        };

        let packet = PendingPacket {
            transaction_id,
            kind,
            ranges,
            payload,
            defer_interrupt: false,
        };
        match self.send_or_queue(packet) {
            Ok(()) => Ok(tracked.then_some(transaction_id)),
            Err(err) => {
                if tracked {
                    self.abandon(transaction_id);
                }
                Err(err)
            }
        }
    }

    /// Completes a packet received by the receive callback, sending a
    /// completion with `payload` if the host asked for one.
    pub fn complete_packet(&self, context: PacketContext, payload: &[u8]) -> Result<(), SendError> {
        if !context.completion_requested {
            return Ok(());
        }
        let payload = self.inline_payload(payload, vmbus_ring::PIPE_PACKET_TYPE_DATA);
        self.send_or_queue(PendingPacket::new(
            context.transaction_id,
            PacketKind::Completion,
            payload,
        ))
    }

    /// Asks the host to abandon `transaction_id`. The completion routine will
    /// not be called, even if the host completes the transaction anyway.
    pub fn cancel_request(&self, transaction_id: u64) -> Result<(), SendError> {
        {
            let mut completions = self.completions.lock();
            let Some(pending) = completions.pending.get_mut(&transaction_id) else {
                return Ok(());
            };
            pending.cancelled = true;
            pending.routine = None;
        }
        tracing::debug!(channel_id = %self.channel_id(), transaction_id, "cancelling request");
        self.send_or_queue(PendingPacket::new(
            transaction_id,
            PacketKind::CancelRequest,
            Vec::new(),
        ))
    }

    /// Describes `buffers` to the host of a pipe channel as GPA range
    /// `handle`.
    pub fn create_gpa_range(
        &self,
        handle: u32,
        buffers: &[ExternalBuffer],
        writable: bool,
    ) -> Result<(), SendError> {
        if !self.offer.is_pipe() {
            return Err(SendError::NotPipe);
        }
        for buffer in buffers {
            buffer.validate()?;
        }
        let gpns: Vec<GpnList> = buffers.iter().map(ExternalBuffer::gpns).collect();
        let ranges = paged_ranges(buffers, &gpns);
        let mut message = PipeSetupGpaDirect {
            handle,
            is_writable: writable.into(),
            reserved: [0; 3],
            range_count: ranges.range_count() as u32,
            padding: 0,
        }
        .as_bytes()
        .to_vec();
        message.extend_from_slice(ranges.range_buffer().as_bytes());
        let payload = self.inline_payload(&message, vmbus_ring::PIPE_PACKET_TYPE_SETUP_GPA_DIRECT);
        self.send_or_queue(
            PendingPacket::new(
                0,
                PacketKind::InBand {
                    completion_requested: false,
                },
                payload,
            )
            .deferring_interrupt(),
        )
    }

    /// Tears down GPA range `handle` of a pipe channel.
    pub fn destroy_gpa_range(&self, handle: u32) -> Result<(), SendError> {
        if !self.offer.is_pipe() {
            return Err(SendError::NotPipe);
        }
        let payload = self.inline_payload(
            PipeTeardownGpaDirect { handle }.as_bytes(),
            vmbus_ring::PIPE_PACKET_TYPE_TEARDOWN_GPA_DIRECT,
        );
        self.send_or_queue(
            PendingPacket::new(
                0,
                PacketKind::InBand {
                    completion_requested: false,
                },
                payload,
            )
            .deferring_interrupt(),
        )
    }

    /// Counters for diagnostics.
    pub fn stats(&self) -> EndpointStats {
        let (interrupt_mask_skips, outgoing_free_bytes, queued) = match &*self.send.lock() {
            Some(send) => (
                send.ring.interrupt_mask_skips(),
                send.ring
                    .outgoing()
                    .and_then(|mut ptrs| send.ring.free_bytes(&mut ptrs))
                    .ok(),
                send.queue.len(),
            ),
            None => (0, None, 0),
        };
        EndpointStats {
            interrupts: self.accounting.stats(),
            interrupt_mask_skips,
            outgoing_free_bytes,
            queued,
            pending_completions: self.completions.lock().pending.len(),
        }
    }

    fn inline_payload(&self, data: &[u8], pipe_packet_type: u32) -> Vec<u8> {
        if !self.offer.is_pipe() {
            return data.to_vec();
        }
        let header = PipeHeader {
            packet_type: pipe_packet_type,
            len: data.len() as u32,
        };
        let mut payload = header.as_bytes().to_vec();
        payload.extend_from_slice(data);
        payload
    }

    fn track(
        &self,
        completion: PendingCompletion,
    ) -> Result<u64, (SendError, PendingCompletion)> {
        let mut completions = self.completions.lock();
        let Some(transaction_id) = completions.last_transaction_id.checked_add(1) else {
            return Err((SendError::TransactionIdsExhausted, completion));
        };
        completions.last_transaction_id = transaction_id;
        completions.pending.insert(transaction_id, completion);
        Ok(transaction_id)
    }

    fn abandon(&self, transaction_id: u64) {
        let completion = self.completions.lock().pending.remove(&transaction_id);
        if let Some(completion) = completion {
            self.release_bounce(completion.bounce);
        }
    }

    fn release_bounce(&self, buffers: Vec<BounceBuffer>) {
        if buffers.is_empty() {
            return;
        }
        let mut pool = self.bounce.lock();
        for buffer in buffers {
            pool.release(buffer);
        }
    }

    /// Writes `packet` to the ring, or queues it behind earlier packets or
    /// when the ring is full.
    fn send_or_queue(&self, packet: PendingPacket) -> Result<(), SendError> {
        if self.is_failed() {
            return Err(SendError::ChannelFailed);
        }
        let mut send = self.send.lock();
        let send = send.as_mut().ok_or(SendError::NotRunning)?;
        let size = packet.ring_size();
        if size > send.ring.maximum_packet_size() {
            return Err(SendError::TooLarge(size));
        }
        if !send.queue.is_empty() {
            tracing::trace!(
                channel_id = %self.channel_id(),
                queued = send.queue.len(),
                "queuing packet behind others"
            );
            send.queue.push_back(packet);
            return Ok(());
        }
        match write_packet(&send.ring, &packet) {
            Ok(WriteOutcome::Sent { signal }) => {
                self.written(send, signal, packet.defer_interrupt);
                Ok(())
            }
            Ok(WriteOutcome::Full) => {
                tracing::trace!(channel_id = %self.channel_id(), size, "ring full, queuing packet");
                send.queue.push_back(packet);
                self.ring_full(send);
                Ok(())
            }
            Err(err) => {
                if let SendError::Corrupt(ring_err) = &err {
                    self.fail(ring_err);
                }
                Err(err)
            }
        }
    }

    fn flush_queue(&self) {
        let mut send = self.send.lock();
        let Some(send) = send.as_mut() else {
            return;
        };
        while let Some(packet) = send.queue.front() {
            let defer_interrupt = packet.defer_interrupt;
            match write_packet(&send.ring, packet) {
                Ok(WriteOutcome::Sent { signal }) => {
                    send.queue.pop_front();
                    self.written(send, signal, defer_interrupt);
                }
                Ok(WriteOutcome::Full) => {
                    self.ring_full(send);
                    break;
                }
                Err(err) => {
                    tracelimit::error_ratelimited!(
                        channel_id = %self.channel_id(),
                        error = &err as &dyn std::error::Error,
                        "dropping queued packet"
                    );
                    let corrupt = matches!(err, SendError::Corrupt(_));
                    if let Some(packet) = send.queue.pop_front() {
                        self.abandon(packet.transaction_id);
                    }
                    if corrupt {
                        self.failed.store(true, Ordering::Relaxed);
                        break;
                    }
                }
            }
        }
    }

    /// Signals the host after a write if the ring requires it or an earlier
    /// signal was deferred, unless this write defers too.
    fn written(&self, send: &mut SendState, signal: bool, defer_interrupt: bool) {
        if signal || send.interrupt_deferred {
            if !defer_interrupt {
                self.signal_host();
            }
            send.interrupt_deferred = defer_interrupt;
        }
    }

    /// The host must see any deferred packets before it can make room.
    fn ring_full(&self, send: &mut SendState) {
        self.accounting.expect(InterruptReason::RingFull);
        if std::mem::take(&mut send.interrupt_deferred) {
            self.signal_host();
        }
    }

    fn signal_host(&self) {
        if let Err(err) = self.client.signal_channel(self.channel_id()) {
            tracelimit::error_ratelimited!(
                channel_id = %self.channel_id(),
                error = &err as &dyn std::error::Error,
                "failed to signal host"
            );
        }
    }

    fn fail(&self, err: &(dyn std::error::Error + 'static)) {
        tracelimit::error_ratelimited!(
            channel_id = %self.channel_id(),
            error = err,
            "channel failed"
        );
        self.failed.store(true, Ordering::Relaxed);
    }

    fn handle_interrupt(&self) {
        self.accounting.interrupt_received();
        self.process_queue();
    }

    /// Drains the incoming ring, dispatching every packet, then retries
    /// queued sends. Called for each channel interrupt; drivers may also
    /// call it to poll.
    pub fn process_queue(&self) {
        {
            let receive = self.receive.lock();
            if let Some(state) = &*receive {
                if !self.is_failed() {
                    match self.drain(state) {
                        Ok(true) => self.accounting.expect(InterruptReason::RingEmpty),
                        Ok(false) => {}
                        Err(err) => self.fail(&err),
                    }
                }
            }
        }
        if !self.is_failed() {
            self.flush_queue();
        }
    }

    /// Returns true if any packets were read.
    fn drain(&self, state: &ReceiveState) -> Result<bool, DispatchError> {
        let ring = &state.ring;
        let mut any = false;
        loop {
            let mut ptrs = ring.incoming()?;
            let mut received = 0;
            loop {
                let packet = match ring.read(&mut ptrs) {
                    Ok(packet) => packet,
                    Err(ReadError::Empty) => break,
                    Err(ReadError::Corrupt(err)) => return Err(err.into()),
                };
                received += 1;
                self.dispatch(state, packet)?;
            }
            if received == 0 {
                break;
            }
            any = true;
            if ring.commit_read(&mut ptrs)?.signal {
                self.signal_host();
            }
        }
        Ok(any)
    }

    fn dispatch(
        &self,
        state: &ReceiveState,
        packet: vmbus_ring::IncomingPacket,
    ) -> Result<(), DispatchError> {
        let ring = &state.ring;
        match packet.typ {
            IncomingPacketType::Completion => {
                let payload = packet.payload.read_all(ring);
                let transaction_id = packet.transaction_id.unwrap_or_default();
                let completion = self.completions.lock().pending.remove(&transaction_id);
                let Some(completion) = completion else {
                    tracelimit::warn_ratelimited!(
                        channel_id = %self.channel_id(),
                        transaction_id,
                        "completion for unknown transaction"
                    );
                    return Ok(());
                };
                self.complete(completion, &payload);
            }
            IncomingPacketType::InBand => {
                let Some(callback) = &state.callback else {
                    return Ok(());
                };
                let Some(data) = self.in_band_data(ring, packet.payload)? else {
                    return Ok(());
                };
                callback(
                    self,
                    ReceivedPacket {
                        context: packet_context(&packet),
                        data,
                        transfer_pages: None,
                    },
                );
            }
            IncomingPacketType::TransferPages(set_id, count, ranges) => {
                let Some(callback) = &state.callback else {
                    return Ok(());
                };
                let bytes = ranges.read_all(ring);
                let ranges = bytes
                    .chunks_exact(size_of::<TransferPageRange>())
                    .take(count as usize)
                    .filter_map(|b| TransferPageRange::read_from_bytes(b).ok())
                    .collect();
                callback(
                    self,
                    ReceivedPacket {
                        context: packet_context(&packet),
                        data: packet.payload.read_all(ring),
                        transfer_pages: Some(TransferPages { set_id, ranges }),
                    },
                );
            }
            IncomingPacketType::CancelRequest | IncomingPacketType::GpaDirect(..) => {
                tracelimit::warn_ratelimited!(
                    channel_id = %self.channel_id(),
                    typ = ?packet.typ,
                    "unsupported packet from host"
                );
            }
        }
        Ok(())
    }

    /// Returns the data of an in-band packet, or `None` for pipe control
    /// messages.
    fn in_band_data(
        &self,
        ring: &IncomingRing<PagedRingMem>,
        payload: RingRange,
    ) -> Result<Option<Vec<u8>>, DispatchError> {
        if !self.offer.is_pipe() {
            return Ok(Some(payload.read_all(ring)));
        }
        let mut header = PipeHeader::new_zeroed();
        payload
            .read_at(ring, 0, header.as_mut_bytes())
            .map_err(|_| DispatchError::PipeHeader)?;
        if header.packet_type != vmbus_ring::PIPE_PACKET_TYPE_DATA {
            tracelimit::warn_ratelimited!(
                channel_id = %self.channel_id(),
                packet_type = header.packet_type,
                "dropping pipe control message"
            );
            return Ok(None);
        }
        let available = payload.len() - size_of::<PipeHeader>();
        if header.len as usize > available {
            return Err(DispatchError::PipeLength {
                len: header.len,
                available,
            });
        }
        let mut data = vec![0; header.len as usize];
        payload
            .read_at(ring, size_of::<PipeHeader>(), &mut data)
            .map_err(|_| DispatchError::PipeHeader)?;
        Ok(Some(data))
    }

    fn complete(&self, completion: PendingCompletion, payload: &[u8]) {
        if !completion.cancelled && !completion.flags.data_out_only() {
            for buffer in &completion.bounce {
                buffer.copy(false);
            }
        }
        self.release_bounce(completion.bounce);
        if let Some(routine) = completion.routine {
            routine(payload);
        }
    }
}

/// Describes `buffers` with the page numbers the host should see.
fn paged_ranges(buffers: &[ExternalBuffer], gpns: &[GpnList]) -> MultiPagedRangeBuf<GpnList> {
    buffers
        .iter()
        .zip(gpns)
        .filter_map(|(buffer, gpns)| PagedRange::new(buffer.offset % PAGE_SIZE, buffer.len, gpns))
        .collect()
}

fn packet_context(packet: &vmbus_ring::IncomingPacket) -> PacketContext {
    PacketContext {
        transaction_id: packet.transaction_id.unwrap_or_default(),
        completion_requested: packet.transaction_id.is_some(),
    }
}
