// Copyright (c) Microsoft Corporation.
// Licensed under the MIT License.

//! A simulated VMBus host, for testing the client and drivers built on it
//! without a hypervisor.
//!
//! [`SimulatedHost`] implements both [`SynicClient`] and [`MemoryAllocator`].
//! Control messages posted by the guest are handled synchronously and their
//! responses queued for [`SynicClient::poll_message`]. Once a channel is
//! open, [`SimulatedHost::channel`] gives access to the host's end of its
//! rings.

use crate::HypercallError;
use crate::MemoryAllocator;
use crate::MemoryError;
use crate::SynicClient;
use crate::SynicMessage;
use anyhow::Context as _;
use guid::Guid;
use parking_lot::Mutex;
use std::collections::BTreeMap;
use std::collections::BTreeSet;
use std::collections::VecDeque;
use std::sync::Arc;
use std::sync::atomic::AtomicU64;
use std::sync::atomic::Ordering;
use vmbus_core::OutgoingMessage;
use vmbus_core::protocol;
use vmbus_core::protocol::ChannelId;
use vmbus_core::protocol::ConnectionState;
use vmbus_core::protocol::FeatureFlags;
use vmbus_core::protocol::GpadlId;
use vmbus_core::protocol::Message;
use vmbus_core::protocol::MessageType;
use vmbus_core::protocol::OfferChannel;
use vmbus_core::protocol::OfferFlags;
use vmbus_core::protocol::OpenChannel;
use vmbus_core::protocol::UserDefinedData;
use vmbus_core::protocol::Version;
use vmbus_ring::IncomingPacketType;
use vmbus_ring::IncomingRing;
use vmbus_ring::OutgoingPacket;
use vmbus_ring::OutgoingPacketType;
use vmbus_ring::OutgoingRing;
use vmbus_ring::PAGE_SIZE;
use vmbus_ring::PagedRingMem;
use vmbus_ring::ReadError;
use vmbus_ring::SharedPages;
use vmbus_ring::TransferPageRange;
use vmbus_ring::gparange::MultiPagedRangeBuf;
use zerocopy::FromBytes;
use zerocopy::IntoBytes;

/// Where shared pages appear to the host on an isolated simulated VM.
pub const SHARED_GPA_BOUNDARY: u64 = 1 << 36;

const SHARED_GPN_BOUNDARY: u64 = SHARED_GPA_BOUNDARY / PAGE_SIZE as u64;
const FIRST_GPN: u64 = 0x100;
const HV_STATUS_INVALID_PARAMETER: u16 = 5;

/// Host behavior.
#[derive(Debug, Clone)]
pub struct HostConfig {
    /// The versions the host accepts.
    pub versions: Vec<Version>,
    /// The features the host supports.
    pub supported_features: FeatureFlags,
    /// The connection state reported for an accepted version.
    pub connection_state: ConnectionState,
    /// Simulate a hardware-isolated VM.
    pub isolated: bool,
}

impl Default for HostConfig {
    fn default() -> Self {
        Self {
            versions: Version::ALL.to_vec(),
            supported_features: FeatureFlags::all(),
            connection_state: ConnectionState::SUCCESSFUL,
            isolated: false,
        }
    }
}

struct HostOffer {
    offer: OfferChannel,
    sent: bool,
    open: Option<OpenChannel>,
}

struct PendingGpadl {
    channel_id: ChannelId,
    count: usize,
    needed: usize,
    values: Vec<u64>,
}

struct HostGpadl {
    channel_id: ChannelId,
    // Guest page numbers, after removing the shared GPA boundary.
    gpns: Vec<u64>,
}

struct HostState {
    config: HostConfig,
    to_guest: VecDeque<Vec<u8>>,
    received: Vec<MessageType>,
    proposed: Vec<Version>,
    version: Option<Version>,
    offers_delivered: bool,
    offers: BTreeMap<ChannelId, HostOffer>,
    next_channel_id: u32,
    pending_gpadls: BTreeMap<GpadlId, PendingGpadl>,
    gpadls: BTreeMap<GpadlId, HostGpadl>,
    gpadl_status: i32,
    open_status: u32,
    released: Vec<ChannelId>,
    signals: BTreeMap<u32, usize>,
    allocations: Vec<SharedPages>,
    next_gpn: u64,
    visible: BTreeSet<u64>,
    fail_next_allocation: bool,
}

impl HostState {
    fn send<T: IntoBytes + zerocopy::Immutable + zerocopy::KnownLayout + protocol::VmbusMessage>(
        &mut self,
        message: &T,
    ) {
        self.to_guest
            .push_back(OutgoingMessage::new(message).data().to_vec());
    }

    fn send_offer(&mut self, channel_id: ChannelId) {
        if let Some(offer) = self.offers.get_mut(&channel_id) {
            offer.sent = true;
            let message = offer.offer;
            self.send(&message);
        }
    }

    /// Translates a page number as seen by the host back to the guest's
    /// page number. `private_ok` allows unshared pages on an isolated VM.
    fn guest_gpn(&self, gpn: u64, private_ok: bool) -> anyhow::Result<u64> {
        if !self.config.isolated {
            return Ok(gpn);
        }
        if gpn >= SHARED_GPN_BOUNDARY {
            let gpn = gpn - SHARED_GPN_BOUNDARY;
            anyhow::ensure!(self.visible.contains(&gpn), "page {gpn:#x} not shared");
            Ok(gpn)
        } else {
            anyhow::ensure!(private_ok, "page {gpn:#x} is private");
            Ok(gpn)
        }
    }

    fn pages(&self, gpns: &[u64]) -> anyhow::Result<SharedPages> {
        let first = *gpns.first().context("no pages")?;
        anyhow::ensure!(
            gpns.iter().zip(first..).all(|(&a, b)| a == b),
            "pages not contiguous"
        );
        let allocation = self
            .allocations
            .iter()
            .find(|a| (a.gpn()..a.gpn() + a.page_count() as u64).contains(&first))
            .with_context(|| format!("page {first:#x} not allocated"))?;
        allocation
            .subrange((first - allocation.gpn()) as usize, gpns.len())
            .context("pages span allocations")
    }

    fn is_confidential(&self, channel_id: ChannelId) -> bool {
        self.offers
            .get(&channel_id)
            .is_some_and(|o| o.offer.flags.confidential_ring_buffer())
    }

    fn handle_message(&mut self, data: &[u8]) -> Result<(), HypercallError> {
        let message = match Message::parse(data, self.version) {
            Ok(message) => message,
            Err(err) => {
                tracing::warn!(
                    error = &err as &dyn std::error::Error,
                    "host received invalid message"
                );
                return Err(HypercallError::Status(HV_STATUS_INVALID_PARAMETER));
            }
        };
        self.received.push(message.message_type());
        match message {
            Message::InitiateContact2(request, _) => {
                self.initiate_contact(&request.initiate_contact)
            }
            Message::InitiateContact(request, _) => self.initiate_contact(&request),
            Message::RequestOffers(..) => {
                let ids: Vec<_> = self.offers.keys().copied().collect();
                for id in ids {
                    self.send_offer(id);
                }
                self.send(&protocol::AllOffersDelivered {});
                self.offers_delivered = true;
            }
            Message::GpadlHeader(header, rest) => {
                let mut pending = PendingGpadl {
                    channel_id: header.channel_id,
                    count: header.count.into(),
                    needed: header.len as usize / 8,
                    values: Vec::new(),
                };
                append_values(&mut pending, rest);
                self.gpadl_progress(header.gpadl_id, pending);
            }
            Message::GpadlBody(body, rest) => {
                match self.pending_gpadls.remove(&body.gpadl_id) {
                    Some(mut pending) => {
                        append_values(&mut pending, rest);
                        self.gpadl_progress(body.gpadl_id, pending);
                    }
                    None => tracing::warn!(gpadl_id = %body.gpadl_id, "body for unknown gpadl"),
                }
            }
            Message::GpadlTeardown(teardown, _) => {
                if self.gpadls.remove(&teardown.gpadl_id).is_some() {
                    self.send(&protocol::GpadlTorndown {
                        gpadl_id: teardown.gpadl_id,
                    });
                } else {
                    tracing::warn!(gpadl_id = %teardown.gpadl_id, "teardown of unknown gpadl");
                }
            }
            Message::OpenChannel(open, _) => {
                let valid = self.offers.contains_key(&open.channel_id)
                    && self
                        .gpadls
                        .get(&open.ring_buffer_gpadl_id)
                        .is_some_and(|g| g.channel_id == open.channel_id);
                let status = if valid {
                    self.open_status
                } else {
                    protocol::STATUS_UNSUCCESSFUL as u32
                };
                if status == 0 {
                    if let Some(offer) = self.offers.get_mut(&open.channel_id) {
                        offer.open = Some(open);
                    }
                }
                self.send(&protocol::OpenResult {
                    channel_id: open.channel_id,
                    open_id: open.open_id,
                    status,
                });
            }
            Message::CloseChannel(close, _) => {
                if let Some(offer) = self.offers.get_mut(&close.channel_id) {
                    offer.open = None;
                }
            }
            Message::RelIdReleased(released, _) => {
                self.offers.remove(&released.channel_id);
                self.released.push(released.channel_id);
            }
            Message::Unload(..) => {
                self.version = None;
                self.offers_delivered = false;
                self.pending_gpadls.clear();
                self.gpadls.clear();
                for offer in self.offers.values_mut() {
                    offer.sent = false;
                    offer.open = None;
                }
                self.send(&protocol::UnloadComplete {});
            }
            message => {
                tracing::warn!(message_type = ?message.message_type(), "unexpected message from guest");
            }
        }
        Ok(())
    }

    fn initiate_contact(&mut self, request: &protocol::InitiateContact) {
        let version = Version::try_from(request.version_requested).ok();
        if let Some(version) = version {
            self.proposed.push(version);
        }
        let Some(version) = version.filter(|v| self.config.versions.contains(v)) else {
            self.send(&protocol::VersionResponse {
                version_supported: 0,
                connection_state: ConnectionState::SUCCESSFUL,
                padding: 0,
                selected_version_or_connection_id: 0,
            });
            return;
        };
        let response = protocol::VersionResponse {
            version_supported: 1,
            connection_state: self.config.connection_state,
            padding: 0,
            selected_version_or_connection_id: protocol::MESSAGE_CONNECTION_ID,
        };
        if self.config.connection_state == ConnectionState::SUCCESSFUL {
            self.version = Some(version);
        }
        if version.has_feature_flags() {
            self.send(&protocol::VersionResponse2 {
                version_response: response,
                supported_features: self.config.supported_features.into(),
            });
        } else {
            self.send(&response);
        }
    }

    fn gpadl_progress(&mut self, gpadl_id: GpadlId, pending: PendingGpadl) {
        if pending.values.len() < pending.needed {
            self.pending_gpadls.insert(gpadl_id, pending);
            return;
        }
        let channel_id = pending.channel_id;
        let status = match self.resolve_gpadl(gpadl_id, &pending) {
            Ok(gpns) => {
                if self.gpadl_status == protocol::STATUS_SUCCESS {
                    self.gpadls.insert(gpadl_id, HostGpadl { channel_id, gpns });
                }
                self.gpadl_status
            }
            Err(err) => {
                tracing::warn!(%gpadl_id, error = %err, "bad gpadl");
                protocol::STATUS_UNSUCCESSFUL
            }
        };
        self.send(&protocol::GpadlCreated {
            channel_id,
            gpadl_id,
            status,
        });
    }

    fn resolve_gpadl(&self, gpadl_id: GpadlId, pending: &PendingGpadl) -> anyhow::Result<Vec<u64>> {
        anyhow::ensure!(gpadl_id.0 != 0, "zero gpadl id");
        anyhow::ensure!(!self.gpadls.contains_key(&gpadl_id), "duplicate gpadl id");
        anyhow::ensure!(self.offers.contains_key(&pending.channel_id), "unknown channel");
        let ranges = MultiPagedRangeBuf::new(pending.count, &pending.values[..pending.needed])?;
        let private_ok = self.is_confidential(pending.channel_id);
        let mut gpns = Vec::new();
        for range in ranges.iter() {
            for &gpn in range.gpns() {
                gpns.push(self.guest_gpn(gpn, private_ok)?);
            }
        }
        Ok(gpns)
    }
}

fn append_values(pending: &mut PendingGpadl, data: &[u8]) {
    let remaining = pending.needed.saturating_sub(pending.values.len());
    pending.values.extend(
        data.chunks_exact(8)
            .take(remaining)
            .filter_map(|c| u64::read_from_bytes(c).ok()),
    );
}

struct HostInner {
    state: Mutex<HostState>,
    event_flags: Box<[AtomicU64]>,
}

impl HostInner {
    fn signal_guest(&self, channel_id: ChannelId) {
        let id = channel_id.0 as usize;
        self.event_flags[id / 64].fetch_or(1 << (id % 64), Ordering::Release);
    }
}

/// A simulated host. See the module documentation.
pub struct SimulatedHost {
    inner: Arc<HostInner>,
}

impl SimulatedHost {
    /// Creates a host with no offers.
    pub fn new(config: HostConfig) -> Self {
        let gpadl_status = protocol::STATUS_SUCCESS;
        Self {
            inner: Arc::new(HostInner {
                state: Mutex::new(HostState {
                    config,
                    to_guest: VecDeque::new(),
                    received: Vec::new(),
                    proposed: Vec::new(),
                    version: None,
                    offers_delivered: false,
                    offers: BTreeMap::new(),
                    next_channel_id: 1,
                    pending_gpadls: BTreeMap::new(),
                    gpadls: BTreeMap::new(),
                    gpadl_status,
                    open_status: 0,
                    released: Vec::new(),
                    signals: BTreeMap::new(),
                    allocations: Vec::new(),
                    next_gpn: FIRST_GPN,
                    visible: BTreeSet::new(),
                    fail_next_allocation: false,
                }),
                event_flags: (0..protocol::MAX_CHANNELS / 64)
                    .map(|_| AtomicU64::new(0))
                    .collect(),
            }),
        }
    }

    /// Offers a channel, immediately if the guest has already received the
    /// initial offers. Returns the new channel's ID.
    pub fn offer(&self, interface_id: Guid, flags: OfferFlags) -> ChannelId {
        let mut state = self.inner.state.lock();
        let channel_id = ChannelId(state.next_channel_id);
        state.next_channel_id += 1;
        let offer = OfferChannel {
            interface_id,
            instance_id: Guid {
                data1: channel_id.0,
                ..Guid::ZERO
            },
            rsvd: [0; 4],
            flags,
            mmio_megabytes: 0,
            user_defined: UserDefinedData::default(),
            subchannel_index: 0,
            mmio_megabytes_optional: 0,
            channel_id,
            monitor_id: 0xff,
            monitor_allocated: 0,
            is_dedicated: 1,
            connection_id: 0x10000 + channel_id.0,
        };
        state.offers.insert(
            channel_id,
            HostOffer {
                offer,
                sent: false,
                open: None,
            },
        );
        if state.offers_delivered {
            state.send_offer(channel_id);
        }
        channel_id
    }

    /// Rescinds an offer.
    pub fn rescind(&self, channel_id: ChannelId) {
        let mut state = self.inner.state.lock();
        let Some(offer) = state.offers.get_mut(&channel_id) else {
            return;
        };
        offer.open = None;
        if offer.sent {
            state.send(&protocol::RescindChannelOffer { channel_id });
        } else {
            state.offers.remove(&channel_id);
        }
    }

    /// Queues a raw message for the guest.
    pub fn inject(&self, data: &[u8]) {
        self.inner.state.lock().to_guest.push_back(data.to_vec());
    }

    /// The types of every message received from the guest, in order.
    pub fn received(&self) -> Vec<MessageType> {
        self.inner.state.lock().received.clone()
    }

    /// Every version the guest proposed, in order.
    pub fn proposed_versions(&self) -> Vec<Version> {
        self.inner.state.lock().proposed.clone()
    }

    /// The channel IDs the guest has released.
    pub fn released(&self) -> Vec<ChannelId> {
        self.inner.state.lock().released.clone()
    }

    /// The guest page numbers of a created GPADL.
    pub fn gpadl_gpns(&self, gpadl_id: GpadlId) -> Option<Vec<u64>> {
        self.inner
            .state
            .lock()
            .gpadls
            .get(&gpadl_id)
            .map(|g| g.gpns.clone())
    }

    /// The number of GPADLs the host knows about.
    pub fn gpadl_count(&self) -> usize {
        self.inner.state.lock().gpadls.len()
    }

    /// The status to report for subsequent GPADLs.
    pub fn set_gpadl_status(&self, status: i32) {
        self.inner.state.lock().gpadl_status = status;
    }

    /// The status to report for subsequent open requests.
    pub fn set_open_status(&self, status: u32) {
        self.inner.state.lock().open_status = status;
    }

    /// How many times the guest signaled `connection_id`.
    pub fn signal_count(&self, connection_id: u32) -> usize {
        self.inner
            .state
            .lock()
            .signals
            .get(&connection_id)
            .copied()
            .unwrap_or(0)
    }

    /// Sets the event flag for `channel_id`.
    pub fn signal_guest(&self, channel_id: ChannelId) {
        self.inner.signal_guest(channel_id);
    }

    /// Returns true if the guest page `gpn` is shared with the host.
    pub fn is_visible(&self, gpn: u64) -> bool {
        self.inner.state.lock().visible.contains(&gpn)
    }

    /// Makes the next page allocation fail.
    pub fn fail_next_allocation(&self) {
        self.inner.state.lock().fail_next_allocation = true;
    }

    /// The host's end of an open channel.
    pub fn channel(&self, channel_id: ChannelId) -> anyhow::Result<HostChannel> {
        let state = self.inner.state.lock();
        let offer = state
            .offers
            .get(&channel_id)
            .with_context(|| format!("unknown channel {channel_id}"))?;
        let open = offer
            .open
            .as_ref()
            .with_context(|| format!("channel {channel_id} not open"))?;
        let gpadl = state
            .gpadls
            .get(&open.ring_buffer_gpadl_id)
            .context("ring gpadl not found")?;
        let pages = state.pages(&gpadl.gpns)?;
        let downstream = open.downstream_ring_buffer_page_offset as usize;
        let upstream = pages
            .subrange(0, downstream)
            .and_then(PagedRingMem::new)
            .context("invalid upstream ring")?;
        let downstream = pages
            .subrange(downstream, pages.page_count().saturating_sub(downstream))
            .and_then(PagedRingMem::new)
            .context("invalid downstream ring")?;
        Ok(HostChannel {
            channel_id,
            connection_id: offer.offer.connection_id,
            confidential: state.is_confidential(channel_id),
            incoming: IncomingRing::new(upstream)?,
            outgoing: OutgoingRing::new(downstream)?,
            host: self.inner.clone(),
        })
    }
}

impl SynicClient for SimulatedHost {
    fn post_message(
        &self,
        connection_id: u32,
        message_type: u32,
        data: &[u8],
    ) -> Result<(), HypercallError> {
        if connection_id != protocol::MESSAGE_CONNECTION_ID
            || message_type != protocol::SYNIC_MESSAGE_TYPE
            || data.len() > protocol::MAX_MESSAGE_SIZE
        {
            return Err(HypercallError::Status(HV_STATUS_INVALID_PARAMETER));
        }
        self.inner.state.lock().handle_message(data)
    }

    fn signal_event(&self, connection_id: u32, _flag: u16) -> Result<(), HypercallError> {
        *self
            .inner
            .state
            .lock()
            .signals
            .entry(connection_id)
            .or_default() += 1;
        Ok(())
    }

    fn poll_message(&self) -> Option<SynicMessage> {
        let data = self.inner.state.lock().to_guest.pop_front()?;
        Some(SynicMessage {
            message_type: protocol::SYNIC_MESSAGE_TYPE,
            data,
        })
    }

    fn event_flags(&self) -> &[AtomicU64] {
        &self.inner.event_flags
    }

    fn current_vp(&self) -> u32 {
        0
    }
}

impl MemoryAllocator for SimulatedHost {
    fn allocate_pages(&self, count: usize) -> Result<SharedPages, MemoryError> {
        let mut state = self.inner.state.lock();
        if std::mem::take(&mut state.fail_next_allocation) || count == 0 {
            return Err(MemoryError::OutOfMemory);
        }
        let pages = SharedPages::new(state.next_gpn, count);
        // Leave a hole so that separate allocations are never contiguous.
        state.next_gpn += count as u64 + 1;
        state.allocations.push(pages.clone());
        Ok(pages)
    }

    fn is_isolated(&self) -> bool {
        self.inner.state.lock().config.isolated
    }

    fn shared_gpa_boundary(&self) -> u64 {
        if self.is_isolated() {
            SHARED_GPA_BOUNDARY
        } else {
            0
        }
    }

    fn set_host_visibility(&self, pages: &SharedPages, visible: bool) -> Result<(), MemoryError> {
        let mut state = self.inner.state.lock();
        if !state.config.isolated {
            return Err(MemoryError::Visibility);
        }
        for gpn in pages.gpns() {
            if visible {
                state.visible.insert(gpn);
            } else {
                state.visible.remove(&gpn);
            }
        }
        Ok(())
    }
}

/// A byte range of external memory referenced by a packet, with page numbers
/// as sent by the guest.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct HostRange {
    /// The offset into the first page.
    pub offset: usize,
    /// The length in bytes.
    pub len: usize,
    /// The page numbers.
    pub gpns: Vec<u64>,
}

/// The kind of a packet received by the host.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum HostPacketKind {
    /// Inline data.
    InBand,
    /// A completion.
    Completion,
    /// A cancellation request.
    CancelRequest,
    /// Data in guest memory.
    GpaDirect(Vec<HostRange>),
    /// Data in a transfer page set.
    TransferPages(u16, Vec<TransferPageRange>),
}

/// A packet received by the host.
#[derive(Debug, Clone)]
pub struct HostPacket {
    /// The transaction ID, if the packet has one.
    pub transaction_id: Option<u64>,
    /// The packet kind.
    pub kind: HostPacketKind,
    /// The inline payload.
    pub payload: Vec<u8>,
}

/// The host's end of an open channel.
pub struct HostChannel {
    channel_id: ChannelId,
    connection_id: u32,
    confidential: bool,
    incoming: IncomingRing<PagedRingMem>,
    outgoing: OutgoingRing<PagedRingMem>,
    host: Arc<HostInner>,
}

impl HostChannel {
    /// The channel ID.
    pub fn channel_id(&self) -> ChannelId {
        self.channel_id
    }

    /// How many times the guest has signaled this channel.
    pub fn signal_count(&self) -> usize {
        self.host
            .state
            .lock()
            .signals
            .get(&self.connection_id)
            .copied()
            .unwrap_or(0)
    }

    /// Reads the next packet from the guest, signaling the guest if it was
    /// waiting for ring space.
    pub fn read(&self) -> anyhow::Result<Option<HostPacket>> {
        let mut ptrs = self.incoming.incoming()?;
        let packet = match self.incoming.read(&mut ptrs) {
            Ok(packet) => packet,
            Err(ReadError::Empty) => return Ok(None),
            Err(ReadError::Corrupt(err)) => return Err(err.into()),
        };
        let kind = match packet.typ {
            IncomingPacketType::InBand => HostPacketKind::InBand,
            IncomingPacketType::Completion => HostPacketKind::Completion,
            IncomingPacketType::CancelRequest => HostPacketKind::CancelRequest,
            IncomingPacketType::GpaDirect(count, ranges) => {
                let bytes = ranges.read_all(&self.incoming);
                let mut values = vec![0u64; bytes.len() / 8];
                let values_len = values.len();
                values
                    .as_mut_bytes()
                    .copy_from_slice(&bytes[..values_len * 8]);
                let buf = MultiPagedRangeBuf::new(count as usize, values)?;
                HostPacketKind::GpaDirect(
                    buf.iter()
                        .map(|r| HostRange {
                            offset: r.offset(),
                            len: r.len(),
                            gpns: r.gpns().to_vec(),
                        })
                        .collect(),
                )
            }
            IncomingPacketType::TransferPages(id, count, ranges) => {
                let bytes = ranges.read_all(&self.incoming);
                let ranges = bytes
                    .chunks_exact(size_of::<TransferPageRange>())
                    .take(count as usize)
                    .map(TransferPageRange::read_from_bytes)
                    .collect::<Result<Vec<_>, _>>()
                    .map_err(|_| anyhow::anyhow!("invalid transfer page ranges"))?;
                HostPacketKind::TransferPages(id, ranges)
            }
        };
        let payload = packet.payload.read_all(&self.incoming);
        let commit = self.incoming.commit_read(&mut ptrs)?;
        if commit.signal {
            self.host.signal_guest(self.channel_id);
        }
        Ok(Some(HostPacket {
            transaction_id: packet.transaction_id,
            kind,
            payload,
        }))
    }

    /// Writes a packet to the guest, signaling it if required.
    pub fn write(
        &self,
        typ: OutgoingPacketType<'_>,
        transaction_id: u64,
        payload: &[u8],
    ) -> anyhow::Result<()> {
        let mut ptrs = self.outgoing.outgoing()?;
        let range = self.outgoing.write(
            &mut ptrs,
            &OutgoingPacket {
                transaction_id,
                size: payload.len(),
                typ,
            },
        )?;
        range.write_at(&self.outgoing, 0, payload)?;
        if self.outgoing.commit_write(&mut ptrs)? {
            self.host.signal_guest(self.channel_id);
        }
        Ok(())
    }

    /// Sends a completion for `transaction_id`.
    pub fn complete(&self, transaction_id: u64, payload: &[u8]) -> anyhow::Result<()> {
        self.write(OutgoingPacketType::Completion, transaction_id, payload)
    }

    /// Masks or unmasks the guest's signal for new packets.
    pub fn set_interrupt_mask(&self, masked: bool) {
        self.incoming.set_interrupt_mask(masked);
    }

    fn for_each_page(
        &self,
        range: &HostRange,
        mut f: impl FnMut(&SharedPages, usize, std::ops::Range<usize>),
    ) -> anyhow::Result<()> {
        let state = self.host.state.lock();
        let mut offset = range.offset;
        let mut done = 0;
        for &gpn in &range.gpns {
            if done == range.len {
                break;
            }
            let gpn = state.guest_gpn(gpn, self.confidential)?;
            let page = state.pages(&[gpn])?;
            let n = (PAGE_SIZE - offset).min(range.len - done);
            f(&page, offset, done..done + n);
            done += n;
            offset = 0;
        }
        anyhow::ensure!(done == range.len, "range not covered by its pages");
        Ok(())
    }

    /// Reads external memory referenced by a GPA direct packet.
    pub fn read_external(&self, range: &HostRange) -> anyhow::Result<Vec<u8>> {
        let mut data = vec![0; range.len];
        self.for_each_page(range, |page, offset, part| {
            page.read_at(offset, &mut data[part]);
        })?;
        Ok(data)
    }

    /// Writes external memory referenced by a GPA direct packet.
    pub fn write_external(&self, range: &HostRange, data: &[u8]) -> anyhow::Result<()> {
        anyhow::ensure!(data.len() <= range.len, "data larger than range");
        let range = HostRange {
            len: data.len(),
            ..range.clone()
        };
        self.for_each_page(&range, |page, offset, part| {
            page.write_at(offset, &data[part]);
        })
    }
}
