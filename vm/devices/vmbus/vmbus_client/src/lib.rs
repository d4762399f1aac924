// Copyright (c) Microsoft Corporation.
// Licensed under the MIT License.

//! The guest side of the VMBus control protocol.
//!
//! [`VmbusClient`] negotiates a protocol version with the host, collects
//! channel offers, and performs the per-channel requests (GPADL creation and
//! teardown, open and close) that device drivers need before they can
//! exchange packets over a channel's ring buffers.
//!
//! The client is synchronous. Requests post a control message and then poll
//! the SynIC message queue until the matching response arrives, handling
//! unrelated messages (hot-add offers, rescinds) along the way. Interrupts
//! are delivered by calling [`VmbusClient::handle_sint`] whenever the VMBus
//! SINT fires.

#![forbid(unsafe_code)]

mod filter;
#[cfg(any(test, feature = "testing"))]
pub mod testing;

pub use filter::AllowedInterface;
pub use filter::ChannelFilter;
pub use filter::KEYBOARD_INTERFACE;
pub use filter::NETWORK_INTERFACE;
pub use filter::STORAGE_INTERFACE;
pub use filter::VIDEO_INTERFACE;
pub use filter::VMBFS_INTERFACE;
pub use filter::VPCI_INTERFACE;

use bitfield_struct::bitfield;
use guid::Guid;
use parking_lot::Mutex;
use slab::Slab;
use std::collections::BTreeMap;
use std::sync::Arc;
use std::sync::atomic::AtomicU64;
use std::sync::atomic::Ordering;
use thiserror::Error;
use vmbus_core::OutgoingMessage;
use vmbus_core::VersionInfo;
use vmbus_core::protocol;
use vmbus_core::protocol::ChannelId;
use vmbus_core::protocol::ConnectionState;
use vmbus_core::protocol::FeatureFlags;
use vmbus_core::protocol::GpadlId;
use vmbus_core::protocol::Message;
use vmbus_core::protocol::OfferChannel;
use vmbus_core::protocol::UserDefinedData;
use vmbus_core::protocol::Version;
use vmbus_ring::PAGE_SIZE;
use vmbus_ring::SharedPages;
use vmbus_ring::gparange::GpnList;
use vmbus_ring::gparange::MultiPagedRangeBuf;
use vmbus_ring::gparange::PagedRange;
use zerocopy::IntoBytes;

/// The size of the GPADL handle table. Handle zero is never allocated.
pub const MAX_GPADLS: usize = 256;

/// A message received on the VMBus SINT.
#[derive(Debug, Clone)]
pub struct SynicMessage {
    /// The SynIC message type.
    pub message_type: u32,
    /// The payload, starting with a control message header.
    pub data: Vec<u8>,
}

/// A failed SynIC hypercall.
#[derive(Debug, Error, Copy, Clone, PartialEq, Eq)]
pub enum HypercallError {
    /// The host's message queue is full. Retry.
    #[error("message queue full")]
    Busy,
    /// Any other failure.
    #[error("hypercall failed with status {0:#x}")]
    Status(u16),
}

/// The SynIC operations the client needs.
pub trait SynicClient: Send + Sync {
    /// Posts a message to the host's message port on `connection_id`.
    fn post_message(
        &self,
        connection_id: u32,
        message_type: u32,
        data: &[u8],
    ) -> Result<(), HypercallError>;

    /// Signals event flag `flag` of `connection_id`.
    fn signal_event(&self, connection_id: u32, flag: u16) -> Result<(), HypercallError>;

    /// Removes the next message from the VMBus SINT's message slot.
    fn poll_message(&self) -> Option<SynicMessage>;

    /// The VMBus SINT's event flags, one bit per channel ID.
    fn event_flags(&self) -> &[AtomicU64];

    /// The index of the calling VP.
    fn current_vp(&self) -> u32;
}

/// A memory allocation failure.
#[derive(Debug, Error, Copy, Clone, PartialEq, Eq)]
pub enum MemoryError {
    /// No pages available.
    #[error("out of memory")]
    OutOfMemory,
    /// The host visibility of the pages could not be changed.
    #[error("failed to change host visibility")]
    Visibility,
}

/// Allocates guest pages and, on isolated VMs, shares them with the host.
pub trait MemoryAllocator: Send + Sync {
    /// Allocates `count` zeroed, physically contiguous pages.
    fn allocate_pages(&self, count: usize) -> Result<SharedPages, MemoryError>;

    /// Returns true if the VM is hardware isolated, so guest memory is
    /// private unless explicitly shared.
    fn is_isolated(&self) -> bool;

    /// The address at which shared pages are visible to the host, added to
    /// their guest physical address. Zero when not isolated.
    fn shared_gpa_boundary(&self) -> u64;

    /// Shares `pages` with the host or makes them private again.
    fn set_host_visibility(&self, pages: &SharedPages, visible: bool) -> Result<(), MemoryError>;
}

/// Connection parameters.
#[derive(Debug, Clone)]
pub struct VmbusConfig {
    /// Versions to propose, in order of preference.
    pub versions: Vec<Version>,
    /// Features requested at [`Version::Copper`] and above.
    pub feature_flags: FeatureFlags,
    /// Identifies the guest software to the host.
    pub client_id: Guid,
    /// The connection ID control messages are posted to.
    pub message_connection_id: u32,
    /// The SINT the host should target.
    pub sint: u8,
    /// The VTL the host should target.
    pub vtl: u8,
    /// How many times to poll for a response before giving up.
    pub response_poll_limit: u32,
    /// Which offers to accept.
    pub filter: ChannelFilter,
}

impl Default for VmbusConfig {
    fn default() -> Self {
        Self {
            versions: vec![
                Version::Copper,
                Version::Iron,
                Version::Win10Rs5,
                Version::Win10Rs4,
                Version::Win10Rs3_1,
                Version::Win10Rs3_0,
                Version::Win10,
                Version::Win8_1,
            ],
            feature_flags: FeatureFlags::new().with_client_id(true),
            client_id: Guid::ZERO,
            message_connection_id: protocol::MESSAGE_CONNECTION_ID,
            sint: protocol::VMBUS_SINT,
            vtl: 0,
            response_poll_limit: 1_000_000,
            filter: ChannelFilter::default(),
        }
    }
}

/// Options for [`VmbusClient::create_gpadl`].
#[bitfield(u32)]
pub struct GpadlFlags {
    /// Zero the pages before sharing them.
    pub zero_pages: bool,
    /// The pages may stay encrypted if the channel is confidential.
    pub allow_encrypted: bool,
    #[bits(30)]
    _reserved: u32,
}

/// A failed control request.
#[derive(Debug, Error)]
pub enum RequestError {
    /// No version has been negotiated.
    #[error("not connected to the host")]
    NotConnected,
    /// The message could not be posted.
    #[error("failed to post message")]
    Post(#[source] HypercallError),
    /// The host did not respond within the poll limit.
    #[error("no {0} response from the host")]
    NoResponse(&'static str),
}

/// A failed connection attempt.
#[derive(Debug, Error)]
pub enum ConnectError {
    /// Already connected.
    #[error("invalid state to connect to the host")]
    InvalidState,
    /// The host accepted none of the configured versions.
    #[error("no supported protocol versions")]
    NoSupportedVersions,
    /// The host accepted the version but refused the connection.
    #[error("failed to connect to the host: {0:?}")]
    FailedToConnect(ConnectionState),
    /// A request failed.
    #[error(transparent)]
    Request(#[from] RequestError),
}

/// A failed GPADL operation.
#[derive(Debug, Error)]
pub enum GpadlError {
    /// The channel is not offered.
    #[error("unknown channel {0}")]
    UnknownChannel(ChannelId),
    /// The channel has been rescinded.
    #[error("channel {0} has been rescinded")]
    Rescinded(ChannelId),
    /// Every handle is in use.
    #[error("no free gpadl handles")]
    OutOfResources,
    /// The buffer cannot be described by one GPADL.
    #[error("buffer of {0} pages too large for a gpadl")]
    TooLarge(usize),
    /// The pages could not be shared with the host.
    #[error("failed to prepare gpadl memory")]
    Memory(#[source] MemoryError),
    /// The host refused the GPADL.
    #[error("host failed to create gpadl: {0:#x}")]
    Failed(i32),
    /// The GPADL holds the ring buffers of an opening or open channel.
    #[error("gpadl {0} is in use by an open channel")]
    InUse(GpadlId),
    /// The GPADL does not exist or is not fully created.
    #[error("unknown gpadl {0}")]
    UnknownGpadl(GpadlId),
    /// A request failed.
    #[error(transparent)]
    Request(#[from] RequestError),
}

/// A failed open request.
#[derive(Debug, Error)]
pub enum OpenError {
    /// The channel is not offered.
    #[error("unknown channel {0}")]
    UnknownChannel(ChannelId),
    /// The channel cannot be opened in its current state.
    #[error("channel {0} cannot be opened while {1:?}")]
    InvalidState(ChannelId, ChannelState),
    /// The ring GPADL does not belong to the channel.
    #[error("gpadl {0} is not a created gpadl of the channel")]
    InvalidGpadl(GpadlId),
    /// The host refused to open the channel.
    #[error("host failed to open channel: {0:#x}")]
    Failed(u32),
    /// A request failed.
    #[error(transparent)]
    Request(#[from] RequestError),
}

/// A failed channel request.
#[derive(Debug, Error)]
pub enum ChannelError {
    /// The channel is not offered.
    #[error("unknown channel {0}")]
    UnknownChannel(ChannelId),
    /// A request failed.
    #[error(transparent)]
    Request(#[from] RequestError),
}

/// The lifecycle state of a channel.
#[derive(Debug, Copy, Clone, PartialEq, Eq)]
pub enum ChannelState {
    /// Offered by the host and not open.
    Offered,
    /// An open request is outstanding.
    Opening,
    /// Open.
    Open,
    /// A close request is being sent.
    Closing,
    /// Closed by the guest.
    Closed,
    /// Revoked by the host. The channel ID is released once the channel is
    /// closed and its GPADLs are torn down.
    Rescinded,
}

/// An accepted offer.
#[derive(Debug, Clone)]
pub struct OfferInfo {
    /// The offer as sent by the host.
    pub offer: OfferChannel,
    /// Offered after the initial offers were delivered.
    pub hot_added: bool,
    /// The ring buffer may stay encrypted.
    pub confidential: bool,
}

impl OfferInfo {
    /// The channel ID.
    pub fn channel_id(&self) -> ChannelId {
        self.offer.channel_id
    }

    /// Returns true if in-band payloads carry a pipe header.
    pub fn is_pipe(&self) -> bool {
        self.offer.flags.named_pipe_mode()
    }
}

/// A request to open a channel.
#[derive(Debug, Clone)]
pub struct OpenRequest {
    /// The channel to open.
    pub channel_id: ChannelId,
    /// The GPADL holding both ring buffers.
    pub ring_gpadl_id: GpadlId,
    /// The first page of the host-to-guest ring within the GPADL.
    pub downstream_ring_buffer_page_offset: u32,
    /// Device-specific open data.
    pub user_data: UserDefinedData,
}

/// A GPADL created by [`VmbusClient::create_gpadl`]. Must be passed to
/// [`VmbusClient::destroy_gpadl`] before the pages are reused.
#[derive(Debug)]
pub struct Gpadl {
    channel_id: ChannelId,
    id: GpadlId,
    pages: SharedPages,
    host_visible: bool,
    visible_gpn: u64,
}

impl Gpadl {
    /// The GPADL handle.
    pub fn id(&self) -> GpadlId {
        self.id
    }

    /// The channel the GPADL was created for.
    pub fn channel_id(&self) -> ChannelId {
        self.channel_id
    }

    /// The described pages.
    pub fn pages(&self) -> &SharedPages {
        &self.pages
    }

    /// Returns true if the pages were shared with the host.
    pub fn is_host_visible(&self) -> bool {
        self.host_visible
    }

    /// The first page number as sent to the host.
    pub fn visible_gpn(&self) -> u64 {
        self.visible_gpn
    }
}

/// A channel interrupt handler, called from [`VmbusClient::handle_sint`].
pub type ChannelIsr = Arc<dyn Fn() + Send + Sync>;

struct Channel {
    offer: OfferChannel,
    state: ChannelState,
    rescinded: bool,
    hot_added: bool,
    confidential: bool,
    ring_gpadl: Option<GpadlId>,
}

#[derive(Debug, Copy, Clone, PartialEq, Eq)]
enum GpadlState {
    Creating,
    Created,
    TearingDown,
}

struct GpadlEntry {
    channel_id: ChannelId,
    state: GpadlState,
}

fn gpadl_key(id: GpadlId) -> Option<usize> {
    (id.0 as usize).checked_sub(1)
}

#[derive(Default)]
struct ClientState {
    version: Option<VersionInfo>,
    offers_delivered: bool,
    channels: BTreeMap<ChannelId, Channel>,
    gpadls: Slab<GpadlEntry>,
}

impl ClientState {
    fn has_gpadls(&self, channel_id: ChannelId) -> bool {
        self.gpadls.iter().any(|(_, g)| g.channel_id == channel_id)
    }
}

/// The VMBus client.
pub struct VmbusClient {
    synic: Arc<dyn SynicClient>,
    memory: Arc<dyn MemoryAllocator>,
    config: VmbusConfig,
    state: Mutex<ClientState>,
    interrupts: Mutex<BTreeMap<u32, ChannelIsr>>,
}

impl VmbusClient {
    /// Creates a client. Call [`VmbusClient::connect`] before anything else.
    pub fn new(
        synic: Arc<dyn SynicClient>,
        memory: Arc<dyn MemoryAllocator>,
        config: VmbusConfig,
    ) -> Self {
        Self {
            synic,
            memory,
            config,
            state: Mutex::new(ClientState::default()),
            interrupts: Mutex::new(BTreeMap::new()),
        }
    }

    /// The memory allocator.
    pub fn memory(&self) -> &Arc<dyn MemoryAllocator> {
        &self.memory
    }

    /// The negotiated version, if connected.
    pub fn version(&self) -> Option<VersionInfo> {
        self.state.lock().version
    }

    /// Negotiates a version and collects the initial offers.
    pub fn connect(&self) -> Result<VersionInfo, ConnectError> {
        if self.state.lock().version.is_some() {
            return Err(ConnectError::InvalidState);
        }
        for &version in &self.config.versions {
            match self.initiate_contact(version)? {
                Some(version) => {
                    tracing::info!(
                        version = %version.version,
                        feature_flags = ?version.feature_flags,
                        "vmbus connected, requesting offers"
                    );
                    self.request_offers()?;
                    return Ok(version);
                }
                None => {
                    tracing::debug!(%version, "host does not support version");
                }
            }
        }
        tracing::error!("no supported vmbus protocol versions");
        Err(ConnectError::NoSupportedVersions)
    }

    fn initiate_contact(&self, version: Version) -> Result<Option<VersionInfo>, ConnectError> {
        let feature_flags = if version.has_feature_flags() {
            self.config.feature_flags
        } else {
            FeatureFlags::new()
        };
        let target_info = protocol::TargetInfo::new()
            .with_sint(self.config.sint)
            .with_vtl(self.config.vtl)
            .with_feature_flags(feature_flags.into());
        let message = protocol::InitiateContact2 {
            initiate_contact: protocol::InitiateContact {
                version_requested: version as u32,
                target_message_vp: self.synic.current_vp(),
                interrupt_page_or_target_info: target_info.into(),
                parent_to_child_monitor_page_gpa: 0,
                child_to_parent_monitor_page_gpa: 0,
            },
            client_id: self.config.client_id,
        };
        if version.has_feature_flags() {
            self.send(&OutgoingMessage::new(&message))?;
        } else {
            self.send(&OutgoingMessage::new(&message.initiate_contact))?;
        }

        let (response, supported_features) =
            self.wait_for("version", true, |_, message| match message {
                Message::VersionResponse2(response, _) => {
                    Some((response.version_response, response.supported_features))
                }
                Message::VersionResponse(response, _) => Some((*response, 0)),
                _ => None,
            })?;

        if response.version_supported == 0 {
            return Ok(None);
        }
        if response.connection_state != ConnectionState::SUCCESSFUL {
            tracing::error!(state = ?response.connection_state, %version, "host refused connection");
            return Err(ConnectError::FailedToConnect(response.connection_state));
        }
        let version = VersionInfo {
            version,
            feature_flags: feature_flags & FeatureFlags::from(supported_features),
        };
        self.state.lock().version = Some(version);
        Ok(Some(version))
    }

    fn request_offers(&self) -> Result<(), RequestError> {
        self.send(&OutgoingMessage::new(&protocol::RequestOffers {}))?;
        self.wait_for("offers delivered", true, |state, message| {
            matches!(message, Message::AllOffersDelivered(..)).then(|| {
                state.offers_delivered = true;
            })
        })?;
        Ok(())
    }

    /// The accepted offers that have not been rescinded.
    pub fn offers(&self) -> Vec<OfferInfo> {
        self.state
            .lock()
            .channels
            .values()
            .filter(|c| !c.rescinded)
            .map(|c| OfferInfo {
                offer: c.offer,
                hot_added: c.hot_added,
                confidential: c.confidential,
            })
            .collect()
    }

    /// The offer for `channel_id`, if accepted and not released.
    pub fn offer(&self, channel_id: ChannelId) -> Option<OfferInfo> {
        self.state.lock().channels.get(&channel_id).map(|c| OfferInfo {
            offer: c.offer,
            hot_added: c.hot_added,
            confidential: c.confidential,
        })
    }

    /// The state of `channel_id`, or `None` once its ID has been released.
    pub fn channel_state(&self, channel_id: ChannelId) -> Option<ChannelState> {
        self.state.lock().channels.get(&channel_id).map(|c| {
            if c.rescinded {
                ChannelState::Rescinded
            } else {
                c.state
            }
        })
    }

    /// The number of GPADL handles in use.
    pub fn gpadl_count(&self) -> usize {
        self.state.lock().gpadls.len()
    }

    /// Describes `pages` to the host as a GPADL for `channel_id`.
    ///
    /// On isolated VMs the pages are first shared with the host, unless
    /// `flags` allows encryption and the channel is confidential.
    pub fn create_gpadl(
        &self,
        channel_id: ChannelId,
        pages: SharedPages,
        flags: GpadlFlags,
    ) -> Result<Gpadl, GpadlError> {
        let confidential = {
            let state = self.state.lock();
            if state.version.is_none() {
                return Err(RequestError::NotConnected.into());
            }
            let channel = state
                .channels
                .get(&channel_id)
                .ok_or(GpadlError::UnknownChannel(channel_id))?;
            if channel.rescinded {
                return Err(GpadlError::Rescinded(channel_id));
            }
            channel.confidential
        };

        let page_count = pages.page_count();
        let len = u32::try_from(pages.len())
            .ok()
            .filter(|_| page_count <= (u16::MAX as usize - 8) / 8)
            .ok_or(GpadlError::TooLarge(page_count))?;

        let host_visible =
            self.memory.is_isolated() && !(flags.allow_encrypted() && confidential);
        if flags.zero_pages() {
            pages.fill_at(0, pages.len(), 0);
        }
        let mut visible_gpn = pages.gpn();
        if host_visible {
            self.memory
                .set_host_visibility(&pages, true)
                .map_err(GpadlError::Memory)?;
            visible_gpn += self.memory.shared_gpa_boundary() / PAGE_SIZE as u64;
        }

        match self.create_gpadl_handle(channel_id, visible_gpn, page_count, len) {
            Ok(id) => Ok(Gpadl {
                channel_id,
                id,
                pages,
                host_visible,
                visible_gpn,
            }),
            Err(err) => {
                if host_visible {
                    self.revoke_visibility(&pages);
                }
                Err(err)
            }
        }
    }

    fn create_gpadl_handle(
        &self,
        channel_id: ChannelId,
        visible_gpn: u64,
        page_count: usize,
        len: u32,
    ) -> Result<GpadlId, GpadlError> {
        let gpadl_id = {
            let mut state = self.state.lock();
            if state.gpadls.len() >= MAX_GPADLS - 1 {
                tracing::warn!(%channel_id, "gpadl table full");
                return Err(GpadlError::OutOfResources);
            }
            let key = state.gpadls.insert(GpadlEntry {
                channel_id,
                state: GpadlState::Creating,
            });
            GpadlId(key as u32 + 1)
        };

        let result = self
            .send_gpadl(channel_id, gpadl_id, visible_gpn, page_count, len)
            .and_then(|()| {
                self.wait_for("gpadl created", true, |_, message| match message {
                    Message::GpadlCreated(created, _) if created.gpadl_id == gpadl_id => {
                        if created.channel_id != channel_id {
                            tracelimit::warn_ratelimited!(
                                %gpadl_id,
                                expected = %channel_id,
                                actual = %created.channel_id,
                                "gpadl created for the wrong channel"
                            );
                        }
                        Some(created.status)
                    }
                    _ => None,
                })
            });

        let mut state = self.state.lock();
        let key = gpadl_id.0 as usize - 1;
        match result {
            Ok(protocol::STATUS_SUCCESS) => {
                state.gpadls[key].state = GpadlState::Created;
                tracing::debug!(%channel_id, %gpadl_id, page_count, "gpadl created");
                Ok(gpadl_id)
            }
            Ok(status) => {
                state.gpadls.remove(key);
                tracing::warn!(%channel_id, %gpadl_id, status, "host failed to create gpadl");
                self.try_release(&mut state, channel_id);
                Err(GpadlError::Failed(status))
            }
            Err(err) => {
                state.gpadls.remove(key);
                self.try_release(&mut state, channel_id);
                Err(err.into())
            }
        }
    }

    fn send_gpadl(
        &self,
        channel_id: ChannelId,
        gpadl_id: GpadlId,
        visible_gpn: u64,
        page_count: usize,
        len: u32,
    ) -> Result<(), RequestError> {
        let gpns: GpnList = (visible_gpn..visible_gpn + page_count as u64).collect();
        // The range was sized above, so it is valid.
        let range = PagedRange::new(0, len as usize, &gpns);
        let ranges: MultiPagedRangeBuf<GpnList> = range.into_iter().collect();
        let values = ranges.range_buffer();

        let header = protocol::GpadlHeader {
            channel_id,
            gpadl_id,
            len: values.as_bytes().len() as u16,
            count: 1,
        };
        let (first, rest) = values.split_at(values.len().min(protocol::GpadlHeader::MAX_DATA_VALUES));
        self.send(&OutgoingMessage::with_data(&header, first.as_bytes()))?;
        for (index, chunk) in rest.chunks(protocol::GpadlBody::MAX_DATA_VALUES).enumerate() {
            let body = protocol::GpadlBody {
                rsvd: index as u32,
                gpadl_id,
            };
            self.send(&OutgoingMessage::with_data(&body, chunk.as_bytes()))?;
        }
        Ok(())
    }

    /// Tears down `gpadl`. Fails with [`GpadlError::InUse`] while it holds
    /// the rings of an opening or open channel.
    pub fn destroy_gpadl(&self, gpadl: &Gpadl) -> Result<(), GpadlError> {
        let gpadl_id = gpadl.id;
        let channel_id = gpadl.channel_id;
        {
            let mut state = self.state.lock();
            let in_use = state.channels.get(&channel_id).is_some_and(|c| {
                c.ring_gpadl == Some(gpadl_id)
                    && matches!(c.state, ChannelState::Opening | ChannelState::Open)
            });
            let entry = gpadl_key(gpadl_id)
                .and_then(|key| state.gpadls.get_mut(key))
                .filter(|e| e.channel_id == channel_id && e.state == GpadlState::Created)
                .ok_or(GpadlError::UnknownGpadl(gpadl_id))?;
            if in_use {
                return Err(GpadlError::InUse(gpadl_id));
            }
            entry.state = GpadlState::TearingDown;
        }

        let result = self
            .send(&OutgoingMessage::new(&protocol::GpadlTeardown {
                channel_id,
                gpadl_id,
            }))
            .and_then(|()| {
                self.wait_for("gpadl torndown", true, |_, message| {
                    matches!(message, Message::GpadlTorndown(torndown, _) if torndown.gpadl_id == gpadl_id)
                        .then_some(())
                })
            });

        let mut state = self.state.lock();
        let key = gpadl_id.0 as usize - 1;
        if let Err(err) = result {
            state.gpadls[key].state = GpadlState::Created;
            return Err(err.into());
        }
        state.gpadls.remove(key);
        tracing::debug!(%channel_id, %gpadl_id, "gpadl torn down");
        self.try_release(&mut state, channel_id);
        drop(state);

        if gpadl.host_visible {
            self.revoke_visibility(&gpadl.pages);
        }
        Ok(())
    }

    fn revoke_visibility(&self, pages: &SharedPages) {
        if let Err(err) = self.memory.set_host_visibility(pages, false) {
            tracing::error!(
                error = &err as &dyn std::error::Error,
                gpn = pages.gpn(),
                "failed to revoke host visibility"
            );
        }
    }

    /// Opens a channel whose ring GPADL has been created.
    ///
    /// A host failure returns the channel to [`ChannelState::Offered`].
    pub fn open_channel(&self, request: &OpenRequest) -> Result<(), OpenError> {
        let channel_id = request.channel_id;
        let previous = {
            let mut state = self.state.lock();
            let ring_ok = gpadl_key(request.ring_gpadl_id)
                .and_then(|key| state.gpadls.get(key))
                .is_some_and(|e| e.channel_id == channel_id && e.state == GpadlState::Created);
            let channel = state
                .channels
                .get_mut(&channel_id)
                .ok_or(OpenError::UnknownChannel(channel_id))?;
            if channel.rescinded {
                return Err(OpenError::InvalidState(channel_id, ChannelState::Rescinded));
            }
            if !matches!(channel.state, ChannelState::Offered | ChannelState::Closed) {
                return Err(OpenError::InvalidState(channel_id, channel.state));
            }
            if !ring_ok {
                return Err(OpenError::InvalidGpadl(request.ring_gpadl_id));
            }
            let previous = channel.state;
            channel.state = ChannelState::Opening;
            channel.ring_gpadl = Some(request.ring_gpadl_id);
            previous
        };

        tracing::info!(%channel_id, "opening channel");
        let open_id = channel_id.0;
        let result = self
            .send(&OutgoingMessage::new(&protocol::OpenChannel {
                channel_id,
                open_id,
                ring_buffer_gpadl_id: request.ring_gpadl_id,
                target_vp: self.synic.current_vp(),
                downstream_ring_buffer_page_offset: request.downstream_ring_buffer_page_offset,
                user_data: request.user_data,
            }))
            .and_then(|()| {
                self.wait_for("open result", true, |_, message| match message {
                    Message::OpenResult(result, _)
                        if result.channel_id == channel_id && result.open_id == open_id =>
                    {
                        Some(result.status)
                    }
                    _ => None,
                })
            });

        let mut state = self.state.lock();
        let Some(channel) = state.channels.get_mut(&channel_id) else {
            return Err(OpenError::UnknownChannel(channel_id));
        };
        match result {
            Ok(0) => {
                channel.state = ChannelState::Open;
                tracing::info!(%channel_id, "channel open");
                Ok(())
            }
            Ok(status) => {
                channel.state = ChannelState::Offered;
                channel.ring_gpadl = None;
                tracing::warn!(%channel_id, status, "host failed to open channel");
                self.try_release(&mut state, channel_id);
                Err(OpenError::Failed(status))
            }
            Err(err) => {
                channel.state = previous;
                channel.ring_gpadl = None;
                Err(err.into())
            }
        }
    }

    /// Closes a channel. Does nothing unless the channel is opening or open.
    pub fn close_channel(&self, channel_id: ChannelId) -> Result<(), ChannelError> {
        let previous = {
            let mut state = self.state.lock();
            let channel = state
                .channels
                .get_mut(&channel_id)
                .ok_or(ChannelError::UnknownChannel(channel_id))?;
            if !matches!(channel.state, ChannelState::Opening | ChannelState::Open) {
                return Ok(());
            }
            std::mem::replace(&mut channel.state, ChannelState::Closing)
        };

        tracing::info!(%channel_id, "closing channel");
        let result = self.send(&OutgoingMessage::new(&protocol::CloseChannel { channel_id }));

        let mut state = self.state.lock();
        if let Some(channel) = state.channels.get_mut(&channel_id) {
            if result.is_err() {
                channel.state = previous;
            } else {
                channel.state = ChannelState::Closed;
                channel.ring_gpadl = None;
            }
        }
        result?;
        self.try_release(&mut state, channel_id);
        Ok(())
    }

    /// Signals the host that `channel_id` has work to do.
    pub fn signal_channel(&self, channel_id: ChannelId) -> Result<(), ChannelError> {
        let connection_id = self
            .state
            .lock()
            .channels
            .get(&channel_id)
            .ok_or(ChannelError::UnknownChannel(channel_id))?
            .offer
            .connection_id;
        self.synic
            .signal_event(connection_id, 0)
            .map_err(|err| ChannelError::Request(RequestError::Post(err)))
    }

    /// Calls `isr` from [`VmbusClient::handle_sint`] whenever the host
    /// signals `channel_id`. Replaces any previous handler.
    pub fn register_isr(&self, channel_id: ChannelId, isr: ChannelIsr) -> Result<(), ChannelError> {
        if !self.state.lock().channels.contains_key(&channel_id) {
            return Err(ChannelError::UnknownChannel(channel_id));
        }
        self.interrupts.lock().insert(channel_id.0, isr);
        Ok(())
    }

    /// Removes the interrupt handler of `channel_id`.
    pub fn unregister_isr(&self, channel_id: ChannelId) {
        self.interrupts.lock().remove(&channel_id.0);
    }

    /// Handles a VMBus SINT: dispatches signaled channel interrupts, then any
    /// pending control messages.
    pub fn handle_sint(&self) {
        let isrs = self.scan_event_flags();
        for isr in isrs {
            isr();
        }
        while let Some(message) = self.synic.poll_message() {
            let mut state = self.state.lock();
            let version = state.version.map(|v| v.version);
            if let Some(message) = parse_message(&message, version) {
                self.dispatch(&mut state, message);
            }
        }
    }

    fn scan_event_flags(&self) -> Vec<ChannelIsr> {
        let interrupts = self.interrupts.lock();
        let Some(&max) = interrupts.keys().next_back() else {
            return Vec::new();
        };
        let flags = self.synic.event_flags();
        let mut isrs = Vec::new();
        for (index, word) in flags.iter().enumerate().take(max as usize / 64 + 1) {
            let mut bits = word.swap(0, Ordering::AcqRel);
            while bits != 0 {
                let bit = bits.trailing_zeros();
                bits &= bits - 1;
                if let Some(isr) = interrupts.get(&(index as u32 * 64 + bit)) {
                    isrs.push(isr.clone());
                }
            }
        }
        isrs
    }

    /// Disconnects from the host, ignoring any messages until the host
    /// confirms.
    pub fn unload(&self) -> Result<(), RequestError> {
        if self.state.lock().version.is_none() {
            return Err(RequestError::NotConnected);
        }
        self.send(&OutgoingMessage::new(&protocol::Unload {}))?;
        self.wait_for("unload complete", false, |_, message| {
            matches!(message, Message::UnloadComplete(..)).then_some(())
        })?;

        let mut state = self.state.lock();
        for (key, gpadl) in &state.gpadls {
            tracing::warn!(
                channel_id = %gpadl.channel_id,
                gpadl_id = %GpadlId(key as u32 + 1),
                "gpadl still allocated at unload"
            );
        }
        *state = ClientState::default();
        self.interrupts.lock().clear();
        tracing::info!("vmbus unloaded");
        Ok(())
    }

    fn send(&self, message: &OutgoingMessage) -> Result<(), RequestError> {
        for _ in 0..self.config.response_poll_limit {
            match self.synic.post_message(
                self.config.message_connection_id,
                protocol::SYNIC_MESSAGE_TYPE,
                message.data(),
            ) {
                Ok(()) => return Ok(()),
                Err(HypercallError::Busy) => std::hint::spin_loop(),
                Err(err) => {
                    tracing::error!(
                        error = &err as &dyn std::error::Error,
                        "failed to post vmbus message"
                    );
                    return Err(RequestError::Post(err));
                }
            }
        }
        Err(RequestError::Post(HypercallError::Busy))
    }

    /// Polls for messages until `matches` accepts one. Others are dispatched
    /// as unsolicited messages, or dropped if `dispatch_others` is false.
    fn wait_for<T>(
        &self,
        what: &'static str,
        dispatch_others: bool,
        mut matches: impl FnMut(&mut ClientState, &Message<'_>) -> Option<T>,
    ) -> Result<T, RequestError> {
        for _ in 0..self.config.response_poll_limit {
            let Some(message) = self.synic.poll_message() else {
                std::hint::spin_loop();
                continue;
            };
            let mut state = self.state.lock();
            let version = state.version.map(|v| v.version);
            let Some(message) = parse_message(&message, version) else {
                continue;
            };
            if let Some(result) = matches(&mut state, &message) {
                return Ok(result);
            }
            if dispatch_others {
                self.dispatch(&mut state, message);
            } else {
                tracing::debug!(message_type = ?message.message_type(), what, "ignoring message");
            }
        }
        tracing::error!(what, "timed out waiting for the host");
        Err(RequestError::NoResponse(what))
    }

    fn dispatch(&self, state: &mut ClientState, message: Message<'_>) {
        match message {
            Message::OfferChannel(offer, _) => self.handle_offer(state, &offer),
            Message::RescindChannelOffer(rescind, _) => {
                let channel_id = rescind.channel_id;
                let Some(channel) = state.channels.get_mut(&channel_id) else {
                    tracelimit::warn_ratelimited!(%channel_id, "rescind of unknown channel");
                    return;
                };
                tracing::info!(%channel_id, state = ?channel.state, "channel rescinded");
                channel.rescinded = true;
                self.try_release(state, channel_id);
            }
            message => {
                tracelimit::warn_ratelimited!(
                    message_type = ?message.message_type(),
                    "unexpected vmbus message"
                );
            }
        }
    }

    fn handle_offer(&self, state: &mut ClientState, offer: &OfferChannel) {
        let channel_id = offer.channel_id;
        if channel_id.0 >= protocol::MAX_CHANNELS {
            tracelimit::warn_ratelimited!(%channel_id, "offer with invalid channel id");
            return;
        }
        if !self
            .config
            .filter
            .is_allowed(&offer.interface_id, self.memory.is_isolated())
        {
            tracing::info!(
                %channel_id,
                interface_id = %offer.interface_id,
                "channel not allowed"
            );
            return;
        }
        if state.channels.contains_key(&channel_id) {
            tracelimit::warn_ratelimited!(%channel_id, "duplicate offer");
            return;
        }
        let confidential = state
            .version
            .is_some_and(|v| v.feature_flags.confidential_channels())
            && offer.flags.confidential_ring_buffer();
        let hot_added = state.offers_delivered;
        tracing::info!(
            %channel_id,
            interface_id = %offer.interface_id,
            instance_id = %offer.instance_id,
            hot_added,
            "channel offered"
        );
        state.channels.insert(
            channel_id,
            Channel {
                offer: *offer,
                state: ChannelState::Offered,
                rescinded: false,
                hot_added,
                confidential,
                ring_gpadl: None,
            },
        );
    }

    /// Releases the ID of a rescinded channel once it is closed and has no
    /// GPADLs.
    fn try_release(&self, state: &mut ClientState, channel_id: ChannelId) {
        let Some(channel) = state.channels.get(&channel_id) else {
            return;
        };
        if !channel.rescinded
            || !matches!(channel.state, ChannelState::Offered | ChannelState::Closed)
            || state.has_gpadls(channel_id)
        {
            return;
        }
        state.channels.remove(&channel_id);
        tracing::info!(%channel_id, "releasing channel");
        if let Err(err) = self.send(&OutgoingMessage::new(&protocol::RelIdReleased { channel_id })) {
            tracing::error!(
                %channel_id,
                error = &err as &dyn std::error::Error,
                "failed to release channel"
            );
        }
    }
}

fn parse_message(message: &SynicMessage, version: Option<Version>) -> Option<Message<'_>> {
    if message.message_type != protocol::SYNIC_MESSAGE_TYPE
        || message.data.len() > protocol::MAX_MESSAGE_SIZE
    {
        tracelimit::warn_ratelimited!(
            message_type = message.message_type,
            len = message.data.len(),
            "invalid synic message"
        );
        return None;
    }
    match Message::parse(&message.data, version) {
        Ok(message) => Some(message),
        Err(err) => {
            tracelimit::warn_ratelimited!(
                error = &err as &dyn std::error::Error,
                "invalid vmbus message"
            );
            None
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::testing::HostConfig;
    use crate::testing::SimulatedHost;
    use protocol::MessageType;
    use protocol::OfferFlags;
    use std::sync::atomic::AtomicUsize;
    use test_with_tracing::test;

    fn client(host: &Arc<SimulatedHost>, config: VmbusConfig) -> VmbusClient {
        VmbusClient::new(host.clone(), host.clone(), config)
    }

    fn connected(host_config: HostConfig) -> (Arc<SimulatedHost>, VmbusClient, ChannelId) {
        let host = Arc::new(SimulatedHost::new(host_config));
        let channel_id = host.offer(STORAGE_INTERFACE, OfferFlags::new());
        let client = client(&host, VmbusConfig::default());
        client.connect().unwrap();
        (host, client, channel_id)
    }

    fn one_page(client: &VmbusClient) -> SharedPages {
        client.memory().allocate_pages(1).unwrap()
    }

    #[test]
    fn connect_highest_version() {
        let host = Arc::new(SimulatedHost::new(HostConfig::default()));
        let client = client(&host, VmbusConfig::default());
        let version = client.connect().unwrap();
        assert_eq!(version.version, Version::Copper);
        assert_eq!(
            version.feature_flags,
            FeatureFlags::new().with_client_id(true)
        );
        assert!(matches!(client.connect(), Err(ConnectError::InvalidState)));
    }

    #[test]
    fn version_fallback() {
        let host = Arc::new(SimulatedHost::new(HostConfig {
            versions: vec![Version::Win10, Version::Win8],
            ..Default::default()
        }));
        let client = client(&host, VmbusConfig::default());
        let version = client.connect().unwrap();
        assert_eq!(version.version, Version::Win10);
        assert_eq!(version.feature_flags, FeatureFlags::new());

        let proposed = host.proposed_versions();
        assert_eq!(
            proposed,
            [
                Version::Copper,
                Version::Iron,
                Version::Win10Rs5,
                Version::Win10Rs4,
                Version::Win10Rs3_1,
                Version::Win10Rs3_0,
                Version::Win10
            ]
        );
    }

    #[test]
    fn no_supported_version() {
        let host = Arc::new(SimulatedHost::new(HostConfig {
            versions: Vec::new(),
            ..Default::default()
        }));
        let client = client(&host, VmbusConfig::default());
        assert!(matches!(
            client.connect(),
            Err(ConnectError::NoSupportedVersions)
        ));
        assert_eq!(
            host.proposed_versions().len(),
            VmbusConfig::default().versions.len()
        );
        assert_eq!(client.version(), None);
        assert!(
            !host
                .received()
                .contains(&MessageType::REQUEST_OFFERS)
        );
    }

    #[test]
    fn connection_refused() {
        let host = Arc::new(SimulatedHost::new(HostConfig {
            connection_state: ConnectionState::FAILED_LOW_RESOURCES,
            ..Default::default()
        }));
        let client = client(&host, VmbusConfig::default());
        assert!(matches!(
            client.connect(),
            Err(ConnectError::FailedToConnect(ConnectionState::FAILED_LOW_RESOURCES))
        ));
        assert_eq!(host.proposed_versions(), [Version::Copper]);
        assert_eq!(client.version(), None);
    }

    #[test]
    fn filter_offers() {
        for isolated in [false, true] {
            let host = Arc::new(SimulatedHost::new(HostConfig {
                isolated,
                ..Default::default()
            }));
            let storage = host.offer(STORAGE_INTERFACE, OfferFlags::new());
            let video = host.offer(VIDEO_INTERFACE, OfferFlags::new());
            host.offer(
                Guid::from_static_str("12345678-0000-0000-0000-000000000000"),
                OfferFlags::new(),
            );
            let client = client(&host, VmbusConfig::default());
            client.connect().unwrap();
            let mut offered: Vec<_> = client.offers().iter().map(|o| o.channel_id()).collect();
            offered.sort();
            if isolated {
                assert_eq!(offered, [storage]);
            } else {
                assert_eq!(offered, [storage, video]);
            }
            assert!(client.offers().iter().all(|o| !o.hot_added));
        }
    }

    #[test]
    fn hot_add() {
        let (host, client, _) = connected(HostConfig::default());
        let network = host.offer(NETWORK_INTERFACE, OfferFlags::new());
        client.handle_sint();
        let offer = client.offer(network).unwrap();
        assert!(offer.hot_added);
        assert_eq!(client.channel_state(network), Some(ChannelState::Offered));
    }

    #[test]
    fn gpadl_spans_messages() {
        let (host, client, channel_id) = connected(HostConfig::default());
        let pages = client.memory().allocate_pages(100).unwrap();
        pages.write_at(0, b"garbage");
        let gpadl = client
            .create_gpadl(channel_id, pages.clone(), GpadlFlags::new().with_zero_pages(true))
            .unwrap();
        assert_eq!(gpadl.id(), GpadlId(1));
        assert_eq!(
            host.gpadl_gpns(gpadl.id()).unwrap(),
            pages.gpns().collect::<Vec<_>>()
        );
        let mut buf = [0xff; 7];
        pages.read_at(0, &mut buf);
        assert_eq!(buf, [0; 7]);
        let bodies = host
            .received()
            .iter()
            .filter(|&&t| t == MessageType::GPADL_BODY)
            .count();
        // 26 page numbers fit in the header, 28 in each body.
        assert_eq!(bodies, 3);

        client.destroy_gpadl(&gpadl).unwrap();
        assert!(host.gpadl_gpns(gpadl.id()).is_none());
        assert_eq!(client.gpadl_count(), 0);
        assert!(matches!(
            client.destroy_gpadl(&gpadl),
            Err(GpadlError::UnknownGpadl(_))
        ));
    }

    #[test]
    fn gpadl_failure_reclaims_handle() {
        let (host, client, channel_id) = connected(HostConfig::default());
        host.set_gpadl_status(protocol::STATUS_UNSUCCESSFUL);
        assert!(matches!(
            client.create_gpadl(channel_id, one_page(&client), GpadlFlags::new()),
            Err(GpadlError::Failed(protocol::STATUS_UNSUCCESSFUL))
        ));
        assert_eq!(client.gpadl_count(), 0);
        host.set_gpadl_status(protocol::STATUS_SUCCESS);
        let gpadl = client
            .create_gpadl(channel_id, one_page(&client), GpadlFlags::new())
            .unwrap();
        assert_eq!(gpadl.id(), GpadlId(1));
    }

    #[test]
    fn gpadl_table_exhaustion() {
        let (_host, client, channel_id) = connected(HostConfig::default());
        let mut gpadls = Vec::new();
        for _ in 0..MAX_GPADLS - 1 {
            gpadls.push(
                client
                    .create_gpadl(channel_id, one_page(&client), GpadlFlags::new())
                    .unwrap(),
            );
        }
        assert!(gpadls.iter().all(|g| g.id().0 != 0));
        assert!(matches!(
            client.create_gpadl(channel_id, one_page(&client), GpadlFlags::new()),
            Err(GpadlError::OutOfResources)
        ));
        let gpadl = gpadls.pop().unwrap();
        client.destroy_gpadl(&gpadl).unwrap();
        client
            .create_gpadl(channel_id, one_page(&client), GpadlFlags::new())
            .unwrap();
    }

    #[test]
    fn isolated_gpadl_is_shared() {
        let (host, client, channel_id) = connected(HostConfig {
            isolated: true,
            ..Default::default()
        });
        let pages = one_page(&client);
        let gpadl = client
            .create_gpadl(channel_id, pages.clone(), GpadlFlags::new())
            .unwrap();
        assert!(gpadl.is_host_visible());
        assert!(host.is_visible(pages.gpn()));
        assert_eq!(
            gpadl.visible_gpn(),
            pages.gpn() + client.memory().shared_gpa_boundary() / PAGE_SIZE as u64
        );
        client.destroy_gpadl(&gpadl).unwrap();
        assert!(!host.is_visible(pages.gpn()));
    }

    #[test]
    fn confidential_ring_stays_private() {
        let host = Arc::new(SimulatedHost::new(HostConfig {
            isolated: true,
            ..Default::default()
        }));
        let channel_id = host.offer(
            STORAGE_INTERFACE,
            OfferFlags::new().with_confidential_ring_buffer(true),
        );
        let client = client(
            &host,
            VmbusConfig {
                feature_flags: FeatureFlags::new()
                    .with_client_id(true)
                    .with_confidential_channels(true),
                ..Default::default()
            },
        );
        let version = client.connect().unwrap();
        assert!(version.feature_flags.confidential_channels());
        assert!(client.offer(channel_id).unwrap().confidential);

        let pages = one_page(&client);
        let gpadl = client
            .create_gpadl(
                channel_id,
                pages.clone(),
                GpadlFlags::new().with_allow_encrypted(true),
            )
            .unwrap();
        assert!(!gpadl.is_host_visible());
        assert_eq!(gpadl.visible_gpn(), pages.gpn());
        assert!(!host.is_visible(pages.gpn()));

        // Without the flag the pages are shared even for a confidential
        // channel.
        let shared = client
            .create_gpadl(channel_id, one_page(&client), GpadlFlags::new())
            .unwrap();
        assert!(shared.is_host_visible());
    }

    fn open(client: &VmbusClient, channel_id: ChannelId, gpadl: &Gpadl) -> Result<(), OpenError> {
        client.open_channel(&OpenRequest {
            channel_id,
            ring_gpadl_id: gpadl.id(),
            downstream_ring_buffer_page_offset: 1,
            user_data: UserDefinedData::default(),
        })
    }

    #[test]
    fn open_failure_returns_to_offered() {
        let (host, client, channel_id) = connected(HostConfig::default());
        let ring = client
            .create_gpadl(channel_id, client.memory().allocate_pages(2).unwrap(), GpadlFlags::new())
            .unwrap();
        host.set_open_status(1);
        assert!(matches!(
            open(&client, channel_id, &ring),
            Err(OpenError::Failed(1))
        ));
        assert_eq!(client.channel_state(channel_id), Some(ChannelState::Offered));

        host.set_open_status(0);
        open(&client, channel_id, &ring).unwrap();
        assert_eq!(client.channel_state(channel_id), Some(ChannelState::Open));
        assert!(matches!(
            open(&client, channel_id, &ring),
            Err(OpenError::InvalidState(_, ChannelState::Open))
        ));
        assert!(matches!(
            client.destroy_gpadl(&ring),
            Err(GpadlError::InUse(_))
        ));

        client.close_channel(channel_id).unwrap();
        assert_eq!(client.channel_state(channel_id), Some(ChannelState::Closed));
        client.close_channel(channel_id).unwrap();
        client.destroy_gpadl(&ring).unwrap();
    }

    #[test]
    fn rescind_open_channel() {
        let (host, client, channel_id) = connected(HostConfig::default());
        let ring = client
            .create_gpadl(channel_id, client.memory().allocate_pages(2).unwrap(), GpadlFlags::new())
            .unwrap();
        open(&client, channel_id, &ring).unwrap();

        host.rescind(channel_id);
        client.handle_sint();
        assert_eq!(client.channel_state(channel_id), Some(ChannelState::Rescinded));
        assert!(client.offers().is_empty());
        assert!(matches!(
            client.create_gpadl(channel_id, one_page(&client), GpadlFlags::new()),
            Err(GpadlError::Rescinded(_))
        ));

        client.close_channel(channel_id).unwrap();
        assert!(host.released().is_empty());
        client.destroy_gpadl(&ring).unwrap();
        assert_eq!(host.released(), [channel_id]);
        assert_eq!(client.channel_state(channel_id), None);
    }

    #[test]
    fn rescind_idle_channel() {
        let (host, client, channel_id) = connected(HostConfig::default());
        host.rescind(channel_id);
        client.handle_sint();
        assert_eq!(host.released(), [channel_id]);
        assert_eq!(client.channel_state(channel_id), None);
    }

    #[test]
    fn channel_interrupts() {
        let (host, client, channel_id) = connected(HostConfig::default());
        let count = Arc::new(AtomicUsize::new(0));
        client
            .register_isr(channel_id, {
                let count = count.clone();
                Arc::new(move || {
                    count.fetch_add(1, Ordering::Relaxed);
                })
            })
            .unwrap();
        host.signal_guest(channel_id);
        client.handle_sint();
        client.handle_sint();
        assert_eq!(count.load(Ordering::Relaxed), 1);

        client.signal_channel(channel_id).unwrap();
        let connection_id = client.offer(channel_id).unwrap().offer.connection_id;
        assert_eq!(host.signal_count(connection_id), 1);

        client.unregister_isr(channel_id);
        host.signal_guest(channel_id);
        client.handle_sint();
        assert_eq!(count.load(Ordering::Relaxed), 1);
    }

    #[test]
    fn unload_ignores_other_messages() {
        let (host, client, channel_id) = connected(HostConfig::default());
        let _orphan = client
            .create_gpadl(channel_id, one_page(&client), GpadlFlags::new())
            .unwrap();
        host.offer(NETWORK_INTERFACE, OfferFlags::new());
        client.unload().unwrap();
        assert_eq!(client.version(), None);
        assert!(client.offers().is_empty());
        assert!(host.received().contains(&MessageType::UNLOAD));
        assert!(matches!(client.unload(), Err(RequestError::NotConnected)));
    }

    #[test]
    fn malformed_messages_are_dropped() {
        let (host, client, channel_id) = connected(HostConfig::default());
        host.inject(&[0xff; 4]);
        host.inject(&OutgoingMessage::new(&protocol::GpadlTorndown { gpadl_id: GpadlId(9) }).data()[..6]);
        client.handle_sint();
        assert_eq!(client.channel_state(channel_id), Some(ChannelState::Offered));
    }
}
