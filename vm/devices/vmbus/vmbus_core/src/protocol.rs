// Copyright (c) Microsoft Corporation.
// Licensed under the MIT License.

//! Wire definitions for the VMBus control protocol.
//!
//! Every control message is a [`MessageHeader`] followed by a fixed-size
//! structure and, for some messages, trailing data. Messages are exchanged
//! through the SynIC message port and are at most [`MAX_MESSAGE_SIZE`]
//! bytes.

use bitfield_struct::bitfield;
use guid::Guid;
use open_enum::open_enum;
use std::fmt;
use std::mem::size_of;
use std::ops::BitAnd;
use std::ops::Deref;
use std::ops::DerefMut;
use thiserror::Error;
use zerocopy::FromBytes;
use zerocopy::FromZeros;
use zerocopy::Immutable;
use zerocopy::IntoBytes;
use zerocopy::KnownLayout;

#[macro_use]
mod macros;

/// The NTSTATUS reported by the host for success.
pub const STATUS_SUCCESS: i32 = 0;
/// A generic NTSTATUS failure, used by the host for refused requests.
pub const STATUS_UNSUCCESSFUL: i32 = 0x8000ffff_u32 as i32;

/// The size of [`MessageHeader`].
pub const HEADER_SIZE: usize = size_of::<MessageHeader>();
/// The SynIC message payload size, which bounds every control message.
pub const MAX_MESSAGE_SIZE: usize = 240;

/// The connection ID control messages are posted to.
pub const MESSAGE_CONNECTION_ID: u32 = 1;
/// The SynIC message type used for VMBus control messages.
pub const SYNIC_MESSAGE_TYPE: u32 = 1;
/// The SINT the host targets with control messages and channel interrupts.
pub const VMBUS_SINT: u8 = 2;
/// The number of event flags in a SynIC event flags page, which bounds
/// channel IDs.
pub const MAX_CHANNELS: u32 = 2048;

vmbus_messages! {
    pub enum Message, MessageType {
        1 OFFER_CHANNEL { OfferChannel V1 },
        2 RESCIND_CHANNEL_OFFER { RescindChannelOffer V1 },
        3 REQUEST_OFFERS { RequestOffers V1 },
        4 ALL_OFFERS_DELIVERED { AllOffersDelivered V1 },
        5 OPEN_CHANNEL { OpenChannel V1 },
        6 OPEN_CHANNEL_RESULT { OpenResult V1 },
        7 CLOSE_CHANNEL { CloseChannel V1 },
        8 GPADL_HEADER { GpadlHeader V1 },
        9 GPADL_BODY { GpadlBody V1 },
        10 GPADL_CREATED { GpadlCreated V1 },
        11 GPADL_TEARDOWN { GpadlTeardown V1 },
        12 GPADL_TORNDOWN { GpadlTorndown V1 },
        13 REL_ID_RELEASED { RelIdReleased V1 },
        // The version is not known yet when these two arrive, and the longer
        // form is only distinguishable by size.
        14 INITIATE_CONTACT {
            InitiateContact2 0 check_size:true,
            InitiateContact 0
        },
        15 VERSION_RESPONSE {
            VersionResponse2 0 check_size:true,
            VersionResponse 0
        },
        16 UNLOAD { Unload 0 },
        17 UNLOAD_COMPLETE { UnloadComplete 0 },
    }
}

/// An error parsing a control message.
#[derive(Debug, Error)]
pub enum ParseError {
    /// The message is shorter than its type requires.
    #[error("message too small: {0:?}")]
    MessageTooSmall(Option<MessageType>),
    /// The type is unknown or not valid at the negotiated version.
    #[error("unexpected or unsupported message type: {0:?}")]
    InvalidMessageType(MessageType),
}

/// Implemented by every control message structure.
pub trait VmbusMessage: Sized {
    /// The message type written to the header.
    const MESSAGE_TYPE: MessageType;
    /// The size of the message including its header.
    const MESSAGE_SIZE: usize = HEADER_SIZE + size_of::<Self>();
}

/// The header that starts every control message.
#[repr(C)]
#[derive(Copy, Clone, Debug, Eq, PartialEq, IntoBytes, FromBytes, Immutable, KnownLayout)]
pub struct MessageHeader {
    message_type: MessageType,
    padding: u32,
}

impl MessageHeader {
    /// A header for `message_type`.
    pub fn new(message_type: MessageType) -> Self {
        Self {
            message_type,
            padding: 0,
        }
    }

    /// The message type.
    pub fn message_type(&self) -> MessageType {
        self.message_type
    }
}

/// Builds a protocol version number.
pub const fn make_version(major: u16, minor: u16) -> u32 {
    ((major as u32) << 16) | (minor as u32)
}

/// Protocol versions, in increasing order.
#[repr(u32)]
#[derive(Copy, Clone, Debug, PartialEq, Eq, PartialOrd, Ord, Hash)]
#[expect(missing_docs)]
pub enum Version {
    V1 = make_version(0, 13),
    Win7 = make_version(1, 1),
    Win8 = make_version(2, 4),
    Win8_1 = make_version(3, 0),
    Win10 = make_version(4, 0),
    Win10Rs3_0 = make_version(4, 1),
    Win10Rs3_1 = make_version(5, 0),
    Win10Rs4 = make_version(5, 1),
    Win10Rs5 = make_version(5, 2),
    Iron = make_version(5, 3),
    Copper = make_version(6, 0),
}

impl Version {
    /// Every known version, oldest first.
    pub const ALL: [Version; 11] = [
        Version::V1,
        Version::Win7,
        Version::Win8,
        Version::Win8_1,
        Version::Win10,
        Version::Win10Rs3_0,
        Version::Win10Rs3_1,
        Version::Win10Rs4,
        Version::Win10Rs5,
        Version::Iron,
        Version::Copper,
    ];

    /// Returns true if this version carries feature flags and a client ID in
    /// `InitiateContact` and supported features in `VersionResponse`.
    pub fn has_feature_flags(self) -> bool {
        self >= Version::Copper
    }
}

impl TryFrom<u32> for Version {
    type Error = u32;

    fn try_from(value: u32) -> Result<Self, Self::Error> {
        Version::ALL
            .into_iter()
            .find(|v| *v as u32 == value)
            .ok_or(value)
    }
}

impl fmt::Display for Version {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let v = *self as u32;
        write!(f, "{}.{}", v >> 16, v & 0xffff)
    }
}

/// Optional protocol features, negotiated at [`Version::Copper`] and above.
#[bitfield(u32)]
#[derive(IntoBytes, FromBytes, Immutable, KnownLayout, PartialEq, Eq)]
pub struct FeatureFlags {
    /// The guest may choose the event flag and connection ID on open.
    pub guest_specified_signal_parameters: bool,
    /// The open request may redirect the channel interrupt.
    pub channel_interrupt_redirection: bool,
    /// The connection's monitor pages may be changed.
    pub modify_connection: bool,
    /// `InitiateContact` carries a client ID identifying the guest software.
    pub client_id: bool,
    /// Offers may ask for encrypted ring buffers and external memory.
    pub confidential_channels: bool,
    #[bits(27)]
    _reserved: u32,
}

impl FeatureFlags {
    /// Every flag this crate knows about.
    pub const fn all() -> Self {
        Self::new()
            .with_guest_specified_signal_parameters(true)
            .with_channel_interrupt_redirection(true)
            .with_modify_connection(true)
            .with_client_id(true)
            .with_confidential_channels(true)
    }
}

impl BitAnd for FeatureFlags {
    type Output = Self;

    fn bitand(self, rhs: Self) -> Self {
        Self::from_bits(self.into_bits() & rhs.into_bits())
    }
}

/// Interpretation of [`InitiateContact::interrupt_page_or_target_info`].
#[bitfield(u64)]
pub struct TargetInfo {
    /// The SINT the host should target with control messages.
    pub sint: u8,
    /// The VTL the host should target.
    pub vtl: u8,
    _padding: u16,
    /// The requested [`FeatureFlags`], at [`Version::Copper`] and above.
    pub feature_flags: u32,
}

open_enum! {
    /// The `connection_state` of a [`VersionResponse`].
    #[derive(IntoBytes, FromBytes, Immutable, KnownLayout)]
    pub enum ConnectionState: u8 {
        #![expect(missing_docs)]
        SUCCESSFUL = 0,
        FAILED_LOW_RESOURCES = 1,
        FAILED_UNKNOWN_FAILURE = 2,
    }
}

/// A host-assigned channel ID (the "child relative ID").
#[repr(transparent)]
#[derive(
    Copy,
    Clone,
    Debug,
    Eq,
    PartialEq,
    Ord,
    PartialOrd,
    Hash,
    IntoBytes,
    FromBytes,
    Immutable,
    KnownLayout,
)]
pub struct ChannelId(pub u32);

impl fmt::Display for ChannelId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        self.0.fmt(f)
    }
}

/// A guest-assigned GPADL handle. Zero is never a valid handle.
#[repr(transparent)]
#[derive(
    Copy,
    Clone,
    Debug,
    Eq,
    PartialEq,
    Ord,
    PartialOrd,
    Hash,
    IntoBytes,
    FromBytes,
    Immutable,
    KnownLayout,
)]
pub struct GpadlId(pub u32);

impl fmt::Display for GpadlId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{:#x}", self.0)
    }
}

/// Sent by the guest to propose a protocol version.
#[repr(C)]
#[derive(Copy, Clone, Debug, Eq, PartialEq, IntoBytes, FromBytes, Immutable, KnownLayout)]
#[expect(missing_docs)]
pub struct InitiateContact {
    pub version_requested: u32,
    pub target_message_vp: u32,
    /// A [`TargetInfo`].
    pub interrupt_page_or_target_info: u64,
    pub parent_to_child_monitor_page_gpa: u64,
    pub child_to_parent_monitor_page_gpa: u64,
}

/// `InitiateContact` as sent at [`Version::Copper`] and above.
#[repr(C)]
#[derive(Copy, Clone, Debug, Eq, PartialEq, IntoBytes, FromBytes, Immutable, KnownLayout)]
#[expect(missing_docs)]
pub struct InitiateContact2 {
    pub initiate_contact: InitiateContact,
    pub client_id: Guid,
}

#[repr(C)]
#[derive(Copy, Clone, Debug, Eq, PartialEq, IntoBytes, FromBytes, Immutable, KnownLayout)]
#[expect(missing_docs)]
pub struct VersionResponse {
    pub version_supported: u8,
    pub connection_state: ConnectionState,
    pub padding: u16,
    pub selected_version_or_connection_id: u32,
}

/// `VersionResponse` as sent for a supported [`Version::Copper`] or later
/// request. Refusals always use the short form.
#[repr(C)]
#[derive(Copy, Clone, Debug, Eq, PartialEq, IntoBytes, FromBytes, Immutable, KnownLayout)]
#[expect(missing_docs)]
pub struct VersionResponse2 {
    pub version_response: VersionResponse,
    pub supported_features: u32,
}

impl From<VersionResponse> for VersionResponse2 {
    fn from(value: VersionResponse) -> Self {
        Self {
            version_response: value,
            supported_features: 0,
        }
    }
}

/// Device-defined data carried by offers and open requests.
#[repr(C, align(4))]
#[derive(Copy, Clone, Debug, PartialEq, Eq, IntoBytes, FromBytes, Immutable, KnownLayout)]
pub struct UserDefinedData(pub [u8; 120]);

impl Default for UserDefinedData {
    fn default() -> Self {
        Self::new_zeroed()
    }
}

impl Deref for UserDefinedData {
    type Target = [u8; 120];

    fn deref(&self) -> &Self::Target {
        &self.0
    }
}

impl DerefMut for UserDefinedData {
    fn deref_mut(&mut self) -> &mut Self::Target {
        &mut self.0
    }
}

/// Flags describing an offered channel.
#[bitfield(u16)]
#[derive(IntoBytes, FromBytes, Immutable, KnownLayout, PartialEq, Eq)]
pub struct OfferFlags {
    /// The guest should expose a device interface for the channel.
    pub enumerate_device_interface: bool, // 0x1
    /// The ring buffer must stay encrypted on an isolated VM.
    pub confidential_ring_buffer: bool, // 0x2
    /// Additional GPADLs and GPA direct ranges must stay encrypted on an
    /// isolated VM.
    pub confidential_external_memory: bool, // 0x4
    #[bits(1)]
    _reserved1: u16,
    /// In-band payloads are framed with a pipe header.
    pub named_pipe_mode: bool, // 0x10
    #[bits(8)]
    _reserved2: u16,
    /// The channel provides a transport-layer named pipe.
    pub tlnpi_provider: bool, // 0x2000
    #[bits(2)]
    _reserved3: u16,
}

#[repr(C)]
#[derive(Copy, Clone, Debug, PartialEq, Eq, IntoBytes, FromBytes, Immutable, KnownLayout)]
#[expect(missing_docs)]
pub struct OfferChannel {
    pub interface_id: Guid,
    pub instance_id: Guid,
    pub rsvd: [u32; 4],
    pub flags: OfferFlags,
    pub mmio_megabytes: u16,
    pub user_defined: UserDefinedData,
    pub subchannel_index: u16,
    pub mmio_megabytes_optional: u16,
    pub channel_id: ChannelId,
    pub monitor_id: u8,
    pub monitor_allocated: u8,
    pub is_dedicated: u16,
    /// The connection ID to signal for this channel's interrupts.
    pub connection_id: u32,
}

#[repr(C)]
#[derive(Copy, Clone, Debug, PartialEq, Eq, IntoBytes, FromBytes, Immutable, KnownLayout)]
#[expect(missing_docs)]
pub struct RescindChannelOffer {
    pub channel_id: ChannelId,
}

/// Followed by `len` bytes of GPA ranges, the first of which are in this
/// message and the rest in [`GpadlBody`] messages.
#[repr(C)]
#[derive(Copy, Clone, Debug, IntoBytes, FromBytes, Immutable, KnownLayout)]
#[expect(missing_docs)]
pub struct GpadlHeader {
    pub channel_id: ChannelId,
    pub gpadl_id: GpadlId,
    pub len: u16,
    pub count: u16,
}

impl GpadlHeader {
    /// The number of u64 values that fit after the header in one message.
    pub const MAX_DATA_VALUES: usize = (MAX_MESSAGE_SIZE - Self::MESSAGE_SIZE) / size_of::<u64>();
}

#[repr(C)]
#[derive(Copy, Clone, Debug, IntoBytes, FromBytes, Immutable, KnownLayout)]
#[expect(missing_docs)]
pub struct GpadlBody {
    /// The body message's sequence number. Not interpreted by hosts.
    pub rsvd: u32,
    pub gpadl_id: GpadlId,
}

impl GpadlBody {
    /// The number of u64 values that fit after the body header in one
    /// message.
    pub const MAX_DATA_VALUES: usize = (MAX_MESSAGE_SIZE - Self::MESSAGE_SIZE) / size_of::<u64>();
}

#[repr(C)]
#[derive(Copy, Clone, Debug, Eq, PartialEq, IntoBytes, FromBytes, Immutable, KnownLayout)]
#[expect(missing_docs)]
pub struct GpadlCreated {
    pub channel_id: ChannelId,
    pub gpadl_id: GpadlId,
    pub status: i32,
}

#[repr(C)]
#[derive(Copy, Clone, Debug, Eq, PartialEq, IntoBytes, FromBytes, Immutable, KnownLayout)]
#[expect(missing_docs)]
pub struct GpadlTeardown {
    pub channel_id: ChannelId,
    pub gpadl_id: GpadlId,
}

#[repr(C)]
#[derive(Copy, Clone, Debug, Eq, PartialEq, IntoBytes, FromBytes, Immutable, KnownLayout)]
#[expect(missing_docs)]
pub struct GpadlTorndown {
    pub gpadl_id: GpadlId,
}

#[repr(C)]
#[derive(Copy, Clone, Debug, Eq, PartialEq, IntoBytes, FromBytes, Immutable, KnownLayout)]
#[expect(missing_docs)]
pub struct OpenChannel {
    pub channel_id: ChannelId,
    pub open_id: u32,
    pub ring_buffer_gpadl_id: GpadlId,
    pub target_vp: u32,
    /// The page offset of the host-to-guest ring within the ring GPADL.
    pub downstream_ring_buffer_page_offset: u32,
    pub user_data: UserDefinedData,
}

#[repr(C)]
#[derive(Copy, Clone, Debug, Eq, PartialEq, IntoBytes, FromBytes, Immutable, KnownLayout)]
#[expect(missing_docs)]
pub struct OpenResult {
    pub channel_id: ChannelId,
    pub open_id: u32,
    pub status: u32,
}

#[repr(C)]
#[derive(Copy, Clone, Debug, Eq, PartialEq, IntoBytes, FromBytes, Immutable, KnownLayout)]
#[expect(missing_docs)]
pub struct CloseChannel {
    pub channel_id: ChannelId,
}

#[repr(C)]
#[derive(Copy, Clone, Debug, Eq, PartialEq, IntoBytes, FromBytes, Immutable, KnownLayout)]
#[expect(missing_docs)]
pub struct RelIdReleased {
    pub channel_id: ChannelId,
}

// Header-only messages.

#[repr(C)]
#[derive(Copy, Clone, Debug, Eq, PartialEq, IntoBytes, FromBytes, Immutable, KnownLayout)]
#[expect(missing_docs)]
pub struct RequestOffers {}

#[repr(C)]
#[derive(Copy, Clone, Debug, Eq, PartialEq, IntoBytes, FromBytes, Immutable, KnownLayout)]
#[expect(missing_docs)]
pub struct AllOffersDelivered {}

#[repr(C)]
#[derive(Copy, Clone, Debug, Eq, PartialEq, IntoBytes, FromBytes, Immutable, KnownLayout)]
#[expect(missing_docs)]
pub struct Unload {}

#[repr(C)]
#[derive(Copy, Clone, Debug, Eq, PartialEq, IntoBytes, FromBytes, Immutable, KnownLayout)]
#[expect(missing_docs)]
pub struct UnloadComplete {}

#[cfg(test)]
mod tests {
    use super::*;
    use test_with_tracing::test;

    #[test]
    fn layouts() {
        assert_eq!(size_of::<OfferChannel>(), 188);
        assert_eq!(size_of::<OpenChannel>(), 140);
        assert_eq!(size_of::<InitiateContact>(), 32);
        assert_eq!(size_of::<InitiateContact2>(), 48);
        assert_eq!(size_of::<VersionResponse2>(), 12);
        // Room for the range header and 26 PFNs in the first message, 28 in
        // each continuation.
        assert_eq!(GpadlHeader::MAX_DATA_VALUES, 27);
        assert_eq!(GpadlBody::MAX_DATA_VALUES, 28);
    }

    #[test]
    fn parse_version_response_by_size() {
        let short = VersionResponse {
            version_supported: 1,
            connection_state: ConnectionState::SUCCESSFUL,
            padding: 0,
            selected_version_or_connection_id: 1,
        };
        let mut data = MessageHeader::new(MessageType::VERSION_RESPONSE)
            .as_bytes()
            .to_vec();
        data.extend_from_slice(short.as_bytes());
        assert!(matches!(
            Message::parse(&data, None).unwrap(),
            Message::VersionResponse(r, _) if r == short
        ));

        data.extend_from_slice(&0x18u32.to_le_bytes());
        match Message::parse(&data, None).unwrap() {
            Message::VersionResponse2(r, rest) => {
                assert_eq!(r.version_response, short);
                assert_eq!(r.supported_features, 0x18);
                assert!(rest.is_empty());
            }
            m => panic!("unexpected {m:?}"),
        }
    }

    #[test]
    fn parse_gates_on_version() {
        let data = [
            MessageHeader::new(MessageType::RESCIND_CHANNEL_OFFER).as_bytes(),
            ChannelId(4).as_bytes(),
        ]
        .concat();
        assert!(matches!(
            Message::parse(&data, None),
            Err(ParseError::InvalidMessageType(MessageType::RESCIND_CHANNEL_OFFER))
        ));
        let m = Message::parse(&data, Some(Version::Win10)).unwrap();
        assert_eq!(m.message_type(), MessageType::RESCIND_CHANNEL_OFFER);
    }

    #[test]
    fn parse_rejects_truncated() {
        let data = [
            MessageHeader::new(MessageType::GPADL_CREATED).as_bytes(),
            &[0; 4],
        ]
        .concat();
        assert!(matches!(
            Message::parse(&data, Some(Version::Copper)),
            Err(ParseError::MessageTooSmall(Some(MessageType::GPADL_CREATED)))
        ));
        assert!(matches!(
            Message::parse(&[1, 0], None),
            Err(ParseError::MessageTooSmall(None))
        ));
        let unknown = MessageHeader::new(MessageType(99));
        assert!(matches!(
            Message::parse(unknown.as_bytes(), Some(Version::Copper)),
            Err(ParseError::InvalidMessageType(MessageType(99)))
        ));
    }

    #[test]
    fn versions() {
        assert_eq!(Version::try_from(0x60000), Ok(Version::Copper));
        assert_eq!(Version::try_from(0x60001), Err(0x60001));
        assert_eq!(Version::Win8_1.to_string(), "3.0");
        assert!(Version::Copper.has_feature_flags());
        assert!(!Version::Iron.has_feature_flags());
    }
}
