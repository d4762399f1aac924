// Copyright (c) Microsoft Corporation.
// Licensed under the MIT License.

//! Types shared by both ends of the VMBus control protocol.

#![forbid(unsafe_code)]

pub mod protocol;

use protocol::HEADER_SIZE;
use protocol::MAX_MESSAGE_SIZE;
use protocol::MessageHeader;
use protocol::VmbusMessage;
use zerocopy::Immutable;
use zerocopy::IntoBytes;
use zerocopy::KnownLayout;

/// A negotiated protocol version and feature set.
#[derive(Copy, Clone, Debug, PartialEq, Eq)]
pub struct VersionInfo {
    /// The agreed version.
    pub version: protocol::Version,
    /// The features both sides support.
    pub feature_flags: protocol::FeatureFlags,
}

/// A control message ready to be posted to the SynIC message port.
#[derive(Clone)]
pub struct OutgoingMessage {
    data: [u8; MAX_MESSAGE_SIZE],
    len: u8,
}

impl OutgoingMessage {
    /// Encodes `message` with its header.
    pub fn new<T: IntoBytes + Immutable + KnownLayout + VmbusMessage>(message: &T) -> Self {
        Self::with_data(message, &[])
    }

    /// Encodes `message` with its header, followed by `data`.
    ///
    /// Panics if the result does not fit in a SynIC message. Callers size
    /// trailing data with the message type's `MAX_DATA_VALUES`.
    pub fn with_data<T: IntoBytes + Immutable + KnownLayout + VmbusMessage>(
        message: &T,
        data: &[u8],
    ) -> Self {
        let header = MessageHeader::new(T::MESSAGE_TYPE);
        let body = message.as_bytes();
        let len = HEADER_SIZE + body.len() + data.len();
        assert!(len <= MAX_MESSAGE_SIZE, "message too large: {len}");
        let mut buf = [0; MAX_MESSAGE_SIZE];
        buf[..HEADER_SIZE].copy_from_slice(header.as_bytes());
        buf[HEADER_SIZE..HEADER_SIZE + body.len()].copy_from_slice(body);
        buf[HEADER_SIZE + body.len()..len].copy_from_slice(data);
        Self {
            data: buf,
            len: len as u8,
        }
    }

    /// The encoded message.
    pub fn data(&self) -> &[u8] {
        &self.data[..self.len as usize]
    }
}

impl std::fmt::Debug for OutgoingMessage {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("OutgoingMessage")
            .field("data", &self.data())
            .finish()
    }
}

impl PartialEq for OutgoingMessage {
    fn eq(&self, other: &Self) -> bool {
        self.data() == other.data()
    }
}
