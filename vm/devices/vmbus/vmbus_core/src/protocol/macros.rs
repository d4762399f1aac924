// Copyright (c) Microsoft Corporation.
// Licensed under the MIT License.

/// Generates, from one table of control messages:
///
/// * the `MessageType` open enum,
/// * the borrowed `Message` enum and its `parse` function,
/// * a `VmbusMessage` impl per struct, with a compile-time check that the
///   message fits in a SynIC message.
///
/// Each row is `number NAME { Struct min_version [check_size:true], ... }`.
/// Variants of one message type are tried in order; `check_size:true` lets a
/// shorter message fall through to the next (older) variant instead of
/// failing. A `min_version` of `0` means the message is accepted before a
/// version has been negotiated.
macro_rules! vmbus_messages {
    (
        pub enum $message:ident, $message_type:ident {
            $(
                $num:literal $name:ident {
                    $( $ty:ident $min_version:tt $(check_size:$check:tt)? ),* $(,)?
                },
            )*
        }
    ) => {
        open_enum! {
            /// The type field of a control message header.
            #[derive(IntoBytes, FromBytes, Immutable, KnownLayout)]
            pub enum $message_type: u32 {
                #![expect(missing_docs)]
                $($name = $num,)*
            }
        }

        /// A parsed control message, borrowing any trailing data from the
        /// input.
        #[derive(Debug)]
        #[expect(missing_docs)]
        pub enum $message<'a> {
            $($($ty($ty, &'a [u8]),)*)*
        }

        impl<'a> $message<'a> {
            /// Parses a control message.
            ///
            /// Messages whose minimum version is above `version` are
            /// rejected as [`ParseError::InvalidMessageType`]. Pass `None`
            /// before a version has been negotiated.
            pub fn parse(data: &'a [u8], version: Option<Version>) -> Result<Self, ParseError> {
                let (header, data) = MessageHeader::read_from_prefix(data)
                    .map_err(|_| ParseError::MessageTooSmall(None))?;

                let message = match header.message_type {
                    $($(
                        $message_type::$name
                            if version >= vmbus_messages!(@version $min_version)
                                $(&& vmbus_messages!(@check_size $check $ty data))? =>
                        {
                            let (message, rest) = $ty::read_from_prefix(data)
                                .map_err(|_| ParseError::MessageTooSmall(Some(header.message_type)))?;
                            Self::$ty(message, rest)
                        }
                    )*)*
                    other => return Err(ParseError::InvalidMessageType(other)),
                };
                Ok(message)
            }

            /// The message type this variant was parsed from.
            pub fn message_type(&self) -> $message_type {
                match self {
                    $($(Self::$ty(..) => $message_type::$name,)*)*
                }
            }
        }

        $($(
            impl VmbusMessage for $ty {
                const MESSAGE_TYPE: $message_type = $message_type::$name;
            }

            static_assertions::const_assert!($ty::MESSAGE_SIZE <= MAX_MESSAGE_SIZE);
        )*)*
    };

    (@version 0) => { None };
    (@version $version:ident) => { Some(Version::$version) };
    (@check_size true $ty:ident $data:ident) => { $data.len() >= size_of::<$ty>() };
}
