// Copyright (c) Microsoft Corporation.
// Licensed under the MIT License.

//! Provides the [`open_enum`] macro.

#![no_std]

/// Defines an "open" enumeration: a `#[repr(transparent)]` newtype over an
/// integer with one associated constant per known value.
///
/// Unlike a Rust `enum`, any value of the storage type is a valid instance,
/// which is what wire formats need: a peer may send a value this side does
/// not know about, and matching on it must not be undefined behavior.
///
/// The generated type derives `Copy`, `Clone`, `Eq`, `PartialEq`, `Hash`,
/// `Ord` and `PartialOrd`, implements `Debug` (printing the constant's name
/// when known), and has a `name()` method.
///
/// ```
/// open_enum::open_enum! {
///     pub enum Color: u8 {
///         #![expect(missing_docs)]
///         RED = 1,
///         GREEN = 2,
///     }
/// }
///
/// assert_eq!(Color::GREEN.0, 2);
/// assert_eq!(Color(1), Color::RED);
/// assert_eq!(Color(7).name(), None);
/// ```
#[macro_export]
macro_rules! open_enum {
    (
        $(#[$a:meta])*
        $v:vis enum $name:ident : $storage:ty {
            $(#![$implattr:meta])*
            $(
                $(#[$vattr:meta])*
                $variant:ident = $value:expr,
            )*
        }
    ) => {
        #[derive(Copy, Clone, Eq, PartialEq, Hash, Ord, PartialOrd)]
        #[repr(transparent)]
        $(#[$a])*
        $v struct $name(pub $storage);

        $(#[$implattr])*
        impl $name {
            $(
                $(#[$vattr])*
                pub const $variant: $name = $name($value);
            )*
        }

        impl $name {
            /// Returns the name of the constant with this value, if any.
            pub const fn name(&self) -> ::core::option::Option<&'static str> {
                $(
                    if self.0 == $name::$variant.0 {
                        return ::core::option::Option::Some(stringify!($variant));
                    }
                )*
                ::core::option::Option::None
            }
        }

        impl ::core::fmt::Debug for $name {
            fn fmt(&self, fmt: &mut ::core::fmt::Formatter<'_>) -> ::core::fmt::Result {
                match self.name() {
                    ::core::option::Option::Some(name) => fmt.pad(name),
                    ::core::option::Option::None => ::core::fmt::Debug::fmt(&self.0, fmt),
                }
            }
        }
    };
}

#[cfg(test)]
mod tests {
    extern crate std;
    use std::format;

    open_enum! {
        enum Kind: u16 {
            ALPHA = 6,
            BETA = 0xb,
        }
    }

    #[test]
    fn debug_names_known_values() {
        assert_eq!(format!("{:?}", Kind::ALPHA), "ALPHA");
        assert_eq!(format!("{:?}", Kind(11)), "BETA");
        assert_eq!(format!("{:?}", Kind(3)), "3");
    }

    #[test]
    fn unknown_values_round_trip() {
        let k = Kind(0x1234);
        assert_eq!(k.name(), None);
        assert_ne!(k, Kind::BETA);
        assert_eq!(k.0, 0x1234);
    }
}
