//! Prost message structs for the subset of the Trezor schema this crate speaks.
//!
//! Field tags follow the firmware's `messages-*.proto` definitions.

pub mod bitcoin;
pub mod ethereum;
pub mod management;

pub use bitcoin::*;
pub use ethereum::*;
pub use management::*;

/// A schema message that can travel through a [`crate::DeviceSession`].
///
/// `NAME` is the key the [`crate::MessageRegistry`] resolves to a type code.
pub trait DeviceMessage: prost::Message + Default {
    const NAME: &'static str;
}

macro_rules! device_messages {
    ($($ty:ident),* $(,)?) => {
        $(
            impl $crate::messages::DeviceMessage for $ty {
                const NAME: &'static str = stringify!($ty);
            }
        )*
    };
}

pub(crate) use device_messages;
