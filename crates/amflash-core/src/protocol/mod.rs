//! Wire-level definitions shared by the two flashing paths.

pub mod constants;
pub mod packets;
pub mod xmodem;
