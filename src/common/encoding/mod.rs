mod varbit;
mod varint;

/// Bit-level input cursor as consumed by nom's bit parsers.
pub type NomBitInput<'a> = (&'a [u8], usize);

pub use varbit::*;
pub use varint::*;
