//! The two bit-level encodings carried inside Prometheus XOR chunks: the
//! bucketed delta-of-delta timestamp integers, and the XOR float stream
//! whose significant-bit window is threaded from sample to sample.

use bitstream_io::BitWrite;
use nom::{
    bits::complete::{bool, take},
    IResult,
};

use crate::common::encoding::NomBitInput;

/// Payload width per timestamp bucket. Bucket `i` is selected on the wire
/// by a prefix of `i` 1-bits; the closing 0 is dropped for the widest
/// bucket, whose prefix is already unambiguous.
const TS_PAYLOAD_BITS: [u8; 5] = [0, 14, 17, 20, 64];

/// Whether `value` is representable in a bucket of the given payload width.
/// Payloads are two's complement shifted by one: a width of `n` covers
/// `-(2^(n-1) - 1) ..= 2^(n-1)`.
fn fits_in(value: i64, payload_bits: u8) -> bool {
    match payload_bits {
        0 => value == 0,
        64 => true,
        bits => {
            let half = 1i64 << (bits - 1);
            value > -half && value <= half
        }
    }
}

fn payload_mask(bits: u8) -> u64 {
    if bits == 64 {
        u64::MAX
    } else {
        (1u64 << bits) - 1
    }
}

fn sign_extend(raw: u64, bits: u8) -> i64 {
    let mut value = raw as i64;
    if bits < 64 && value > 1 << (bits - 1) {
        value -= 1 << bits;
    }
    value
}

/// Writes an i64 into the narrowest timestamp bucket that holds it.
pub fn write_varbit_ts<W: BitWrite>(value: i64, writer: &mut W) -> std::io::Result<()> {
    let bucket = TS_PAYLOAD_BITS
        .iter()
        .position(|&bits| fits_in(value, bits))
        .unwrap_or(TS_PAYLOAD_BITS.len() - 1);

    for _ in 0..bucket {
        writer.write_bit(true)?;
    }
    if bucket + 1 < TS_PAYLOAD_BITS.len() {
        writer.write_bit(false)?;
    }

    let bits = TS_PAYLOAD_BITS[bucket];
    if bits > 0 {
        writer.write(bits as u32, value as u64 & payload_mask(bits))?;
    }
    Ok(())
}

/// Reads a bucketed timestamp integer from the bit input.
pub fn read_varbit_ts(input: NomBitInput) -> IResult<NomBitInput, i64> {
    let mut rest = input;
    let mut bucket = 0usize;
    while bucket < TS_PAYLOAD_BITS.len() - 1 {
        let (r, one) = bool(rest)?;
        rest = r;
        if !one {
            break;
        }
        bucket += 1;
    }

    let bits = TS_PAYLOAD_BITS[bucket];
    if bits == 0 {
        return Ok((rest, 0));
    }
    let (rest, raw): (_, u64) = take(bits)(rest)?;
    Ok((rest, sign_extend(raw, bits)))
}

/// Running state of the XOR float codec: the previous value plus the
/// leading/trailing bit window of the last explicitly encoded delta. The
/// same state drives both directions; feed it every sample in order.
#[derive(Debug, Clone, Copy)]
pub struct XorState {
    value: f64,
    leading: u8,
    trailing: u8,
    window_set: bool,
}

impl XorState {
    /// Starts the codec at a known value, usually a chunk's first sample
    /// (which is stored raw, outside this encoding).
    pub fn with_value(value: f64) -> XorState {
        XorState {
            value,
            leading: 0,
            trailing: 0,
            window_set: false,
        }
    }

    /// Encodes the next value: one 0 bit when nothing changed, otherwise
    /// the XOR delta inside the reused or re-declared bit window.
    pub fn write<W: BitWrite>(&mut self, value: f64, writer: &mut W) -> std::io::Result<()> {
        let delta = value.to_bits() ^ self.value.to_bits();
        self.value = value;

        if delta == 0 {
            return writer.write_bit(false);
        }
        writer.write_bit(true)?;

        // leading count is stored in 5 bits, so 31 is the ceiling
        let leading = delta.leading_zeros().min(31) as u8;
        let trailing = delta.trailing_zeros() as u8;

        if self.window_set && leading >= self.leading && trailing >= self.trailing {
            writer.write_bit(false)?;
            let width = 64u32 - self.leading as u32 - self.trailing as u32;
            return writer.write(width, delta >> self.trailing);
        }

        self.leading = leading;
        self.trailing = trailing;
        self.window_set = true;

        writer.write_bit(true)?;
        writer.write(5, leading)?;
        let width = 64u64 - leading as u64 - trailing as u64;
        // the 6-bit width field encodes 64 as 0; a zero-width delta took
        // the "unchanged" branch already
        writer.write(6, width & 0x3f)?;
        writer.write(width as u32, delta >> trailing)?;
        Ok(())
    }

    /// Decodes the next value from the bit input.
    pub fn read<'a>(&mut self, input: NomBitInput<'a>) -> IResult<NomBitInput<'a>, f64> {
        let (rest, changed) = bool(input)?;
        if !changed {
            return Ok((rest, self.value));
        }

        let (rest, new_window) = bool(rest)?;
        let mut rest = rest;
        if new_window {
            let (r, leading): (_, u8) = take(5usize)(rest)?;
            let (r, width_code): (_, u8) = take(6usize)(r)?;
            let width = if width_code == 0 { 64 } else { width_code };
            if leading as u16 + width as u16 > 64 {
                return Err(nom::Err::Error(nom::error::Error::new(
                    r,
                    nom::error::ErrorKind::Verify,
                )));
            }
            self.leading = leading;
            self.trailing = 64 - leading - width;
            self.window_set = true;
            rest = r;
        }

        let width = 64 - self.leading - self.trailing;
        let (rest, bits): (NomBitInput, u64) = take(width)(rest)?;
        self.value = f64::from_bits(self.value.to_bits() ^ (bits << self.trailing));
        Ok((rest, self.value))
    }
}
