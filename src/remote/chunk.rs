//! Decoding of streamed remote-read responses: the chunked frame envelope
//! (uvarint length + CRC32-Castagnoli + protobuf payload) and the XOR chunk
//! encoding carried inside `ChunkedSeries`.

use bitstream_io::{BigEndian, BitWrite, BitWriter};
use crc::{Crc, CRC_32_ISCSI};
use nom::number::complete::be_f64;

use crate::common::encoding::{
    read_uvarint, read_varbit_ts, read_varint, write_uvarint, write_varbit_ts, write_varint,
    NomBitInput, XorState,
};
use crate::common::types::Sample;
use crate::error::{PsdError, PsdResult};

const CASTAGNOLI: Crc<u32> = Crc::<u32>::new(&CRC_32_ISCSI);

fn decode_err(what: &str) -> PsdError {
    PsdError::Decoding(format!("xor chunk: {what}"))
}

/// Decodes a Prometheus XOR chunk: a big-endian u16 sample count followed by
/// a bit stream of varint/varbit encoded samples.
pub fn decode_xor_chunk(data: &[u8]) -> PsdResult<Vec<Sample>> {
    if data.len() < 2 {
        return Err(decode_err("truncated header"));
    }
    let count = u16::from_be_bytes([data[0], data[1]]) as usize;
    let mut samples = Vec::with_capacity(count);
    if count == 0 {
        return Ok(samples);
    }

    // First sample: timestamp varint, value as raw 64-bit float.
    let input = &data[2..];
    let (input, mut timestamp) = read_varint(input).map_err(|_| decode_err("first timestamp"))?;
    let (input, first_value) =
        be_f64::<_, nom::error::Error<&[u8]>>(input).map_err(|_| decode_err("first value"))?;
    samples.push(Sample::new(timestamp, first_value));
    if count == 1 {
        return Ok(samples);
    }

    // Second sample: timestamp delta as uvarint (the stream is still
    // byte-aligned here), value xor-encoded against the first.
    let (input, mut delta) = read_uvarint(input).map_err(|_| decode_err("timestamp delta"))?;
    timestamp += delta as i64;
    let mut xor = XorState::with_value(first_value);
    let mut cursor: NomBitInput = (input, 0);
    let (rest, value) = xor.read(cursor).map_err(|_| decode_err("second value"))?;
    cursor = rest;
    samples.push(Sample::new(timestamp, value));

    // Remaining samples: delta-of-delta timestamps, xor-encoded values.
    for _ in 2..count {
        let (rest, dod) = read_varbit_ts(cursor).map_err(|_| decode_err("timestamp dod"))?;
        delta = (delta as i64 + dod) as u64;
        timestamp += delta as i64;

        let (rest, value) = xor.read(rest).map_err(|_| decode_err("value"))?;
        cursor = rest;
        samples.push(Sample::new(timestamp, value));
    }

    Ok(samples)
}

/// Encodes samples into the XOR chunk layout understood by
/// [`decode_xor_chunk`]. The write half exists for symmetry and tests; the
/// proxy and downsampler only ever decode.
pub fn encode_xor_chunk(samples: &[Sample]) -> PsdResult<Vec<u8>> {
    if samples.len() > u16::MAX as usize {
        return Err(PsdError::Encoding(format!(
            "xor chunk: too many samples ({})",
            samples.len()
        )));
    }

    let mut buf: Vec<u8> = Vec::with_capacity(2 + samples.len() * 4);
    buf.extend_from_slice(&(samples.len() as u16).to_be_bytes());
    let Some(head) = samples.first() else {
        return Ok(buf);
    };

    write_varint(head.timestamp, &mut buf)?;
    buf.extend_from_slice(&head.value.to_bits().to_be_bytes());
    if samples.len() == 1 {
        return Ok(buf);
    }

    let second = &samples[1];
    let mut delta = second
        .timestamp
        .checked_sub(head.timestamp)
        .filter(|d| *d >= 0)
        .ok_or_else(|| PsdError::Encoding("xor chunk: timestamps not ascending".into()))?;
    write_uvarint(delta as u64, &mut buf)?;

    let mut bits: Vec<u8> = Vec::new();
    let mut writer = BitWriter::endian(&mut bits, BigEndian);
    let mut xor = XorState::with_value(head.value);
    xor.write(second.value, &mut writer)?;
    let mut prev_timestamp = second.timestamp;

    for s in &samples[2..] {
        let new_delta = s.timestamp - prev_timestamp;
        write_varbit_ts(new_delta - delta, &mut writer)?;
        xor.write(s.value, &mut writer)?;
        delta = new_delta;
        prev_timestamp = s.timestamp;
    }
    writer.byte_align()?;
    buf.extend_from_slice(&bits);
    Ok(buf)
}

/// Splits a streamed read body into protobuf frames, verifying each frame's
/// Castagnoli checksum. Frame layout: uvarint payload size, 4-byte big-endian
/// CRC32 of the payload, payload bytes.
pub fn split_chunked_frames(mut body: &[u8]) -> PsdResult<Vec<&[u8]>> {
    let mut frames = Vec::new();
    while !body.is_empty() {
        let (rest, size) =
            read_uvarint(body).map_err(|_| PsdError::Decoding("chunked frame: size".into()))?;
        let size = size as usize;
        if rest.len() < 4 + size {
            return Err(PsdError::Decoding("chunked frame: truncated".into()));
        }
        let expected = u32::from_be_bytes([rest[0], rest[1], rest[2], rest[3]]);
        let payload = &rest[4..4 + size];
        if CASTAGNOLI.checksum(payload) != expected {
            return Err(PsdError::Decoding("chunked frame: checksum mismatch".into()));
        }
        frames.push(payload);
        body = &rest[4 + size..];
    }
    Ok(frames)
}

/// Builds a single stream frame around a payload. Test/tooling counterpart
/// of [`split_chunked_frames`].
pub fn encode_chunked_frame(payload: &[u8]) -> Vec<u8> {
    let mut out = Vec::with_capacity(payload.len() + 12);
    // write_uvarint on a Vec cannot fail
    let _ = write_uvarint(payload.len() as u64, &mut out);
    out.extend_from_slice(&CASTAGNOLI.checksum(payload).to_be_bytes());
    out.extend_from_slice(payload);
    out
}
