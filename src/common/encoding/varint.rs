//! Golang-compatible base-128 varints. Unsigned values are seven payload
//! bits per byte, least significant group first, high bit as continuation;
//! signed values are zigzag-folded onto the unsigned encoding.

use nom::IResult;

const MAX_ENCODED_LEN: usize = 10;

fn too_large(input: &[u8]) -> nom::Err<nom::error::Error<&[u8]>> {
    nom::Err::Error(nom::error::Error::new(input, nom::error::ErrorKind::TooLarge))
}

/// Write a u64 as a Golang uvarint.
pub fn write_uvarint<W: std::io::Write>(mut value: u64, writer: &mut W) -> std::io::Result<()> {
    loop {
        let group = (value & 0x7f) as u8;
        value >>= 7;
        if value == 0 {
            return writer.write_all(&[group]);
        }
        writer.write_all(&[group | 0x80])?;
    }
}

/// Parses a Golang uvarint. Encodings longer than ten bytes, and ten-byte
/// encodings whose last group overflows a u64, are rejected.
pub fn read_uvarint(input: &[u8]) -> IResult<&[u8], u64> {
    let mut value = 0u64;
    for (idx, &byte) in input.iter().enumerate() {
        if idx == MAX_ENCODED_LEN {
            return Err(too_large(input));
        }
        let group = (byte & 0x7f) as u64;
        // the tenth group holds bit 63 only
        if idx == MAX_ENCODED_LEN - 1 && group > 1 {
            return Err(too_large(input));
        }
        value |= group << (7 * idx);
        if byte & 0x80 == 0 {
            return Ok((&input[idx + 1..], value));
        }
    }
    Err(nom::Err::Error(nom::error::Error::new(
        input,
        nom::error::ErrorKind::Eof,
    )))
}

fn zigzag(value: i64) -> u64 {
    ((value << 1) ^ (value >> 63)) as u64
}

fn unzigzag(raw: u64) -> i64 {
    ((raw >> 1) as i64) ^ -((raw & 1) as i64)
}

/// Write an i64 as a Golang zigzag varint.
pub fn write_varint<W: std::io::Write>(value: i64, writer: &mut W) -> std::io::Result<()> {
    write_uvarint(zigzag(value), writer)
}

/// Parses a Golang zigzag varint.
pub fn read_varint(input: &[u8]) -> IResult<&[u8], i64> {
    let (rest, raw) = read_uvarint(input)?;
    Ok((rest, unzigzag(raw)))
}

#[cfg(test)]
mod tests {
    use super::*;
    use rand::{Rng, SeedableRng};

    #[test]
    fn test_uvarint_known_encodings() {
        for (bytes, expected) in [
            (&b"\x00"[..], 0u64),
            (&b"\x05"[..], 5),
            (&b"\x7f"[..], 127),
            (&b"\x80\x01"[..], 128),
            (&b"\x96\x01"[..], 150),
            (&b"\xe5\x8e\x26"[..], 624_485),
        ] {
            let (rest, value) = read_uvarint(bytes).unwrap();
            assert_eq!(value, expected);
            assert!(rest.is_empty());
        }
    }

    #[test]
    fn test_zigzag_folding() {
        for (signed, folded) in [(0i64, 0u64), (-1, 1), (1, 2), (-2, 3), (2, 4)] {
            assert_eq!(zigzag(signed), folded);
            assert_eq!(unzigzag(folded), signed);
        }
        assert_eq!(unzigzag(zigzag(i64::MIN)), i64::MIN);
        assert_eq!(unzigzag(zigzag(i64::MAX)), i64::MAX);
    }

    #[test]
    fn test_uvarint_rejects_oversized_input() {
        // eleven continuation groups
        let mut input = vec![0x80u8; 10];
        input.push(0x01);
        assert!(read_uvarint(&input).is_err());

        // ten groups, but the last one carries bits past 63
        let mut input = vec![0x80u8; 9];
        input.push(0x02);
        assert!(read_uvarint(&input).is_err());

        // truncated before the terminating group
        assert!(read_uvarint(&[0x80]).is_err());
    }

    #[test]
    fn test_uvarint_round_trip() {
        let mut numbers = vec![0, 1, 127, 128, 16_383, 16_384, u64::MAX];
        let mut rng = rand::rngs::StdRng::seed_from_u64(11);
        for _ in 0..128 {
            numbers.push(rng.gen());
        }

        let mut buffer: Vec<u8> = Vec::new();
        for n in &numbers {
            write_uvarint(*n, &mut buffer).unwrap();
        }

        let mut cursor = &buffer[..];
        for n in numbers {
            let (rest, value) = read_uvarint(cursor).unwrap();
            assert_eq!(value, n);
            cursor = rest;
        }
        assert!(cursor.is_empty());
    }

    #[test]
    fn test_varint_round_trip() {
        let mut numbers = vec![0, 1, -1, 63, -64, 8_192, -8_191, i64::MIN, i64::MAX];
        let mut rng = rand::rngs::StdRng::seed_from_u64(12);
        for _ in 0..128 {
            numbers.push(rng.gen());
        }

        let mut buffer: Vec<u8> = Vec::new();
        for n in &numbers {
            write_varint(*n, &mut buffer).unwrap();
        }

        let mut cursor = &buffer[..];
        for n in numbers {
            let (rest, value) = read_varint(cursor).unwrap();
            assert_eq!(value, n);
            cursor = rest;
        }
    }
}
