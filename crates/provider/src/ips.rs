//! IPS and IPS32 patch codecs
//!
//! A patch set is an ordered map of absolute address to replacement byte.
//! The encoders group consecutive addresses into runs and emit one record
//! per run; the decoders validate framing and rebuild the map.
//!
//! Classic IPS records are `offset:3BE length:2BE data[length]` between an
//! ASCII `PATCH` header and an ASCII `EOF` terminator. IPS32 widens the
//! offset to four bytes, uses an `IPS32` header and an `EEOF` terminator.

use crate::error::PatchError;
use crate::patches::Patches;

const IPS_MAGIC: &[u8] = b"PATCH";
const IPS_EOF: &[u8] = b"EOF";
const IPS_MAX_ADDRESS: u64 = 0x00FF_FFFF;

const IPS32_MAGIC: &[u8] = b"IPS32";
const IPS32_EOF: &[u8] = b"EEOF";
const IPS32_MAX_ADDRESS: u64 = 0x7FFF_FFFF;

const MAX_RUN_LENGTH: usize = 0xFFFF;

/// Encode a patch set as a classic IPS stream.
///
/// Fails with [`PatchError::AddressOutOfRange`] if any address exceeds
/// 24 bits and [`PatchError::PatchTooLarge`] if a run of consecutive
/// addresses exceeds `0xFFFF` bytes.
pub fn encode_ips(patches: &Patches) -> Result<Vec<u8>, PatchError> {
    let mut result = Vec::from(IPS_MAGIC);

    for (start, bytes) in runs(patches) {
        if start > IPS_MAX_ADDRESS {
            return Err(PatchError::AddressOutOfRange(start));
        }
        if bytes.len() > MAX_RUN_LENGTH {
            return Err(PatchError::PatchTooLarge(bytes.len()));
        }

        result.extend_from_slice(&(start as u32).to_be_bytes()[1..]);
        result.extend_from_slice(&(bytes.len() as u16).to_be_bytes());
        result.extend_from_slice(&bytes);
    }

    result.extend_from_slice(IPS_EOF);
    Ok(result)
}

/// Encode a patch set as an IPS32 stream (32-bit addresses).
pub fn encode_ips32(patches: &Patches) -> Result<Vec<u8>, PatchError> {
    let mut result = Vec::from(IPS32_MAGIC);

    for (start, bytes) in runs(patches) {
        if start > IPS32_MAX_ADDRESS {
            return Err(PatchError::AddressOutOfRange(start));
        }
        if bytes.len() > MAX_RUN_LENGTH {
            return Err(PatchError::PatchTooLarge(bytes.len()));
        }

        result.extend_from_slice(&(start as u32).to_be_bytes());
        result.extend_from_slice(&(bytes.len() as u16).to_be_bytes());
        result.extend_from_slice(&bytes);
    }

    result.extend_from_slice(IPS32_EOF);
    Ok(result)
}

/// Decode a classic IPS stream back into a patch set.
pub fn decode_ips(data: &[u8]) -> Result<Patches, PatchError> {
    decode(data, IPS_MAGIC, IPS_EOF, 3, IPS_MAX_ADDRESS)
}

/// Decode an IPS32 stream back into a patch set.
pub fn decode_ips32(data: &[u8]) -> Result<Patches, PatchError> {
    decode(data, IPS32_MAGIC, IPS32_EOF, 4, IPS32_MAX_ADDRESS)
}

/// Group the ordered patch map into runs of consecutive addresses.
fn runs(patches: &Patches) -> Vec<(u64, Vec<u8>)> {
    let mut runs: Vec<(u64, Vec<u8>)> = Vec::new();

    for (&address, &value) in patches.iter() {
        match runs.last_mut() {
            Some((start, bytes)) if *start + bytes.len() as u64 == address => {
                bytes.push(value);
            }
            _ => runs.push((address, vec![value])),
        }
    }

    runs
}

fn decode(
    data: &[u8],
    magic: &[u8],
    eof: &[u8],
    address_width: usize,
    max_address: u64,
) -> Result<Patches, PatchError> {
    if data.len() < magic.len() || &data[..magic.len()] != magic {
        return Err(PatchError::InvalidPatchHeader);
    }

    let mut patches = Patches::new();
    let mut cursor = magic.len();

    loop {
        if data[cursor..].starts_with(eof) && data.len() == cursor + eof.len() {
            return Ok(patches);
        }

        if data.len() < cursor + address_width + 2 {
            return Err(PatchError::MissingEof);
        }

        let mut address = 0u64;
        for &byte in &data[cursor..cursor + address_width] {
            address = (address << 8) | u64::from(byte);
        }
        cursor += address_width;

        if address > max_address {
            return Err(PatchError::AddressOutOfRange(address));
        }

        let length = usize::from(u16::from_be_bytes([data[cursor], data[cursor + 1]]));
        cursor += 2;

        if length == 0 {
            return Err(PatchError::InvalidPatchFormat);
        }
        if data.len() < cursor + length {
            return Err(PatchError::InvalidPatchFormat);
        }

        for (i, &byte) in data[cursor..cursor + length].iter().enumerate() {
            patches.insert(address + i as u64, byte);
        }
        cursor += length;
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn patch_set(entries: &[(u64, u8)]) -> Patches {
        entries.iter().copied().collect()
    }

    #[test]
    fn test_encode_groups_consecutive_addresses() {
        let patches = patch_set(&[(0x10, 0x11), (0x11, 0x22), (0x30, 0x33)]);
        let encoded = encode_ips(&patches).unwrap();

        let expected = hex::decode("504154434800001000021122000030000133454f46").unwrap();
        assert_eq!(encoded, expected);
    }

    #[test]
    fn test_ips_round_trip() {
        let patches = patch_set(&[(0, 0xAA), (1, 0xBB), (2, 0xCC), (0x8000, 0x01)]);
        let decoded = decode_ips(&encode_ips(&patches).unwrap()).unwrap();
        assert_eq!(decoded, patches);
    }

    #[test]
    fn test_ips32_round_trip() {
        let patches = patch_set(&[(0x0100_0000, 0x42), (0x7FFF_FFFF, 0x99)]);
        let encoded = encode_ips32(&patches).unwrap();
        assert!(encoded.starts_with(b"IPS32"));
        assert!(encoded.ends_with(b"EEOF"));
        assert_eq!(decode_ips32(&encoded).unwrap(), patches);
    }

    #[test]
    fn test_address_beyond_24_bits_rejected() {
        let patches = patch_set(&[(0x0100_0000, 0x42)]);
        assert_eq!(
            encode_ips(&patches),
            Err(PatchError::AddressOutOfRange(0x0100_0000))
        );
    }

    #[test]
    fn test_run_longer_than_record_rejected() {
        let patches: Patches = (0..0x1_0000u64).map(|a| (a, a as u8)).collect();
        assert_eq!(encode_ips(&patches), Err(PatchError::PatchTooLarge(0x1_0000)));
    }

    #[test]
    fn test_decode_rejects_bad_magic() {
        assert_eq!(decode_ips(b"NOTCHEOF"), Err(PatchError::InvalidPatchHeader));
    }

    #[test]
    fn test_decode_requires_terminator() {
        let patches = patch_set(&[(0x10, 0x11)]);
        let mut encoded = encode_ips(&patches).unwrap();
        encoded.truncate(encoded.len() - 3);
        assert_eq!(decode_ips(&encoded), Err(PatchError::MissingEof));
    }

    #[test]
    fn test_decode_rejects_truncated_record() {
        // Header, record claiming 4 bytes but carrying 1, no terminator.
        let data = [b"PATCH".as_slice(), &[0, 0, 0x10, 0, 4, 0xAA]].concat();
        assert_eq!(decode_ips(&data), Err(PatchError::InvalidPatchFormat));
    }

    #[test]
    fn test_splittable_runs_normalise() {
        // Two records covering one consecutive range decode to one map,
        // and re-encoding merges them into a single record.
        let data = [
            b"PATCH".as_slice(),
            &[0, 0, 0x10, 0, 1, 0xAA],
            &[0, 0, 0x11, 0, 1, 0xBB],
            b"EOF",
        ]
        .concat();

        let decoded = decode_ips(&data).unwrap();
        let reencoded = encode_ips(&decoded).unwrap();
        assert_ne!(reencoded, data);
        assert_eq!(decode_ips(&reencoded).unwrap(), decoded);
    }
}
