//! Address codec (C3): Base58Check and Bech32/Bech32m encode/decode, plus
//! the per-network version/HRP tables used by the script decoder (C2).

use bytes_reader::sha256d;
use thiserror::Error;

#[derive(Debug, Error, PartialEq, Eq)]
pub enum AddressError {
    #[error("invalid base58 character {0:?}")]
    InvalidBase58Char(char),
    #[error("base58check checksum mismatch")]
    BadChecksum,
    #[error("base58check payload has unexpected length {0}")]
    BadPayloadLength(usize),
    #[error("unknown address version byte {0:#04x}")]
    UnknownVersion(u8),
    #[error("mixed-case bech32 string")]
    MixedCase,
    #[error("invalid bech32 character {0:?}")]
    InvalidBech32Char(char),
    #[error("bech32 string missing separator")]
    MissingSeparator,
    #[error("bech32 checksum failed")]
    BadBech32Checksum,
    #[error("bech32 human-readable part mismatch: expected {expected}, got {got}")]
    HrpMismatch { expected: String, got: String },
    #[error("witness program length {0} out of range (2..40)")]
    BadWitnessProgramLength(usize),
    #[error("witness version {0} requires bech32m, not bech32")]
    WrongEncodingForVersion(u8),
    #[error("empty data payload")]
    Empty,
}

/// Which Bitcoin network's version bytes / HRP apply.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, serde::Serialize, serde::Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Network {
    Mainnet,
    Testnet,
    Signet,
    Regtest,
}

pub struct NetworkParams {
    pub p2pkh_version: u8,
    pub p2sh_version: u8,
    pub hrp: &'static str,
}

impl Network {
    pub fn params(self) -> NetworkParams {
        match self {
            Network::Mainnet => NetworkParams {
                p2pkh_version: 0x00,
                p2sh_version: 0x05,
                hrp: "bc",
            },
            Network::Testnet => NetworkParams {
                p2pkh_version: 0x6f,
                p2sh_version: 0xc4,
                hrp: "tb",
            },
            Network::Signet => NetworkParams {
                p2pkh_version: 0x6f,
                p2sh_version: 0xc4,
                hrp: "tb",
            },
            Network::Regtest => NetworkParams {
                p2pkh_version: 0x6f,
                p2sh_version: 0xc4,
                hrp: "bcrt",
            },
        }
    }

    /// All networks sharing the given p2pkh/p2sh version bytes (testnet and
    /// signet are indistinguishable by version alone).
    fn candidates_for_version(version: u8) -> Vec<Network> {
        [
            Network::Mainnet,
            Network::Testnet,
            Network::Signet,
            Network::Regtest,
        ]
        .into_iter()
        .filter(|n| {
            let p = n.params();
            p.p2pkh_version == version || p.p2sh_version == version
        })
        .collect()
    }
}

// ---------------------------------------------------------------------
// Base58Check
// ---------------------------------------------------------------------

const BASE58_ALPHABET: &[u8; 58] = b"123456789ABCDEFGHJKLMNPQRSTUVWXYZabcdefghijkmnopqrstuvwxyz";

fn base58_encode(input: &[u8]) -> String {
    let zeros = input.iter().take_while(|&&b| b == 0).count();
    let mut digits: Vec<u8> = vec![0];
    for &byte in input {
        let mut carry = byte as u32;
        for d in digits.iter_mut() {
            carry += (*d as u32) << 8;
            *d = (carry % 58) as u8;
            carry /= 58;
        }
        while carry > 0 {
            digits.push((carry % 58) as u8);
            carry /= 58;
        }
    }
    let mut out = String::with_capacity(zeros + digits.len());
    out.extend(std::iter::repeat('1').take(zeros));
    for &d in digits.iter().rev() {
        out.push(BASE58_ALPHABET[d as usize] as char);
    }
    out
}

fn base58_decode(input: &str) -> Result<Vec<u8>, AddressError> {
    let zeros = input.chars().take_while(|&c| c == '1').count();
    let mut bytes: Vec<u8> = vec![0];
    for c in input.chars() {
        let value = BASE58_ALPHABET
            .iter()
            .position(|&a| a as char == c)
            .ok_or(AddressError::InvalidBase58Char(c))? as u32;
        let mut carry = value;
        for b in bytes.iter_mut() {
            carry += (*b as u32) * 58;
            *b = (carry & 0xFF) as u8;
            carry >>= 8;
        }
        while carry > 0 {
            bytes.push((carry & 0xFF) as u8);
            carry >>= 8;
        }
    }
    let mut out = vec![0u8; zeros];
    out.extend(bytes.iter().rev());
    Ok(out)
}

/// Base58Check-encode `payload` under `version`.
pub fn base58check_encode(version: u8, payload: &[u8]) -> String {
    let mut prefixed = Vec::with_capacity(1 + payload.len() + 4);
    prefixed.push(version);
    prefixed.extend_from_slice(payload);
    let checksum = sha256d(&prefixed);
    prefixed.extend_from_slice(&checksum[0..4]);
    base58_encode(&prefixed)
}

/// Decode and checksum-validate a Base58Check string, returning
/// `(version, payload)`. Only 20-byte payloads are accepted (P2PKH/P2SH).
pub fn base58check_decode(input: &str) -> Result<(u8, Vec<u8>), AddressError> {
    let raw = base58_decode(input)?;
    if raw.len() < 5 {
        return Err(AddressError::BadPayloadLength(raw.len().saturating_sub(5)));
    }
    let (body, checksum) = raw.split_at(raw.len() - 4);
    let expected = sha256d(body);
    if &expected[0..4] != checksum {
        return Err(AddressError::BadChecksum);
    }
    let version = body[0];
    let payload = body[1..].to_vec();
    if payload.len() != 20 {
        return Err(AddressError::BadPayloadLength(payload.len()));
    }
    Ok((version, payload))
}

/// Encode a P2PKH/P2SH address for `network`.
pub fn encode_base58_address(network: Network, is_script_hash: bool, hash160: &[u8; 20]) -> String {
    let params = network.params();
    let version = if is_script_hash {
        params.p2sh_version
    } else {
        params.p2pkh_version
    };
    base58check_encode(version, hash160)
}

/// Decode a Base58Check address, validating it belongs to one of the four
/// supported networks and returning the matching network(s), whether it is
/// a script hash, and the raw 20-byte payload.
pub fn decode_base58_address(input: &str) -> Result<(Vec<Network>, bool, [u8; 20]), AddressError> {
    let (version, payload) = base58check_decode(input)?;
    let candidates = Network::candidates_for_version(version);
    if candidates.is_empty() {
        return Err(AddressError::UnknownVersion(version));
    }
    let is_script_hash = candidates[0].params().p2sh_version == version;
    let mut hash = [0u8; 20];
    hash.copy_from_slice(&payload);
    Ok((candidates, is_script_hash, hash))
}

// ---------------------------------------------------------------------
// Bech32 / Bech32m (BIP-173 / BIP-350)
// ---------------------------------------------------------------------

const BECH32_CHARSET: &[u8; 32] = b"qpzry9x8gf2tvdw0s3jn54khce6mua7l";
const GENERATOR: [u32; 5] = [
    0x3b6a57b2, 0x26508e6d, 0x1ea119fa, 0x3d4233dd, 0x2a1462b3,
];
const BECH32_CONST: u32 = 1;
const BECH32M_CONST: u32 = 0x2bc830a3;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Variant {
    Bech32,
    Bech32m,
}

impl Variant {
    fn const_value(self) -> u32 {
        match self {
            Variant::Bech32 => BECH32_CONST,
            Variant::Bech32m => BECH32M_CONST,
        }
    }

    /// The variant mandated for a given witness version by BIP-350.
    pub fn for_witness_version(version: u8) -> Variant {
        if version == 0 {
            Variant::Bech32
        } else {
            Variant::Bech32m
        }
    }
}

fn polymod(values: &[u8]) -> u32 {
    let mut chk: u32 = 1;
    for &v in values {
        let b = (chk >> 25) as u8;
        chk = (chk & 0x01ff_ffff) << 5 ^ (v as u32);
        for i in 0..5 {
            if (b >> i) & 1 == 1 {
                chk ^= GENERATOR[i];
            }
        }
    }
    chk
}

fn hrp_expand(hrp: &str) -> Vec<u8> {
    let mut v = Vec::with_capacity(hrp.len() * 2 + 1);
    for b in hrp.bytes() {
        v.push(b >> 5);
    }
    v.push(0);
    for b in hrp.bytes() {
        v.push(b & 31);
    }
    v
}

fn create_checksum(hrp: &str, data: &[u8], variant: Variant) -> [u8; 6] {
    let mut values = hrp_expand(hrp);
    values.extend_from_slice(data);
    values.extend_from_slice(&[0u8; 6]);
    let poly = polymod(&values) ^ variant.const_value();
    let mut checksum = [0u8; 6];
    for (i, c) in checksum.iter_mut().enumerate() {
        *c = ((poly >> (5 * (5 - i))) & 31) as u8;
    }
    checksum
}

fn verify_checksum(hrp: &str, data: &[u8]) -> Option<Variant> {
    let mut values = hrp_expand(hrp);
    values.extend_from_slice(data);
    match polymod(&values) {
        BECH32_CONST => Some(Variant::Bech32),
        BECH32M_CONST => Some(Variant::Bech32m),
        _ => None,
    }
}

/// Convert a byte sequence between bit-widths, as used to pack/unpack
/// witness programs into 5-bit bech32 groups.
pub fn convert_bits(data: &[u8], from: u32, to: u32, pad: bool) -> Option<Vec<u8>> {
    let mut acc: u32 = 0;
    let mut bits: u32 = 0;
    let mut ret = Vec::new();
    let maxv = (1u32 << to) - 1;
    for &value in data {
        if (value as u32) >> from != 0 {
            return None;
        }
        acc = (acc << from) | value as u32;
        bits += from;
        while bits >= to {
            bits -= to;
            ret.push(((acc >> bits) & maxv) as u8);
        }
    }
    if pad {
        if bits > 0 {
            ret.push(((acc << (to - bits)) & maxv) as u8);
        }
    } else if bits >= from || ((acc << (to - bits)) & maxv) != 0 {
        return None;
    }
    Some(ret)
}

/// Encode a segwit address: `hrp`, witness `version` (0..16), and the
/// already-decoded `program` bytes (2..40 long).
pub fn encode_segwit_address(hrp: &str, version: u8, program: &[u8]) -> Result<String, AddressError> {
    if program.len() < 2 || program.len() > 40 {
        return Err(AddressError::BadWitnessProgramLength(program.len()));
    }
    let variant = Variant::for_witness_version(version);
    let mut data = vec![version];
    data.extend(convert_bits(program, 8, 5, true).ok_or(AddressError::Empty)?);
    let checksum = create_checksum(hrp, &data, variant);
    let mut out = String::with_capacity(hrp.len() + 1 + data.len() + 6);
    out.push_str(hrp);
    out.push('1');
    for &d in data.iter().chain(checksum.iter()) {
        out.push(BECH32_CHARSET[d as usize] as char);
    }
    Ok(out)
}

/// Decode any bech32/bech32m string into `(hrp, witness_version, program)`,
/// validating the checksum variant matches BIP-350's per-version rule.
pub fn decode_segwit_address(input: &str) -> Result<(String, u8, Vec<u8>), AddressError> {
    let has_lower = input.chars().any(|c| c.is_ascii_lowercase());
    let has_upper = input.chars().any(|c| c.is_ascii_uppercase());
    if has_lower && has_upper {
        return Err(AddressError::MixedCase);
    }
    let lowered = input.to_ascii_lowercase();
    let sep = lowered.rfind('1').ok_or(AddressError::MissingSeparator)?;
    let (hrp, rest) = lowered.split_at(sep);
    let data_part = &rest[1..];
    if data_part.len() < 6 {
        return Err(AddressError::BadBech32Checksum);
    }
    let mut values = Vec::with_capacity(data_part.len());
    for c in data_part.chars() {
        let v = BECH32_CHARSET
            .iter()
            .position(|&a| a as char == c)
            .ok_or(AddressError::InvalidBech32Char(c))? as u8;
        values.push(v);
    }
    let variant = verify_checksum(hrp, &values).ok_or(AddressError::BadBech32Checksum)?;
    let (data, _checksum) = values.split_at(values.len() - 6);
    let version = data[0];
    let program_5bit = &data[1..];
    let program = convert_bits(program_5bit, 5, 8, false).ok_or(AddressError::Empty)?;
    if program.len() < 2 || program.len() > 40 {
        return Err(AddressError::BadWitnessProgramLength(program.len()));
    }
    let expected_variant = Variant::for_witness_version(version);
    if expected_variant != variant {
        return Err(AddressError::WrongEncodingForVersion(version));
    }
    Ok((hrp.to_string(), version, program))
}

/// Validate `addr` (base58 or bech32/bech32m) and return a normalized
/// display form: lowercased bech32, or the original base58 string once its
/// checksum and (optionally) network have been confirmed.
pub fn validate_and_normalize_address(
    addr: &str,
    network: Option<Network>,
) -> Result<String, AddressError> {
    if let Ok((hrp, version, program)) = decode_segwit_address(addr) {
        if let Some(net) = network {
            let expected_hrp = net.params().hrp;
            if hrp != expected_hrp {
                return Err(AddressError::HrpMismatch {
                    expected: expected_hrp.to_string(),
                    got: hrp,
                });
            }
        }
        return encode_segwit_address(&hrp, version, &program);
    }
    let (candidates, _is_script_hash, _hash) = decode_base58_address(addr)?;
    if let Some(net) = network {
        if !candidates.contains(&net) {
            return Err(AddressError::UnknownVersion(0));
        }
    }
    Ok(addr.to_string())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn base58check_round_trips_20_byte_payloads() {
        for version in [0x00u8, 0x05, 0x6f, 0xc4] {
            let payload = [0x11u8; 20];
            let encoded = base58check_encode(version, &payload);
            let (v, p) = base58check_decode(&encoded).unwrap();
            assert_eq!(v, version);
            assert_eq!(p, payload.to_vec());
        }
    }

    #[test]
    fn base58check_preserves_leading_zero_bytes() {
        let payload = [0u8; 20];
        let encoded = base58check_encode(0x00, &payload);
        assert!(encoded.starts_with('1'));
        let (_v, p) = base58check_decode(&encoded).unwrap();
        assert_eq!(p, payload.to_vec());
    }

    #[test]
    fn base58check_rejects_bad_checksum() {
        let payload = [0x22u8; 20];
        let mut encoded = base58check_encode(0x00, &payload);
        encoded.push('1');
        let decoded = base58check_decode(&encoded);
        assert!(decoded.is_err());
    }

    #[test]
    fn bech32_round_trips_v0() {
        let hrp = "bc";
        let program = [0x22u8; 20];
        let encoded = encode_segwit_address(hrp, 0, &program).unwrap();
        let (got_hrp, version, got_program) = decode_segwit_address(&encoded).unwrap();
        assert_eq!(got_hrp, hrp);
        assert_eq!(version, 0);
        assert_eq!(got_program, program.to_vec());
    }

    #[test]
    fn bech32m_round_trips_v1_taproot() {
        let hrp = "bc";
        let program = [0x33u8; 32];
        let encoded = encode_segwit_address(hrp, 1, &program).unwrap();
        let (_, version, got_program) = decode_segwit_address(&encoded).unwrap();
        assert_eq!(version, 1);
        assert_eq!(got_program, program.to_vec());
    }

    #[test]
    fn bech32_rejects_v1_encoded_as_bech32() {
        // Build a v1 program and sign with the bech32 (not bech32m) constant,
        // which BIP-350 says must be rejected.
        let hrp = "bc";
        let program = [0x44u8; 32];
        let mut data = vec![1u8];
        data.extend(convert_bits(&program, 8, 5, true).unwrap());
        let checksum = create_checksum(hrp, &data, Variant::Bech32);
        let mut s = String::new();
        s.push_str(hrp);
        s.push('1');
        for &d in data.iter().chain(checksum.iter()) {
            s.push(BECH32_CHARSET[d as usize] as char);
        }
        assert!(decode_segwit_address(&s).is_err());
    }

    #[test]
    fn rejects_mixed_case() {
        let encoded = encode_segwit_address("bc", 0, &[0x22u8; 20]).unwrap();
        let mut chars: Vec<char> = encoded.chars().collect();
        let idx = chars.len() - 1;
        chars[idx] = chars[idx].to_ascii_uppercase();
        let mixed: String = chars.into_iter().collect();
        assert_eq!(decode_segwit_address(&mixed), Err(AddressError::MixedCase));
    }

    #[test]
    fn program_length_out_of_range_rejected() {
        assert!(encode_segwit_address("bc", 0, &[0u8; 1]).is_err());
        assert!(encode_segwit_address("bc", 0, &[0u8; 41]).is_err());
    }
}
