//! Script decoder (C2): classifies a raw scriptPubKey and derives its
//! address, plus the redeem-script and taproot-witness helpers used when
//! resolving P2SH-wrapped and taproot inputs.

use address::{encode_segwit_address, Network};
use serde::{Deserialize, Serialize};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ScriptType {
    Pubkeyhash,
    Scripthash,
    WitnessV0Keyhash,
    WitnessV0Scripthash,
    WitnessV1Taproot,
    Nulldata,
    Nonstandard,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DecodedScript {
    pub script_type: ScriptType,
    pub address: Option<String>,
    pub op_return_hex: Option<String>,
}

const OP_RETURN: u8 = 0x6a;
const OP_DUP: u8 = 0x76;
const OP_HASH160: u8 = 0xa9;
const OP_EQUALVERIFY: u8 = 0x88;
const OP_CHECKSIG: u8 = 0xac;
const OP_EQUAL: u8 = 0x87;
const OP_PUSHDATA1: u8 = 0x4c;
const OP_PUSHDATA2: u8 = 0x4d;
const OP_PUSHDATA4: u8 = 0x4e;

fn to_hex(bytes: &[u8]) -> String {
    let mut s = String::with_capacity(bytes.len() * 2);
    for b in bytes {
        s.push_str(&format!("{:02x}", b));
    }
    s
}

/// Scan an OP_RETURN script body (everything after the `OP_RETURN` byte)
/// for the first pushdata payload, skipping any non-push opcodes.
fn first_op_return_payload(rest: &[u8]) -> Option<Vec<u8>> {
    let mut i = 0usize;
    while i < rest.len() {
        let op = rest[i];
        match op {
            0x01..=0x4b => {
                let len = op as usize;
                i += 1;
                if i + len > rest.len() {
                    return None;
                }
                let payload = &rest[i..i + len];
                if !payload.is_empty() {
                    return Some(payload.to_vec());
                }
                i += len;
            }
            OP_PUSHDATA1 => {
                if i + 2 > rest.len() {
                    return None;
                }
                let len = rest[i + 1] as usize;
                i += 2;
                if i + len > rest.len() {
                    return None;
                }
                let payload = &rest[i..i + len];
                if !payload.is_empty() {
                    return Some(payload.to_vec());
                }
                i += len;
            }
            OP_PUSHDATA2 => {
                if i + 3 > rest.len() {
                    return None;
                }
                let len = u16::from_le_bytes([rest[i + 1], rest[i + 2]]) as usize;
                i += 3;
                if i + len > rest.len() {
                    return None;
                }
                let payload = &rest[i..i + len];
                if !payload.is_empty() {
                    return Some(payload.to_vec());
                }
                i += len;
            }
            OP_PUSHDATA4 => {
                if i + 5 > rest.len() {
                    return None;
                }
                let len = u32::from_le_bytes([rest[i + 1], rest[i + 2], rest[i + 3], rest[i + 4]])
                    as usize;
                i += 5;
                if i + len > rest.len() {
                    return None;
                }
                let payload = &rest[i..i + len];
                if !payload.is_empty() {
                    return Some(payload.to_vec());
                }
                i += len;
            }
            _ => {
                // OP_0 and any other non-push opcode: skip one byte and keep scanning.
                i += 1;
            }
        }
    }
    None
}

/// Classify a scriptPubKey and derive its address under `network`.
/// First match wins, in the order laid out by the design.
pub fn classify(script: &[u8], network: Network) -> DecodedScript {
    if let Some(&first) = script.first() {
        if first == OP_RETURN {
            return match first_op_return_payload(&script[1..]) {
                Some(payload) => DecodedScript {
                    script_type: ScriptType::Nulldata,
                    address: None,
                    op_return_hex: Some(to_hex(&payload)),
                },
                None => DecodedScript {
                    script_type: ScriptType::Nonstandard,
                    address: None,
                    op_return_hex: None,
                },
            };
        }
    }

    if script.len() == 25
        && script[0] == OP_DUP
        && script[1] == OP_HASH160
        && script[2] == 0x14
        && script[23] == OP_EQUALVERIFY
        && script[24] == OP_CHECKSIG
    {
        let mut hash = [0u8; 20];
        hash.copy_from_slice(&script[3..23]);
        let address = address::encode_base58_address(network, false, &hash);
        return DecodedScript {
            script_type: ScriptType::Pubkeyhash,
            address: Some(address),
            op_return_hex: None,
        };
    }

    if script.len() == 23 && script[0] == OP_HASH160 && script[1] == 0x14 && script[22] == OP_EQUAL {
        let mut hash = [0u8; 20];
        hash.copy_from_slice(&script[2..22]);
        let address = address::encode_base58_address(network, true, &hash);
        return DecodedScript {
            script_type: ScriptType::Scripthash,
            address: Some(address),
            op_return_hex: None,
        };
    }

    if script.len() == 22 && script[0] == 0x00 && script[1] == 0x14 {
        let program = &script[2..22];
        let hrp = network.params().hrp;
        let address = encode_segwit_address(hrp, 0, program).ok();
        return DecodedScript {
            script_type: ScriptType::WitnessV0Keyhash,
            address,
            op_return_hex: None,
        };
    }

    if script.len() == 34 && script[0] == 0x00 && script[1] == 0x20 {
        let program = &script[2..34];
        let hrp = network.params().hrp;
        let address = encode_segwit_address(hrp, 0, program).ok();
        return DecodedScript {
            script_type: ScriptType::WitnessV0Scripthash,
            address,
            op_return_hex: None,
        };
    }

    if script.len() == 34 && script[0] == 0x51 && script[1] == 0x20 {
        let program = &script[2..34];
        let hrp = network.params().hrp;
        let address = encode_segwit_address(hrp, 1, program).ok();
        return DecodedScript {
            script_type: ScriptType::WitnessV1Taproot,
            address,
            op_return_hex: None,
        };
    }

    DecodedScript {
        script_type: ScriptType::Nonstandard,
        address: None,
        op_return_hex: None,
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RedeemScriptType {
    P2wpkh,
    P2wsh,
    Unknown,
}

/// Classify a P2SH redeem script to detect the common P2SH-wrapped segwit
/// patterns (BIP-141 "P2SH-P2WPKH"/"P2SH-P2WSH").
pub fn classify_redeem_script(redeem_script: &[u8]) -> RedeemScriptType {
    if redeem_script.len() == 22 && redeem_script[0] == 0x00 && redeem_script[1] == 0x14 {
        RedeemScriptType::P2wpkh
    } else if redeem_script.len() == 34 && redeem_script[0] == 0x00 && redeem_script[1] == 0x20 {
        RedeemScriptType::P2wsh
    } else {
        RedeemScriptType::Unknown
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TaprootWitnessType {
    KeyPath,
    ScriptPath,
    Unknown,
}

/// Classify a taproot input's witness stack as key-path or script-path
/// spending, per BIP-341.
pub fn classify_taproot_witness(witness: &[Vec<u8>]) -> TaprootWitnessType {
    if witness.len() == 1 {
        let len = witness[0].len();
        if len == 64 || len == 65 {
            return TaprootWitnessType::KeyPath;
        }
    }
    if let Some(last) = witness.last() {
        if last.len() >= 33 && (last[0] & 0x80) != 0 {
            return TaprootWitnessType::ScriptPath;
        }
    }
    TaprootWitnessType::Unknown
}

#[cfg(test)]
mod tests {
    use super::*;

    fn p2pkh_script(hash: [u8; 20]) -> Vec<u8> {
        let mut v = vec![OP_DUP, OP_HASH160, 0x14];
        v.extend_from_slice(&hash);
        v.push(OP_EQUALVERIFY);
        v.push(OP_CHECKSIG);
        v
    }

    #[test]
    fn classifies_p2pkh() {
        let script = p2pkh_script([0x11; 20]);
        let decoded = classify(&script, Network::Mainnet);
        assert_eq!(decoded.script_type, ScriptType::Pubkeyhash);
        assert!(decoded.address.unwrap().starts_with('1'));
    }

    #[test]
    fn classifies_p2sh() {
        let mut script = vec![OP_HASH160, 0x14];
        script.extend_from_slice(&[0x22; 20]);
        script.push(OP_EQUAL);
        let decoded = classify(&script, Network::Mainnet);
        assert_eq!(decoded.script_type, ScriptType::Scripthash);
        assert!(decoded.address.unwrap().starts_with('3'));
    }

    #[test]
    fn classifies_p2wpkh_and_p2wsh() {
        let mut pkh = vec![0x00, 0x14];
        pkh.extend_from_slice(&[0x33; 20]);
        let decoded = classify(&pkh, Network::Mainnet);
        assert_eq!(decoded.script_type, ScriptType::WitnessV0Keyhash);
        assert!(decoded.address.unwrap().starts_with("bc1q"));

        let mut sh = vec![0x00, 0x20];
        sh.extend_from_slice(&[0x44; 32]);
        let decoded = classify(&sh, Network::Mainnet);
        assert_eq!(decoded.script_type, ScriptType::WitnessV0Scripthash);
    }

    #[test]
    fn classifies_p2tr() {
        let mut script = vec![0x51, 0x20];
        script.extend_from_slice(&[0x55; 32]);
        let decoded = classify(&script, Network::Mainnet);
        assert_eq!(decoded.script_type, ScriptType::WitnessV1Taproot);
        assert!(decoded.address.unwrap().starts_with("bc1p"));
    }

    #[test]
    fn classifies_op_return_with_payload() {
        let mut script = vec![OP_RETURN, 0x05];
        script.extend_from_slice(b"hello");
        let decoded = classify(&script, Network::Mainnet);
        assert_eq!(decoded.script_type, ScriptType::Nulldata);
        assert_eq!(decoded.op_return_hex.unwrap(), to_hex(b"hello"));
    }

    #[test]
    fn op_return_with_no_payload_is_nonstandard() {
        let script = vec![OP_RETURN];
        let decoded = classify(&script, Network::Mainnet);
        assert_eq!(decoded.script_type, ScriptType::Nonstandard);
    }

    #[test]
    fn unrecognized_script_is_nonstandard() {
        let script = vec![0x99, 0x01, 0x02];
        let decoded = classify(&script, Network::Mainnet);
        assert_eq!(decoded.script_type, ScriptType::Nonstandard);
    }

    #[test]
    fn redeem_script_classification() {
        let mut p2wpkh = vec![0x00, 0x14];
        p2wpkh.extend_from_slice(&[0u8; 20]);
        assert_eq!(classify_redeem_script(&p2wpkh), RedeemScriptType::P2wpkh);

        let mut p2wsh = vec![0x00, 0x20];
        p2wsh.extend_from_slice(&[0u8; 32]);
        assert_eq!(classify_redeem_script(&p2wsh), RedeemScriptType::P2wsh);

        assert_eq!(classify_redeem_script(&[0x51, 0x02]), RedeemScriptType::Unknown);
    }

    #[test]
    fn taproot_witness_classification() {
        assert_eq!(
            classify_taproot_witness(&[vec![0u8; 64]]),
            TaprootWitnessType::KeyPath
        );
        let mut control_block = vec![0xc1u8];
        control_block.extend(vec![0u8; 32]);
        assert_eq!(
            classify_taproot_witness(&[vec![1, 2, 3], control_block]),
            TaprootWitnessType::ScriptPath
        );
        assert_eq!(
            classify_taproot_witness(&[vec![1, 2, 3]]),
            TaprootWitnessType::Unknown
        );
    }
}
