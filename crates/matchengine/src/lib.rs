//! Match engine (C7): per-transaction net in/out aggregation against a
//! watch index, plus OP_RETURN label matching (§4.7). Pure function of its
//! inputs — `compute_activities` never allocates global state and its
//! output depends only on the block, the watch snapshot, and the inputs
//! already present on `ParsedTx` (I3).

use domain::{AddressActivity, Direction, ParsedBlock, ParsedTx};
use indexmap::IndexMap;
use rust_decimal::Decimal;
use watch::WatchIndex;

/// Run the match engine over every transaction in `block` against `watch`,
/// in block order, preserving the ordering guarantees of §4.7 ("outputs
/// before inputs before label matches", insertion order within each map).
pub fn compute_activities(block: &ParsedBlock, watch: &WatchIndex) -> Vec<AddressActivity> {
    let mut activities = Vec::new();
    for tx in &block.transactions {
        compute_tx_activities(tx, watch, &mut activities);
    }
    activities
}

fn compute_tx_activities(tx: &ParsedTx, watch: &WatchIndex, out: &mut Vec<AddressActivity>) {
    let (op_return_hex, op_return_utf8) = first_op_return(tx);

    let mut incoming: IndexMap<String, Decimal> = IndexMap::new();
    for output in &tx.outputs {
        if let Some(address) = &output.address {
            if watch.contains(address) {
                *incoming.entry(address.clone()).or_insert(Decimal::ZERO) += output.value_btc;
            }
        }
    }

    let mut outgoing: IndexMap<String, Decimal> = IndexMap::new();
    for input in &tx.inputs {
        if let (Some(address), Some(value)) = (&input.address, input.value_btc) {
            if watch.contains(address) {
                *outgoing.entry(address.clone()).or_insert(Decimal::ZERO) += value;
            }
        }
    }

    let mut matched: std::collections::HashSet<String> = std::collections::HashSet::new();

    for (address, &in_value) in &incoming {
        let out_value = outgoing.get(address).copied().unwrap_or(Decimal::ZERO);
        if in_value > Decimal::ZERO && out_value > Decimal::ZERO {
            let net = in_value - out_value;
            if net != Decimal::ZERO {
                out.push(activity(
                    address,
                    watch,
                    tx,
                    if net >= Decimal::ZERO { Direction::In } else { Direction::Out },
                    net.abs(),
                    &op_return_hex,
                    &op_return_utf8,
                ));
            }
        } else if in_value > Decimal::ZERO {
            out.push(activity(
                address,
                watch,
                tx,
                Direction::In,
                in_value,
                &op_return_hex,
                &op_return_utf8,
            ));
        }
        matched.insert(address.clone());
    }

    for (address, &out_value) in &outgoing {
        if matched.contains(address) {
            continue;
        }
        if out_value > Decimal::ZERO {
            out.push(activity(
                address,
                watch,
                tx,
                Direction::Out,
                out_value,
                &op_return_hex,
                &op_return_utf8,
            ));
        }
        matched.insert(address.clone());
    }

    if let Some(utf8) = &op_return_utf8 {
        if !utf8.is_empty() {
            let haystack = utf8.to_lowercase();
            for label_key in watch.label_keys() {
                if !haystack.contains(label_key) {
                    continue;
                }
                for watched in watch.addresses_for_label_key(label_key) {
                    if matched.contains(&watched.address) {
                        continue;
                    }
                    if !watch.contains(&watched.address) {
                        continue;
                    }
                    out.push(AddressActivity {
                        address: watched.address.clone(),
                        label: watched.label.clone(),
                        txid: tx.txid.clone(),
                        direction: Direction::In,
                        value_btc: Decimal::ZERO,
                        value_usd: None,
                        op_return_hex: op_return_hex.clone(),
                        op_return_utf8: Some(utf8.clone()),
                    });
                    matched.insert(watched.address.clone());
                }
            }
        }
    }
}

fn activity(
    address: &str,
    watch: &WatchIndex,
    tx: &ParsedTx,
    direction: Direction,
    value_btc: Decimal,
    op_return_hex: &Option<String>,
    op_return_utf8: &Option<String>,
) -> AddressActivity {
    AddressActivity {
        address: address.to_string(),
        label: watch.label_for(address),
        txid: tx.txid.clone(),
        direction,
        value_btc,
        value_usd: None,
        op_return_hex: op_return_hex.clone(),
        op_return_utf8: op_return_utf8.clone(),
    }
}

/// The first non-empty OP_RETURN payload present in any output (§4.7 step 1).
fn first_op_return(tx: &ParsedTx) -> (Option<String>, Option<String>) {
    for output in &tx.outputs {
        if let Some(hex) = &output.op_return_hex {
            if !hex.is_empty() {
                return (Some(hex.clone()), output.op_return_utf8.clone());
            }
        }
    }
    (None, None)
}

#[cfg(test)]
mod tests {
    use super::*;
    use domain::{ParsedInput, ParsedOutput, ParsedTx, ScriptType, WatchedAddress};

    fn output(address: &str, value: &str) -> ParsedOutput {
        ParsedOutput {
            address: Some(address.to_string()),
            value_btc: value.parse().unwrap(),
            script_type: ScriptType::Pubkeyhash,
            op_return_hex: None,
            op_return_utf8: None,
        }
    }

    fn input(address: &str, value: &str) -> ParsedInput {
        ParsedInput {
            prev_txid: "prev".to_string(),
            prev_vout: 0,
            address: Some(address.to_string()),
            value_btc: Some(value.parse().unwrap()),
        }
    }

    fn block_with(tx: ParsedTx) -> ParsedBlock {
        ParsedBlock {
            hash: "h".to_string(),
            prev_hash: None,
            height: 1,
            time: 0,
            transactions: vec![tx],
        }
    }

    /// S1: net in/out collapses to a single directional activity.
    #[test]
    fn net_activity_direction_scenario() {
        let tx = ParsedTx {
            txid: "tx1".to_string(),
            inputs: vec![input("addrA", "1.0")],
            outputs: vec![output("addrA", "1.5")],
        };
        let watch = WatchIndex::build(&[WatchedAddress {
            address: "addrA".to_string(),
            label: Some("Wallet A".to_string()),
        }]);
        let activities = compute_activities(&block_with(tx), &watch);
        assert_eq!(activities.len(), 1);
        assert_eq!(activities[0].direction, Direction::In);
        assert_eq!(activities[0].value_btc.to_string(), "0.5");
        assert_eq!(activities[0].label.as_deref(), Some("Wallet A"));
    }

    /// S6: OP_RETURN label match with no balance change.
    #[test]
    fn op_return_label_match_scenario() {
        let mut tx = ParsedTx {
            txid: "tx2".to_string(),
            inputs: vec![],
            outputs: vec![output("addrC", "0.001")],
        };
        tx.outputs.push(ParsedOutput {
            address: None,
            value_btc: Decimal::ZERO,
            script_type: ScriptType::Nulldata,
            op_return_hex: Some("hex".to_string()),
            op_return_utf8: Some("hello wallet-A world".to_string()),
        });
        let watch = WatchIndex::build(&[WatchedAddress {
            address: "addrB".to_string(),
            label: Some("Wallet-A".to_string()),
        }]);
        let activities = compute_activities(&block_with(tx), &watch);
        let label_matches: Vec<_> = activities
            .iter()
            .filter(|a| a.address == "addrB")
            .collect();
        assert_eq!(label_matches.len(), 1);
        assert_eq!(label_matches[0].direction, Direction::In);
        assert_eq!(label_matches[0].value_btc, Decimal::ZERO);
    }

    #[test]
    fn outgoing_only_emits_out_when_not_already_matched() {
        let tx = ParsedTx {
            txid: "tx3".to_string(),
            inputs: vec![input("addrD", "2.0")],
            outputs: vec![],
        };
        let watch = WatchIndex::build(&[WatchedAddress {
            address: "addrD".to_string(),
            label: None,
        }]);
        let activities = compute_activities(&block_with(tx), &watch);
        assert_eq!(activities.len(), 1);
        assert_eq!(activities[0].direction, Direction::Out);
        assert_eq!(activities[0].value_btc.to_string(), "2.0");
    }

    #[test]
    fn unwatched_addresses_produce_no_activity() {
        let tx = ParsedTx {
            txid: "tx4".to_string(),
            inputs: vec![],
            outputs: vec![output("addrZ", "1.0")],
        };
        let watch = WatchIndex::empty();
        assert!(compute_activities(&block_with(tx), &watch).is_empty());
    }
}
