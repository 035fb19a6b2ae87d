use crate::cache::WalletBalance;
use crate::repository::{DealView, TrackedWallet};
use comfy_table::{Cell, Table, modifiers::UTF8_ROUND_CORNERS, presets::UTF8_FULL};
use csv::Writer;
use serde_json::json;

#[derive(Debug, Clone, PartialEq)]
pub enum OutputFormat {
    Table,
    Json,
    Csv,
}

impl From<&str> for OutputFormat {
    fn from(s: &str) -> Self {
        match s.to_lowercase().as_str() {
            "json" => OutputFormat::Json,
            "csv" => OutputFormat::Csv,
            _ => OutputFormat::Table,
        }
    }
}

fn new_table(header: Vec<&str>) -> Table {
    let mut table = Table::new();
    table
        .load_preset(UTF8_FULL)
        .apply_modifier(UTF8_ROUND_CORNERS)
        .set_header(header);
    table
}

fn finish_csv(wtr: Writer<Vec<u8>>) -> String {
    String::from_utf8(wtr.into_inner().unwrap_or_default()).unwrap_or_default()
}

fn scope(chain_id: Option<u64>) -> String {
    chain_id.map_or("all".to_string(), |c| c.to_string())
}

pub fn format_balance(balance: &WalletBalance, format: &OutputFormat) -> String {
    let formatted = balance.formatted();

    match format {
        OutputFormat::Table => {
            let mut table = new_table(vec!["Wallet", "Chain", "Balance (USD)"]);
            table.add_row(vec![
                Cell::new(format!("{:#}", balance.wallet)),
                Cell::new(scope(balance.chain_id)),
                Cell::new(&formatted),
            ]);
            table.to_string()
        }
        OutputFormat::Json => json!({
            "wallet": format!("{:?}", balance.wallet),
            "chain_id": balance.chain_id,
            "balance_usd": formatted,
        })
        .to_string(),
        OutputFormat::Csv => {
            let mut wtr = Writer::from_writer(vec![]);
            let _ = wtr.write_record(["wallet", "chain_id", "balance_usd"]);
            let _ = wtr.write_record([
                &format!("{:?}", balance.wallet),
                &scope(balance.chain_id),
                &formatted,
            ]);
            finish_csv(wtr)
        }
    }
}

pub fn format_deals(deals: &[DealView], format: &OutputFormat) -> String {
    match format {
        OutputFormat::Table => {
            if deals.is_empty() {
                return "No deals found.".to_string();
            }

            let mut table = new_table(vec![
                "Chain", "Block", "Time", "Token", "From", "To", "Volume", "USD", "Tx Hash",
            ]);
            for deal in deals {
                table.add_row(vec![
                    Cell::new(deal.chain_id),
                    Cell::new(deal.block_number),
                    Cell::new(deal.timestamp.format("%Y-%m-%d %H:%M:%S")),
                    Cell::new(&deal.symbol),
                    Cell::new(format!("{:#}", deal.sender)),
                    Cell::new(format!("{:#}", deal.recipient)),
                    Cell::new(deal.volume),
                    Cell::new(format!("{:.2}", deal.volume_usd.round_dp(2))),
                    Cell::new(format_tx_hash(&deal.tx_hash)),
                ]);
            }
            table.to_string()
        }
        OutputFormat::Json => {
            let rows: Vec<_> = deals
                .iter()
                .map(|d| {
                    json!({
                        "chain_id": d.chain_id,
                        "block_number": d.block_number,
                        "timestamp": d.timestamp.to_rfc3339(),
                        "transaction_hash": d.tx_hash,
                        "log_index": d.log_index,
                        "symbol": d.symbol,
                        "from": format!("{:?}", d.sender),
                        "to": format!("{:?}", d.recipient),
                        "volume": d.volume.to_string(),
                        "volume_usd": d.volume_usd.to_string(),
                    })
                })
                .collect();
            serde_json::to_string_pretty(&rows).unwrap_or_else(|_| "[]".to_string())
        }
        OutputFormat::Csv => {
            let mut wtr = Writer::from_writer(vec![]);
            let _ = wtr.write_record([
                "chain_id",
                "block_number",
                "timestamp",
                "symbol",
                "from",
                "to",
                "volume",
                "volume_usd",
                "transaction_hash",
                "log_index",
            ]);
            for d in deals {
                let _ = wtr.write_record([
                    &d.chain_id.to_string(),
                    &d.block_number.to_string(),
                    &d.timestamp.to_rfc3339(),
                    &d.symbol,
                    &format!("{:?}", d.sender),
                    &format!("{:?}", d.recipient),
                    &d.volume.to_string(),
                    &d.volume_usd.to_string(),
                    &d.tx_hash,
                    &d.log_index.to_string(),
                ]);
            }
            finish_csv(wtr)
        }
    }
}

pub fn format_wallets(wallets: &[TrackedWallet], format: &OutputFormat) -> String {
    match format {
        OutputFormat::Table => {
            if wallets.is_empty() {
                return "No tracked wallets.".to_string();
            }

            let mut table = new_table(vec!["Chain", "Wallet", "Last Block"]);
            for wallet in wallets {
                table.add_row(vec![
                    Cell::new(wallet.chain_id),
                    Cell::new(format!("{:#}", wallet.address)),
                    Cell::new(wallet.last_block),
                ]);
            }
            table.to_string()
        }
        OutputFormat::Json => {
            let rows: Vec<_> = wallets
                .iter()
                .map(|w| {
                    json!({
                        "chain_id": w.chain_id,
                        "address": format!("{:?}", w.address),
                        "last_block": w.last_block,
                    })
                })
                .collect();
            serde_json::to_string_pretty(&rows).unwrap_or_else(|_| "[]".to_string())
        }
        OutputFormat::Csv => {
            let mut wtr = Writer::from_writer(vec![]);
            let _ = wtr.write_record(["chain_id", "address", "last_block"]);
            for w in wallets {
                let _ = wtr.write_record([
                    &w.chain_id.to_string(),
                    &format!("{:?}", w.address),
                    &w.last_block.to_string(),
                ]);
            }
            finish_csv(wtr)
        }
    }
}

fn format_tx_hash(hash: &str) -> String {
    if hash.len() <= 10 {
        return hash.to_string();
    }
    format!("{}...{}", &hash[..6], &hash[hash.len() - 4..])
}

#[cfg(test)]
mod tests {
    use super::*;
    use alloy_primitives::Address;
    use rust_decimal::Decimal;

    fn balance() -> WalletBalance {
        WalletBalance {
            wallet: Address::repeat_byte(0x0a),
            chain_id: Some(1),
            balance_usd: Decimal::new(12346, 3),
        }
    }

    #[test]
    fn unknown_format_falls_back_to_table() {
        assert_eq!(OutputFormat::from("JSON"), OutputFormat::Json);
        assert_eq!(OutputFormat::from("csv"), OutputFormat::Csv);
        assert_eq!(OutputFormat::from("yaml"), OutputFormat::Table);
    }

    #[test]
    fn balance_renders_two_decimals() {
        let json: serde_json::Value =
            serde_json::from_str(&format_balance(&balance(), &OutputFormat::Json)).unwrap();
        assert_eq!(json["balance_usd"], "12.35");
        assert_eq!(json["chain_id"], 1);

        let csv = format_balance(&balance(), &OutputFormat::Csv);
        assert!(csv.starts_with("wallet,chain_id,balance_usd\n"));
        assert!(csv.trim_end().ends_with(",1,12.35"));
    }

    #[test]
    fn empty_wallet_list_table() {
        assert_eq!(
            format_wallets(&[], &OutputFormat::Table),
            "No tracked wallets."
        );
        assert_eq!(format_wallets(&[], &OutputFormat::Json), "[]");
    }

    #[test]
    fn shortens_tx_hashes() {
        assert_eq!(
            format_tx_hash("0x0000000000000000000000000000000000000000000000000000000000abcdef"),
            "0x0000...cdef"
        );
    }
}
