//! Report output (CSV export and console tables)

use anyhow::{Context, Result};
use csv::Writer;
use std::io;
use std::path::Path;

use crate::period::PeriodAggregate;
use crate::store::EntityStats;
use crate::tokens::PaymentMethod;
use crate::warm::WarmCacheRow;

const CSV_HEADER: [&str; 7] = [
    "Timestamp",
    "Date",
    "Tx_Hash",
    "Amount_USD",
    "Payment_Method",
    "From_Address",
    "To_Address",
];

/// Write an aggregate's transactions as CSV
pub fn write_transactions<W: io::Write>(writer: W, aggregate: &PeriodAggregate) -> Result<()> {
    let mut wtr = Writer::from_writer(writer);
    wtr.write_record(CSV_HEADER)?;

    for payout in &aggregate.transactions {
        wtr.write_record([
            payout.timestamp.to_rfc3339().as_str(),
            &payout.timestamp.format("%Y-%m-%d").to_string(),
            &payout.tx_hash,
            &format!("{:.2}", payout.amount_usd),
            payout.payment_method.as_str(),
            &payout.from_address,
            payout.to_address.as_deref().unwrap_or(""),
        ])?;
    }

    wtr.flush()?;
    Ok(())
}

pub fn export_transactions(path: &Path, aggregate: &PeriodAggregate) -> Result<()> {
    let file = std::fs::File::create(path).with_context(|| format!("Failed to create {}", path.display()))?;
    write_transactions(file, aggregate)
}

/// Print an aggregate to the console
pub fn print_period(aggregate: &PeriodAggregate) {
    println!("\n============================================================");
    println!("  {}: {} payouts", aggregate.entity_id, aggregate.period);
    println!(
        "  {} → {}",
        aggregate.window_start.format("%Y-%m-%d %H:%M"),
        aggregate.window_end.format("%Y-%m-%d %H:%M")
    );
    println!("============================================================\n");

    let summary = &aggregate.summary;
    println!("  Total:    ${:>14.2}", summary.total_payouts);
    println!("  Count:    {:>15}", summary.payout_count);
    println!("  Largest:  ${:>14.2}", summary.largest_payout);
    println!("  Average:  ${:>14.2}", summary.avg_payout);
    for method in PaymentMethod::ALL {
        let amount = summary.by_method.get(method);
        if amount > 0.0 {
            println!("    {:<8}${:>14.2}", method.as_str(), amount);
        }
    }

    if !aggregate.monthly_buckets.is_empty() {
        println!("\n  {:<10} {:>14} {:>8}", "Month", "Total", "Count");
        for bucket in &aggregate.monthly_buckets {
            let marker = if bucket.has_data { "" } else { "  (no data)" };
            println!("  {:<10} {:>14.2} {:>8}{}", bucket.month, bucket.total, bucket.count, marker);
        }
    }

    if !aggregate.daily_buckets.is_empty() {
        println!("\n  {:<10} {:>14} {:>8}", "Date", "Total", "Count");
        for bucket in &aggregate.daily_buckets {
            println!("  {:<10} {:>14.2} {:>8}", bucket.date, bucket.total, bucket.count);
        }
    }

    if let Some(warm) = &aggregate.warm {
        println!();
        print_warm_row(warm);
    }
    println!();
}

pub fn print_warm_row(row: &WarmCacheRow) {
    println!(
        "  warm: total ${:.2}, 30d ${:.2}, {} payouts, synced {}{}",
        row.total_usd,
        row.last_30d_usd,
        row.payout_count,
        row.last_synced_at.format("%Y-%m-%d %H:%M"),
        row.sync_error
            .as_deref()
            .map(|e| format!(" (error: {})", e))
            .unwrap_or_default()
    );
}

pub fn print_stats(stats: &[EntityStats], warm_rows: usize) {
    println!("\n  {:<24} {:>7} {:>9} {:>9}", "Entity", "Months", "Oldest", "Newest");
    for s in stats {
        println!(
            "  {:<24} {:>7} {:>9} {:>9}",
            s.entity_id,
            s.months,
            s.oldest.map(|m| m.to_string()).unwrap_or_else(|| "-".into()),
            s.newest.map(|m| m.to_string()).unwrap_or_else(|| "-".into()),
        );
    }
    println!("\n  Warm cache rows: {}\n", warm_rows);
}
