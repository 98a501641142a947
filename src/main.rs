use std::env;

use table_probe::{harness, TableServiceClient, EMULATOR_CONNECTION_STRING};

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    tracing_subscriber::fmt::init();

    println!("\n╔════════════════════════════════════════════════════╗");
    println!("║  TABLE-PROBE - Table Storage Emulator Smoke Test   ║");
    println!("╚════════════════════════════════════════════════════╝\n");

    // TABLE_CONNECTION_STRING overrides the well-known emulator descriptor.
    let connection_string = env::var("TABLE_CONNECTION_STRING")
        .unwrap_or_else(|_| EMULATOR_CONNECTION_STRING.to_string());

    println!("▶ Connecting...");
    let service = TableServiceClient::connect(&connection_string)?;
    println!("✓ Connected\n");

    let report = harness::run(&service).await?;

    println!("━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━");
    println!("✅ Smoke test passed");
    println!("  • Table:       {}", report.table_name);
    println!("  • Batch table: {}", report.batch_table_name);
    println!("  • Entities:    {} over {} pages", report.total_entities, report.page_sizes.len());

    Ok(())
}
