//! TDMA link simulation

use std::time::Duration;

use anyhow::Result;
use clap::Parser;
use colored::Colorize;
use indicatif::{ProgressBar, ProgressStyle};
use tdma_sim::{scenarios, SimulationPresets};

#[derive(Parser, Debug)]
#[command(name = "tdma_sim", about = "Run a hub and ground stations over simulated radio links")]
struct Cli {
    /// Number of ground stations
    #[arg(short, long, default_value_t = 3)]
    stations: usize,

    /// Transmissions per station
    #[arg(short, long, default_value_t = 2)]
    rounds: usize,
}

#[tokio::main]
async fn main() -> Result<()> {
    env_logger::init();
    let cli = Cli::parse();

    println!("{}", "TDMA Link Simulation".bright_blue().bold());
    println!("{}", "====================".bright_blue());

    let presets = [
        ("Good Conditions", SimulationPresets::good_conditions()),
        ("Average Conditions", SimulationPresets::average_conditions()),
        ("Poor Conditions", SimulationPresets::poor_conditions()),
    ];

    let spinner_style = ProgressStyle::default_spinner().template("{spinner:.cyan} {msg}")?;

    for (name, link) in presets {
        println!("{}", format!("\n>>> Testing: {}", name).bright_green().bold());
        println!("Bandwidth: {} bps", link.bandwidth_bps);
        println!("Packet Loss: {}%", (link.packet_loss * 100.0) as u32);
        println!("Latency: {:?}", link.latency);
        println!();

        let bar = ProgressBar::new_spinner();
        bar.set_style(spinner_style.clone());
        bar.set_message(format!("{} stations sharing {} slots...", cli.stations, scenarios::SHARED_SLOTS));
        bar.enable_steady_tick(Duration::from_millis(100));
        let outcome = scenarios::slot_sharing(link.clone(), cli.stations, cli.rounds).await;
        bar.finish_and_clear();
        let outcome = outcome?;

        for report in &outcome.reports {
            let slot = match report.assigned_slot {
                Some(slot) => slot.to_string().bright_white(),
                None => "none".red(),
            };
            let line = format!(
                "{}: slot {}, {} sent, {} acked, {} frames lost",
                report.node_id, slot, report.transmissions, report.acks, report.frames_dropped
            );
            if report.acks == report.transmissions {
                println!("  {}", line);
            } else {
                println!("  {}", line.yellow());
            }
        }
        println!("Hub received {} payloads", outcome.delivered);
        print!("{}", outcome.table);

        println!("\nFragmentation:");
        scenarios::fragmentation_test(link).await?;

        println!("{}", "Test complete!".bright_yellow());
        println!("{}", "-".repeat(50));
    }

    println!("\n{}", "All simulations complete!".bright_green().bold());
    Ok(())
}
