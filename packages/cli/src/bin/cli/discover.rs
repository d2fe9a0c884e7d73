// ABOUTME: CLI commands for external dev server discovery and port clearing
// ABOUTME: Runs one reconciliation pass or one conflict resolution and prints the result

use super::utils::{one_shot_config, projects_table};
use colored::*;
use metrodeck_supervisor::{find_pids_on_port, is_port_available, Supervisor};

pub async fn handle_discover_command() -> anyhow::Result<()> {
    let supervisor = Supervisor::new(one_shot_config());
    let ports = supervisor.config().discovery_ports.clone();

    println!(
        "{}",
        format!("🔎 Scanning ports {}-{}", ports.start(), ports.end())
            .blue()
            .bold()
    );
    println!();

    supervisor.reconcile().await;
    let projects = supervisor.list_projects().await;

    if projects.is_empty() {
        println!("{}", "No running dev servers found".yellow());
        return Ok(());
    }

    println!("{}", projects_table(&projects));
    println!("Total: {} dev servers", projects.len().to_string().cyan());
    Ok(())
}

pub async fn handle_kill_port_command(port: u16) -> anyhow::Result<()> {
    if is_port_available(port) {
        println!("{}", format!("Port {} is already free", port).green());
        return Ok(());
    }

    let pids = find_pids_on_port(port).await;
    if pids.is_empty() {
        println!(
            "{}",
            format!("Port {} is busy but its owner is not visible", port).yellow()
        );
    } else {
        println!("Port {} is held by PID(s) {:?}", port, pids);
    }

    let supervisor = Supervisor::new(one_shot_config());
    supervisor.free_port(port).await?;
    println!("{}", format!("✅ Port {} is free", port).green());
    Ok(())
}
