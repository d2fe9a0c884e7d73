// ABOUTME: Long-running CLI commands that follow supervisor events
// ABOUTME: `run` streams one project's logs; `watch` prints registry changes

use super::utils::{format_log_entry, one_shot_config, projects_table, status_label, LogCursor};
use colored::*;
use metrodeck_supervisor::{
    ProjectField, ProjectId, ProjectStatus, Supervisor, SupervisorConfig, SupervisorEvent,
};
use std::path::Path;
use tokio::sync::broadcast::error::RecvError;
use tracing::warn;

pub async fn handle_run_command(path: &Path, port: Option<u16>) -> anyhow::Result<()> {
    let supervisor = Supervisor::new(one_shot_config());
    let id = supervisor.add_project(path, None, port).await?;
    let mut events = supervisor.subscribe();

    if let Some(project) = supervisor.project(id).await {
        println!(
            "{}",
            format!(
                "🚀 Starting {} ({}) on port {}",
                project.name,
                project.project_type.display_name(),
                project.port
            )
            .blue()
            .bold()
        );
        println!("{}", "Press Ctrl-C to stop".dimmed());
    }

    let mut cursor = LogCursor::default();
    supervisor.start(id).await?;

    loop {
        tokio::select! {
            _ = tokio::signal::ctrl_c() => {
                println!();
                break;
            }
            event = events.recv() => match event {
                Ok(event) => {
                    if print_run_event(&supervisor, id, &mut cursor, event).await {
                        break;
                    }
                }
                Err(RecvError::Lagged(skipped)) => {
                    warn!("Missed {} supervisor events", skipped);
                }
                Err(RecvError::Closed) => break,
            }
        }
    }

    println!("{}", "Stopping dev server...".dimmed());
    supervisor.shutdown().await;
    print_new_logs(&supervisor, id, &mut cursor).await;
    Ok(())
}

/// Print the entries stored since the last call
async fn print_new_logs(supervisor: &Supervisor, id: ProjectId, cursor: &mut LogCursor) {
    match supervisor.logs_after(id, cursor.position()).await {
        Ok(entries) => {
            for entry in cursor.take_new(entries) {
                println!("{}", format_log_entry(&entry));
            }
        }
        Err(e) => warn!("Could not read logs: {}", e),
    }
}

/// Print one event for the followed project. Returns true once the project
/// has failed for good.
async fn print_run_event(
    supervisor: &Supervisor,
    id: ProjectId,
    cursor: &mut LogCursor,
    event: SupervisorEvent,
) -> bool {
    match event {
        SupervisorEvent::LogsAppended { id: event_id, .. } if event_id == id => {
            print_new_logs(supervisor, id, cursor).await;
            false
        }
        SupervisorEvent::ProjectChanged { id: event_id, fields } if event_id == id => {
            print_new_logs(supervisor, id, cursor).await;
            let Some(project) = supervisor.project(id).await else {
                return true;
            };
            if fields.contains(&ProjectField::Port) {
                println!("{}", format!("Port changed to {}", project.port).yellow());
            }
            if fields.contains(&ProjectField::Status) {
                println!("{} {}", "●".bold(), status_label(project.status));
            }
            project.status == ProjectStatus::Error && !project.should_retry
        }
        _ => false,
    }
}

pub async fn handle_watch_command() -> anyhow::Result<()> {
    let config = SupervisorConfig::from_env();
    if !config.discovery_enabled {
        println!(
            "{}",
            "Background discovery is disabled; only user projects will be shown".yellow()
        );
    }

    let supervisor = Supervisor::init(config).await;
    let mut events = supervisor.subscribe();

    let projects = supervisor.list_projects().await;
    println!("{}", "👀 Watching dev servers".blue().bold());
    if !projects.is_empty() {
        println!("{}", projects_table(&projects));
    }
    println!("{}", "Press Ctrl-C to exit".dimmed());

    loop {
        tokio::select! {
            _ = tokio::signal::ctrl_c() => {
                println!();
                break;
            }
            event = events.recv() => match event {
                Ok(event) => print_watch_event(&supervisor, event).await,
                Err(RecvError::Lagged(skipped)) => {
                    warn!("Missed {} supervisor events", skipped);
                }
                Err(RecvError::Closed) => break,
            }
        }
    }

    supervisor.shutdown().await;
    Ok(())
}

async fn print_watch_event(supervisor: &Supervisor, event: SupervisorEvent) {
    match event {
        SupervisorEvent::ProjectAdded { id } => {
            if let Some(project) = supervisor.project(id).await {
                println!(
                    "{} {} on port {} ({})",
                    "+".green().bold(),
                    project.name,
                    project.port,
                    project.project_type.display_name()
                );
            }
        }
        SupervisorEvent::ProjectRemoved { id } => {
            println!("{} {}", "-".red().bold(), id);
        }
        SupervisorEvent::ProjectChanged { id, fields } => {
            if let Some(project) = supervisor.project(id).await {
                let fields: Vec<String> = fields.iter().map(|field| format!("{:?}", field)).collect();
                println!(
                    "{} {} [{}] {}",
                    "~".yellow().bold(),
                    project.name,
                    fields.join(", "),
                    status_label(project.status)
                );
            }
        }
        SupervisorEvent::LogsAppended { .. } => {}
    }
}
