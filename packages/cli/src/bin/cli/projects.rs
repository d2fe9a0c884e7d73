use colored::*;
use metrodeck_supervisor::detector::{ProjectDetector, DEFAULT_PROJECT_TYPE};
use metrodeck_supervisor::DEFAULT_METRO_PORT;
use std::path::Path;

pub fn handle_check_command(path: &Path) -> anyhow::Result<()> {
    ProjectDetector::validate_project_path(path)?;

    let marker = ProjectDetector::read_type_marker(path);
    let project_type = ProjectDetector::detect_project_type(path, None, DEFAULT_PROJECT_TYPE);

    println!(
        "{}",
        format!("✅ {} is a React Native project", path.display()).green()
    );
    println!("   Type: {}", project_type.display_name().cyan());
    match marker {
        Some(marked) => println!("   Type marker: {}", marked.as_str()),
        None => println!("   Type marker: {}", "none".dimmed()),
    }

    match ProjectDetector::launch_command(project_type, path, DEFAULT_METRO_PORT) {
        Ok(command) => println!("   Launch: {}", command.display().dimmed()),
        Err(e) => println!("   {}", e.to_string().yellow()),
    }
    Ok(())
}
