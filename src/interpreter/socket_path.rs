//! Local-socket path construction for local servers.
//!
//! On systems that prefer Unix domain sockets the server listens on a
//! per-project socket file. `sun_path` is tiny, so the path is capped at
//! 103 bytes with a temp-directory fallback, and a truncated project name
//! as the last resort.

use std::path::PathBuf;

/// Longest socket path the OS accepts.
pub const MAX_SOCKET_PATH: usize = 103;

const SOCKET_FILE: &str = "server.sock";

/// Socket path for a project, always within the length cap.
pub fn for_project(project: &str) -> PathBuf {
    let project = if project.is_empty() { "broker" } else { project };

    let preferred = dirs::data_dir()
        .unwrap_or_else(std::env::temp_dir)
        .join("analysis-broker")
        .join(project)
        .join(SOCKET_FILE);
    if fits(&preferred) {
        return preferred;
    }

    let fallback = std::env::temp_dir().join(project).join(SOCKET_FILE);
    if fits(&fallback) {
        return fallback;
    }

    // Probably the project name is crazy long.
    let truncated: String = project.chars().take(10).collect();
    std::env::temp_dir().join(truncated).join(SOCKET_FILE)
}

fn fits(path: &PathBuf) -> bool {
    path.as_os_str().len() < MAX_SOCKET_PATH
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_path_is_keyed_by_project() {
        let a = for_project("alpha");
        let b = for_project("beta");
        assert_ne!(a, b);
        assert!(a.to_string_lossy().contains("alpha"));
        assert!(a.to_string_lossy().ends_with("server.sock"));
    }

    #[test]
    fn test_empty_project_gets_a_default() {
        let path = for_project("");
        assert!(path.to_string_lossy().contains("broker"));
    }

    #[test]
    fn test_long_project_falls_back_under_cap() {
        let huge = "p".repeat(200);
        let path = for_project(&huge);
        assert!(path.as_os_str().len() < MAX_SOCKET_PATH);
    }
}
