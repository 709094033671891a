//! Plumbing around the `vagrant` command line tool.
//!
//! Vagrant workers need three things from the tool: the machine table from
//! `vagrant global-status` (to translate a machine name into the id that
//! `vagrant ssh` wants and to learn whether the guest is running), the
//! address of a guest interface for public-network setups, and `vagrant up`
//! when the host accepts a start offer. All invocations are external
//! blocking tools driven through `tokio::process`.

use std::path::{Path, PathBuf};
use std::process::Stdio;

use regex::Regex;
use tokio::process::Command;
use tracing::debug;

/// One row of the `vagrant global-status` table.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct MachineInfo {
    pub id: String,
    pub name: String,
    pub provider: String,
    pub state: String,
    pub directory: PathBuf,
}

impl MachineInfo {
    pub fn is_running(&self) -> bool {
        self.state == "running"
    }
}

#[derive(Debug, thiserror::Error)]
pub enum VagrantError {
    #[error("can not run vagrant: {0}")]
    Spawn(#[from] std::io::Error),

    #[error("vagrant exited with {status}: {stderr}")]
    CommandFailed { status: String, stderr: String },

    #[error("vagrant machine `{0}` does not exist")]
    MachineNotFound(String),

    #[error("could not parse vagrant output: {0}")]
    Parse(String),
}

async fn run(args: &[&str], cwd: Option<&Path>) -> Result<String, VagrantError> {
    let mut command = Command::new("vagrant");
    command
        .args(args)
        .stdin(Stdio::null())
        .stdout(Stdio::piped())
        .stderr(Stdio::piped());
    if let Some(cwd) = cwd {
        command.current_dir(cwd);
    }

    debug!(?args, "vagrant: running command");
    let output = command.output().await?;
    if !output.status.success() {
        return Err(VagrantError::CommandFailed {
            status: output.status.to_string(),
            stderr: String::from_utf8_lossy(&output.stderr).trim().to_string(),
        });
    }
    Ok(String::from_utf8_lossy(&output.stdout).into_owned())
}

/// Query the global machine table.
pub async fn global_status() -> Result<Vec<MachineInfo>, VagrantError> {
    let output = run(&["global-status"], None).await?;
    parse_global_status(&output)
}

/// Look a single machine up by name.
pub async fn machine_info(machine: &str) -> Result<MachineInfo, VagrantError> {
    global_status()
        .await?
        .into_iter()
        .find(|info| info.name == machine)
        .ok_or_else(|| VagrantError::MachineNotFound(machine.to_string()))
}

/// Address of a guest interface, for public-network guests.
pub async fn ip_address(machine_id: &str, dev: &str) -> Result<String, VagrantError> {
    let command = format!("ip address show dev {dev}");
    let output = run(&["ssh", machine_id, "-c", &command], None).await?;
    parse_inet_address(&output)
        .ok_or_else(|| VagrantError::Parse(format!("no inet address for device {dev}")))
}

/// `vagrant up` for a machine, from its vagrant root when known. Used by
/// hosts that accepted a start offer; may take a long while.
pub async fn start_machine(machine: &str, root: Option<&Path>) -> Result<(), VagrantError> {
    run(&["up", machine], root).await.map(|_| ())
}

fn parse_global_status(output: &str) -> Result<Vec<MachineInfo>, VagrantError> {
    // id       name    provider   state   directory
    // 1a2b3c4  devbox  virtualbox running /home/me/devbox
    let row = Regex::new(r"(?m)^([0-9a-f]{7})\s+(\S+)\s+(\S+)\s+(\S+)\s+(\S.*?)\s*$")
        .map_err(|e| VagrantError::Parse(e.to_string()))?;

    Ok(row
        .captures_iter(output)
        .map(|caps| MachineInfo {
            id: caps[1].to_string(),
            name: caps[2].to_string(),
            provider: caps[3].to_string(),
            state: caps[4].to_string(),
            directory: PathBuf::from(&caps[5]),
        })
        .collect())
}

fn parse_inet_address(output: &str) -> Option<String> {
    let inet = Regex::new(r"inet\s+(\d+\.\d+\.\d+\.\d+)").ok()?;
    inet.captures(output).map(|caps| caps[1].to_string())
}

#[cfg(test)]
mod tests {
    use super::*;

    const GLOBAL_STATUS: &str = "\
id       name    provider   state    directory
-------------------------------------------------------------------
1a2b3c4  devbox  virtualbox running  /home/me/devbox
9f8e7d6  legacy  libvirt    poweroff /home/me/legacy

The above shows information about all known Vagrant environments
on this machine.
";

    #[test]
    fn test_parse_global_status() {
        let machines = parse_global_status(GLOBAL_STATUS).unwrap();
        assert_eq!(machines.len(), 2);
        assert_eq!(machines[0].id, "1a2b3c4");
        assert_eq!(machines[0].name, "devbox");
        assert!(machines[0].is_running());
        assert_eq!(machines[0].directory, PathBuf::from("/home/me/devbox"));
        assert_eq!(machines[1].state, "poweroff");
        assert!(!machines[1].is_running());
    }

    #[test]
    fn test_parse_global_status_empty_table() {
        let machines =
            parse_global_status("id       name    provider   state    directory\n").unwrap();
        assert!(machines.is_empty());
    }

    #[test]
    fn test_parse_inet_address() {
        let output = "\
2: eth1: <BROADCAST,MULTICAST,UP,LOWER_UP> mtu 1500
    inet 192.168.33.10/24 brd 192.168.33.255 scope global eth1
";
        assert_eq!(
            parse_inet_address(output).as_deref(),
            Some("192.168.33.10")
        );
        assert!(parse_inet_address("no address here").is_none());
    }

    #[cfg(feature = "vagrant-integration-tests")]
    #[tokio::test]
    async fn test_global_status_against_real_vagrant() {
        // Requires a vagrant binary on PATH; machines may legitimately be
        // absent, the call itself must succeed.
        global_status().await.unwrap();
    }
}
