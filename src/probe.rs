//! Host checks run before provisioning: is VirtualBox installed, and can we
//! drive it through `VBoxManage`.

use std::path::{Path, PathBuf};

use crate::backend::vboxmanage::VBoxManage;
use crate::error::ImporterError;

const REGISTRY_KEY: &str = r"HKLM\SOFTWARE\Oracle\VirtualBox";

/// Whether VirtualBox appears to be installed on this host.
pub async fn is_hypervisor_installed() -> bool {
    if cfg!(windows) {
        query_registry(None).await.is_ok()
    } else {
        which::which("virtualbox").is_ok() || which::which("VirtualBox").is_ok()
    }
}

/// Installation directory recorded by the Windows installer.
pub async fn installation_dir() -> Option<PathBuf> {
    if !cfg!(windows) {
        return None;
    }
    let out = query_registry(Some("InstallDir")).await.ok()?;
    parse_registry_value(&out, "InstallDir").map(PathBuf::from)
}

/// Find `VBoxManage` and check that it runs.
pub async fn locate_control_tool() -> Result<VBoxManage, ImporterError> {
    let program = find_control_tool(installation_dir().await.as_deref()).ok_or_else(|| {
        ImporterError::AutomationUnavailable {
            hint: "VBoxManage was not found in the VirtualBox installation or on PATH".into(),
        }
    })?;

    let api = VBoxManage::new(program);
    match api.version().await {
        Ok(version) => {
            tracing::debug!(program = %api.program().display(), %version, "found VBoxManage");
            Ok(api)
        }
        Err(e) => Err(ImporterError::AutomationUnavailable {
            hint: format!("{} did not run: {e}", api.program().display()),
        }),
    }
}

fn find_control_tool(install_dir: Option<&Path>) -> Option<PathBuf> {
    if let Some(dir) = install_dir {
        let candidate = dir.join(if cfg!(windows) {
            "VBoxManage.exe"
        } else {
            "VBoxManage"
        });
        if candidate.is_file() {
            return Some(candidate);
        }
    }
    which::which("VBoxManage")
        .or_else(|_| which::which("vboxmanage"))
        .ok()
}

async fn query_registry(value: Option<&str>) -> Result<String, ImporterError> {
    let mut cmd = tokio::process::Command::new("reg");
    cmd.args(["query", REGISTRY_KEY]);
    if let Some(value) = value {
        cmd.args(["/v", value]);
    }
    cmd.arg("/reg:64");

    let output = cmd.output().await.map_err(|e| ImporterError::Io {
        context: "running reg query".into(),
        source: e,
    })?;
    if !output.status.success() {
        return Err(ImporterError::ExternalCommand {
            command: "reg query".into(),
            message: String::from_utf8_lossy(&output.stderr).trim().to_string(),
        });
    }
    Ok(String::from_utf8_lossy(&output.stdout).into_owned())
}

/// Pull `name` out of `reg query` output, which looks like
/// `    InstallDir    REG_SZ    C:\Program Files\Oracle\VirtualBox\`.
fn parse_registry_value(out: &str, name: &str) -> Option<String> {
    out.lines().find_map(|line| {
        let line = line.trim();
        let rest = line.strip_prefix(name)?;
        let rest = rest.trim_start();
        let (kind, value) = rest.split_once(char::is_whitespace)?;
        kind.starts_with("REG_").then(|| value.trim().to_string())
    })
}
