use std::process::Command;
use std::time::{SystemTime, UNIX_EPOCH};

// Deployment images pin the version through VEILTUN_GIT_TAG; developer
// builds fall back to `git describe`, then to the crate version.
fn main() {
    println!("cargo:rerun-if-env-changed=VEILTUN_GIT_TAG");

    let mut build_version = std::env::var("VEILTUN_GIT_TAG")
        .unwrap_or_default()
        .trim()
        .to_string();
    if build_version.is_empty() {
        build_version = git_describe().unwrap_or_default();
    }
    if build_version.is_empty() {
        build_version = env!("CARGO_PKG_VERSION").to_string();
    }
    println!("cargo:rustc-env=VEILTUN_BUILD_VERSION={build_version}");

    // Surfaced by the web server's status endpoint so operators can tell
    // which image a running daemon came from.
    let build_epoch = SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|elapsed| elapsed.as_secs())
        .unwrap_or(0);
    println!("cargo:rustc-env=VEILTUN_BUILD_EPOCH={build_epoch}");
}

fn git_describe() -> Option<String> {
    let output = Command::new("git")
        .args(["describe", "--tags", "--always", "--dirty"])
        .output()
        .ok()?;
    if !output.status.success() {
        return None;
    }
    let description = String::from_utf8(output.stdout).ok()?;
    let description = description.trim();
    if description.is_empty() {
        None
    } else {
        Some(description.to_string())
    }
}
