//! Stamps the version reported by `portfleet --version`

use std::process::Command;

/// Trimmed stdout of a successful git command
fn git(args: &[&str]) -> Option<String> {
    let output = Command::new("git").args(args).output().ok()?;
    if !output.status.success() {
        return None;
    }
    let value = String::from_utf8(output.stdout).ok()?.trim().to_string();
    (!value.is_empty()).then_some(value)
}

fn main() {
    // Release builds pin the version; otherwise the latest tag, then Cargo.toml
    let version = std::env::var("PORTFLEET_RELEASE_VERSION")
        .ok()
        .or_else(|| {
            git(&["describe", "--tags", "--abbrev=0"])
                .map(|tag| tag.trim_start_matches('v').to_string())
        })
        .unwrap_or_else(|| env!("CARGO_PKG_VERSION").to_string());

    let mut commit = git(&["rev-parse", "--short", "HEAD"]).unwrap_or_else(|| "unknown".to_string());
    if git(&["status", "--porcelain", "--untracked-files=no"]).is_some() {
        commit.push_str("-dirty");
    }

    println!("cargo:rustc-env=PORTFLEET_VERSION={}", version);
    println!("cargo:rustc-env=PORTFLEET_COMMIT={}", commit);

    println!("cargo:rerun-if-env-changed=PORTFLEET_RELEASE_VERSION");
    println!("cargo:rerun-if-changed=.git/HEAD");
    println!("cargo:rerun-if-changed=.git/refs");
}
