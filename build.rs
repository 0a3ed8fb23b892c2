use std::collections::HashMap;
use std::fs;

/// Dependencies reported by `drive-import about`
const TRACKED_DEPS: &[&str] = &[
    "tokio",
    "reqwest",
    "serde",
    "serde_json",
    "oauth2",
    "secrecy",
    "tracing",
    "thiserror",
    "clap",
    "indicatif",
];

fn main() {
    // Parse Cargo.lock to extract resolved dependency versions
    // A missing lockfile reports every version as "unknown"
    let lock_contents = fs::read_to_string("Cargo.lock").unwrap_or_default();

    let versions = parse_cargo_lock(&lock_contents);

    for dep_name in TRACKED_DEPS {
        let env_key = format!("DEP_VERSION_{}", dep_name.to_uppercase().replace('-', "_"));
        let version = versions.get(*dep_name).map(|v| v.as_str()).unwrap_or("unknown");
        println!("cargo:rustc-env={env_key}={version}");
    }

    println!("cargo:rerun-if-changed=Cargo.lock");

    // Detect Rust compiler version at build time: "rustc 1.84.0 (...)" → "1.84.0"
    if let Ok(output) = std::process::Command::new("rustc").arg("--version").output() {
        let ver_line = String::from_utf8_lossy(&output.stdout);
        let ver = ver_line.split_whitespace().nth(1).unwrap_or("unknown");
        println!("cargo:rustc-env=RUSTC_VERSION={ver}");
    } else {
        println!("cargo:rustc-env=RUSTC_VERSION=unknown");
    }
}

/// Parse Cargo.lock and return highest version for each package name.
/// When a crate appears multiple times (e.g. an older http as transitive + http 1 as direct),
/// we keep the highest semver version which corresponds to our direct dependency.
fn parse_cargo_lock(contents: &str) -> HashMap<String, String> {
    let mut versions: HashMap<String, String> = HashMap::new();
    let mut current_name: Option<String> = None;

    for line in contents.lines() {
        let trimmed = line.trim();
        if trimmed.starts_with("name = ") {
            current_name = trimmed
                .strip_prefix("name = \"")
                .and_then(|s| s.strip_suffix('"'))
                .map(|s| s.to_string());
        } else if trimmed.starts_with("version = ") {
            if let Some(ref name) = current_name {
                if let Some(ver) = trimmed
                    .strip_prefix("version = \"")
                    .and_then(|s| s.strip_suffix('"'))
                {
                    let should_replace = match versions.get(name) {
                        None => true,
                        Some(existing) => compare_semver(ver, existing) == std::cmp::Ordering::Greater,
                    };
                    if should_replace {
                        versions.insert(name.clone(), ver.to_string());
                    }
                }
            }
            current_name = None;
        }
    }

    versions
}

/// Simple semver comparison: split on '.' and compare numerically
fn compare_semver(a: &str, b: &str) -> std::cmp::Ordering {
    let parse = |s: &str| -> Vec<u64> {
        s.split('.').filter_map(|p| p.parse().ok()).collect()
    };
    parse(a).cmp(&parse(b))
}
