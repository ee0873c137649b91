use std::time::{SystemTime, UNIX_EPOCH};

fn main() {
    // Use semantic version from Cargo.toml
    let version = env!("CARGO_PKG_VERSION");

    // Compilation timestamp as seconds since the epoch; "Unknown" if the clock is unusable
    let timestamp = SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_secs().to_string())
        .unwrap_or_else(|_| "Unknown".to_string());

    println!("cargo:rustc-env=BUILD_VERSION={}", version);
    println!("cargo:rustc-env=BUILD_TIMESTAMP={}", timestamp);
    println!("cargo:rerun-if-changed=build.rs");
}
