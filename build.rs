#[cfg(feature = "generate-header")]
use std::env;
#[cfg(feature = "generate-header")]
use std::path::PathBuf;

const HEADER: &str = "include/tunnel_bridge.h";

fn main() {
    println!("cargo:rerun-if-changed=src/lib.rs");
    println!("cargo:rerun-if-changed=src/ffi");
    println!("cargo:rerun-if-changed={HEADER}");

    #[cfg(feature = "generate-header")]
    generate_header();

    #[cfg(not(feature = "generate-header"))]
    println!("cargo:warning=Skipping {HEADER} regeneration (enable `generate-header` to refresh it).");
}

/// Writes the C header for the point API. Only the `Bridge*` surface and the
/// types it mentions are exported; `TunnelPoint` stays opaque.
#[cfg(feature = "generate-header")]
fn generate_header() {
    use std::fs;

    let Ok(crate_dir) = env::var("CARGO_MANIFEST_DIR").map(PathBuf::from) else {
        panic!("CARGO_MANIFEST_DIR missing");
    };
    let output = crate_dir.join(HEADER);
    if let Some(parent) = output.parent() {
        if let Err(error) = fs::create_dir_all(parent) {
            panic!("failed to create {}: {error}", parent.display());
        }
    }

    let config = cbindgen::Config {
        language: cbindgen::Language::C,
        include_guard: Some("TUNNEL_BRIDGE_H".to_string()),
        documentation: true,
        cpp_compat: true,
        usize_is_size_t: true,
        ..cbindgen::Config::default()
    };

    let bindings = cbindgen::Builder::new()
        .with_crate(&crate_dir)
        .with_config(config)
        .include_item("BridgeSupportSet")
        .include_item("BridgeLogSink")
        .generate();

    match bindings {
        Ok(bindings) => {
            if bindings.write_to_file(&output) {
                println!("cargo:warning=Updated {}", output.display());
            }
        }
        Err(error) => panic!("cbindgen failed: {error}"),
    }
}
