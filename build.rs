// Build script for ShuffleFS
//
// Emits a pkg-config file so the C preload layer above the shuffler can
// locate the static library at link time.

use std::env;
use std::path::Path;

fn main() {
    let out_dir = env::var("OUT_DIR").expect("OUT_DIR not set by cargo");
    write_pkg_config(Path::new(&out_dir));

    println!("cargo:rerun-if-changed=build.rs");
}

/// Render shufflefs.pc into `dir`.
///
/// The library path points at the cargo target directory for the active
/// profile, so a preload build can link against a plain `cargo build`
/// without an install step. Overriding PREFIX only changes the recorded
/// install prefix, not where cargo puts the artifacts.
fn write_pkg_config(dir: &Path) {
    let lib_dir = {
        let target = env::var("CARGO_TARGET_DIR").unwrap_or_else(|_| {
            let manifest = env::var("CARGO_MANIFEST_DIR").unwrap();
            format!("{}/target", manifest)
        });
        format!("{}/{}", target, env::var("PROFILE").unwrap())
    };

    let variables = [
        (
            "prefix",
            env::var("PREFIX").unwrap_or_else(|_| "/usr/local".to_string()),
        ),
        ("exec_prefix", "${prefix}".to_string()),
        ("libdir", lib_dir),
    ];
    let fields = [
        ("Name", "ShuffleFS".to_string()),
        (
            "Description",
            "Particle shuffle layer for indexed log directories".to_string(),
        ),
        ("Version", env::var("CARGO_PKG_VERSION").unwrap()),
        (
            "Libs",
            "-L${libdir} -lshufflefs -lpthread -ldl -lm".to_string(),
        ),
    ];

    let mut pc = String::from("# ShuffleFS pkg-config file\n\n");
    for (name, value) in &variables {
        pc.push_str(&format!("{}={}\n", name, value));
    }
    pc.push('\n');
    for (name, value) in &fields {
        pc.push_str(&format!("{}: {}\n", name, value));
    }

    std::fs::write(dir.join("shufflefs.pc"), pc).expect("could not write shufflefs.pc");
}
