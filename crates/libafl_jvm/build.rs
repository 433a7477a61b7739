use std::{env, fs::File, io::Write, path::Path};

fn main() {
    let out_dir = env::var_os("OUT_DIR").unwrap();
    let out_dir = out_dir.to_string_lossy().to_string();
    let dest_path = Path::new(&out_dir).join("constants.rs");

    let map_initial_size: usize = option_env!("LIBAFL_JVM_MAP_INITIAL_SIZE")
        .map_or(Ok(512), str::parse)
        .expect("Could not parse LIBAFL_JVM_MAP_INITIAL_SIZE");
    let map_max_size: usize = option_env!("LIBAFL_JVM_MAP_MAX_SIZE")
        .map_or(Ok(1 << 20), str::parse)
        .expect("Could not parse LIBAFL_JVM_MAP_MAX_SIZE");

    assert!(
        map_initial_size > 0 && map_initial_size <= map_max_size,
        "LIBAFL_JVM_MAP_INITIAL_SIZE ({map_initial_size}) must be in 1..=LIBAFL_JVM_MAP_MAX_SIZE ({map_max_size})"
    );

    let mut constants_file = File::create(dest_path).expect("Could not create file");
    write!(
        constants_file,
        "// These constants are autogenerated by build.rs

        /// The number of counters the coverage map starts out with
        pub const COVERAGE_MAP_INITIAL_SIZE: usize = {map_initial_size};
        /// The number of counters the coverage map may grow to
        pub const COVERAGE_MAP_MAX_SIZE: usize = {map_max_size};
"
    )
    .expect("Could not write file");

    println!("cargo:rerun-if-env-changed=LIBAFL_JVM_MAP_INITIAL_SIZE");
    println!("cargo:rerun-if-env-changed=LIBAFL_JVM_MAP_MAX_SIZE");
    println!("cargo:rerun-if-changed=build.rs");
}
