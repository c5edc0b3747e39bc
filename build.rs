fn main() {
    println!("cargo:rerun-if-changed=build.rs");

    // ── macOS: embed Info.plist so CoreBluetooth grants Bluetooth access ──────
    //
    // CBCentralManager stays "unauthorized" and never reports advertisements
    // unless the running binary carries an Info.plist with
    // NSBluetoothAlwaysUsageDescription. Command-line tools have no bundle,
    // so the plist goes into the `__TEXT,__info_plist` section of the Mach-O
    // binary via the linker's `-sectcreate` flag.
    //
    // `CARGO_CFG_TARGET_OS` is the *target* OS, so cross-compiling from
    // Linux to macOS picks this up too.
    if std::env::var("CARGO_CFG_TARGET_OS").as_deref() != Ok("macos") {
        return;
    }
    // Only the btleplug binding talks to CoreBluetooth.
    if std::env::var_os("CARGO_FEATURE_PLATFORM").is_none() {
        return;
    }

    let Ok(dir) = std::env::var("CARGO_MANIFEST_DIR") else {
        println!("cargo:warning=CARGO_MANIFEST_DIR is not set; skipping Info.plist embedding");
        return;
    };
    let plist = format!("{dir}/Info.plist");

    // ld … -sectcreate __TEXT __info_plist /path/to/Info.plist …
    println!("cargo:rustc-link-arg=-sectcreate");
    println!("cargo:rustc-link-arg=__TEXT");
    println!("cargo:rustc-link-arg=__info_plist");
    println!("cargo:rustc-link-arg={plist}");
    println!("cargo:rerun-if-changed=Info.plist");
}
