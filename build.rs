use std::env;

fn main() {
    // The assembly stubs are i386-only; skip them when building the crate for
    // the host (unit tests exercise the portable core through the test seams).
    let arch = env::var("CARGO_CFG_TARGET_ARCH").unwrap_or_default();
    if arch != "x86" {
        return;
    }

    cc::Build::new()
        .file("src/asm/vectors.S")
        .file("src/asm/alltraps.S")
        .file("src/asm/switch.S")
        .compile("vkstubs");
}
