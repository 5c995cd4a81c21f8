//! Boot command line flags.
//!
//! Flags are any substring beginning with `-` followed by a keyword;
//! unknown tokens are ignored.

use spin::Once;

pub const KERNEL_MODE_LIVE: u8 = 1;

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct BootArgs {
    /// `-live`: run from the boot medium without touching disks.
    pub alive: bool,
    pub aboot_hint_present: u8,
    /// `-silent`: suppress boot logs.
    pub asilent: bool,
}

pub fn args_parse(cmdline: &str) -> BootArgs {
    let mut args = BootArgs::default();
    for (i, _) in cmdline.match_indices('-') {
        let rest = &cmdline[i..];
        if rest.starts_with("-live") {
            args.alive = true;
            args.aboot_hint_present = KERNEL_MODE_LIVE;
        }
        if rest.starts_with("-silent") {
            args.asilent = true;
        }
    }
    args
}

static BOOT_ARGS: Once<BootArgs> = Once::new();

pub fn set_boot_args(args: BootArgs) {
    BOOT_ARGS.call_once(|| args);
}

pub fn boot_args() -> BootArgs {
    BOOT_ARGS.get().copied().unwrap_or_default()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn args0() {
        let a = args_parse("");
        assert_eq!(a, BootArgs::default());
    }

    #[test]
    fn args1() {
        let a = args_parse("-live -silent");
        assert!(a.alive);
        assert_eq!(a.aboot_hint_present, KERNEL_MODE_LIVE);
        assert!(a.asilent);
    }

    #[test]
    fn args2() {
        let a = args_parse("-silent");
        assert!(!a.alive);
        assert_eq!(a.aboot_hint_present, 0);
        assert!(a.asilent);
    }

    #[test]
    fn args3() {
        assert_eq!(args_parse("-bleh vga=off"), BootArgs::default());
    }

    #[test]
    fn args4() {
        // Flags are substring matches, wherever the dash appears.
        let a = args_parse("root=/dev/hda -livecd");
        assert!(a.alive);
    }
}
