//! Version subcommand implementation

use lanbridge_common::{ClientConfig, RelayConfig};

pub fn run() {
    println!("lanbridge {}", env!("CARGO_PKG_VERSION"));
    println!(
        "max frame: relay {} KiB, client {} KiB",
        RelayConfig::default().max_frame_size / 1024,
        ClientConfig::default().max_frame_size / 1024
    );

    #[cfg(target_os = "linux")]
    println!("target: linux");
    #[cfg(target_os = "macos")]
    println!("target: macos");
    #[cfg(target_os = "windows")]
    println!("target: windows");
    #[cfg(not(any(target_os = "linux", target_os = "macos", target_os = "windows")))]
    println!("target: unknown");
}
