//! Version Command

use virtmigrate_core::BuildInfo;

/// Run version command
pub fn run() {
    println!("virtmigrate");
    println!("{}", BuildInfo::current());
}
