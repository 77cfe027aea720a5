//! Cross-platform console symbols
//!
//! Provides ASCII-safe symbols for Windows compatibility.

/// Checkmark symbol
#[cfg(windows)]
pub const CHECK: &str = "[OK]";
#[cfg(not(windows))]
pub const CHECK: &str = "\u{2713}"; // ✓

/// Cross/error symbol
#[cfg(windows)]
pub const CROSS: &str = "[X]";
#[cfg(not(windows))]
pub const CROSS: &str = "\u{2717}"; // ✗

/// Unknown / not tested symbol
#[cfg(windows)]
pub const QUESTION: &str = "[?]";
#[cfg(not(windows))]
pub const QUESTION: &str = "?";

/// Warning symbol
#[cfg(windows)]
pub const WARN: &str = "[!]";
#[cfg(not(windows))]
pub const WARN: &str = "!";

/// Search symbol (table titles)
#[cfg(windows)]
pub const LOOKING_GLASS: &str = "[?]";
#[cfg(not(windows))]
pub const LOOKING_GLASS: &str = "\u{1F50D}"; // 🔍

/// Character repeated for table rules
pub const RULE: char = '=';
