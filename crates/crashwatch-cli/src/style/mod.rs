//! Terminal output: semantic colors, message helpers and result tables.

use std::sync::atomic::{AtomicBool, Ordering};

pub mod colors;
pub mod output;
pub mod table;

pub use output::*;
pub use table::*;

/// Global flag to track if colors are disabled.
static NO_COLOR: AtomicBool = AtomicBool::new(false);

pub fn set_no_color(value: bool) {
    NO_COLOR.store(value, Ordering::SeqCst);
}

/// True when `--no-color` was given or `NO_COLOR` is set.
pub fn no_color() -> bool {
    NO_COLOR.load(Ordering::SeqCst) || std::env::var_os("NO_COLOR").is_some()
}
