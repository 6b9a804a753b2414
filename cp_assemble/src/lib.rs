// Warning groups (as of rust 1.55)
#![deny(
    future_incompatible,
    nonstandard_style,
    rust_2018_compatibility,
    rust_2021_compatibility,
    rust_2018_idioms,
    unused
)]

// assembling cluster jobs for a CellProfiler pipeline
pub mod admission;
pub mod commands;
pub mod filelist;
pub mod join;
pub mod loaddata;
pub mod plate;
pub mod scripts;
pub mod splitter;
