// Warning groups (as of rust 1.55)
#![deny(
    future_incompatible,
    nonstandard_style,
    rust_2018_compatibility,
    rust_2021_compatibility,
    rust_2018_idioms,
    unused
)]

pub mod error;
pub mod image;
pub mod layout;
pub mod parse;

pub use error::{CommandError, ParseError, ScanError, TableError};
pub use image::{ImageRecord, ImageSet, ImageSetData};
pub use layout::PathLayout;
