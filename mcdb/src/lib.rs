#[cfg(test)]
#[macro_use]
extern crate quickcheck;

pub mod dbfile;
pub mod hash;
pub mod make;
pub mod remap;
pub mod utils;

pub use crate::utils::error::{Error, Result};
