#[macro_use]
extern crate log;

#[cfg(test)]
#[macro_use]
extern crate quickcheck;

pub mod acct;
pub mod codec;
pub mod db;
pub mod error;
pub mod misc;
pub mod netdb;
pub mod netgroup;

pub use crate::error::{NssError, Result};
