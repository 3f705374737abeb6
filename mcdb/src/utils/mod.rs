pub mod error;
pub mod serialize;
pub mod tmpfile;
