//! Core library for gridmatch: pure 3×3 board rules and the JSON wire
//! protocol shared between the server and its clients.

pub mod board;
pub mod protocol;
