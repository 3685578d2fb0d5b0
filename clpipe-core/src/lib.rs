#![forbid(unsafe_code)]

pub use bytemuck;

pub mod scalar;
