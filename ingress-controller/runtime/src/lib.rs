#![deny(warnings, rust_2018_idioms)]
#![forbid(unsafe_code)]

mod args;
mod config;
mod controller;
mod prober;
mod store;

pub use self::args::Args;
