#![deny(warnings, rust_2018_idioms)]
#![forbid(unsafe_code)]

pub mod config;
pub mod network;
pub mod probe;

pub use self::{
    config::{ConfigSnapshot, GatewayConfig, GatewaysByVisibility, HttpProtocol, IstioConfig, NetworkConfig},
    probe::{HashProbeInjector, ProbeInjector, ProbeTarget},
};
