//! Istio networking resources written by the controller.

pub mod destination_rule;
pub mod gateway;
pub mod virtual_service;

pub use self::{
    destination_rule::{DestinationRule, DestinationRuleSpec},
    gateway::{Gateway, GatewaySpec},
    virtual_service::{VirtualService, VirtualServiceSpec},
};

/// The reserved gateway name that routes sidecar-to-sidecar traffic.
pub const MESH_GATEWAY: &str = "mesh";
