//! OpenFlow 1.0 control plane for locality-aware VM placement.
//!
//! Switch sessions ([`ofp_controller::openflow0x01`]) feed a [`controller::Controller`], which
//! keeps the topology, programs per-pair paths and aggregates flow counters. The
//! [`orchestrator`] periodically evaluates the VM placement against the network cost and
//! live-migrates VMs once a better placement has been stable for a while.

pub mod api;
pub mod config;
pub mod controller;
pub mod cost;
pub mod error;
pub mod mac;
pub mod ofp_controller;
pub mod ofp_header;
pub mod ofp_message;
pub mod openflow0x01;
pub mod orchestrator;
pub mod packet;
pub mod telemetry;
pub mod topology;
