//! Accelerator pod fleet management for deep-learning hosts.
//!
//! This crate tracks the accelerator pods a single host has leased from a
//! cloud provider, keeps that picture reconciled against what the provider
//! actually reports, and hands pods out to callers with at-most-one-claimant
//! semantics across OS processes.
//!
//! ## Architecture
//!
//! ```text
//! ┌──────────────────────────────────────────────────────────────┐
//! │                         Host machine                         │
//! │  ┌────────────────┐   claims   ┌───────────────────────────┐ │
//! │  │  FleetManager  │◄──────────►│  ClaimLedger (flock+JSON) │ │
//! │  │  get/up/clean  │            │  shared across processes  │ │
//! │  └───────┬────────┘            └───────────────────────────┘ │
//! │          │ list / describe / create / start / stop / delete  │
//! │          ▼                                                   │
//! │  ┌────────────────┐                                          │
//! │  │ CommandRunner  │  provider CLI (e.g. gcloud compute tpus) │
//! │  └───────┬────────┘                                          │
//! └──────────┼───────────────────────────────────────────────────┘
//!            ▼
//!   ┌─────────────────┐
//!   │ Cloud provider  │  accelerator pods: host1-abcde, ...
//!   └─────────────────┘
//! ```
//!
//! ## Example
//!
//! ```ignore
//! use accel::{AcquireRequest, FleetManager};
//!
//! let mut fleet = FleetManager::new(ctx);
//! fleet.refresh(false).await?;
//!
//! // Hand out a healthy v3-8 pod, provisioning one if none is free.
//! let pod = fleet.get(AcquireRequest::by_version("v3-8")).await?;
//! println!("{} at {:?}", pod.name(), pod.ip());
//!
//! // Done with it.
//! pod.release()?;
//! ```

#![warn(clippy::pedantic)]
#![allow(clippy::module_name_repetitions)]

pub mod config;
pub mod context;
pub mod error;
pub mod exec;
pub mod fleet;
pub mod hosts;
pub mod ledger;
pub mod pod;

pub use config::Config;
pub use context::FleetContext;
pub use error::{AccelError, AccelResult};
pub use exec::{CommandOutput, CommandRunner, RetryPolicy, ShellRunner};
pub use fleet::{
    detect_software_version, AcquireRequest, CandidateSource, FleetManager, ProvisionRequest,
    RandomCandidates, DEFAULT_VERSION,
};
pub use hosts::{EnvRegistry, FixedEnv, GcpEnv, HostEnv, ShellEnv};
pub use ledger::{is_pid_alive, ClaimLedger};
pub use pod::{Accelerator, PodDetails, PodHealth, PodState};
