//! # relay-gateway
//!
//! One OpenAI-compatible API surface in front of many upstream AI provider
//! channels.
//!
//! This library provides:
//! - Channel selection with priority, weights, cooldowns and failover
//! - Protocol adaptors for OpenAI, Anthropic, Gemini, Groq, Zhipu, Novita
//!   and OpenAI-compatible custom endpoints
//! - Ratio-based quota computation with tiered per-provider pricing
//! - Async task bindings so video polls reach the channel that started the job
//!
//! ## Request Flow
//!
//! ```text
//!   client ──▶ api ──▶ dispatcher ──▶ adaptor ──▶ upstream provider
//!               │          │
//!               │          ├──▶ pricing (quota)  ──▶ usage sink
//!               └──────────┴──▶ task_binding (create / resolve)
//! ```
//!
//! ## Modules
//! - `relay`: canonical request/response types
//! - `adaptor`: provider wire formats
//! - `dispatcher`: failover loop and metering
//! - `pricing`: price tables and ratio resolution
//! - `task_binding`: task id → channel stores

pub mod adaptor;
pub mod api;
pub mod channel;
pub mod channel_health;
pub mod config;
pub mod dispatcher;
pub mod error;
pub mod pricing;
pub mod relay;
pub mod task_binding;
pub mod usage;

pub use config::Config;
pub use dispatcher::{DispatchContext, Dispatched, Dispatcher};
pub use error::{DispatchFailure, RelayError};
