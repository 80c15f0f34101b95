//! `cncsort-middleware` – event routing
//!
//! Decouples the components that produce domain events (bed mapping, the
//! motion gate, the planner) from the ones that react to them (persistence,
//! display, audit, planning).
//!
//! # Modules
//!
//! - [`bus`] – Synchronous, kind-routed event channel with handler isolation
//!   and a broadcast tap for async observers.

pub mod bus;

pub use bus::{EventChannel, Handler, HandlerFailure, PublishReport, SubscriptionId};
