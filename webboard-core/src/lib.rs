//! Container-agnostic registration and dispatch model for web elements.
//!
//! Web elements (servlets, filters, listeners, resources, error pages and welcome files) are
//! published by independent registration sources and bound to logical contexts, which are in
//! turn layered over physical mount points. This crate decides which of the competing elements
//! is active, applies structural changes atomically against an engine adapter, and composes
//! the filter chain for every request.
//!
//! Dependency order of the modules, leaves first: [`context`], [`element`], [`resolver`],
//! [`server`] (the batch engine), [`dispatch`]. The [`engine`] module describes the adapter the
//! batch engine materializes effects into, and [`whiteboard`] turns registration events into
//! batches.
mod error;
pub use error::{
    AnyError, AnyResult, BatchError, ConfigError, DispatchError, EngineError, RegistrationError,
    ServletError, ValidationError,
};

pub mod config;
pub mod context;
pub mod dispatch;
pub mod element;
pub mod engine;
pub mod http;
pub mod resolver;
pub mod server;
pub mod util;
pub mod whiteboard;
