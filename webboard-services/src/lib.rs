//! Concrete collaborators for the webboard core: an in-process engine adapter, the
//! `service_async` dispatch service and a handful of built-in servlets, filters and listeners.
pub mod builtin;
pub mod engine;
pub mod http;
