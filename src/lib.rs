//! Skillhost: a sandboxed skill execution host.
//!
//! Executes untrusted, user-supplied "skills" in isolated OS processes,
//! grants them time-boxed secrets through an ephemeral credential vault,
//! validates and quarantines unsafe submissions, and coordinates all state
//! transitions over a publish/subscribe event backbone that external
//! channels (bots, dashboards) can observe without coupling to internals.
//!
//! A composition root constructs one [`bus::EventBus`], one
//! [`vault::CredentialVault`], one [`store::SkillStore`] and one
//! [`manager::LifecycleManager`] and passes them explicitly; there is no
//! hidden global state.

#![forbid(unsafe_code)]
#![warn(missing_docs)]

pub mod bus;
pub mod config;
pub mod logging;
pub mod skill;
pub mod vault;

pub mod store;

pub mod manager;
