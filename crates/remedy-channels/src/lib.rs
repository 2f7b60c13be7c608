//! Notification gateway for escalations.
//!
//! Provides a [`NotificationChannel`] trait for a single delivery target and
//! a [`ChannelManager`] that fans an escalation out to every registered
//! channel with a per-channel timeout.
//!
//! # Main types
//!
//! - [`NotificationChannel`]: Trait for delivering an escalation to one destination.
//! - [`ChannelManager`]: Bounded concurrent fan-out; implements [`remedy_core::NotificationGateway`].
//! - [`LogChannel`]: Channel that writes escalations to the structured log.

/// Core channel trait.
pub mod channel;
/// Log-backed channel.
pub mod log;
/// Channel manager for multi-channel fan-out.
pub mod manager;

pub use channel::NotificationChannel;
pub use log::LogChannel;
pub use manager::ChannelManager;
