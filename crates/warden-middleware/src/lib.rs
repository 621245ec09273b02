//! `warden-middleware` – The Nervous System
//!
//! Routes events from the safety core to whoever is listening (the transport
//! layer, a speech/sound player, a dashboard) without caring what they do
//! with them.
//!
//! # Modules
//!
//! - [`bus`] – Headless, typed, topic-based publish/subscribe event bus built
//!   on Tokio broadcast channels.

pub mod bus;

pub use bus::{EventBus, Topic, TopicReceiver};
