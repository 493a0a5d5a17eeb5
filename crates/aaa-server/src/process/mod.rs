//! Protocol state machines shipped with the server

pub mod eap_aka;
pub mod radius;

pub use eap_aka::{AkaSettings, EapAka, IdentityRequest};
pub use radius::{Radius, RadiusSettings};
