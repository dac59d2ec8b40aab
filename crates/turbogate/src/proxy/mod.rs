//! Backend forwarding and correlation.

pub mod correlation;
pub mod forward;
