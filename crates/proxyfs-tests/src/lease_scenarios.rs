//! End-to-end lease protocol scenarios, driven through the public manager
//! surface with simulated mount sessions.
