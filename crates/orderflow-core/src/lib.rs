//! Orderflow Core — shared domain abstractions.
//!
//! This crate defines the order-event model, delivery bookkeeping types,
//! the handler capability, and the storage traits every other crate depends
//! on. It contains no infrastructure code.

pub mod clock;
pub mod delivery;
pub mod error;
pub mod event;
pub mod handler;
pub mod reader;
pub mod repository;
pub mod rng;
pub mod subscription;
