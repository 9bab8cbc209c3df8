//! Core execution engine for secure multi-party computation.
//!
//! This crate provides the two subsystems that every protocol layer of an
//! MPC session builds on:
//!
//! 1. A [`registry::Registry`] that is the single point of truth for a
//!    running session: it hands out gate, wire and sharing identifiers,
//!    owns the tables of registered gates and wires, and coordinates the
//!    queue of gates that are ready to be evaluated by worker tasks.
//! 2. An [`sp::SpProvider`] that precomputes additive shares of square
//!    pairs `(a, a·a)` over several machine-integer widths by driving
//!    batched correlated oblivious transfers between every pair of
//!    parties, ahead of the online phase.
//!
//! Communication is abstracted behind the [`channel::Channel`] trait, so
//! the engine can run over network sockets, in-memory channels or any
//! other transport without changes to the protocol code.
#![deny(unsafe_code)]
#![deny(missing_docs)]
#![deny(rustdoc::broken_intra_doc_links)]

pub mod channel;
pub mod circuit;
pub mod config;
pub mod ot;
pub mod registry;
pub mod ring;
pub mod sp;
pub mod stats;
