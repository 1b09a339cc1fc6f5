#![cfg_attr(docsrs, feature(doc_cfg))]
//! # canbms_lib
//!
//! This crate decodes the CAN protocol spoken by battery management modules,
//! keeps a per-module state record and republishes that state, together with
//! Home Assistant discovery metadata, through an abstract publisher.
//!
//! The pipeline is:
//!
//! 1. [`protocol::decode`] turns a raw frame into a [`protocol::DecodedUpdate`].
//! 2. [`store::ModuleStore`] applies the update and computes derived fields.
//! 3. [`discovery::Registrar`] describes the sensors of a module, once per module.
//! 4. [`publisher::StatePublisher`] serialises the module record after every update.
//! 5. [`ingest::IngestLoop`] drives all of the above from a [`ingest::FrameSource`].
//!
//! ## Features
//!
//! - `default`: Enables `bin-dependencies`, which is intended for compiling the `canbms` command-line tool.
//! - `socketcan`: Enables the Linux SocketCAN frame source using the `socketcan` crate.
//! - `bin-dependencies`: Enables all features required by the `canbms` binary executable.

/// Contains error types for the library.
mod error;
/// Defines the CAN wire protocol of the battery modules.
pub mod protocol;

pub mod discovery;
pub mod ingest;
pub mod publisher;
pub mod store;

pub use error::Error;

/// Linux SocketCAN frame source.
#[cfg_attr(docsrs, doc(cfg(feature = "socketcan")))]
#[cfg(feature = "socketcan")]
pub mod socketcan;
