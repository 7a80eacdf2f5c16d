//! meshforge: 3D model processing service.
//!
//! The library half of the binary, exposed for integration testing. The
//! server itself lives in `mf-server`; this crate adds single-file local
//! processing for the `run` command.

pub mod local;
