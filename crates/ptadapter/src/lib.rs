#![cfg_attr(docsrs, feature(doc_auto_cfg, doc_cfg))]
#![doc = include_str!("../README.md")]
#![warn(missing_docs)]
#![warn(noop_method_call)]
#![warn(unreachable_pub)]
#![warn(clippy::all)]
#![deny(clippy::await_holding_lock)]
#![deny(clippy::cast_lossless)]
#![deny(clippy::checked_conversions)]
#![warn(clippy::cognitive_complexity)]
#![deny(clippy::debug_assert_with_mut_call)]
#![deny(clippy::exhaustive_enums)]
#![deny(clippy::exhaustive_structs)]
#![deny(clippy::expl_impl_clone_on_copy)]
#![deny(clippy::fallible_impl_from)]
#![deny(clippy::implicit_clone)]
#![deny(clippy::large_stack_arrays)]
#![warn(clippy::manual_ok_or)]
#![deny(clippy::missing_docs_in_private_items)]
#![warn(clippy::needless_borrow)]
#![warn(clippy::needless_pass_by_value)]
#![warn(clippy::option_option)]
#![deny(clippy::print_stderr)]
#![deny(clippy::print_stdout)]
#![warn(clippy::rc_buffer)]
#![deny(clippy::ref_option_ref)]
#![warn(clippy::semicolon_if_nothing_returned)]
#![warn(clippy::trait_duplication_in_bounds)]
#![deny(clippy::unchecked_duration_subtraction)]
#![deny(clippy::unnecessary_wraps)]
#![warn(clippy::unseparated_literal_suffix)]
#![deny(clippy::unwrap_used)]
#![allow(clippy::let_unit_value)] // This can reasonably be done for explicitness
#![allow(clippy::uninlined_format_args)]
#![allow(clippy::result_large_err)]

pub mod argstr;
pub mod config;

mod client;
mod err;
mod extor;
mod ipc;
mod relay;
mod server;
mod slot;
mod socks;
mod tunnel;

pub use client::{ClientAdapter, ClientTransport};
pub use config::{ClientConfig, ServerConfig, ServerTransportConfig, TunnelConfig};
pub use err::{ConnectError, Error, Result};
pub use ipc::{AdapterStatus, PtTimeouts};
pub use relay::relay;
pub use server::ext::{
    ClientConnectedFn, ExtOrClientInfo, ExtServerAdapter, IpFamily, PreconnectFn,
};
pub use server::{ServerAdapter, ServerTransport};
pub use socks::{Socks4Reply, Socks5Reply};
pub use tunnel::ListeningClientAdapter;
