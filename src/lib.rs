#![doc = include_str!("../README.md")]
#![warn(rustdoc::all)]
#![deny(unused_must_use, rust_2018_idioms)]
#![cfg_attr(docsrs, feature(doc_cfg, doc_auto_cfg))]

#[macro_use]
extern crate tracing;

pub mod error;
pub use error::{CrispyError, Result};

pub mod abi;

pub mod compiler;
pub use compiler::{CcCompiler, Compiler};

pub mod cache;
pub use cache::{CacheProvider, FileCache};

pub mod source_utils;

pub mod plugin_engine;
pub use plugin_engine::PluginEngine;

pub mod config_context;
pub use config_context::ConfigContext;

pub mod config_loader;

pub mod pipeline;
pub use pipeline::{Flags, Script};

pub mod driver;
pub use driver::DriverOptions;
