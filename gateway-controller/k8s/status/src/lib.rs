#![deny(rust_2018_idioms)]
#![forbid(unsafe_code)]

pub mod conditions;
mod error;
mod patcher;
mod writer;

pub use self::{
    conditions::NewCondition,
    error::classify,
    patcher::{ClientPatcher, RecordingPatcher, ResourcePatcher, Target, Write},
    writer::{Conditioned, StatusWriter},
};
