// SPDX-License-Identifier: GPL-3.0-only

pub mod sys;

pub use sys::build_default_adapters;
