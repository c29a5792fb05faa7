// SPDX-License-Identifier: GPL-3.0-only

use globset::{Glob, GlobMatcher};
use storage_types::DiskFlags;

use crate::config::DiskSourceConfig;
use crate::error::{Result, ServiceError};

/// Device-path pattern mapped to a nickname and flags
#[derive(Debug, Clone)]
pub struct DiskSource {
    pattern: String,
    matcher: GlobMatcher,
    nickname: String,
    flags: DiskFlags,
}

impl DiskSource {
    pub fn new(pattern: &str, nickname: impl Into<String>, flags: DiskFlags) -> Result<Self> {
        let matcher = Glob::new(pattern)
            .map_err(|e| {
                ServiceError::InvalidArgument(format!("Bad disk source pattern {pattern}: {e}"))
            })?
            .compile_matcher();
        Ok(Self {
            pattern: pattern.to_string(),
            matcher,
            nickname: nickname.into(),
            flags,
        })
    }

    pub fn from_config(config: &DiskSourceConfig) -> Result<Self> {
        Self::new(&config.pattern, config.nickname.clone(), config.flag_set())
    }

    pub fn pattern(&self) -> &str {
        &self.pattern
    }

    pub fn nickname(&self) -> &str {
        &self.nickname
    }

    pub fn flags(&self) -> DiskFlags {
        self.flags
    }

    pub fn matches(&self, sys_path: &str) -> bool {
        self.matcher.is_match(sys_path)
    }
}

/// First source matching `sys_path`, in registration order
pub fn classify<'a>(sources: &'a [DiskSource], sys_path: &str) -> Option<&'a DiskSource> {
    sources.iter().find(|source| source.matches(sys_path))
}
