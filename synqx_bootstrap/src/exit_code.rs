// /////////////////////////////////////////////////////////////////////////////
// SynqX Distributed Pipeline Core
// Copyright (c) 2025 Michael Gardner, A Bit of Help, Inc.
// SPDX-License-Identifier: BSD-3-Clause
// See LICENSE file in the project root.
// /////////////////////////////////////////////////////////////////////////////

//! # Exit Code Management
//!
//! Standardized Unix exit codes following BSD `sysexits.h` conventions:
//! 0 success, 1 general error, 64 usage error, 69 service unavailable,
//! 77 permission denied, 78 configuration error.

use std::fmt;

/// Exit codes following Unix conventions (BSD sysexits.h)
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
#[repr(i32)]
pub enum ExitCode {
    /// Successful termination (0)
    #[default]
    Success = 0,

    /// General error (1)
    Error = 1,

    /// Command line usage error (64)
    UsageError = 64,

    /// Service unavailable (69), e.g. the dispatcher is unreachable
    Unavailable = 69,

    /// Permission denied (77), e.g. agent credentials rejected
    PermissionDenied = 77,

    /// Configuration error (78), e.g. missing credentials or bad env
    ConfigError = 78,
}

impl ExitCode {
    pub fn as_i32(self) -> i32 {
        self as i32
    }

    /// Terminates the process with this code.
    pub fn exit(self) -> ! {
        std::process::exit(self.as_i32())
    }
}

impl fmt::Display for ExitCode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            ExitCode::Success => "success",
            ExitCode::Error => "error",
            ExitCode::UsageError => "usage error",
            ExitCode::Unavailable => "service unavailable",
            ExitCode::PermissionDenied => "permission denied",
            ExitCode::ConfigError => "configuration error",
        };
        write!(f, "{} ({})", name, self.as_i32())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_exit_code_values() {
        assert_eq!(ExitCode::Success.as_i32(), 0);
        assert_eq!(ExitCode::Error.as_i32(), 1);
        assert_eq!(ExitCode::UsageError.as_i32(), 64);
        assert_eq!(ExitCode::Unavailable.as_i32(), 69);
        assert_eq!(ExitCode::PermissionDenied.as_i32(), 77);
        assert_eq!(ExitCode::ConfigError.as_i32(), 78);
    }

    #[test]
    fn test_display_names() {
        assert_eq!(ExitCode::ConfigError.to_string(), "configuration error (78)");
    }
}
