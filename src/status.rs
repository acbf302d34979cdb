/*
    otavisor: an update supervisor DBUS daemon and CLI interface
    Copyright (C) 2025  Denis Benato

    This program is free software; you can redistribute it and/or modify
    it under the terms of the GNU General Public License as published by
    the Free Software Foundation; either version 2 of the License, or
    (at your option) any later version.

    This program is distributed in the hope that it will be useful,
    but WITHOUT ANY WARRANTY; without even the implied warranty of
    MERCHANTABILITY or FITNESS FOR A PARTICULAR PURPOSE.  See the
    GNU General Public License for more details.

    You should have received a copy of the GNU General Public License along
    with this program; if not, write to the Free Software Foundation, Inc.,
    51 Franklin Street, Fifth Floor, Boston, MA 02110-1301 USA.
*/

/// Opaque status code reported by the update engine
pub type StatusCode = i32;

/// Normal return, also reported while a download is still in progress
pub const STATUS_IN_PROGRESS: StatusCode = 0;
/// The engine finished downloading the staged artifact
pub const STATUS_DOWNLOAD_COMPLETE: StatusCode = 114;
/// The operation was aborted on user request
pub const STATUS_ABORTED: StatusCode = 9;
/// Internet connection failure
pub const STATUS_CONNECTION_FAILURE: StatusCode = 155;
/// Local to the supervisor: a background task died before reporting
pub const STATUS_TASK_FAILED: StatusCode = -1;

const CONNECTION_CODES: &[StatusCode] = &[
    STATUS_CONNECTION_FAILURE,
    156,
    163,
    167,
    168,
    169,
    170,
    171,
    243,
    244,
    245,
];
const CERTIFICATE_CODES: &[StatusCode] = &[208];
const UP_TO_DATE_CODES: &[StatusCode] = &[12, 98, 99, 110];

pub const CONNECTION_ERROR_MESSAGE: &str = "Unable to connect to the update server.";
pub const CONNECTION_TROUBLESHOOTING: &str =
    "Please check your network connection and try again later.";
pub const SSL_TROUBLESHOOTING: &str =
    "The update server certificate could not be verified. Please check the system date and time.";
pub const UP_TO_DATE_MESSAGE: &str = "Your system is currently up to date.";
pub const TRY_AGAIN_SUFFIX: &str = "Do you want to try again?";

/// How a terminal engine status is surfaced to the user
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ErrorClass {
    /// Network failure talking to the update server
    Connection,
    /// TLS host certificate rejected
    Certificate,
    /// Nothing to download or the update does not apply: not an error
    UpToDate,
    /// The user aborted: nothing is shown
    Aborted,
    /// Anything else, described by the engine's own message
    Generic,
}

impl ErrorClass {
    pub fn classify(code: StatusCode) -> Self {
        if code == STATUS_ABORTED {
            ErrorClass::Aborted
        } else if CONNECTION_CODES.contains(&code) {
            ErrorClass::Connection
        } else if CERTIFICATE_CODES.contains(&code) {
            ErrorClass::Certificate
        } else if UP_TO_DATE_CODES.contains(&code) {
            ErrorClass::UpToDate
        } else {
            ErrorClass::Generic
        }
    }

    /// Convert class to a string representation for DBus
    pub fn as_str(&self) -> &str {
        match self {
            ErrorClass::Connection => "Connection",
            ErrorClass::Certificate => "Certificate",
            ErrorClass::UpToDate => "UpToDate",
            ErrorClass::Aborted => "Aborted",
            ErrorClass::Generic => "Generic",
        }
    }

    /// Whether the user is offered to retry, as opposed to a dismiss-only message
    pub fn offers_retry(&self) -> bool {
        matches!(
            self,
            ErrorClass::Connection | ErrorClass::Certificate | ErrorClass::Generic
        )
    }
}

/// A classified terminal status, ready to be shown to the user
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ErrorReport {
    pub code: StatusCode,
    pub class: ErrorClass,
    /// Main message; empty for aborted operations
    pub message: String,
    /// Secondary troubleshooting text, if any
    pub details: String,
}

impl ErrorReport {
    /// Build the report for `code`. `engine_message` is only consulted for
    /// the generic class.
    pub fn new<F>(code: StatusCode, engine_message: F) -> Self
    where
        F: FnOnce(StatusCode) -> String,
    {
        let class = ErrorClass::classify(code);
        let (message, details) = match class {
            ErrorClass::Connection => (
                format!("{CONNECTION_ERROR_MESSAGE}\n{TRY_AGAIN_SUFFIX}"),
                CONNECTION_TROUBLESHOOTING.to_string(),
            ),
            ErrorClass::Certificate => (
                format!("{CONNECTION_ERROR_MESSAGE}\n{TRY_AGAIN_SUFFIX}"),
                SSL_TROUBLESHOOTING.to_string(),
            ),
            ErrorClass::UpToDate => (UP_TO_DATE_MESSAGE.to_string(), String::new()),
            ErrorClass::Aborted => (String::new(), String::new()),
            ErrorClass::Generic => (
                format!("{}\n{TRY_AGAIN_SUFFIX}", capitalize(&engine_message(code))),
                String::new(),
            ),
        };

        Self {
            code,
            class,
            message,
            details,
        }
    }

    pub fn offers_retry(&self) -> bool {
        self.class.offers_retry()
    }
}

fn capitalize(s: &str) -> String {
    let mut chars = s.chars();
    match chars.next() {
        Some(first) => first.to_uppercase().chain(chars).collect(),
        None => String::new(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn classifies_engine_codes() {
        assert_eq!(ErrorClass::classify(155), ErrorClass::Connection);
        assert_eq!(ErrorClass::classify(245), ErrorClass::Connection);
        assert_eq!(ErrorClass::classify(208), ErrorClass::Certificate);
        assert_eq!(ErrorClass::classify(12), ErrorClass::UpToDate);
        assert_eq!(ErrorClass::classify(110), ErrorClass::UpToDate);
        assert_eq!(ErrorClass::classify(STATUS_ABORTED), ErrorClass::Aborted);
        assert_eq!(ErrorClass::classify(42), ErrorClass::Generic);
    }

    #[test]
    fn generic_message_is_capitalized_with_retry_suffix() {
        let report = ErrorReport::new(42, |_| "operation timed out".to_string());
        assert_eq!(report.class, ErrorClass::Generic);
        assert_eq!(report.message, "Operation timed out\nDo you want to try again?");
        assert!(report.offers_retry());
    }

    #[test]
    fn engine_message_only_used_for_generic() {
        let report = ErrorReport::new(98, |_| panic!("should not be asked"));
        assert_eq!(report.message, UP_TO_DATE_MESSAGE);
        assert!(!report.offers_retry());

        let aborted = ErrorReport::new(STATUS_ABORTED, |_| panic!("should not be asked"));
        assert!(aborted.message.is_empty());
    }

    #[test]
    fn empty_engine_message_does_not_panic() {
        let report = ErrorReport::new(1, |_| String::new());
        assert_eq!(report.message, "\nDo you want to try again?");
    }
}
