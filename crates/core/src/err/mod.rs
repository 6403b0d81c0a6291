use std::io::Error as IoError;
use std::sync::Arc;

use thiserror::Error;

use crate::kvs::ShardId;

/// The result type returned by all scan operations
pub type Result<T, E = Error> = std::result::Result<T, E>;

/// An error originating from a range scan.
///
/// A single wire failure is reported to every member of a scan share, so
/// this error is cheaply cloneable.
#[derive(Error, Debug, Clone)]
#[non_exhaustive]
pub enum Error {
	/// The scan handle is no longer active
	#[error("The scan is no longer active")]
	Inactive,

	/// The scan handle was used incorrectly
	#[error("Invalid use of the scan handle: {0}")]
	Invalid(String),

	/// The shard for a key could not be resolved
	#[error("Unable to resolve the shard for key '{0}'")]
	ShardResolve(String),

	/// The scan could not be started with the current topology
	#[error("The range scan failed: {0}")]
	Failed(String),

	/// A connection to the owning server could not be acquired
	#[error("Unable to acquire a connection for shard {shard}: {message}")]
	Connection {
		shard: ShardId,
		message: String,
	},

	/// The server refused to create a range scan
	#[error("Unable to create a range scan on shard {shard}: {message}")]
	Create {
		shard: ShardId,
		message: String,
	},

	/// The server failed to continue a range scan
	#[error("Unable to continue the range scan on shard {shard}: {message}")]
	Continue {
		shard: ShardId,
		message: String,
	},

	/// The server returned a response which could not be decoded
	#[error("Received a malformed range scan response from shard {shard}: {message}")]
	BadResponse {
		shard: ShardId,
		message: String,
	},

	/// A single key lookup could not be validated
	#[error("Unable to validate key on shard {shard}: {message}")]
	Validate {
		shard: ShardId,
		message: String,
	},

	/// There was a problem reading or writing a spill file
	#[error("There was a problem with a spill file: {0}")]
	Spill(Arc<IoError>),

	/// The temporary storage quota was exceeded
	#[error("The temporary storage quota has been exceeded")]
	TempQuotaExceeded,

	/// The scan did not complete within the allotted time
	#[error("The range scan timed out")]
	Timeout,

	/// A worker terminated unexpectedly while processing the scan
	#[error("A range scan worker aborted unexpectedly")]
	WorkerAborted,
}

impl Error {
	/// Returns the stable numeric code for this error
	pub fn code(&self) -> u32 {
		match self {
			Error::Inactive => 16052,
			Error::Invalid(_) => 16053,
			Error::Continue {
				..
			} => 16054,
			Error::Create {
				..
			} => 16055,
			Error::Failed(_) | Error::BadResponse {
				..
			} => 16056,
			Error::Timeout => 16057,
			Error::ShardResolve(_) => 16058,
			Error::Connection {
				..
			} => 16059,
			Error::WorkerAborted => 16061,
			Error::Spill(_) | Error::TempQuotaExceeded => 16063,
			Error::Validate {
				..
			} => 16064,
		}
	}

	/// Whether this error was caused by the scan deadline expiring
	pub fn is_timeout(&self) -> bool {
		matches!(self, Error::Timeout)
	}
}

impl From<IoError> for Error {
	fn from(e: IoError) -> Error {
		Error::Spill(Arc::new(e))
	}
}

impl From<tokio::task::JoinError> for Error {
	fn from(e: tokio::task::JoinError) -> Error {
		match e.is_panic() {
			true => Error::WorkerAborted,
			false => Error::Inactive,
		}
	}
}

/// An error returned by the wire level collaborators
#[derive(Error, Debug, Clone, PartialEq, Eq)]
#[non_exhaustive]
pub enum WireError {
	/// The requested key or range does not exist on the server
	#[error("The key was not found")]
	KeyNotFound,

	/// The shard is not owned by the server this request was sent to
	#[error("The shard is not owned by this server")]
	NotMyShard,

	/// The server responded with an unexpected status
	#[error("The server responded with status {0:#06x}")]
	Status(u16),

	/// The response did not arrive before the deadline
	#[error("The request timed out")]
	Timeout,

	/// The transport failed
	#[error("Transport error: {0}")]
	Io(String),
}

impl WireError {
	/// Whether this error indicates the underlying transport should be discarded
	pub fn is_transport(&self) -> bool {
		matches!(self, WireError::Io(_) | WireError::Timeout)
	}
}

#[cfg(test)]
mod tests {
	use super::*;

	#[test]
	fn error_codes_are_stable() {
		assert_eq!(Error::Inactive.code(), 16052);
		assert_eq!(Error::Timeout.code(), 16057);
		assert_eq!(Error::WorkerAborted.code(), 16061);
		assert_eq!(Error::TempQuotaExceeded.code(), 16063);
		assert_eq!(
			Error::Validate {
				shard: 3,
				message: "boom".into()
			}
			.code(),
			16064
		);
	}

	#[test]
	fn io_errors_become_spill_errors() {
		let err: Error = IoError::other("disk full").into();
		assert!(matches!(err, Error::Spill(_)));
		assert_eq!(err.to_string(), "There was a problem with a spill file: disk full");
	}

	#[test]
	fn wire_transport_errors() {
		assert!(WireError::Io("reset".into()).is_transport());
		assert!(WireError::Timeout.is_transport());
		assert!(!WireError::KeyNotFound.is_transport());
		assert_eq!(WireError::Status(0x84).to_string(), "The server responded with status 0x0084");
	}
}
