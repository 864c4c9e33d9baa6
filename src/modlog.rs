//! The modification log collaborator.
//!
//! One structured record is emitted per write operation, successful or not.
//! The sink is append-only and external; a failure to log never fails the
//! operation itself.

use time::OffsetDateTime;

use crate::error::OperationKind;

/// One logged write operation.
#[derive(Debug, Clone, serde::Serialize)]
pub struct ModificationRecord {
	/// When the operation completed.
	pub timestamp: OffsetDateTime,
	/// The target DN.
	pub dn: String,
	/// The operation kind.
	pub operation: OperationKind,
	/// The LDAP result code, zero for success.
	pub result_code: u32,
	/// Whether the operation succeeded.
	pub success: bool,
}

/// An append-only sink for modification records.
pub trait ModificationLogSink: Send + Sync + std::fmt::Debug {
	/// Appends one record. Errors are reported to the caller, which treats
	/// them as non-fatal.
	fn record(&self, record: &ModificationRecord) -> std::io::Result<()>;
}

/// The default sink: structured tracing events under the
/// `ldap_browser::modlog` target.
#[derive(Debug, Clone, Copy, Default)]
pub struct TracingModificationLog;

impl ModificationLogSink for TracingModificationLog {
	fn record(&self, record: &ModificationRecord) -> std::io::Result<()> {
		tracing::info!(
			target: "ldap_browser::modlog",
			dn = %record.dn,
			operation = %record.operation,
			result_code = record.result_code,
			success = record.success,
			"modification"
		);
		Ok(())
	}
}

#[cfg(test)]
mod tests {
	#![allow(clippy::unwrap_used)]

	use std::sync::{Arc, Mutex};

	use time::OffsetDateTime;

	use super::{ModificationLogSink, ModificationRecord};
	use crate::error::OperationKind;

	/// A sink collecting records in memory.
	#[derive(Debug, Default, Clone)]
	struct Collecting(Arc<Mutex<Vec<ModificationRecord>>>);

	impl ModificationLogSink for Collecting {
		fn record(&self, record: &ModificationRecord) -> std::io::Result<()> {
			self.0.lock().unwrap().push(record.clone());
			Ok(())
		}
	}

	#[test]
	fn sinks_receive_one_record_per_operation() {
		let sink = Collecting::default();
		sink.record(&ModificationRecord {
			timestamp: OffsetDateTime::UNIX_EPOCH,
			dn: "cn=a,dc=example".to_owned(),
			operation: OperationKind::Delete,
			result_code: 0,
			success: true,
		})
		.unwrap();

		let records = sink.0.lock().unwrap();
		assert_eq!(records.len(), 1);
		assert!(records[0].success);
		assert_eq!(records[0].operation, OperationKind::Delete);
	}
}
