//! The LDIF record collaborator.
//!
//! The textual LDIF grammar lives outside this crate; import and export
//! paths only consume and produce opaque streaming records, shaped like
//! search results. A source yields records one at a time (typically from a
//! parser reading a file), a sink receives them one at a time (typically a
//! serializer writing a file).

use async_trait::async_trait;

use crate::{error::Error, provider::EntryRecord};

/// A forward-only stream of content records, e.g. a parsed LDIF file.
#[async_trait]
pub trait LdifRecordSource: Send {
	/// The next record, `Ok(None)` at the end of the stream.
	async fn next_record(&mut self) -> Result<Option<EntryRecord>, Error>;
}

/// A consumer of content records, e.g. an LDIF serializer.
#[async_trait]
pub trait LdifRecordSink: Send {
	/// Writes one record.
	async fn write_record(&mut self, record: &EntryRecord) -> Result<(), Error>;
}

/// An in-memory source, mainly for tests and for re-importing records
/// collected elsewhere.
#[derive(Debug, Default)]
pub struct VecRecordSource {
	/// Remaining records, yielded front to back.
	records: std::collections::VecDeque<EntryRecord>,
}

impl VecRecordSource {
	/// A source yielding the given records in order.
	#[must_use]
	pub fn new(records: Vec<EntryRecord>) -> Self {
		VecRecordSource { records: records.into() }
	}
}

#[async_trait]
impl LdifRecordSource for VecRecordSource {
	async fn next_record(&mut self) -> Result<Option<EntryRecord>, Error> {
		Ok(self.records.pop_front())
	}
}

/// An in-memory sink, mainly for tests.
#[derive(Debug, Default)]
pub struct VecRecordSink {
	/// The records received so far.
	pub records: Vec<EntryRecord>,
}

#[async_trait]
impl LdifRecordSink for VecRecordSink {
	async fn write_record(&mut self, record: &EntryRecord) -> Result<(), Error> {
		self.records.push(record.clone());
		Ok(())
	}
}

/// The outcome of an import run.
#[derive(Debug, Clone, Copy, Default)]
pub struct ImportSummary {
	/// Records imported successfully.
	pub imported: u64,
	/// Records that failed; the first error is reported alongside.
	pub failed: u64,
}
