//! The abstract directory-protocol provider consumed by the session.
//!
//! The provider owns wire encoding, TLS handshake mechanics and the mapping
//! of transport failures into the [`Error`](crate::error::Error) taxonomy
//! (transient network class vs. protocol class). The engine itself only ever
//! talks to these traits; the shipped implementation lives in
//! [`crate::transport`], and tests substitute scripted stubs.

use std::collections::HashMap;

use async_trait::async_trait;
use url::Url;

use crate::{
	config::ConnectionConfig,
	credentials::Credentials,
	dn::{Dn, Rdn},
	entry::{Attribute, AttributeSet, AttributeValue},
	error::Error,
	search::SearchRequest,
};

/// One raw search result: the matched DN and its returned attributes, split
/// into textual and binary values the way the wire protocol reports them.
#[derive(Debug, Clone, Default)]
pub struct EntryRecord {
	/// The matched DN, as sent by the server.
	pub dn: String,
	/// Textual attribute values by description.
	pub attrs: HashMap<String, Vec<String>>,
	/// Binary attribute values by description.
	pub bin_attrs: HashMap<String, Vec<Vec<u8>>>,
}

impl EntryRecord {
	/// Get the first value of an attribute. Will return `None` if attribute
	/// value is not valid UTF-8.
	#[must_use]
	pub fn attr_first(&self, attr: &str) -> Option<&str> {
		let values = self.attrs.get(attr).or_else(|| {
			self.attrs.iter().find(|(k, _)| k.eq_ignore_ascii_case(attr)).map(|(_, v)| v)
		})?;
		values.first().map(String::as_str)
	}

	/// All textual values of an attribute, case-insensitively looked up.
	#[must_use]
	pub fn attr_all(&self, attr: &str) -> Vec<&str> {
		self.attrs
			.iter()
			.filter(|(k, _)| k.eq_ignore_ascii_case(attr))
			.flat_map(|(_, v)| v.iter().map(String::as_str))
			.collect()
	}

	/// Get the first value of an attribute, interpreted as a directory
	/// boolean. `None` when absent or malformed.
	#[must_use]
	pub fn bool_first(&self, attr: &str) -> Option<bool> {
		match self.attr_first(attr) {
			Some(v) if v.eq_ignore_ascii_case("TRUE") => Some(true),
			Some(v) if v.eq_ignore_ascii_case("FALSE") => Some(false),
			_ => None,
		}
	}

	/// Converts the record into the cache's attribute representation.
	#[must_use]
	pub fn to_attribute_set(&self) -> AttributeSet {
		let mut set = AttributeSet::new();
		for (description, values) in &self.attrs {
			set.put(Attribute::new(
				description.clone(),
				values.iter().cloned().map(AttributeValue::Text).collect(),
			));
		}
		for (description, values) in &self.bin_attrs {
			set.put(Attribute::new(
				description.clone(),
				values.iter().cloned().map(AttributeValue::Binary).collect(),
			));
		}
		set
	}
}

/// One element of a result stream.
#[derive(Debug, Clone)]
pub enum SearchRecord {
	/// A matched entry.
	Entry(EntryRecord),
	/// A redirect to another location. Never followed automatically.
	Referral(Vec<Url>),
}

/// What a finished stream reports about its completion.
#[derive(Debug, Clone, Copy, Default)]
pub struct SearchSummary {
	/// Whether the server cut the result short (size or time limit).
	pub truncated: bool,
}

/// One attribute modification within a modify operation.
#[derive(Debug, Clone)]
pub enum ModifyOp {
	/// Add values to an attribute, creating it if absent.
	Add(String, Vec<AttributeValue>),
	/// Delete specific values, or the whole attribute when empty.
	Delete(String, Vec<AttributeValue>),
	/// Replace all values of an attribute.
	Replace(String, Vec<AttributeValue>),
}

/// Factory for transport handles. One handle maps to one server connection.
#[async_trait]
pub trait DirectoryProvider: Send + Sync + std::fmt::Debug {
	/// Establishes a connection, completing any configured TLS negotiation
	/// before returning.
	async fn connect(&self, config: &ConnectionConfig) -> Result<Box<dyn ProviderHandle>, Error>;
}

/// A live connection to one directory server. Implementations need not be
/// internally synchronized; the session serializes access.
#[async_trait]
pub trait ProviderHandle: Send + std::fmt::Debug {
	/// Authenticates the connection.
	async fn bind(&mut self, credentials: &Credentials) -> Result<(), Error>;

	/// Issues a search and returns the lazy result cursor.
	async fn search(&mut self, request: &SearchRequest) -> Result<Box<dyn RecordCursor>, Error>;

	/// Adds an entry.
	async fn add(
		&mut self,
		dn: &Dn,
		attributes: &[(String, Vec<AttributeValue>)],
	) -> Result<(), Error>;

	/// Applies attribute modifications to an entry.
	async fn modify(&mut self, dn: &Dn, changes: &[ModifyOp]) -> Result<(), Error>;

	/// Renames an entry below the same parent.
	async fn rename(&mut self, dn: &Dn, new_rdn: &Rdn, delete_old_rdn: bool) -> Result<(), Error>;

	/// Deletes a leaf entry.
	async fn delete(&mut self, dn: &Dn) -> Result<(), Error>;

	/// Gracefully shuts the connection down. Dropping the handle tears it
	/// down ungracefully.
	async fn close(&mut self) -> Result<(), Error>;
}

/// A lazy, forward-only, single-pass cursor over search results. Exhausted
/// once `next_record` returns `Ok(None)`; re-running a search requires a new
/// [`ProviderHandle::search`] call.
#[async_trait]
pub trait RecordCursor: Send + std::fmt::Debug {
	/// The next record, `Ok(None)` at the end of the stream. May block on
	/// network I/O.
	async fn next_record(&mut self) -> Result<Option<SearchRecord>, Error>;

	/// Completion information, available once the stream is exhausted.
	fn summary(&self) -> Option<SearchSummary>;
}

#[cfg(test)]
mod tests {
	#![allow(clippy::unwrap_used)]

	use std::collections::HashMap;

	use super::EntryRecord;

	#[test]
	fn attr_first() {
		let entry = EntryRecord {
			dn: String::from("dontcare"),
			attrs: [(
				String::from("name"),
				vec![String::from("Foo Bar"), String::from("Bar McBaz")],
			)]
			.into_iter()
			.collect(),
			bin_attrs: HashMap::default(),
		};
		assert_eq!(
			entry.attr_first("attribute_does_not_exist"),
			None,
			"Undefined attributes should return None"
		);
		assert_eq!(entry.attr_first("name"), Some("Foo Bar"), "Should return the first value");
		assert_eq!(entry.attr_first("NAME"), Some("Foo Bar"), "Lookup is case-insensitive");
	}

	#[test]
	fn bool_first() {
		let entry = EntryRecord {
			dn: String::from("dontcare"),
			attrs: [
				(String::from("hasSubordinates"), vec![String::from("TRUE")]),
				(String::from("broken"), vec![String::from("maybe")]),
			]
			.into_iter()
			.collect(),
			bin_attrs: HashMap::default(),
		};
		assert_eq!(entry.bool_first("hasSubordinates"), Some(true));
		assert_eq!(entry.bool_first("broken"), None, "Malformed booleans read as unknown");
	}

	#[test]
	fn attribute_set_conversion_keeps_binary_values() {
		let record = EntryRecord {
			dn: String::from("cn=x"),
			attrs: [(String::from("cn"), vec![String::from("x")])].into_iter().collect(),
			bin_attrs: [(String::from("jpegPhoto"), vec![vec![0xff, 0xd8]])]
				.into_iter()
				.collect(),
		};
		let set = record.to_attribute_set();
		assert_eq!(set.first_text("cn"), Some("x"));
		assert_eq!(set.get("jpegphoto").unwrap().values()[0].as_bytes(), [0xff, 0xd8]);
	}
}
