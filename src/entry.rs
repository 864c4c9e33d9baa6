//! In-memory representation of a single directory node.
//!
//! Entries are owned exclusively by the [`crate::cache::EntryCache`] and are
//! handed out as `Arc` references; parent and children are reached through
//! DN lookups in the owning cache, never through direct object references.

use std::sync::{PoisonError, RwLock};

use crate::dn::{Dn, Rdn};

/// Status flag bit: the server hinted that the entry has children.
const HAS_CHILDREN_HINT: u16 = 1 << 0;
/// Status flag bit: the entry represents directory metadata (a base DN or
/// schema subentry shown under the root) rather than a plain tree node.
const IS_DIRECTORY_ENTRY: u16 = 1 << 1;
/// Status flag bit: the entry is an alias.
const IS_ALIAS: u16 = 1 << 2;
/// Status flag bit: the entry is a referral.
const IS_REFERRAL: u16 = 1 << 3;
/// Status flag bit: the entry is a subentry. Subentries never have children.
const IS_SUBENTRY: u16 = 1 << 4;

/// The compact status flag set of an entry.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct EntryFlags(u16);

impl EntryFlags {
	/// Flags of a freshly materialized entry: the children hint starts set,
	/// everything else cleared.
	#[must_use]
	pub fn new() -> Self {
		EntryFlags(HAS_CHILDREN_HINT)
	}

	/// Whether the server hinted at children below this entry.
	#[must_use]
	pub fn has_children_hint(self) -> bool {
		self.0 & HAS_CHILDREN_HINT != 0
	}

	/// Whether the entry represents directory metadata.
	#[must_use]
	pub fn is_directory_entry(self) -> bool {
		self.0 & IS_DIRECTORY_ENTRY != 0
	}

	/// Whether the entry is an alias.
	#[must_use]
	pub fn is_alias(self) -> bool {
		self.0 & IS_ALIAS != 0
	}

	/// Whether the entry is a referral.
	#[must_use]
	pub fn is_referral(self) -> bool {
		self.0 & IS_REFERRAL != 0
	}

	/// Whether the entry is a subentry.
	#[must_use]
	pub fn is_subentry(self) -> bool {
		self.0 & IS_SUBENTRY != 0
	}

	/// Sets or clears a single flag bit.
	fn set(&mut self, bit: u16, value: bool) {
		if value {
			self.0 |= bit;
		} else {
			self.0 &= !bit;
		}
	}
}

impl Default for EntryFlags {
	fn default() -> Self {
		EntryFlags::new()
	}
}

/// One directory node: its DN and status flags. Attribute and children data
/// live in the owning cache's side tables, keyed by the same normalized DN,
/// so that "not yet fetched" stays distinct from "fetched and empty".
#[derive(Debug)]
pub struct Entry {
	/// The distinguished name. Immutable for the lifetime of the entry.
	dn: Dn,
	/// Mutable status flags, updated on every merge of server data.
	flags: RwLock<EntryFlags>,
}

impl Entry {
	/// Creates an entry for the given DN with default flags.
	#[must_use]
	pub fn new(dn: Dn) -> Self {
		Entry { dn, flags: RwLock::new(EntryFlags::new()) }
	}

	/// The distinguished name.
	#[must_use]
	pub fn dn(&self) -> &Dn {
		&self.dn
	}

	/// The naming component, `None` for the root DSE.
	#[must_use]
	pub fn rdn(&self) -> Option<&Rdn> {
		self.dn.rdn()
	}

	/// The parent DN. `None` for the root DSE, which has no parent.
	#[must_use]
	pub fn parent_dn(&self) -> Option<Dn> {
		self.dn.parent()
	}

	/// A snapshot of the current status flags.
	#[must_use]
	pub fn flags(&self) -> EntryFlags {
		*self.flags.read().unwrap_or_else(PoisonError::into_inner)
	}

	/// Sets the has-children hint.
	pub fn set_has_children_hint(&self, value: bool) {
		self.flags.write().unwrap_or_else(PoisonError::into_inner).set(HAS_CHILDREN_HINT, value);
	}

	/// Marks the entry as directory metadata.
	pub fn set_directory_entry(&self, value: bool) {
		self.flags.write().unwrap_or_else(PoisonError::into_inner).set(IS_DIRECTORY_ENTRY, value);
	}

	/// Marks the entry as an alias.
	pub fn set_alias(&self, value: bool) {
		self.flags.write().unwrap_or_else(PoisonError::into_inner).set(IS_ALIAS, value);
	}

	/// Marks the entry as a referral.
	pub fn set_referral(&self, value: bool) {
		self.flags.write().unwrap_or_else(PoisonError::into_inner).set(IS_REFERRAL, value);
	}

	/// Marks the entry as a subentry.
	pub fn set_subentry(&self, value: bool) {
		self.flags.write().unwrap_or_else(PoisonError::into_inner).set(IS_SUBENTRY, value);
	}

	/// Derives the alias/referral/subentry flags from an object class value
	/// list, as reported by the server.
	pub fn apply_object_classes<'a>(&self, object_classes: impl Iterator<Item = &'a str>) {
		let mut alias = false;
		let mut referral = false;
		let mut subentry = false;
		for oc in object_classes {
			if oc.eq_ignore_ascii_case("alias") {
				alias = true;
			} else if oc.eq_ignore_ascii_case("referral") {
				referral = true;
			} else if oc.eq_ignore_ascii_case("subentry") || oc.eq_ignore_ascii_case("ldapSubentry")
			{
				subentry = true;
			}
		}
		let mut flags = self.flags.write().unwrap_or_else(PoisonError::into_inner);
		flags.set(IS_ALIAS, alias);
		flags.set(IS_REFERRAL, referral);
		flags.set(IS_SUBENTRY, subentry);
	}
}

/// One attribute value, textual or binary.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum AttributeValue {
	/// A UTF-8 value.
	Text(String),
	/// A raw binary value.
	Binary(Vec<u8>),
}

impl AttributeValue {
	/// The value as text, if it is textual.
	#[must_use]
	pub fn as_text(&self) -> Option<&str> {
		match self {
			AttributeValue::Text(s) => Some(s),
			AttributeValue::Binary(_) => None,
		}
	}

	/// The raw bytes of the value.
	#[must_use]
	pub fn as_bytes(&self) -> &[u8] {
		match self {
			AttributeValue::Text(s) => s.as_bytes(),
			AttributeValue::Binary(b) => b,
		}
	}
}

/// One attribute: its description as first seen, and its ordered values.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Attribute {
	/// The attribute description as reported by the server.
	description: String,
	/// The values, in server order. May be empty.
	values: Vec<AttributeValue>,
}

impl Attribute {
	/// Creates an attribute with the given description and values.
	#[must_use]
	pub fn new(description: impl Into<String>, values: Vec<AttributeValue>) -> Self {
		Attribute { description: description.into(), values }
	}

	/// The attribute description as reported by the server.
	#[must_use]
	pub fn description(&self) -> &str {
		&self.description
	}

	/// The values, in server order.
	#[must_use]
	pub fn values(&self) -> &[AttributeValue] {
		&self.values
	}

	/// The first textual value, if any.
	#[must_use]
	pub fn first_text(&self) -> Option<&str> {
		self.values.iter().find_map(AttributeValue::as_text)
	}

	/// All textual values, in order.
	#[must_use]
	pub fn texts(&self) -> Vec<&str> {
		self.values.iter().filter_map(AttributeValue::as_text).collect()
	}
}

/// The full attribute state of one entry, keyed case-insensitively by
/// attribute description. Presence of an `AttributeSet` in the cache marks
/// the entry's attributes as initialized; absence means "unknown", which is
/// distinct from "known and empty".
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct AttributeSet {
	/// Attributes keyed by lowercased description.
	attributes: std::collections::HashMap<String, Attribute>,
}

impl AttributeSet {
	/// Creates an empty set.
	#[must_use]
	pub fn new() -> Self {
		AttributeSet::default()
	}

	/// Looks up an attribute case-insensitively.
	#[must_use]
	pub fn get(&self, description: &str) -> Option<&Attribute> {
		self.attributes.get(&description.to_lowercase())
	}

	/// The first textual value of an attribute, if present.
	#[must_use]
	pub fn first_text(&self, description: &str) -> Option<&str> {
		self.get(description).and_then(Attribute::first_text)
	}

	/// All textual values of an attribute, empty if absent.
	#[must_use]
	pub fn texts(&self, description: &str) -> Vec<&str> {
		self.get(description).map(Attribute::texts).unwrap_or_default()
	}

	/// Inserts or replaces an attribute.
	pub fn put(&mut self, attribute: Attribute) {
		self.attributes.insert(attribute.description.to_lowercase(), attribute);
	}

	/// Removes an attribute, returning it if present.
	pub fn remove(&mut self, description: &str) -> Option<Attribute> {
		self.attributes.remove(&description.to_lowercase())
	}

	/// The number of attributes.
	#[must_use]
	pub fn len(&self) -> usize {
		self.attributes.len()
	}

	/// Whether the set holds no attributes.
	#[must_use]
	pub fn is_empty(&self) -> bool {
		self.attributes.is_empty()
	}

	/// Iterates over the attributes in unspecified order.
	pub fn iter(&self) -> impl Iterator<Item = &Attribute> {
		self.attributes.values()
	}
}

#[cfg(test)]
mod tests {
	#![allow(clippy::unwrap_used)]

	use super::{Attribute, AttributeSet, AttributeValue, Entry};
	use crate::dn::Dn;

	#[test]
	fn new_entries_start_with_children_hint() {
		let entry = Entry::new(Dn::parse("ou=people,dc=example,dc=com").unwrap());
		assert!(entry.flags().has_children_hint());
		assert!(!entry.flags().is_alias());

		entry.set_has_children_hint(false);
		assert!(!entry.flags().has_children_hint());
	}

	#[test]
	fn object_classes_drive_status_flags() {
		let entry = Entry::new(Dn::parse("cn=ref,dc=example,dc=com").unwrap());
		entry.apply_object_classes(["top", "referral"].into_iter());
		assert!(entry.flags().is_referral());
		assert!(!entry.flags().is_subentry());

		// a refresh replacing the object classes clears stale flags
		entry.apply_object_classes(["top", "ldapSubentry"].into_iter());
		assert!(!entry.flags().is_referral());
		assert!(entry.flags().is_subentry());
	}

	#[test]
	fn attribute_lookup_is_case_insensitive() {
		let mut set = AttributeSet::new();
		set.put(Attribute::new(
			"modifyTimestamp",
			vec![AttributeValue::Text("20240101000000Z".to_owned())],
		));
		assert_eq!(set.first_text("modifytimestamp"), Some("20240101000000Z"));
		assert_eq!(set.get("MODIFYTIMESTAMP").unwrap().description(), "modifyTimestamp");
		assert!(set.get("missing").is_none());
	}

	#[test]
	fn empty_set_is_distinct_from_absent() {
		let set = AttributeSet::new();
		assert!(set.is_empty());
		assert_eq!(set.texts("objectClass"), Vec::<&str>::new());
	}
}
