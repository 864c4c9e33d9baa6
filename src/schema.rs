//! Directory schema snapshots and their freshness cache.
//!
//! A [`Schema`] is an immutable snapshot of the definitions a server
//! publishes in its subschema entry (RFC 4512): object classes, attribute
//! types, matching rules and syntaxes, keyed both by numeric OID and by
//! every registered name alias. A [`SchemaCache`] publishes the current
//! snapshot behind an `Arc` that readers keep across reloads, and decides
//! whether the server's reported timestamps make a reload necessary. A
//! full schema fetch can run to thousands of definitions and is skipped
//! when the cached copy is still current.

use std::{
	collections::HashMap,
	sync::{Arc, PoisonError, RwLock},
};

use time::{OffsetDateTime, PrimitiveDateTime};

use crate::{
	config::{ServerDialect, TIME_FORMAT},
	entry::AttributeSet,
};

/// The attributes requested when fetching the subschema entry.
pub const SCHEMA_ATTRIBUTES: &[&str] = &[
	"objectClasses",
	"attributeTypes",
	"ldapSyntaxes",
	"matchingRules",
	"matchingRuleUse",
	"createTimestamp",
	"modifyTimestamp",
];

/// The filter matching a subschema entry.
pub const SCHEMA_FILTER: &str = "(objectClass=subschema)";

/// The kind of an object class definition.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ObjectClassKind {
	/// A structural class; entries are shaped by exactly one.
	Structural,
	/// An auxiliary class mixed into entries of any structural class.
	Auxiliary,
	/// An abstract class, only usable as a superclass.
	Abstract,
}

/// One parsed object class definition.
#[derive(Debug, Clone)]
pub struct ObjectClassDef {
	/// The numeric OID.
	pub oid: String,
	/// All registered names, first one canonical.
	pub names: Vec<String>,
	/// Description text, if any.
	pub description: Option<String>,
	/// Names or OIDs of the superclasses.
	pub superiors: Vec<String>,
	/// Structural, auxiliary or abstract.
	pub kind: ObjectClassKind,
	/// Required attribute descriptors.
	pub must: Vec<String>,
	/// Optional attribute descriptors.
	pub may: Vec<String>,
}

/// One parsed attribute type definition.
#[derive(Debug, Clone)]
pub struct AttributeTypeDef {
	/// The numeric OID.
	pub oid: String,
	/// All registered names, first one canonical.
	pub names: Vec<String>,
	/// Description text, if any.
	pub description: Option<String>,
	/// The syntax OID, if declared.
	pub syntax: Option<String>,
	/// Equality matching rule, if declared.
	pub equality: Option<String>,
	/// Substring matching rule, if declared.
	pub substr: Option<String>,
	/// Ordering matching rule, if declared.
	pub ordering: Option<String>,
	/// Whether the attribute holds at most one value.
	pub single_value: bool,
	/// Whether the attribute is server-maintained and read-only.
	pub no_user_modification: bool,
	/// The declared usage, `userApplications` when not declared.
	pub usage: String,
}

/// One parsed matching rule definition.
#[derive(Debug, Clone)]
pub struct MatchingRuleDef {
	/// The numeric OID.
	pub oid: String,
	/// All registered names.
	pub names: Vec<String>,
	/// The syntax the rule applies to, if declared.
	pub syntax: Option<String>,
}

/// One parsed syntax definition.
#[derive(Debug, Clone)]
pub struct SyntaxDef {
	/// The numeric OID.
	pub oid: String,
	/// Description text, if any.
	pub description: Option<String>,
}

/// An immutable schema snapshot.
#[derive(Debug, Clone)]
pub struct Schema {
	/// Object classes by OID.
	object_classes: HashMap<String, ObjectClassDef>,
	/// Attribute types by OID.
	attribute_types: HashMap<String, AttributeTypeDef>,
	/// Matching rules by OID.
	matching_rules: HashMap<String, MatchingRuleDef>,
	/// Syntaxes by OID.
	syntaxes: HashMap<String, SyntaxDef>,
	/// Lowercased object class name → OID.
	object_class_aliases: HashMap<String, String>,
	/// Lowercased attribute type name → OID.
	attribute_aliases: HashMap<String, String>,
	/// When the subschema entry was created, by the server's account.
	create_timestamp: Option<OffsetDateTime>,
	/// When the subschema entry was last modified, by the server's account.
	modify_timestamp: Option<OffsetDateTime>,
	/// Whether this is the built-in sentinel used before any load.
	fallback: bool,
}

impl Schema {
	/// The sentinel schema in place before any load and after `close()`.
	/// Holds no definitions; every lookup falls back to raw names.
	#[must_use]
	pub fn fallback() -> Self {
		Schema {
			object_classes: HashMap::new(),
			attribute_types: HashMap::new(),
			matching_rules: HashMap::new(),
			syntaxes: HashMap::new(),
			object_class_aliases: HashMap::new(),
			attribute_aliases: HashMap::new(),
			create_timestamp: None,
			modify_timestamp: None,
			fallback: true,
		}
	}

	/// Parses a snapshot out of a fetched subschema entry. Definitions that
	/// fail to parse are skipped with a log line; a directory with an
	/// unparsable definition is still browsable with the rest.
	#[must_use]
	pub fn from_subschema(attributes: &AttributeSet, dialect: &ServerDialect) -> Self {
		let mut schema = Schema { fallback: false, ..Schema::fallback() };

		for definition in attributes.texts("objectClasses") {
			match parse_object_class(definition) {
				Some(def) => {
					for name in &def.names {
						schema.object_class_aliases.insert(name.to_lowercase(), def.oid.clone());
					}
					schema.object_classes.insert(def.oid.clone(), def);
				}
				None => tracing::debug!("skipping unparsable object class: {definition}"),
			}
		}
		for definition in attributes.texts("attributeTypes") {
			match parse_attribute_type(definition) {
				Some(def) => {
					for name in &def.names {
						schema.attribute_aliases.insert(name.to_lowercase(), def.oid.clone());
					}
					schema.attribute_types.insert(def.oid.clone(), def);
				}
				None => tracing::debug!("skipping unparsable attribute type: {definition}"),
			}
		}
		for definition in attributes.texts("matchingRules") {
			if let Some(def) = parse_matching_rule(definition) {
				schema.matching_rules.insert(def.oid.clone(), def);
			}
		}
		for definition in attributes.texts("ldapSyntaxes") {
			if let Some(oid) = extract_oid(definition) {
				let description = extract_quoted(definition, "DESC");
				schema.syntaxes.insert(oid.clone(), SyntaxDef { oid, description });
			}
		}

		schema.modify_timestamp = attributes
			.first_text(dialect.modify_timestamp_attribute)
			.or_else(|| attributes.first_text("modifyTimestamp"))
			.and_then(parse_generalized_time);
		schema.create_timestamp = attributes
			.first_text(dialect.create_timestamp_attribute)
			.or_else(|| attributes.first_text("createTimestamp"))
			.and_then(parse_generalized_time);

		schema
	}

	/// Whether this is the sentinel default.
	#[must_use]
	pub fn is_fallback(&self) -> bool {
		self.fallback
	}

	/// Resolves an attribute descriptor or OID to the numeric OID, through
	/// the alias table. `None` for attributes the schema does not know.
	#[must_use]
	pub fn attribute_oid(&self, descriptor: &str) -> Option<&str> {
		if let Some(def) = self.attribute_types.get(descriptor) {
			return Some(def.oid.as_str());
		}
		self.attribute_aliases.get(&descriptor.to_lowercase()).map(String::as_str)
	}

	/// Looks up an attribute type by name or OID.
	#[must_use]
	pub fn attribute_type(&self, descriptor: &str) -> Option<&AttributeTypeDef> {
		let oid = self.attribute_oid(descriptor)?;
		self.attribute_types.get(oid)
	}

	/// Looks up an object class by name or OID.
	#[must_use]
	pub fn object_class(&self, descriptor: &str) -> Option<&ObjectClassDef> {
		if let Some(def) = self.object_classes.get(descriptor) {
			return Some(def);
		}
		let oid = self.object_class_aliases.get(&descriptor.to_lowercase())?;
		self.object_classes.get(oid)
	}

	/// Looks up a matching rule by OID.
	#[must_use]
	pub fn matching_rule(&self, oid: &str) -> Option<&MatchingRuleDef> {
		self.matching_rules.get(oid)
	}

	/// Looks up a syntax by OID.
	#[must_use]
	pub fn syntax(&self, oid: &str) -> Option<&SyntaxDef> {
		self.syntaxes.get(oid)
	}

	/// Number of object class definitions.
	#[must_use]
	pub fn object_class_count(&self) -> usize {
		self.object_classes.len()
	}

	/// Number of attribute type definitions.
	#[must_use]
	pub fn attribute_type_count(&self) -> usize {
		self.attribute_types.len()
	}

	/// The timestamp used for freshness comparison: the modify timestamp
	/// when present, else the create timestamp.
	#[must_use]
	pub fn newest_timestamp(&self) -> Option<OffsetDateTime> {
		self.modify_timestamp.or(self.create_timestamp)
	}
}

/// Publishes the current schema snapshot for one session.
///
/// Reads return a cheap `Arc` clone; the snapshot itself is immutable, so
/// in-flight readers are unaffected by a concurrent reload swapping the
/// published pointer.
#[derive(Debug)]
pub struct SchemaCache {
	/// The published snapshot.
	current: RwLock<Arc<Schema>>,
}

impl SchemaCache {
	/// A cache holding the sentinel fallback schema.
	#[must_use]
	pub fn new() -> Self {
		SchemaCache { current: RwLock::new(Arc::new(Schema::fallback())) }
	}

	/// The latest snapshot.
	#[must_use]
	pub fn current(&self) -> Arc<Schema> {
		self.current.read().unwrap_or_else(PoisonError::into_inner).clone()
	}

	/// Publishes a new snapshot. In-flight readers keep the prior one.
	pub fn install(&self, schema: Schema) {
		*self.current.write().unwrap_or_else(PoisonError::into_inner) = Arc::new(schema);
	}

	/// Reverts to the sentinel fallback, e.g. on session close.
	pub fn reset(&self) {
		self.install(Schema::fallback());
	}

	/// Whether a reload is required given the timestamp the server reports
	/// for its subschema entry: yes if the cache still holds the sentinel or
	/// has no timestamp of its own, or if the server's is strictly newer.
	#[must_use]
	pub fn is_stale(&self, server_timestamp: Option<OffsetDateTime>) -> bool {
		let current = self.current();
		if current.is_fallback() {
			return true;
		}
		match (current.newest_timestamp(), server_timestamp) {
			(None, _) => true,
			(Some(_), None) => false,
			(Some(cached), Some(server)) => server > cached,
		}
	}
}

impl Default for SchemaCache {
	fn default() -> Self {
		SchemaCache::new()
	}
}

/// Parses an RFC 4517 Generalized Time value.
#[must_use]
pub fn parse_generalized_time(value: &str) -> Option<OffsetDateTime> {
	PrimitiveDateTime::parse(value, &TIME_FORMAT).ok().map(PrimitiveDateTime::assume_utc)
}

/// Parses one `objectClasses` definition string.
fn parse_object_class(definition: &str) -> Option<ObjectClassDef> {
	let oid = extract_oid(definition)?;
	let kind = if definition.contains("AUXILIARY") {
		ObjectClassKind::Auxiliary
	} else if definition.contains("ABSTRACT") {
		ObjectClassKind::Abstract
	} else {
		ObjectClassKind::Structural
	};
	Some(ObjectClassDef {
		oid,
		names: extract_names(definition),
		description: extract_quoted(definition, "DESC"),
		superiors: extract_list(definition, "SUP"),
		kind,
		must: extract_list(definition, "MUST"),
		may: extract_list(definition, "MAY"),
	})
}

/// Parses one `attributeTypes` definition string.
fn parse_attribute_type(definition: &str) -> Option<AttributeTypeDef> {
	let oid = extract_oid(definition)?;
	Some(AttributeTypeDef {
		oid,
		names: extract_names(definition),
		description: extract_quoted(definition, "DESC"),
		syntax: extract_token(definition, "SYNTAX"),
		equality: extract_token(definition, "EQUALITY"),
		substr: extract_token(definition, "SUBSTR"),
		ordering: extract_token(definition, "ORDERING"),
		single_value: definition.contains("SINGLE-VALUE"),
		no_user_modification: definition.contains("NO-USER-MODIFICATION"),
		usage: extract_token(definition, "USAGE")
			.unwrap_or_else(|| "userApplications".to_owned()),
	})
}

/// Parses one `matchingRules` definition string.
fn parse_matching_rule(definition: &str) -> Option<MatchingRuleDef> {
	let oid = extract_oid(definition)?;
	Some(MatchingRuleDef {
		oid,
		names: extract_names(definition),
		syntax: extract_token(definition, "SYNTAX"),
	})
}

/// The first token after the opening parenthesis: the numeric OID.
fn extract_oid(definition: &str) -> Option<String> {
	definition
		.split_whitespace()
		.map(|token| token.trim_matches('('))
		.find(|token| !token.is_empty())
		.map(ToOwned::to_owned)
}

/// All names after the NAME keyword, single-quoted, possibly parenthesized.
fn extract_names(definition: &str) -> Vec<String> {
	let Some(start) = find_keyword(definition, "NAME") else {
		return Vec::new();
	};
	let rest = definition[start..].trim_start();
	let mut names = Vec::new();
	if let Some(grouped) = rest.strip_prefix('(') {
		let inner = match grouped.find(')') {
			Some(close) => &grouped[..close],
			None => grouped,
		};
		for name in inner.split_whitespace() {
			let name = name.trim_matches('\'');
			if !name.is_empty() {
				names.push(name.to_owned());
			}
		}
	} else if let Some(quoted) = rest.strip_prefix('\'') {
		if let Some(close) = quoted.find('\'') {
			names.push(quoted[..close].to_owned());
		}
	}
	names
}

/// The single-quoted value after a keyword, e.g. `DESC 'text here'`.
fn extract_quoted(definition: &str, keyword: &str) -> Option<String> {
	let start = find_keyword(definition, keyword)?;
	let rest = &definition[start..];
	let open = rest.find('\'')?;
	let close = rest[open + 1..].find('\'')?;
	Some(rest[open + 1..open + 1 + close].to_owned())
}

/// The bare token after a keyword, e.g. `SYNTAX 1.3.6.1.4.1.1466.115.121.1.15`.
/// A `{128}` length bound suffix is stripped.
fn extract_token(definition: &str, keyword: &str) -> Option<String> {
	let start = find_keyword(definition, keyword)?;
	let token = definition[start..].split_whitespace().next()?;
	let token = token.trim_matches(|c| c == '\'' || c == ')');
	let token = match token.find('{') {
		Some(brace) => &token[..brace],
		None => token,
	};
	if token.is_empty() {
		None
	} else {
		Some(token.to_owned())
	}
}

/// The descriptor list after a keyword: `MUST cn` or `MUST ( cn $ sn )`.
fn extract_list(definition: &str, keyword: &str) -> Vec<String> {
	let Some(start) = find_keyword(definition, keyword) else {
		return Vec::new();
	};
	let rest = definition[start..].trim_start();
	let raw = if let Some(stripped) = rest.strip_prefix('(') {
		match stripped.find(')') {
			Some(close) => &stripped[..close],
			None => stripped,
		}
	} else {
		rest.split_whitespace().next().unwrap_or("")
	};
	raw.split(|c: char| c == '$' || c.is_whitespace())
		.map(|name| name.trim().trim_matches('\''))
		.filter(|name| !name.is_empty())
		.map(ToOwned::to_owned)
		.collect()
}

/// Byte offset just past a whitespace-delimited keyword, `None` if absent.
fn find_keyword(definition: &str, keyword: &str) -> Option<usize> {
	let bytes = definition.as_bytes();
	let mut search_from = 0;
	while let Some(found) = definition[search_from..].find(keyword) {
		let start = search_from + found;
		let end = start + keyword.len();
		let standalone = (start == 0 || bytes[start - 1].is_ascii_whitespace())
			&& bytes.get(end).map_or(true, |b| b.is_ascii_whitespace());
		if standalone {
			return Some(end);
		}
		search_from = end;
	}
	None
}
