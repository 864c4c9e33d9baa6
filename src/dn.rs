//! Distinguished name value types.
//!
//! A [`Dn`] is an immutable, ordered sequence of relative components with the
//! naming component (RDN) leftmost, as in the string form
//! `cn=user,ou=people,dc=example,dc=com`. The empty sequence names the root
//! DSE. Escaping follows RFC 4514: parsing decodes backslash and hex escapes,
//! rendering re-escapes reserved characters.
//!
//! Equality of attribute descriptors is schema-aware: two DNs naming the same
//! entry through different attribute aliases (`cn` vs `commonName` vs
//! `2.5.4.3`) normalize to the same [`Dn::normalized`] string, which is what
//! the entry cache uses as its key.

use crate::{error::Error, schema::Schema};

/// A single relative distinguished name component, `attribute=value`.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct Rdn {
	/// The attribute descriptor or numeric OID, as written.
	attribute: String,
	/// The decoded attribute value.
	value: String,
}

impl Rdn {
	/// Creates a component from a descriptor and a raw (unescaped) value.
	pub fn new(attribute: impl Into<String>, value: impl Into<String>) -> Self {
		Rdn { attribute: attribute.into(), value: value.into() }
	}

	/// Parses a single `attribute=value` component.
	pub fn parse(input: &str) -> Result<Self, Error> {
		let mut components = parse_components(input)?;
		if components.len() != 1 {
			return Err(Error::InvalidDn(input.to_owned()));
		}
		// len checked above
		Ok(components.remove(0))
	}

	/// The attribute descriptor, as written.
	#[must_use]
	pub fn attribute(&self) -> &str {
		&self.attribute
	}

	/// The decoded attribute value.
	#[must_use]
	pub fn value(&self) -> &str {
		&self.value
	}
}

impl std::fmt::Display for Rdn {
	fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
		write!(f, "{}={}", self.attribute, escape_value(&self.value))
	}
}

/// An immutable distinguished name. The component at index zero is the RDN;
/// an empty component list names the root DSE.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Default)]
pub struct Dn {
	/// Ordered components, leftmost first.
	components: Vec<Rdn>,
}

impl Dn {
	/// The empty DN, naming the root DSE.
	#[must_use]
	pub fn root() -> Self {
		Dn { components: Vec::new() }
	}

	/// Parses a DN from its string form, decoding RFC 4514 escapes.
	///
	/// TODO: multi-valued RDNs (`cn=a+sn=b`) are kept as one component and
	/// re-escaped on display; split them properly.
	pub fn parse(input: &str) -> Result<Self, Error> {
		if input.trim().is_empty() {
			return Ok(Dn::root());
		}
		Ok(Dn { components: parse_components(input)? })
	}

	/// Builds a DN from already-decoded components, leftmost first.
	#[must_use]
	pub fn from_components(components: Vec<Rdn>) -> Self {
		Dn { components }
	}

	/// Whether this is the empty DN naming the root DSE.
	#[must_use]
	pub fn is_root(&self) -> bool {
		self.components.is_empty()
	}

	/// The naming component, if any.
	#[must_use]
	pub fn rdn(&self) -> Option<&Rdn> {
		self.components.first()
	}

	/// The parent DN. `None` for the root DSE, which has no parent.
	#[must_use]
	pub fn parent(&self) -> Option<Dn> {
		if self.components.is_empty() {
			return None;
		}
		Some(Dn { components: self.components[1..].to_vec() })
	}

	/// A child DN of this one, named by the given component.
	#[must_use]
	pub fn child(&self, rdn: Rdn) -> Dn {
		let mut components = Vec::with_capacity(self.components.len() + 1);
		components.push(rdn);
		components.extend(self.components.iter().cloned());
		Dn { components }
	}

	/// The ordered components, leftmost first.
	#[must_use]
	pub fn components(&self) -> &[Rdn] {
		&self.components
	}

	/// The number of components.
	#[must_use]
	pub fn depth(&self) -> usize {
		self.components.len()
	}

	/// Whether this DN lies strictly below `ancestor`. Comparison is
	/// case-insensitive on descriptors and values but not schema-aware; use
	/// [`Dn::normalized`] keys where alias-exact answers matter.
	#[must_use]
	pub fn is_descendant_of(&self, ancestor: &Dn) -> bool {
		if self.components.len() <= ancestor.components.len() {
			return false;
		}
		let offset = self.components.len() - ancestor.components.len();
		self.components[offset..].iter().zip(&ancestor.components).all(|(a, b)| {
			a.attribute.eq_ignore_ascii_case(&b.attribute)
				&& a.value.eq_ignore_ascii_case(&b.value)
		})
	}

	/// The OID-canonical string form used as the cache key: every attribute
	/// descriptor is resolved to its numeric OID through the schema's alias
	/// table (falling back to the lowercased descriptor for attributes the
	/// schema does not know), values are lowercased.
	#[must_use]
	pub fn normalized(&self, schema: &Schema) -> String {
		let mut out = String::new();
		for (i, rdn) in self.components.iter().enumerate() {
			if i > 0 {
				out.push(',');
			}
			match schema.attribute_oid(&rdn.attribute) {
				Some(oid) => out.push_str(oid),
				None => out.push_str(&rdn.attribute.to_lowercase()),
			}
			out.push('=');
			out.push_str(&rdn.value.to_lowercase());
		}
		out
	}

	/// Schema-aware equality: whether both DNs normalize to the same
	/// OID-canonical form.
	#[must_use]
	pub fn equivalent(&self, other: &Dn, schema: &Schema) -> bool {
		self.normalized(schema) == other.normalized(schema)
	}
}

impl std::fmt::Display for Dn {
	fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
		for (i, rdn) in self.components.iter().enumerate() {
			if i > 0 {
				f.write_str(",")?;
			}
			write!(f, "{rdn}")?;
		}
		Ok(())
	}
}

/// Splits a DN string on unescaped commas and decodes each component.
fn parse_components(input: &str) -> Result<Vec<Rdn>, Error> {
	let mut components = Vec::new();
	let mut current = String::new();
	let mut chars = input.chars();
	while let Some(c) = chars.next() {
		match c {
			'\\' => {
				current.push('\\');
				match chars.next() {
					Some(next) => current.push(next),
					None => return Err(Error::InvalidDn(input.to_owned())),
				}
			}
			',' => {
				components.push(parse_component(&current, input)?);
				current.clear();
			}
			_ => current.push(c),
		}
	}
	components.push(parse_component(&current, input)?);
	Ok(components)
}

/// Decodes a single raw `attribute=value` component.
fn parse_component(raw: &str, whole: &str) -> Result<Rdn, Error> {
	let Some(eq) = raw.find('=') else {
		return Err(Error::InvalidDn(whole.to_owned()));
	};
	let attribute = raw[..eq].trim();
	if attribute.is_empty()
		|| !attribute.chars().all(|c| c.is_ascii_alphanumeric() || c == '-' || c == '.')
	{
		return Err(Error::InvalidDn(whole.to_owned()));
	}
	let value = unescape_value(raw[eq + 1..].trim_start(), whole)?;
	Ok(Rdn { attribute: attribute.to_owned(), value })
}

/// Decodes RFC 4514 escapes in an attribute value.
fn unescape_value(raw: &str, whole: &str) -> Result<String, Error> {
	let mut bytes = Vec::with_capacity(raw.len());
	let mut chars = raw.chars();
	while let Some(c) = chars.next() {
		if c != '\\' {
			let mut buf = [0_u8; 4];
			bytes.extend_from_slice(c.encode_utf8(&mut buf).as_bytes());
			continue;
		}
		match chars.next() {
			Some(escaped) if escaped.is_ascii_hexdigit() => {
				let Some(low) = chars.next().filter(char::is_ascii_hexdigit) else {
					return Err(Error::InvalidDn(whole.to_owned()));
				};
				let pair = [escaped as u8, low as u8];
				// both chars checked as hex digits above
				let hex = std::str::from_utf8(&pair)
					.ok()
					.and_then(|s| u8::from_str_radix(s, 16).ok())
					.ok_or_else(|| Error::InvalidDn(whole.to_owned()))?;
				bytes.push(hex);
			}
			Some(escaped) => {
				let mut buf = [0_u8; 4];
				bytes.extend_from_slice(escaped.encode_utf8(&mut buf).as_bytes());
			}
			None => return Err(Error::InvalidDn(whole.to_owned())),
		}
	}
	String::from_utf8(bytes).map_err(|_| Error::InvalidDn(whole.to_owned()))
}

/// Escapes an attribute value per RFC 4514. Reserved characters get a
/// backslash prefix, NUL is hex-escaped, space only at the boundaries and
/// `#` only when leading.
#[must_use]
pub fn escape_value(value: &str) -> String {
	if value.is_empty() {
		return String::new();
	}
	let mut out = String::with_capacity(value.len() * 2);
	let last = value.chars().count() - 1;
	for (i, c) in value.chars().enumerate() {
		match c {
			',' | '+' | '"' | '\\' | '<' | '>' | ';' | '=' => {
				out.push('\\');
				out.push(c);
			}
			'\0' => out.push_str("\\00"),
			' ' if i == 0 || i == last => out.push_str("\\20"),
			'#' if i == 0 => out.push_str("\\23"),
			_ => out.push(c),
		}
	}
	out
}

#[cfg(test)]
mod tests {
	#![allow(clippy::unwrap_used)]

	use super::{escape_value, Dn, Rdn};
	use crate::schema::Schema;

	#[test]
	fn parse_and_display_round_trip() {
		let dn = Dn::parse("cn=John Doe,ou=people,dc=example,dc=com").unwrap();
		assert_eq!(dn.depth(), 4);
		assert_eq!(dn.rdn().unwrap().attribute(), "cn");
		assert_eq!(dn.rdn().unwrap().value(), "John Doe");
		assert_eq!(dn.to_string(), "cn=John Doe,ou=people,dc=example,dc=com");
	}

	#[test]
	fn parse_decodes_escapes() {
		let dn = Dn::parse(r"cn=Doe\, John,dc=example").unwrap();
		assert_eq!(dn.rdn().unwrap().value(), "Doe, John");
		assert_eq!(dn.to_string(), r"cn=Doe\, John,dc=example");

		let hex = Dn::parse(r"cn=a\2ab,dc=example").unwrap();
		assert_eq!(hex.rdn().unwrap().value(), "a*b");
	}

	#[test]
	fn escaping_reserved_characters() {
		assert_eq!(escape_value("a,b"), r"a\,b");
		assert_eq!(escape_value(" padded "), r"\20padded\20");
		assert_eq!(escape_value("#lead"), r"\23lead");
		assert_eq!(escape_value("plain"), "plain");
	}

	#[test]
	fn rejects_malformed_input() {
		assert!(Dn::parse("no-equals-sign,dc=example").is_err());
		assert!(Dn::parse("=novalue,dc=example").is_err());
		assert!(Dn::parse(r"cn=trailing\").is_err());
	}

	#[test]
	fn root_has_no_parent() {
		let root = Dn::root();
		assert!(root.is_root());
		assert!(root.parent().is_none());

		let base = Dn::parse("dc=example,dc=com").unwrap();
		assert_eq!(base.parent().unwrap().to_string(), "dc=com");
		assert_eq!(
			Dn::parse("dc=com").unwrap().parent().unwrap(),
			Dn::root(),
			"single component entries hang off the root"
		);
	}

	#[test]
	fn child_composition_matches_parent_invariant() {
		let parent = Dn::parse("ou=people,dc=example,dc=com").unwrap();
		let child = parent.child(Rdn::new("cn", "user"));
		assert_eq!(child.to_string(), "cn=user,ou=people,dc=example,dc=com");
		assert_eq!(child.parent().unwrap(), parent);
		assert!(child.is_descendant_of(&parent));
		assert!(!parent.is_descendant_of(&child));
	}

	#[test]
	fn normalization_is_case_insensitive_without_schema() {
		let schema = Schema::fallback();
		let a = Dn::parse("CN=User,DC=Example,DC=Com").unwrap();
		let b = Dn::parse("cn=user,dc=example,dc=com").unwrap();
		assert!(a.equivalent(&b, &schema));
		assert_eq!(a.normalized(&schema), "cn=user,dc=example,dc=com");
	}
}
