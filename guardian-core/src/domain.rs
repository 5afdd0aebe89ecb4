//! Fast containment test for a mixed set of exact domains and
//! `*.suffix` wildcard patterns (spec.md §4.A).

use std::collections::HashSet;

use crate::Strng;
use crate::error::PolicyError;

/// Lower-cases a host and strips a trailing `:port`, per spec.md §3's
/// canonical domain form. Safe to call more than once; idempotent.
pub fn canonicalize(host: &str) -> String {
	let host = host.trim();
	let without_port = strip_port(host);
	without_port.to_ascii_lowercase()
}

fn strip_port(host: &str) -> &str {
	// IPv6 literals like `[::1]:443` keep their brackets; a bare `host:port`
	// has exactly one colon-delimited trailer that parses as a port number.
	if host.starts_with('[') {
		return host;
	}
	match host.rsplit_once(':') {
		Some((h, port)) if !port.is_empty() && port.bytes().all(|b| b.is_ascii_digit()) => h,
		_ => host,
	}
}

/// `{exact: set of D, wildcards: ordered sequence of Pattern}` from
/// spec.md §3. Immutable after construction so `contains` is safe to
/// call from many readers concurrently without locking.
#[derive(Debug, Clone, Default)]
pub struct DomainSet {
	exact: HashSet<Strng>,
	// Each entry is the suffix after `*.`, e.g. `*.x.y` is stored as `x.y`.
	wildcard_suffixes: Vec<Strng>,
}

impl DomainSet {
	/// Builds a set from exact domains and `*.suffix` patterns. Empty
	/// strings are ignored; all entries are lower-cased. A pattern not of
	/// the form `*.label(.label)+` is rejected.
	pub fn new<E, P>(exact: E, patterns: P) -> Result<Self, PolicyError>
	where
		E: IntoIterator,
		E::Item: AsRef<str>,
		P: IntoIterator,
		P::Item: AsRef<str>,
	{
		let mut exact_set = HashSet::new();
		for d in exact {
			let d = d.as_ref().trim();
			if d.is_empty() {
				continue;
			}
			exact_set.insert(Strng::from(d.to_ascii_lowercase()));
		}

		let mut wildcard_suffixes = Vec::new();
		for p in patterns {
			let p = p.as_ref().trim();
			if p.is_empty() {
				continue;
			}
			let suffix = parse_wildcard(p)?;
			wildcard_suffixes.push(Strng::from(suffix));
		}

		Ok(Self {
			exact: exact_set,
			wildcard_suffixes,
		})
	}

	/// Builds a set from a single list of entries, classifying each as a
	/// wildcard pattern (`*.suffix`) or an exact domain by its prefix.
	pub fn from_entries<I>(entries: I) -> Result<Self, PolicyError>
	where
		I: IntoIterator,
		I::Item: AsRef<str>,
	{
		let mut exact = Vec::new();
		let mut patterns = Vec::new();
		for entry in entries {
			let entry = entry.as_ref();
			if entry.starts_with("*.") {
				patterns.push(entry.to_string());
			} else {
				exact.push(entry.to_string());
			}
		}
		Self::new(exact, patterns)
	}

	/// Returns every entry as the raw string a decision file would store:
	/// exact domains as-is, wildcard patterns re-prefixed with `*.`.
	pub fn entries(&self) -> impl Iterator<Item = String> + '_ {
		let exact = self.exact.iter().map(|d| d.to_string());
		let wildcards = self
			.wildcard_suffixes
			.iter()
			.map(|s| format!("*.{s}"));
		exact.chain(wildcards)
	}

	pub fn is_empty(&self) -> bool {
		self.exact.is_empty() && self.wildcard_suffixes.is_empty()
	}

	/// True iff the canonicalized `domain` is in the exact set or matched
	/// by a wildcard pattern. `domain` is canonicalized again here so
	/// callers may pass a raw `host:port` value.
	pub fn contains(&self, domain: &str) -> bool {
		let domain = canonicalize(domain);
		if self.exact.contains(domain.as_str()) {
			return true;
		}
		self
			.wildcard_suffixes
			.iter()
			.any(|suffix| match domain.strip_suffix(suffix.as_str()) {
				Some(rest) => rest.ends_with('.'),
				None => false,
			})
	}
}

/// Validates `*.label(.label)+` and returns the `label(.label)+` suffix.
/// Any other wildcard shape (`*`, `*.`, `*x`, `a.*.b`, `*.x`) is rejected.
fn parse_wildcard(pattern: &str) -> Result<String, PolicyError> {
	let Some(suffix) = pattern.strip_prefix("*.") else {
		return Err(PolicyError::InvalidPattern(pattern.to_string()));
	};
	let suffix = suffix.to_ascii_lowercase();
	let labels: Vec<&str> = suffix.split('.').collect();
	if labels.len() < 2 || labels.iter().any(|l| l.is_empty()) {
		return Err(PolicyError::InvalidPattern(pattern.to_string()));
	}
	Ok(suffix)
}
