use crate::Topic;
use std::{borrow, fmt, ops};
use thiserror::Error;

const LEVEL_SEPARATOR: char = '/';
const SINGLE_LEVEL_WILDCARD: &str = "+";
const MULTI_LEVEL_WILDCARD: &str = "#";
const WILDCARDS: [char; 2] = ['+', '#'];

/// An MQTT topic filter.
///
/// Filters are sent in Subscribe and Unsubscribe packets. A filter level may
/// be the single-level wildcard `+`; the final level may be the multi-level
/// wildcard `#`.
#[derive(Debug, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct Filter(str);

/// An owned MQTT topic filter.
#[derive(Clone, Debug, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct FilterBuf(String);

#[derive(Debug, Error)]
pub enum InvalidFilter {
	#[error("filter cannot be empty")]
	Empty,
	#[error("filter cannot exceed maximum length for an MQTT string (65,535 bytes)")]
	TooLong,
	#[error("wildcards '+' and '#' must occupy an entire filter level")]
	WildcardPosition,
	#[error("multi-level wildcard '#' may only appear once, as the final level")]
	MultiWildcardPosition,
}

impl Filter {
	pub fn new<S: AsRef<str> + ?Sized>(filter: &S) -> Result<&Filter, InvalidFilter> {
		let filter = filter.as_ref();

		if filter.is_empty() {
			return Err(InvalidFilter::Empty);
		}

		if filter.len() > u16::MAX as usize {
			return Err(InvalidFilter::TooLong);
		}

		let mut levels = filter.split(LEVEL_SEPARATOR).peekable();
		while let Some(level) = levels.next() {
			if level.len() > 1 && level.chars().any(|c| WILDCARDS.contains(&c)) {
				return Err(InvalidFilter::WildcardPosition);
			}

			if level == MULTI_LEVEL_WILDCARD && levels.peek().is_some() {
				return Err(InvalidFilter::MultiWildcardPosition);
			}
		}

		Ok(unsafe { &*(filter as *const str as *const Filter) })
	}

	fn from_str(s: &str) -> &Self {
		unsafe { &*(s as *const str as *const Filter) }
	}

	#[inline]
	pub const fn from_static(filter: &'static str) -> &'static Filter {
		unsafe { &*(filter as *const str as *const Filter) }
	}

	/// Checks whether `topic` is matched by the filter.
	///
	/// `+` matches exactly one topic level, `#` matches one or more trailing
	/// levels, and every level of the topic must be consumed for the filter
	/// to match.
	pub fn matches(&self, topic: &Topic) -> bool {
		let mut topic_levels = topic.levels();

		for filter_level in self.levels() {
			match filter_level {
				MULTI_LEVEL_WILDCARD => {
					// The multi-level wildcard requires at least one
					// remaining topic level.
					return topic_levels.next().is_some();
				}
				SINGLE_LEVEL_WILDCARD => {
					if topic_levels.next().is_none() {
						return false;
					}
				}
				exact => {
					if topic_levels.next() != Some(exact) {
						return false;
					}
				}
			}
		}

		topic_levels.next().is_none()
	}

	/// Returns the length of the filter in bytes when encoded as UTF-8.
	#[inline]
	pub fn len(&self) -> usize {
		let Self(inner) = self;
		inner.len()
	}

	/// Returns `true` if the filter has length of zero bytes.
	///
	/// Empty filters are not valid, so this should *always* be `false`.
	#[inline]
	pub fn is_empty(&self) -> bool {
		let Self(inner) = self;
		inner.is_empty()
	}

	#[inline]
	pub fn as_str(&self) -> &str {
		let Self(inner) = self;
		inner
	}

	/// Returns an iterator over the levels of the filter.
	#[inline]
	pub fn levels(&self) -> impl Iterator<Item = &str> {
		let Self(inner) = self;
		inner.split(LEVEL_SEPARATOR)
	}

	#[inline]
	pub fn to_filter_buf(&self) -> FilterBuf {
		FilterBuf::from(self)
	}
}

impl FilterBuf {
	pub fn new(filter: impl Into<String>) -> Result<Self, InvalidFilter> {
		let filter = filter.into();
		Filter::new(&filter)?;
		Ok(Self(filter))
	}
}

impl fmt::Display for Filter {
	#[inline]
	fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
		f.write_str(self.as_str())
	}
}

impl fmt::Display for FilterBuf {
	#[inline]
	fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
		use ops::Deref;
		self.deref().fmt(f)
	}
}

impl AsRef<str> for Filter {
	#[inline]
	fn as_ref(&self) -> &str {
		self.as_str()
	}
}

impl AsRef<Filter> for Filter {
	#[inline]
	fn as_ref(&self) -> &Filter {
		self
	}
}

impl ToOwned for Filter {
	type Owned = FilterBuf;
	#[inline]
	fn to_owned(&self) -> Self::Owned {
		self.to_filter_buf()
	}
}

impl ops::Deref for FilterBuf {
	type Target = Filter;
	#[inline]
	fn deref(&self) -> &Self::Target {
		let Self(inner) = self;
		Filter::from_str(inner)
	}
}

impl borrow::Borrow<Filter> for FilterBuf {
	#[inline]
	fn borrow(&self) -> &Filter {
		use ops::Deref;
		self.deref()
	}
}

impl AsRef<Filter> for FilterBuf {
	#[inline]
	fn as_ref(&self) -> &Filter {
		Filter::from_str(self.0.as_str())
	}
}

impl From<&Filter> for FilterBuf {
	#[inline]
	fn from(value: &Filter) -> Self {
		let Filter(inner) = value;
		Self(String::from(inner))
	}
}

impl<'f> TryFrom<&'f str> for &'f Filter {
	type Error = InvalidFilter;
	#[inline]
	fn try_from(value: &'f str) -> Result<Self, Self::Error> {
		Filter::new(value)
	}
}

impl TryFrom<&str> for FilterBuf {
	type Error = InvalidFilter;
	#[inline]
	fn try_from(value: &str) -> Result<Self, Self::Error> {
		FilterBuf::new(value)
	}
}

impl TryFrom<String> for FilterBuf {
	type Error = InvalidFilter;
	#[inline]
	fn try_from(value: String) -> Result<Self, Self::Error> {
		FilterBuf::new(value)
	}
}
