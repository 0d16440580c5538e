//! Dispatch of inbound publishes to subscription handlers.

use crate::{packet::Publish, Filter, FilterBuf, QoS, Topic};
use bytes::Bytes;
use std::sync::{Arc, Mutex};

/// Handler invoked with the topic, QoS and payload of each matching inbound
/// publish.
pub type SubHandler = Arc<dyn Fn(&Topic, QoS, &Bytes) + Send + Sync>;

/// Routes inbound publishes to the handlers registered for their topics.
///
/// The client registers a filter/handler pair for every subscription and
/// removes it on unsubscribe; every inbound publish drained from the receive
/// queue is handed to [`dispatch`].
///
/// [`dispatch`]: TopicRouter::dispatch
pub trait TopicRouter: Send + Sync {
	/// Registers `handler` for topics matching `filter`, replacing any
	/// previous handler for the same filter.
	fn handle(&self, filter: FilterBuf, handler: SubHandler);

	/// Removes the handler registered for `filter`, if any.
	fn remove(&self, filter: &Filter);

	/// Delivers an inbound publish to every matching handler.
	fn dispatch(&self, publish: &Publish);
}

/// The default router: literal topic filters with MQTT wildcard matching.
///
/// `+` matches exactly one topic level and `#` matches one or more trailing
/// levels (see [`Filter::matches`]). A publish whose topic matches several
/// registered filters is delivered once per matching handler, in
/// registration order.
#[derive(Default)]
pub struct TextRouter {
	routes: Mutex<Vec<(FilterBuf, SubHandler)>>,
}

impl TextRouter {
	pub fn new() -> Self {
		Self::default()
	}
}

impl TopicRouter for TextRouter {
	fn handle(&self, filter: FilterBuf, handler: SubHandler) {
		let mut routes = self.routes.lock().unwrap();
		for (existing, slot) in routes.iter_mut() {
			if *existing == filter {
				*slot = handler;
				return;
			}
		}
		routes.push((filter, handler));
	}

	fn remove(&self, filter: &Filter) {
		let mut routes = self.routes.lock().unwrap();
		routes.retain(|(existing, _)| existing.as_ref() != filter);
	}

	fn dispatch(&self, publish: &Publish) {
		let handlers: Vec<SubHandler> = {
			let routes = self.routes.lock().unwrap();
			routes
				.iter()
				.filter(|(filter, _)| filter.matches(&publish.topic))
				.map(|(_, handler)| Arc::clone(handler))
				.collect()
		};

		if handlers.is_empty() {
			tracing::debug!(topic = %publish.topic, "no handler for inbound publish");
			return;
		}

		for handler in handlers {
			handler(&publish.topic, publish.qos, &publish.payload);
		}
	}
}
