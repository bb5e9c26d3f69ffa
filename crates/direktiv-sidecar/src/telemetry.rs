// Copyright (C) 2025 SyncMyOrders Sp. z o.o.
// SPDX-License-Identifier: AGPL-3.0-or-later
//! W3C trace context propagation.
//!
//! The trace context of an incoming action is extracted once at ingress into a
//! [`TraceCarrier`] that travels with the request through the queue and the
//! worker. It is injected again into the user-container call and the engine
//! RPC metadata. Nothing is stored in process-wide state.

use std::collections::HashMap;

use axum::http::{HeaderMap, HeaderName, HeaderValue};
use opentelemetry::propagation::{Extractor, TextMapPropagator};
use opentelemetry_sdk::propagation::TraceContextPropagator;

/// Owned set of propagation fields (`traceparent`, `tracestate`).
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct TraceCarrier {
    fields: HashMap<String, String>,
}

impl TraceCarrier {
    /// Extract the trace context from HTTP headers.
    ///
    /// Invalid or absent context yields an empty carrier.
    pub fn from_headers(headers: &HeaderMap) -> Self {
        let propagator = TraceContextPropagator::new();
        let cx = propagator.extract(&HeaderExtractor(headers));

        let mut fields = HashMap::new();
        propagator.inject_context(&cx, &mut fields);
        fields.retain(|_, v: &mut String| !v.is_empty());

        Self { fields }
    }

    /// Whether a trace context is present.
    pub fn is_empty(&self) -> bool {
        self.fields.is_empty()
    }

    /// Value of one propagation field.
    pub fn get(&self, key: &str) -> Option<&str> {
        self.fields.get(key).map(String::as_str)
    }

    /// Iterate over the propagation fields.
    pub fn iter(&self) -> impl Iterator<Item = (&str, &str)> {
        self.fields.iter().map(|(k, v)| (k.as_str(), v.as_str()))
    }

    /// Add the propagation fields to an outgoing header map.
    pub fn inject_headers(&self, headers: &mut HeaderMap) {
        for (key, value) in self.iter() {
            if let (Ok(name), Ok(value)) = (
                HeaderName::from_bytes(key.as_bytes()),
                HeaderValue::from_str(value),
            ) {
                headers.insert(name, value);
            }
        }
    }

    /// Add the propagation fields to gRPC request metadata.
    pub fn inject_metadata(&self, metadata: &mut tonic::metadata::MetadataMap) {
        for (key, value) in self.iter() {
            if let (Ok(key), Ok(value)) = (
                tonic::metadata::MetadataKey::from_bytes(key.as_bytes()),
                value.parse(),
            ) {
                metadata.insert(key, value);
            }
        }
    }
}

struct HeaderExtractor<'a>(&'a HeaderMap);

impl Extractor for HeaderExtractor<'_> {
    fn get(&self, key: &str) -> Option<&str> {
        self.0.get(key).and_then(|v| v.to_str().ok())
    }

    fn keys(&self) -> Vec<&str> {
        self.0.keys().map(HeaderName::as_str).collect()
    }
}
